//! Cross-tab replication of entity changes.
//!
//! Stores that share one session exchange [`SyncMessage`]s as JSON strings
//! over a broadcast channel. Only entity patches travel; tab state never
//! leaves its store. Conflicts are settled per record by [`Stamp`]: the
//! higher Lamport version wins and the origin id breaks ties, so every store
//! converges on the same record regardless of arrival order.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::core::config::Config;
use crate::core::constants::MAX_TOMBSTONES;
use crate::core::entities::EntityKind;
use crate::core::ids::{OriginId, TabId};
use crate::core::patch::EntityPatch;

/// Last-writer identity of one record.
///
/// Field order matters: the derived ordering compares `version` first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub version: u64,
    pub origin: OriginId,
}

impl Stamp {
    pub fn new(version: u64, origin: OriginId) -> Self {
        Self { version, origin }
    }
}

/// Stamps keyed by entity key (`"chat:c1"`, `"message:c1/42"`).
///
/// Removals keep their stamp as a tombstone, which is what stops an older
/// patch from resurrecting a deleted record. Only the newest
/// [`MAX_TOMBSTONES`] tombstones are held; a patch older than those has long
/// since been delivered or lost to a lagged channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StampLedger {
    by_key: BTreeMap<String, Stamp>,
    /// Removed keys, oldest first.
    #[serde(default)]
    tombstones: VecDeque<String>,
}

impl StampLedger {
    pub fn get(&self, key: &str) -> Option<&Stamp> {
        self.by_key.get(key)
    }

    /// Whether a write stamped `stamp` should replace what is held for `key`.
    pub fn admits(&self, key: &str, stamp: &Stamp) -> bool {
        self.by_key.get(key).is_none_or(|held| stamp > held)
    }

    pub fn record(&mut self, key: impl Into<String>, stamp: Stamp) {
        let key = key.into();
        self.clear_tombstone(&key);
        self.by_key.insert(key, stamp);
    }

    pub fn record_removal(&mut self, key: impl Into<String>, stamp: Stamp) {
        let key = key.into();
        self.clear_tombstone(&key);
        self.by_key.insert(key.clone(), stamp);
        self.tombstones.push_back(key);
        while self.tombstones.len() > MAX_TOMBSTONES {
            if let Some(oldest) = self.tombstones.pop_front() {
                self.by_key.remove(&oldest);
            }
        }
    }

    /// Drops whatever is held for `key`.
    pub fn forget(&mut self, key: &str) {
        self.clear_tombstone(key);
        self.by_key.remove(key);
    }

    /// Stamps every key `patch` touches. A removed local message id is
    /// forgotten instead of tombstoned: only the store that minted it ever
    /// writes it, and it never mints the same id twice.
    pub fn record_patch(&mut self, patch: &EntityPatch, stamp: &Stamp) {
        let removed = patch.removed_keys();
        for key in patch.entity_keys() {
            match removed.iter().find(|(removed_key, _)| *removed_key == key) {
                Some((_, true)) => self.forget(&key),
                Some((_, false)) => self.record_removal(key, stamp.clone()),
                None => self.record(key, stamp.clone()),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    fn clear_tombstone(&mut self, key: &str) {
        if let Some(index) = self.tombstones.iter().position(|held| held == key) {
            self.tombstones.remove(index);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SyncMessage {
    Patch {
        entity_kind: EntityKind,
        ids: Vec<String>,
        version: u64,
        origin: OriginId,
        patch: EntityPatch,
    },
    TabClosed {
        origin: OriginId,
        tab_id: TabId,
    },
}

impl SyncMessage {
    pub fn patch(patch: EntityPatch, version: u64, origin: OriginId) -> Self {
        SyncMessage::Patch {
            entity_kind: patch.kind(),
            ids: patch.ids(),
            version,
            origin,
            patch,
        }
    }

    pub fn origin(&self) -> &OriginId {
        match self {
            SyncMessage::Patch { origin, .. } | SyncMessage::TabClosed { origin, .. } => origin,
        }
    }

    pub fn encode(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(SyncError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, SyncError> {
        serde_json::from_str(text).map_err(SyncError::Decode)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("failed to encode sync message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode sync message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("sync channel closed")]
    Closed,
    #[error("sync receiver lagged behind by {0} messages")]
    Lagged(u64),
}

/// A store-level event for sibling stores. Handlers raise these without
/// knowing their store's origin; the store stamps it on publish.
#[derive(Debug, Clone, PartialEq)]
pub enum Announcement {
    TabClosed { tab_id: TabId },
}

impl Announcement {
    pub fn into_message(self, origin: OriginId) -> SyncMessage {
        match self {
            Announcement::TabClosed { tab_id } => SyncMessage::TabClosed { origin, tab_id },
        }
    }
}

/// In-process stand-in for the browser's broadcast channel.
#[derive(Clone)]
pub struct SyncHub {
    tx: broadcast::Sender<String>,
}

impl SyncHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// A hub holding `sync_channel_capacity` undelivered messages per port.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.sync_channel_capacity())
    }

    /// Opens an endpoint for the store identified by `origin`.
    pub fn connect(&self, origin: OriginId) -> SyncPort {
        SyncPort {
            origin,
            tx: self.tx.clone(),
            rx: self.tx.subscribe(),
        }
    }
}

/// One store's endpoint on a [`SyncHub`]. Messages the store published
/// itself are filtered out on receipt.
pub struct SyncPort {
    origin: OriginId,
    tx: broadcast::Sender<String>,
    rx: broadcast::Receiver<String>,
}

impl SyncPort {
    pub fn origin(&self) -> &OriginId {
        &self.origin
    }

    pub fn publish(&self, message: &SyncMessage) -> Result<(), SyncError> {
        let text = message.encode()?;
        self.tx.send(text).map_err(|_| SyncError::Closed)?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<SyncMessage, SyncError> {
        loop {
            match self.rx.recv().await {
                Ok(text) => {
                    if let Some(message) = self.accept(&text) {
                        return Ok(message);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Err(SyncError::Lagged(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return Err(SyncError::Closed),
            }
        }
    }

    /// Collects every message already waiting on the channel.
    pub fn drain(&mut self) -> Vec<SyncMessage> {
        let mut messages = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(text) => messages.extend(self.accept(&text)),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "sync port lagged while draining");
                }
                Err(_) => break,
            }
        }
        messages
    }

    fn accept(&self, text: &str) -> Option<SyncMessage> {
        match SyncMessage::decode(text) {
            Ok(message) if message.origin() == &self.origin => None,
            Ok(message) => Some(message),
            Err(err) => {
                warn!(error = %err, "dropping undecodable sync message");
                debug!(payload = text, "undecodable sync payload");
                None
            }
        }
    }
}
