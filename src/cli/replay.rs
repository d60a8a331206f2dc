use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::core::config::{path_display, Config};
use crate::core::ids::OriginId;
use crate::core::store::{DispatchOutcome, Store, StoreOptions};
use crate::utils::journal::{read_journal, JournalError};

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write {}: {source}", path_display(.path))]
    Write {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Counts from one replay run plus a few figures from the final snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub updated: usize,
    pub unchanged: usize,
    pub rejected: usize,
    pub faulted: usize,
    pub version: u64,
    pub tabs: usize,
    pub chats: usize,
    pub messages: usize,
    pub pending: usize,
}

impl ReplaySummary {
    pub fn total(&self) -> usize {
        self.updated + self.unchanged + self.rejected + self.faulted
    }

    pub fn describe(&self) -> Vec<String> {
        vec![
            format!("Replayed {} actions:", self.total()),
            format!("  updated: {}", self.updated),
            format!("  unchanged: {}", self.unchanged),
            format!("  rejected: {}", self.rejected),
            format!("  faulted: {}", self.faulted),
            format!(
                "Final state: version {}, {} tabs, {} chats, {} messages, {} pending",
                self.version, self.tabs, self.chats, self.messages, self.pending
            ),
        ]
    }
}

/// Applies every envelope of the journal at `path` to a fresh store.
///
/// Effects are collected and dropped, so operations that were pending when
/// the journal was written stay pending in the result.
pub fn replay_into(store: &mut Store, path: &Path) -> Result<ReplaySummary, ReplayError> {
    let envelopes = read_journal(path)?;
    info!(count = envelopes.len(), path = %path_display(path), "replaying journal");

    let mut summary = ReplaySummary::default();
    for envelope in envelopes {
        let kind = envelope.action.name();
        match store.dispatch_envelope(envelope) {
            Ok(DispatchOutcome::Updated { .. }) => summary.updated += 1,
            Ok(DispatchOutcome::Unchanged) => summary.unchanged += 1,
            Ok(DispatchOutcome::Faulted) => summary.faulted += 1,
            Err(err) => {
                debug!(action = kind, error = %err, "replayed action rejected");
                summary.rejected += 1;
            }
        }
    }
    store.flush();
    store.take_effects();
    store.take_outbox();

    let snapshot = store.snapshot();
    summary.version = snapshot.version;
    summary.tabs = snapshot.by_tab.len();
    summary.chats = snapshot.entities.chats.len();
    summary.messages = snapshot.entities.message_count();
    summary.pending = snapshot.optimistic.pending_count();
    Ok(summary)
}

pub fn run_replay(
    config: &Config,
    path: &Path,
    snapshot_out: Option<&Path>,
) -> Result<ReplaySummary, ReplayError> {
    let mut store = Store::new(StoreOptions {
        origin: OriginId::from("replay"),
        max_notifications: config.max_notifications(),
    });
    let summary = replay_into(&mut store, path)?;

    if let Some(out) = snapshot_out {
        let json = serde_json::to_string_pretty(store.snapshot().as_ref())?;
        fs::write(out, json).map_err(|source| ReplayError::Write {
            path: out.to_path_buf(),
            source,
        })?;
        info!(path = %path_display(out), "wrote replayed snapshot");
    }
    Ok(summary)
}
