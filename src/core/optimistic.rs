//! Bookkeeping for optimistic updates.
//!
//! Each speculative change is recorded under the client-generated
//! [`CorrelationId`] that the eventual server echo or failure carries. An
//! operation moves `Pending → Committed` or `Pending → RolledBack` exactly
//! once; a second resolution is rejected, which is what makes duplicate echoes
//! and late failures harmless.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::constants::MAX_RESOLVED_OPS;
use crate::core::entities::{PhotoRef, User};
use crate::core::ids::{ChatId, CorrelationId, MessageId, TabId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OpState {
    Pending,
    Committed,
    RolledBack,
}

impl OpState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OpState::Pending)
    }
}

/// What an optimistic operation changed and the pre-image needed to undo it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum OptimisticTarget {
    SendMessage {
        chat_id: ChatId,
        local_id: MessageId,
        previous_last_message_id: Option<MessageId>,
        previous_last_message_date: Option<DateTime<Utc>>,
    },
    PinMessage {
        chat_id: ChatId,
        message_id: MessageId,
        was_pinned: bool,
    },
    UpdateContact {
        previous: User,
    },
    UploadProfilePhoto {
        user_id: UserId,
        previous_photo: Option<PhotoRef>,
    },
}

impl OptimisticTarget {
    pub fn chat_id(&self) -> Option<&ChatId> {
        match self {
            OptimisticTarget::SendMessage { chat_id, .. }
            | OptimisticTarget::PinMessage { chat_id, .. } => Some(chat_id),
            OptimisticTarget::UpdateContact { .. } | OptimisticTarget::UploadProfilePhoto { .. } => {
                None
            }
        }
    }

    /// Key of the record the operation speculates on. Two pending operations
    /// with the same key stack on top of each other.
    fn record_key(&self) -> String {
        match self {
            OptimisticTarget::SendMessage {
                chat_id, local_id, ..
            } => format!("message:{chat_id}/{local_id}"),
            OptimisticTarget::PinMessage {
                chat_id,
                message_id,
                ..
            } => format!("pin:{chat_id}/{message_id}"),
            OptimisticTarget::UpdateContact { previous } => format!("user:{}", previous.id),
            OptimisticTarget::UploadProfilePhoto { user_id, .. } => format!("photo:{user_id}"),
        }
    }

    /// Hands this operation's pre-image to a later operation on the same
    /// record, so undoing the later one restores the original state.
    fn inherit_pre_image(&mut self, from: &OptimisticTarget) {
        match (self, from) {
            (
                OptimisticTarget::PinMessage { was_pinned, .. },
                OptimisticTarget::PinMessage {
                    was_pinned: earlier,
                    ..
                },
            ) => *was_pinned = *earlier,
            (
                OptimisticTarget::UpdateContact { previous },
                OptimisticTarget::UpdateContact { previous: earlier },
            ) => *previous = earlier.clone(),
            (
                OptimisticTarget::UploadProfilePhoto { previous_photo, .. },
                OptimisticTarget::UploadProfilePhoto {
                    previous_photo: earlier,
                    ..
                },
            ) => *previous_photo = earlier.clone(),
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOp {
    pub correlation: CorrelationId,
    pub tab_id: TabId,
    pub target: OptimisticTarget,
    pub state: OpState,
    seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("optimistic operation {0} is not known")]
    Unknown(CorrelationId),
    #[error("optimistic operation {correlation} was already resolved as {state:?}")]
    AlreadyResolved {
        correlation: CorrelationId,
        state: OpState,
    },
    #[error("optimistic operation {0} was already started")]
    Duplicate(CorrelationId),
    #[error("{0:?} is not a terminal state")]
    NotTerminal(OpState),
}

/// How a resolved operation should be undone, if at all.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub op: PendingOp,
    /// False when a later pending operation on the same record took over the
    /// pre-image; the record must then be left as it is.
    pub restore: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimisticLedger {
    ops: BTreeMap<CorrelationId, PendingOp>,
    resolved: VecDeque<CorrelationId>,
    next_seq: u64,
}

impl OptimisticLedger {
    pub fn begin(
        &mut self,
        correlation: CorrelationId,
        tab_id: TabId,
        target: OptimisticTarget,
    ) -> Result<(), LedgerError> {
        if self.ops.contains_key(&correlation) {
            return Err(LedgerError::Duplicate(correlation));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ops.insert(
            correlation,
            PendingOp {
                correlation,
                tab_id,
                target,
                state: OpState::Pending,
                seq,
            },
        );
        Ok(())
    }

    pub fn get(&self, correlation: &CorrelationId) -> Option<&PendingOp> {
        self.ops.get(correlation)
    }

    pub fn is_pending(&self, correlation: &CorrelationId) -> bool {
        self.ops
            .get(correlation)
            .is_some_and(|op| op.state == OpState::Pending)
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingOp> {
        self.ops.values().filter(|op| op.state == OpState::Pending)
    }

    /// Pending operations, oldest first.
    pub fn pending_by_age(&self) -> Vec<&PendingOp> {
        let mut ops: Vec<&PendingOp> = self.pending().collect();
        ops.sort_by_key(|op| op.seq);
        ops
    }

    pub fn pending_count(&self) -> usize {
        self.pending().count()
    }

    pub fn pending_for_tab(&self, tab_id: &TabId) -> Vec<CorrelationId> {
        self.pending()
            .filter(|op| &op.tab_id == tab_id)
            .map(|op| op.correlation)
            .collect()
    }

    pub fn pending_for_chat(&self, chat_id: &ChatId) -> Vec<CorrelationId> {
        self.pending()
            .filter(|op| op.target.chat_id() == Some(chat_id))
            .map(|op| op.correlation)
            .collect()
    }

    /// Moves a pending operation to a terminal state.
    pub fn resolve(
        &mut self,
        correlation: &CorrelationId,
        outcome: OpState,
    ) -> Result<Resolution, LedgerError> {
        if !outcome.is_terminal() {
            return Err(LedgerError::NotTerminal(outcome));
        }
        let op = self
            .ops
            .get(correlation)
            .ok_or(LedgerError::Unknown(*correlation))?;
        if op.state.is_terminal() {
            return Err(LedgerError::AlreadyResolved {
                correlation: *correlation,
                state: op.state,
            });
        }

        let key = op.target.record_key();
        let seq = op.seq;
        let successor = self
            .ops
            .values()
            .filter(|other| {
                other.state == OpState::Pending
                    && other.seq > seq
                    && other.target.record_key() == key
            })
            .min_by_key(|other| other.seq)
            .map(|other| other.correlation);

        let mut restore = true;
        if outcome == OpState::RolledBack {
            if let Some(successor) = successor {
                let pre_image = op.target.clone();
                if let Some(later) = self.ops.get_mut(&successor) {
                    later.target.inherit_pre_image(&pre_image);
                    restore = false;
                }
            }
        }

        let entry = self
            .ops
            .get_mut(correlation)
            .ok_or(LedgerError::Unknown(*correlation))?;
        entry.state = outcome;
        let op = entry.clone();
        self.resolved.push_back(*correlation);
        self.prune();
        Ok(Resolution { op, restore })
    }

    fn prune(&mut self) {
        while self.resolved.len() > MAX_RESOLVED_OPS {
            if let Some(oldest) = self.resolved.pop_front() {
                self.ops.remove(&oldest);
            }
        }
    }
}
