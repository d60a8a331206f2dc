//! The single writer that owns the current snapshot.
//!
//! [`Store::dispatch`] runs one handler synchronously and swaps in its
//! result. Everything a handler asks for beyond the snapshot (effects,
//! follow-up actions, outgoing sync messages) is queued on the store and
//! collected by the runtime after the batch. Bindings are notified once per
//! [`Store::flush`].

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::core::actions::{apply_action, Action, ActionEnvelope, ActionParseError};
use crate::core::binding::Bindings;
use crate::core::constants::DEFAULT_MAX_NOTIFICATIONS;
use crate::core::effects::EffectRequest;
use crate::core::ids::{OriginId, TabId};
use crate::core::patch::diff_entities;
use crate::core::selectors::SelectorSet;
use crate::core::snapshot::{ActionContext, Draft, DraftOutput, Snapshot};
use crate::core::sync::{Stamp, SyncMessage};
use crate::core::tab_state::NotificationKind;
use crate::utils::journal::ActionJournal;

const FAULT_NOTICE: &str = "Something went wrong";

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Identity of this store on the cross-tab channel.
    pub origin: OriginId,
    pub max_notifications: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            origin: OriginId::generate(),
            max_notifications: DEFAULT_MAX_NOTIFICATIONS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A new snapshot was swapped in.
    Updated { version: u64 },
    /// The handler ran and changed nothing.
    Unchanged,
    /// The handler panicked; the snapshot was left as it was.
    Faulted,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("malformed payload for '{kind}': {source}")]
    MalformedPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} rejected: {reason}")]
    Rejected { kind: &'static str, reason: String },
}

impl From<ActionParseError> for DispatchError {
    fn from(err: ActionParseError) -> Self {
        match err {
            ActionParseError::UnknownAction(kind) => DispatchError::UnknownAction(kind),
            ActionParseError::MalformedPayload { kind, source } => {
                DispatchError::MalformedPayload { kind, source }
            }
        }
    }
}

pub struct Store {
    current: Arc<Snapshot>,
    options: StoreOptions,
    /// Lamport clock: the highest version seen locally or remotely.
    clock: u64,
    follow_ups: VecDeque<ActionEnvelope>,
    effects: Vec<EffectRequest>,
    outbox: Vec<SyncMessage>,
    bindings: Bindings,
    selectors: SelectorSet,
    dirty: bool,
    journal: Option<ActionJournal>,
    /// Makes the next handler panic.
    #[cfg(test)]
    fail_next_handler: bool,
}

impl Store {
    pub fn new(options: StoreOptions) -> Self {
        Self::with_snapshot(Snapshot::default(), options)
    }

    pub fn with_snapshot(snapshot: Snapshot, options: StoreOptions) -> Self {
        Self {
            clock: snapshot.version,
            current: Arc::new(snapshot),
            options,
            follow_ups: VecDeque::new(),
            effects: Vec::new(),
            outbox: Vec::new(),
            bindings: Bindings::new(),
            selectors: SelectorSet::new(),
            dirty: false,
            journal: None,
            #[cfg(test)]
            fail_next_handler: false,
        }
    }

    pub fn origin(&self) -> &OriginId {
        &self.options.origin
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current)
    }

    pub fn version(&self) -> u64 {
        self.current.version
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    pub fn selectors(&self) -> &SelectorSet {
        &self.selectors
    }

    pub fn has_tab(&self, tab_id: &TabId) -> bool {
        self.current.tab(tab_id).is_some()
    }

    pub fn set_journal(&mut self, journal: Option<ActionJournal>) {
        self.journal = journal;
    }

    pub fn journal_mut(&mut self) -> Option<&mut ActionJournal> {
        self.journal.as_mut()
    }

    pub fn dispatch(
        &mut self,
        tab_id: &TabId,
        action: Action,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.dispatch_envelope(ActionEnvelope::new(tab_id.clone(), action))
    }

    /// The string form: `dispatch("sendMessage", {...})`.
    pub fn dispatch_json(
        &mut self,
        tab_id: &TabId,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<DispatchOutcome, DispatchError> {
        let action = Action::from_json(kind, payload)?;
        self.dispatch(tab_id, action)
    }

    /// Applies one envelope, then every follow-up it queued. The result is
    /// that of the envelope itself; follow-up failures are logged.
    pub fn dispatch_envelope(
        &mut self,
        envelope: ActionEnvelope,
    ) -> Result<DispatchOutcome, DispatchError> {
        if let Some(journal) = self.journal.as_mut() {
            if let Err(err) = journal.record(&envelope) {
                warn!(error = %err, "failed to journal action");
            }
        }
        let outcome = self.apply_envelope(envelope);
        self.drain_follow_ups();
        outcome
    }

    /// Applies every envelope in order and runs one notification pass.
    pub fn apply_batch(
        &mut self,
        envelopes: impl IntoIterator<Item = ActionEnvelope>,
    ) -> Vec<Result<DispatchOutcome, DispatchError>> {
        let results = envelopes
            .into_iter()
            .map(|envelope| self.dispatch_envelope(envelope))
            .collect();
        self.flush();
        results
    }

    /// Notifies bindings if anything changed since the last flush.
    pub fn flush(&mut self) -> usize {
        if !self.dirty {
            return 0;
        }
        self.dirty = false;
        self.bindings.notify(&self.current)
    }

    pub fn take_effects(&mut self) -> Vec<EffectRequest> {
        std::mem::take(&mut self.effects)
    }

    pub fn take_outbox(&mut self) -> Vec<SyncMessage> {
        std::mem::take(&mut self.outbox)
    }

    /// Turns a message from a sibling store into the action that applies
    /// it. Returns `None` when the message concerns nothing held here.
    pub fn receive(
        &mut self,
        message: SyncMessage,
    ) -> Option<Result<DispatchOutcome, DispatchError>> {
        match message {
            SyncMessage::Patch {
                version,
                origin,
                patch,
                ..
            } => {
                if origin == self.options.origin {
                    return None;
                }
                let action = Action::ApplyRemotePatch {
                    origin,
                    version,
                    patch,
                };
                Some(self.dispatch(&TabId::system(), action))
            }
            SyncMessage::TabClosed { origin, tab_id } => {
                if origin == self.options.origin || !self.has_tab(&tab_id) {
                    return None;
                }
                Some(self.dispatch(&tab_id, Action::UnregisterTab))
            }
        }
    }

    fn drain_follow_ups(&mut self) {
        while let Some(envelope) = self.follow_ups.pop_front() {
            let kind = envelope.action.name();
            if let Err(err) = self.apply_envelope(envelope) {
                warn!(action = kind, error = %err, "follow-up action failed");
            }
        }
    }

    fn apply_envelope(
        &mut self,
        envelope: ActionEnvelope,
    ) -> Result<DispatchOutcome, DispatchError> {
        let kind = envelope.action.name();
        if envelope.action.requires_tab() && !self.has_tab(&envelope.tab_id) {
            return Err(DispatchError::Rejected {
                kind,
                reason: format!("tab {} is not registered", envelope.tab_id),
            });
        }

        let ctx = ActionContext::from(&envelope);
        let base = Arc::clone(&self.current);
        let max_notifications = self.options.max_notifications;
        let action = envelope.action;
        #[cfg(test)]
        let fail_handler = std::mem::take(&mut self.fail_next_handler);
        #[cfg(not(test))]
        let fail_handler = false;

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            if fail_handler {
                panic!("handler failure requested by test");
            }
            let mut draft = Draft::new(&base, &ctx, max_notifications);
            apply_action(&mut draft, action).map(|()| draft.finish())
        }));

        match result {
            Ok(Ok(output)) => Ok(self.commit(&ctx, output)),
            Ok(Err(err)) => {
                debug!(action = kind, tab = %ctx.tab_id, error = %err, "action rejected");
                Err(DispatchError::Rejected {
                    kind,
                    reason: err.to_string(),
                })
            }
            Err(_) => {
                error!(action = kind, tab = %ctx.tab_id, "action handler panicked");
                self.fault(&ctx);
                Ok(DispatchOutcome::Faulted)
            }
        }
    }

    /// Surfaces a handler panic in the tab that caused it.
    fn fault(&mut self, ctx: &ActionContext) {
        let base = Arc::clone(&self.current);
        let mut draft = Draft::new(&base, ctx, self.options.max_notifications);
        draft.notify(NotificationKind::Error, FAULT_NOTICE);
        let mut output = draft.finish();
        output.broadcast = false;
        self.commit(ctx, output);
    }

    fn commit(&mut self, ctx: &ActionContext, output: DraftOutput) -> DispatchOutcome {
        let DraftOutput {
            snapshot,
            effects,
            follow_ups,
            announcements,
            observed_version,
            broadcast,
        } = output;

        self.clock = self.clock.max(observed_version);
        self.effects
            .extend(effects.into_iter().map(|effect| EffectRequest {
                tab_id: ctx.tab_id.clone(),
                effect,
            }));
        self.follow_ups
            .extend(follow_ups.into_iter().map(|action| ActionEnvelope {
                tab_id: ctx.tab_id.clone(),
                issued_at: ctx.issued_at,
                action,
            }));
        let origin = self.options.origin.clone();
        self.outbox.extend(
            announcements
                .into_iter()
                .map(|announcement| announcement.into_message(origin.clone())),
        );

        let Some(mut next) = snapshot else {
            return DispatchOutcome::Unchanged;
        };

        let version = self.clock.max(self.current.version) + 1;
        self.clock = version;
        next.version = version;

        if broadcast {
            let patches = diff_entities(&self.current.entities, &next.entities);
            if !patches.is_empty() {
                let stamp = Stamp::new(version, origin.clone());
                let stamps = Arc::make_mut(&mut next.stamps);
                for patch in &patches {
                    stamps.record_patch(patch, &stamp);
                }
                self.outbox.extend(
                    patches
                        .into_iter()
                        .map(|patch| SyncMessage::patch(patch, version, origin.clone())),
                );
            }
        }

        self.current = Arc::new(next);
        self.dirty = true;
        DispatchOutcome::Updated { version }
    }
}
