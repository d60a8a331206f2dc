//! The immutable global snapshot and the draft handlers write through.
//!
//! A [`Snapshot`] is a tree of `Arc`s. Handlers never see a `&mut Snapshot`;
//! they get a [`Draft`] that copies a subtree on first write and only hands
//! out mutable tab state for the tab that issued the action. When the draft
//! finishes, subtrees whose contents ended up equal to the base are swapped
//! back to the base `Arc`, so a handler that changed nothing yields no new
//! snapshot at all.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::account::{AuthState, Settings};
use crate::core::actions::{Action, ActionEnvelope};
use crate::core::effects::Effect;
use crate::core::entities::{Chat, Entities, EntityTable, Message, User};
use crate::core::ids::{ChatId, MessageId, TabId, UserId};
use crate::core::optimistic::OptimisticLedger;
use crate::core::patch::EntityPatch;
use crate::core::sync::{Announcement, StampLedger};
use crate::core::tab_state::{NotificationKind, TabState};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub entities: Entities,
    pub by_tab: Arc<BTreeMap<TabId, Arc<TabState>>>,
    pub settings: Arc<Settings>,
    pub auth: Arc<AuthState>,
    pub optimistic: Arc<OptimisticLedger>,
    pub stamps: Arc<StampLedger>,
    pub version: u64,
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn tab(&self, tab_id: &TabId) -> Option<&Arc<TabState>> {
        self.by_tab.get(tab_id)
    }

    /// Returns a snapshot with `patch` applied to the entity graph. Tables
    /// and records the patch does not change keep their identity.
    pub fn apply_patch(&self, patch: &EntityPatch) -> Snapshot {
        let mut next = self.clone();
        patch.apply(&mut next.entities);
        next
    }

    /// True when both snapshots share every subtree by identity.
    pub fn ptr_eq(&self, other: &Snapshot) -> bool {
        self.entities.ptr_eq(&other.entities)
            && Arc::ptr_eq(&self.by_tab, &other.by_tab)
            && Arc::ptr_eq(&self.settings, &other.settings)
            && Arc::ptr_eq(&self.auth, &other.auth)
            && Arc::ptr_eq(&self.optimistic, &other.optimistic)
            && Arc::ptr_eq(&self.stamps, &other.stamps)
            && self.version == other.version
            && self.last_sync_time == other.last_sync_time
    }
}

/// Who issued the action being handled, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionContext {
    pub tab_id: TabId,
    pub issued_at: DateTime<Utc>,
}

impl From<&ActionEnvelope> for ActionContext {
    fn from(envelope: &ActionEnvelope) -> Self {
        Self {
            tab_id: envelope.tab_id.clone(),
            issued_at: envelope.issued_at,
        }
    }
}

/// Everything a finished handler produced.
#[derive(Debug, Default)]
pub struct DraftOutput {
    /// The next snapshot, or `None` when nothing changed.
    pub snapshot: Option<Snapshot>,
    pub effects: Vec<Effect>,
    pub follow_ups: Vec<Action>,
    pub announcements: Vec<Announcement>,
    /// Highest remote version the handler saw; merged into the next version.
    pub observed_version: u64,
    /// Whether entity changes should be rebroadcast to sibling stores.
    pub broadcast: bool,
}

pub struct Draft<'a> {
    base: &'a Snapshot,
    next: Snapshot,
    ctx: &'a ActionContext,
    max_notifications: usize,
    effects: Vec<Effect>,
    follow_ups: Vec<Action>,
    announcements: Vec<Announcement>,
    observed_version: u64,
    broadcast: bool,
}

impl<'a> Draft<'a> {
    pub fn new(base: &'a Snapshot, ctx: &'a ActionContext, max_notifications: usize) -> Self {
        Self {
            base,
            next: base.clone(),
            ctx,
            max_notifications,
            effects: Vec::new(),
            follow_ups: Vec::new(),
            announcements: Vec::new(),
            observed_version: 0,
            broadcast: true,
        }
    }

    pub fn ctx(&self) -> &ActionContext {
        self.ctx
    }

    pub fn tab_id(&self) -> &TabId {
        &self.ctx.tab_id
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.ctx.issued_at
    }

    /// The draft's current view, including writes made so far.
    pub fn view(&self) -> &Snapshot {
        &self.next
    }

    pub fn entities(&self) -> &Entities {
        &self.next.entities
    }

    pub fn chat(&self, chat_id: &ChatId) -> Option<&Arc<Chat>> {
        self.next.entities.chats.get(chat_id)
    }

    pub fn user(&self, user_id: &UserId) -> Option<&Arc<User>> {
        self.next.entities.users.get(user_id)
    }

    pub fn message(&self, chat_id: &ChatId, message_id: &MessageId) -> Option<&Arc<Message>> {
        self.next.entities.message(chat_id, message_id)
    }

    pub fn apply_patch(&mut self, patch: &EntityPatch) -> bool {
        patch.apply(&mut self.next.entities)
    }

    pub fn update_chat(&mut self, chat_id: &ChatId, edit: impl FnOnce(&mut Chat)) -> bool {
        update_record(&mut self.next.entities.chats, chat_id, edit)
    }

    pub fn update_user(&mut self, user_id: &UserId, edit: impl FnOnce(&mut User)) -> bool {
        update_record(&mut self.next.entities.users, user_id, edit)
    }

    pub fn update_message(
        &mut self,
        chat_id: &ChatId,
        message_id: &MessageId,
        edit: impl FnOnce(&mut Message),
    ) -> bool {
        let Some(table) = self.next.entities.messages.get(chat_id) else {
            return false;
        };
        let mut table = Arc::clone(table);
        if !update_record(&mut table, message_id, edit) {
            return false;
        }
        Arc::make_mut(&mut self.next.entities.messages).insert(chat_id.clone(), table);
        true
    }

    pub fn insert_message(&mut self, message: Message) -> bool {
        if self
            .message(&message.chat_id, &message.id)
            .is_some_and(|existing| **existing == message)
        {
            return false;
        }
        let chat_id = message.chat_id.clone();
        self.next.entities.messages_mut(&chat_id).upsert(message)
    }

    /// Removes messages from one chat, returning the ids that were present.
    pub fn remove_messages(&mut self, chat_id: &ChatId, message_ids: &[MessageId]) -> Vec<MessageId> {
        let present: Vec<MessageId> = message_ids
            .iter()
            .filter(|id| self.message(chat_id, id).is_some())
            .copied()
            .collect();
        if present.is_empty() {
            return present;
        }
        let table = self.next.entities.messages_mut(chat_id);
        for id in &present {
            table.remove(id);
        }
        self.next.entities.prune_empty_messages(chat_id);
        present
    }

    /// Drops a chat record together with its messages.
    pub fn remove_chat(&mut self, chat_id: &ChatId) -> bool {
        let mut changed = false;
        if self.next.entities.chats.contains(chat_id) {
            Arc::make_mut(&mut self.next.entities.chats).remove(chat_id);
            changed = true;
        }
        if self.next.entities.messages.contains_key(chat_id) {
            Arc::make_mut(&mut self.next.entities.messages).remove(chat_id);
            changed = true;
        }
        changed
    }

    pub fn replace_entities(&mut self, entities: Entities) {
        self.next.entities = entities;
    }

    pub fn tab(&self) -> Option<&TabState> {
        self.next.by_tab.get(&self.ctx.tab_id).map(|tab| tab.as_ref())
    }

    /// Mutable state of the tab that issued the action. Other tabs are not
    /// reachable from a draft.
    pub fn tab_mut(&mut self) -> Option<&mut TabState> {
        if !self.next.by_tab.contains_key(&self.ctx.tab_id) {
            return None;
        }
        let tabs = Arc::make_mut(&mut self.next.by_tab);
        tabs.get_mut(&self.ctx.tab_id).map(Arc::make_mut)
    }

    /// Creates state for the issuing tab. Returns false if it already exists.
    pub fn register_tab(&mut self) -> bool {
        if self.next.by_tab.contains_key(&self.ctx.tab_id) {
            return false;
        }
        let tab = TabState::new(self.ctx.tab_id.clone());
        Arc::make_mut(&mut self.next.by_tab).insert(self.ctx.tab_id.clone(), Arc::new(tab));
        true
    }

    /// Drops the issuing tab's state. Returns false if it did not exist.
    pub fn unregister_tab(&mut self) -> bool {
        if !self.next.by_tab.contains_key(&self.ctx.tab_id) {
            return false;
        }
        Arc::make_mut(&mut self.next.by_tab).remove(&self.ctx.tab_id);
        true
    }

    /// Queues a notification in the issuing tab, if it is registered.
    pub fn notify(&mut self, kind: NotificationKind, message: impl Into<String>) {
        let issued_at = self.ctx.issued_at;
        let limit = self.max_notifications;
        if let Some(tab) = self.tab_mut() {
            tab.push_notification(kind, message, issued_at, limit);
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.next.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        Arc::make_mut(&mut self.next.settings)
    }

    pub fn auth(&self) -> &AuthState {
        &self.next.auth
    }

    pub fn auth_mut(&mut self) -> &mut AuthState {
        Arc::make_mut(&mut self.next.auth)
    }

    pub fn ledger(&self) -> &OptimisticLedger {
        &self.next.optimistic
    }

    pub fn ledger_mut(&mut self) -> &mut OptimisticLedger {
        Arc::make_mut(&mut self.next.optimistic)
    }

    pub fn stamps(&self) -> &StampLedger {
        &self.next.stamps
    }

    pub fn stamps_mut(&mut self) -> &mut StampLedger {
        Arc::make_mut(&mut self.next.stamps)
    }

    pub fn set_last_sync_time(&mut self, at: Option<DateTime<Utc>>) {
        self.next.last_sync_time = at;
    }

    pub fn effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    /// Queues an action to run after this one has been committed.
    pub fn follow_up(&mut self, action: Action) {
        self.follow_ups.push(action);
    }

    pub fn announce(&mut self, message: Announcement) {
        self.announcements.push(message);
    }

    pub fn observe_version(&mut self, version: u64) {
        self.observed_version = self.observed_version.max(version);
    }

    /// Keeps this action's entity changes local to the store.
    pub fn quiet(&mut self) {
        self.broadcast = false;
    }

    pub fn finish(self) -> DraftOutput {
        let Draft {
            base,
            mut next,
            effects,
            follow_ups,
            announcements,
            observed_version,
            broadcast,
            ..
        } = self;

        keep_if_equal(&mut next.settings, &base.settings);
        keep_if_equal(&mut next.auth, &base.auth);
        keep_if_equal(&mut next.optimistic, &base.optimistic);
        keep_if_equal(&mut next.stamps, &base.stamps);
        if !Arc::ptr_eq(&next.by_tab, &base.by_tab) {
            let tabs = Arc::make_mut(&mut next.by_tab);
            for (tab_id, tab) in tabs.iter_mut() {
                if let Some(original) = base.by_tab.get(tab_id) {
                    keep_if_equal(tab, original);
                }
            }
            keep_if_equal(&mut next.by_tab, &base.by_tab);
        }

        let snapshot = (!next.ptr_eq(base)).then_some(next);
        DraftOutput {
            snapshot,
            effects,
            follow_ups,
            announcements,
            observed_version,
            broadcast,
        }
    }
}

fn keep_if_equal<T: PartialEq>(candidate: &mut Arc<T>, original: &Arc<T>) {
    if !Arc::ptr_eq(candidate, original) && **candidate == **original {
        *candidate = Arc::clone(original);
    }
}

/// Edits a copy of one record and writes it back only if it changed, so an
/// untouched table is never copied.
fn update_record<K, V>(
    table: &mut Arc<EntityTable<K, V>>,
    id: &K,
    edit: impl FnOnce(&mut V),
) -> bool
where
    K: Ord + Clone,
    V: crate::core::entities::Entity<Id = K>,
{
    let Some(current) = table.get(id) else {
        return false;
    };
    let mut record = (**current).clone();
    edit(&mut record);
    if record == **current {
        return false;
    }
    Arc::make_mut(table).upsert(record)
}
