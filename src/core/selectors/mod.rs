//! Read access to a [`Snapshot`].
//!
//! Plain lookups are free functions returning borrowed records. Derived
//! collections go through [`Memo`] instances, bundled per store in
//! [`SelectorSet`].

mod chats;
pub mod memo;

use std::sync::Arc;

pub use chats::{
    ChatMemberNames, ChatMessageIds, PinnedMessageIds, SelectedMessageIds, SelectorSet,
    SortedChatIds, UnreadTotal,
};
pub use memo::{Memo, ShallowEq};

use crate::core::entities::{Chat, Message, User};
use crate::core::ids::{ChatId, MessageId, TabId, UserId};
use crate::core::snapshot::Snapshot;
use crate::core::tab_state::TabState;

pub fn select_chat<'a>(snapshot: &'a Snapshot, chat_id: &ChatId) -> Option<&'a Arc<Chat>> {
    snapshot.entities.chats.get(chat_id)
}

pub fn select_user<'a>(snapshot: &'a Snapshot, user_id: &UserId) -> Option<&'a Arc<User>> {
    snapshot.entities.users.get(user_id)
}

pub fn select_message<'a>(
    snapshot: &'a Snapshot,
    chat_id: &ChatId,
    message_id: &MessageId,
) -> Option<&'a Arc<Message>> {
    snapshot.entities.message(chat_id, message_id)
}

pub fn select_tab_state<'a>(snapshot: &'a Snapshot, tab_id: &TabId) -> Option<&'a TabState> {
    snapshot.tab(tab_id).map(|tab| tab.as_ref())
}

/// The chat open in `tab_id`, if it still exists.
pub fn select_current_chat<'a>(snapshot: &'a Snapshot, tab_id: &TabId) -> Option<&'a Arc<Chat>> {
    let chat_id = select_tab_state(snapshot, tab_id)?.current_chat_id.as_ref()?;
    select_chat(snapshot, chat_id)
}

pub fn select_is_chat_muted(snapshot: &Snapshot, chat_id: &ChatId) -> bool {
    select_chat(snapshot, chat_id).is_some_and(|chat| chat.is_muted)
}

pub fn select_current_user(snapshot: &Snapshot) -> Option<&Arc<User>> {
    let user_id = snapshot.auth.current_user_id()?;
    select_user(snapshot, user_id)
}

/// True once chats were loaded from the server or a sibling store in this
/// session, or restored with a sync time.
pub fn select_is_data_ready(snapshot: &Snapshot) -> bool {
    snapshot.last_sync_time.is_some()
}

/// Messages waiting for their server echo across all chats.
pub fn pending_message_count(snapshot: &Snapshot) -> usize {
    snapshot
        .entities
        .messages
        .values()
        .flat_map(|table| table.values())
        .filter(|message| message.is_pending)
        .count()
}
