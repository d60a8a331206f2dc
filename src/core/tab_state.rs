//! UI-only state owned by a single tab.
//!
//! Tab state holds ids and flags, never entity records, so a tab can be
//! dropped and recreated without losing data.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::{ChatId, MessageId, TabId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LeftScreen {
    #[default]
    ChatList,
    Archived,
    Contacts,
    Settings,
    GlobalSearch,
    NewGroup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Modal {
    DeleteMessages {
        chat_id: ChatId,
        message_ids: Vec<MessageId>,
    },
    ReportMessages {
        chat_id: ChatId,
        message_ids: Vec<MessageId>,
    },
    PinMessage {
        chat_id: ChatId,
        message_id: MessageId,
    },
    MediaViewer {
        chat_id: ChatId,
        message_id: MessageId,
    },
    Invite {
        chat_id: ChatId,
    },
    CountryPicker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    #[default]
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: u64,
    pub kind: NotificationKind,
    pub message: String,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSelection {
    pub chat_id: ChatId,
    pub message_ids: BTreeSet<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchDraft {
    pub query: Option<String>,
    pub chat_id: Option<ChatId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingFlags {
    pub chats: bool,
    pub country_list: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabState {
    pub id: TabId,
    pub left_screen: LeftScreen,
    pub current_chat_id: Option<ChatId>,
    pub modal: Option<Modal>,
    pub notifications: Vec<Notification>,
    pub next_notification_id: u64,
    pub selection: Option<MessageSelection>,
    pub search: SearchDraft,
    pub scroll_anchors: BTreeMap<ChatId, MessageId>,
    pub loading: LoadingFlags,
}

impl TabState {
    pub fn new(id: TabId) -> Self {
        Self {
            id,
            left_screen: LeftScreen::default(),
            current_chat_id: None,
            modal: None,
            notifications: Vec::new(),
            next_notification_id: 1,
            selection: None,
            search: SearchDraft::default(),
            scroll_anchors: BTreeMap::new(),
            loading: LoadingFlags::default(),
        }
    }

    /// Queues a notification, dropping the oldest ones beyond `limit`.
    pub fn push_notification(
        &mut self,
        kind: NotificationKind,
        message: impl Into<String>,
        issued_at: DateTime<Utc>,
        limit: usize,
    ) -> u64 {
        let id = self.next_notification_id;
        self.next_notification_id += 1;
        self.notifications.push(Notification {
            id,
            kind,
            message: message.into(),
            issued_at,
        });
        if limit > 0 && self.notifications.len() > limit {
            let overflow = self.notifications.len() - limit;
            self.notifications.drain(..overflow);
        }
        id
    }

    pub fn dismiss_notification(&mut self, id: u64) -> bool {
        let before = self.notifications.len();
        self.notifications.retain(|notification| notification.id != id);
        before != self.notifications.len()
    }

    /// Adds or removes a message from the selection. Selecting in another
    /// chat starts a fresh selection there.
    pub fn toggle_selection(&mut self, chat_id: &ChatId, message_id: MessageId) {
        let same_chat = self
            .selection
            .as_ref()
            .is_some_and(|selection| &selection.chat_id == chat_id);
        if !same_chat {
            self.selection = Some(MessageSelection {
                chat_id: chat_id.clone(),
                message_ids: BTreeSet::new(),
            });
        }
        let Some(selection) = self.selection.as_mut() else {
            return;
        };
        if !selection.message_ids.remove(&message_id) {
            selection.message_ids.insert(message_id);
        }
        if selection.message_ids.is_empty() {
            self.selection = None;
        }
    }

    /// Forgets every reference this tab holds to the given messages.
    pub fn forget_messages(&mut self, chat_id: &ChatId, message_ids: &[MessageId]) {
        if let Some(selection) = &mut self.selection {
            if &selection.chat_id == chat_id {
                for id in message_ids {
                    selection.message_ids.remove(id);
                }
                if selection.message_ids.is_empty() {
                    self.selection = None;
                }
            }
        }
        if self
            .scroll_anchors
            .get(chat_id)
            .is_some_and(|anchor| message_ids.contains(anchor))
        {
            self.scroll_anchors.remove(chat_id);
        }
        let modal_targets_deleted = match &self.modal {
            Some(Modal::DeleteMessages { chat_id: modal_chat, .. })
            | Some(Modal::ReportMessages { chat_id: modal_chat, .. }) => modal_chat == chat_id,
            Some(Modal::PinMessage {
                chat_id: modal_chat,
                message_id,
            })
            | Some(Modal::MediaViewer {
                chat_id: modal_chat,
                message_id,
            }) => modal_chat == chat_id && message_ids.contains(message_id),
            _ => false,
        };
        if modal_targets_deleted {
            self.modal = None;
        }
    }

    /// Forgets every reference this tab holds to a chat.
    pub fn forget_chat(&mut self, chat_id: &ChatId) {
        if self.current_chat_id.as_ref() == Some(chat_id) {
            self.current_chat_id = None;
        }
        if self
            .selection
            .as_ref()
            .is_some_and(|selection| &selection.chat_id == chat_id)
        {
            self.selection = None;
        }
        if self.search.chat_id.as_ref() == Some(chat_id) {
            self.search.chat_id = None;
        }
        self.scroll_anchors.remove(chat_id);
        let modal_chat = match &self.modal {
            Some(Modal::DeleteMessages { chat_id, .. })
            | Some(Modal::ReportMessages { chat_id, .. })
            | Some(Modal::PinMessage { chat_id, .. })
            | Some(Modal::MediaViewer { chat_id, .. })
            | Some(Modal::Invite { chat_id }) => Some(chat_id),
            Some(Modal::CountryPicker) | None => None,
        };
        if modal_chat == Some(chat_id) {
            self.modal = None;
        }
    }
}
