//! The action vocabulary and its routing table.
//!
//! [`Action`] is a closed sum type: adding a variant without routing it in
//! [`apply_action`] is a compile error, so there is no runtime registry to
//! race against. The string form used by external callers,
//! `{"kind": "<name>", "payload": {...}}`, is handled by
//! [`Action::from_json`].

mod catalog;
mod contacts;
mod messages;
mod session;
mod sync;
mod tabs;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::account::{AuthSession, SettingsPatch};
use crate::core::entities::{Chat, CountryCode, Message, PhotoRef, User};
use crate::core::ids::{ChatId, CorrelationId, MessageId, OriginId, TabId, UserId};
use crate::core::optimistic::{LedgerError, OptimisticTarget, Resolution};
use crate::core::patch::EntityPatch;
use crate::core::persist::PersistedState;
use crate::core::snapshot::Draft;
use crate::core::tab_state::{LeftScreen, Modal, NotificationKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Action {
    RegisterTab,
    UnregisterTab,
    SetLeftScreen {
        screen: LeftScreen,
    },
    OpenChat {
        #[serde(default)]
        chat_id: Option<ChatId>,
    },
    OpenModal {
        modal: Modal,
    },
    CloseModal,
    ShowNotification {
        message: String,
        #[serde(default)]
        kind: NotificationKind,
    },
    DismissNotification {
        id: u64,
    },
    ToggleMessageSelection {
        chat_id: ChatId,
        message_id: MessageId,
    },
    ExitMessageSelectMode,
    SetSearchQuery {
        #[serde(default)]
        query: Option<String>,
        #[serde(default)]
        chat_id: Option<ChatId>,
    },
    SetScrollAnchor {
        chat_id: ChatId,
        #[serde(default)]
        message_id: Option<MessageId>,
    },

    LoadChats,
    ChatsLoaded {
        chats: Vec<Chat>,
        #[serde(default)]
        users: Vec<User>,
        #[serde(default)]
        messages: Vec<Message>,
        /// Reset the chat list to exactly `chats` instead of merging.
        #[serde(default)]
        replace: bool,
    },
    ChatsLoadFailed {
        error: String,
    },
    ToggleChatMuted {
        chat_id: ChatId,
    },
    DeleteChat {
        chat_id: ChatId,
    },
    LoadCountryList,
    CountryListLoaded {
        countries: Vec<CountryCode>,
    },
    CountryListLoadFailed {
        error: String,
    },

    SendMessage {
        chat_id: ChatId,
        text: String,
        #[serde(default = "CorrelationId::generate")]
        correlation: CorrelationId,
    },
    SendMessageSucceeded {
        correlation: CorrelationId,
        message: Message,
    },
    SendMessageFailed {
        correlation: CorrelationId,
        error: String,
    },
    DeleteMessages {
        chat_id: ChatId,
        message_ids: Vec<MessageId>,
    },
    MessagesDeleted {
        chat_id: ChatId,
        message_ids: Vec<MessageId>,
    },
    DeleteMessagesFailed {
        chat_id: ChatId,
        message_ids: Vec<MessageId>,
        error: String,
    },
    PinMessage {
        chat_id: ChatId,
        message_id: MessageId,
        #[serde(default = "default_true")]
        is_pinned: bool,
        #[serde(default = "CorrelationId::generate")]
        correlation: CorrelationId,
    },
    PinMessageSucceeded {
        correlation: CorrelationId,
    },
    PinMessageFailed {
        correlation: CorrelationId,
        error: String,
    },

    UpdateContact {
        user_id: UserId,
        first_name: String,
        #[serde(default)]
        last_name: Option<String>,
        #[serde(default = "CorrelationId::generate")]
        correlation: CorrelationId,
    },
    UpdateContactSucceeded {
        correlation: CorrelationId,
        user: User,
    },
    UpdateContactFailed {
        correlation: CorrelationId,
        error: String,
    },
    UploadProfilePhoto {
        file_name: String,
        #[serde(default = "CorrelationId::generate")]
        correlation: CorrelationId,
    },
    UploadProfilePhotoSucceeded {
        correlation: CorrelationId,
        photo: PhotoRef,
    },
    UploadProfilePhotoFailed {
        correlation: CorrelationId,
        error: String,
    },

    UpdateSettings(SettingsPatch),
    SetAuthSession {
        session: AuthSession,
    },
    SignOut,
    Hydrate {
        state: Box<PersistedState>,
    },
    ApplyRemotePatch {
        origin: OriginId,
        version: u64,
        patch: EntityPatch,
    },
}

fn default_true() -> bool {
    true
}

impl Action {
    /// Every action name accepted by [`Action::from_json`].
    pub const NAMES: &'static [&'static str] = &[
        "registerTab",
        "unregisterTab",
        "setLeftScreen",
        "openChat",
        "openModal",
        "closeModal",
        "showNotification",
        "dismissNotification",
        "toggleMessageSelection",
        "exitMessageSelectMode",
        "setSearchQuery",
        "setScrollAnchor",
        "loadChats",
        "chatsLoaded",
        "chatsLoadFailed",
        "toggleChatMuted",
        "deleteChat",
        "loadCountryList",
        "countryListLoaded",
        "countryListLoadFailed",
        "sendMessage",
        "sendMessageSucceeded",
        "sendMessageFailed",
        "deleteMessages",
        "messagesDeleted",
        "deleteMessagesFailed",
        "pinMessage",
        "pinMessageSucceeded",
        "pinMessageFailed",
        "updateContact",
        "updateContactSucceeded",
        "updateContactFailed",
        "uploadProfilePhoto",
        "uploadProfilePhotoSucceeded",
        "uploadProfilePhotoFailed",
        "updateSettings",
        "setAuthSession",
        "signOut",
        "hydrate",
        "applyRemotePatch",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Action::RegisterTab => "registerTab",
            Action::UnregisterTab => "unregisterTab",
            Action::SetLeftScreen { .. } => "setLeftScreen",
            Action::OpenChat { .. } => "openChat",
            Action::OpenModal { .. } => "openModal",
            Action::CloseModal => "closeModal",
            Action::ShowNotification { .. } => "showNotification",
            Action::DismissNotification { .. } => "dismissNotification",
            Action::ToggleMessageSelection { .. } => "toggleMessageSelection",
            Action::ExitMessageSelectMode => "exitMessageSelectMode",
            Action::SetSearchQuery { .. } => "setSearchQuery",
            Action::SetScrollAnchor { .. } => "setScrollAnchor",
            Action::LoadChats => "loadChats",
            Action::ChatsLoaded { .. } => "chatsLoaded",
            Action::ChatsLoadFailed { .. } => "chatsLoadFailed",
            Action::ToggleChatMuted { .. } => "toggleChatMuted",
            Action::DeleteChat { .. } => "deleteChat",
            Action::LoadCountryList => "loadCountryList",
            Action::CountryListLoaded { .. } => "countryListLoaded",
            Action::CountryListLoadFailed { .. } => "countryListLoadFailed",
            Action::SendMessage { .. } => "sendMessage",
            Action::SendMessageSucceeded { .. } => "sendMessageSucceeded",
            Action::SendMessageFailed { .. } => "sendMessageFailed",
            Action::DeleteMessages { .. } => "deleteMessages",
            Action::MessagesDeleted { .. } => "messagesDeleted",
            Action::DeleteMessagesFailed { .. } => "deleteMessagesFailed",
            Action::PinMessage { .. } => "pinMessage",
            Action::PinMessageSucceeded { .. } => "pinMessageSucceeded",
            Action::PinMessageFailed { .. } => "pinMessageFailed",
            Action::UpdateContact { .. } => "updateContact",
            Action::UpdateContactSucceeded { .. } => "updateContactSucceeded",
            Action::UpdateContactFailed { .. } => "updateContactFailed",
            Action::UploadProfilePhoto { .. } => "uploadProfilePhoto",
            Action::UploadProfilePhotoSucceeded { .. } => "uploadProfilePhotoSucceeded",
            Action::UploadProfilePhotoFailed { .. } => "uploadProfilePhotoFailed",
            Action::UpdateSettings(_) => "updateSettings",
            Action::SetAuthSession { .. } => "setAuthSession",
            Action::SignOut => "signOut",
            Action::Hydrate { .. } => "hydrate",
            Action::ApplyRemotePatch { .. } => "applyRemotePatch",
        }
    }

    /// Parses the `dispatch(name, payload)` form. A `null` or empty payload
    /// is accepted for actions whose fields are all optional.
    pub fn from_json(kind: &str, payload: serde_json::Value) -> Result<Action, ActionParseError> {
        if !Self::NAMES.contains(&kind) {
            return Err(ActionParseError::UnknownAction(kind.to_string()));
        }

        let bare = match &payload {
            serde_json::Value::Null => true,
            serde_json::Value::Object(fields) => fields.is_empty(),
            _ => false,
        };
        let tagged = |payload: Option<serde_json::Value>| {
            let mut envelope = serde_json::Map::new();
            envelope.insert("kind".into(), serde_json::Value::String(kind.to_string()));
            if let Some(payload) = payload {
                envelope.insert("payload".into(), payload);
            }
            serde_json::from_value::<Action>(serde_json::Value::Object(envelope))
        };

        if !bare {
            return tagged(Some(payload)).map_err(|source| ActionParseError::MalformedPayload {
                kind: kind.to_string(),
                source,
            });
        }
        tagged(None)
            .or_else(|_| tagged(Some(serde_json::Value::Object(serde_json::Map::new()))))
            .map_err(|source| ActionParseError::MalformedPayload {
                kind: kind.to_string(),
                source,
            })
    }

    /// UI actions only make sense for a registered tab. Completions, sync
    /// and lifecycle actions are accepted from anywhere.
    pub fn requires_tab(&self) -> bool {
        matches!(
            self,
            Action::SetLeftScreen { .. }
                | Action::OpenChat { .. }
                | Action::OpenModal { .. }
                | Action::CloseModal
                | Action::ShowNotification { .. }
                | Action::DismissNotification { .. }
                | Action::ToggleMessageSelection { .. }
                | Action::ExitMessageSelectMode
                | Action::SetSearchQuery { .. }
                | Action::SetScrollAnchor { .. }
                | Action::LoadChats
                | Action::ToggleChatMuted { .. }
                | Action::DeleteChat { .. }
                | Action::LoadCountryList
                | Action::SendMessage { .. }
                | Action::DeleteMessages { .. }
                | Action::PinMessage { .. }
                | Action::UpdateContact { .. }
                | Action::UploadProfilePhoto { .. }
        )
    }

    pub fn send_message(chat_id: impl Into<ChatId>, text: impl Into<String>) -> Action {
        Action::SendMessage {
            chat_id: chat_id.into(),
            text: text.into(),
            correlation: CorrelationId::generate(),
        }
    }

    pub fn pin_message(chat_id: impl Into<ChatId>, message_id: MessageId, is_pinned: bool) -> Action {
        Action::PinMessage {
            chat_id: chat_id.into(),
            message_id,
            is_pinned,
            correlation: CorrelationId::generate(),
        }
    }

    pub fn update_contact(
        user_id: impl Into<UserId>,
        first_name: impl Into<String>,
        last_name: Option<String>,
    ) -> Action {
        Action::UpdateContact {
            user_id: user_id.into(),
            first_name: first_name.into(),
            last_name,
            correlation: CorrelationId::generate(),
        }
    }

    pub fn upload_profile_photo(file_name: impl Into<String>) -> Action {
        Action::UploadProfilePhoto {
            file_name: file_name.into(),
            correlation: CorrelationId::generate(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActionParseError {
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("malformed payload for '{kind}': {source}")]
    MalformedPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Why a handler refused an action. Nothing the handler wrote is kept.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ActionError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        ActionError::Rejected(reason.into())
    }
}

/// An action plus the tab that issued it and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEnvelope {
    pub tab_id: TabId,
    pub issued_at: DateTime<Utc>,
    pub action: Action,
}

impl ActionEnvelope {
    pub fn new(tab_id: TabId, action: Action) -> Self {
        Self {
            tab_id,
            issued_at: Utc::now(),
            action,
        }
    }
}

/// Queues actions for the runtime. Cheap to clone; safe to use from effect
/// tasks and binding callbacks since nothing runs until the queue is drained.
#[derive(Clone)]
pub struct ActionDispatcher {
    tx: mpsc::UnboundedSender<ActionEnvelope>,
}

impl ActionDispatcher {
    pub fn new(tx: mpsc::UnboundedSender<ActionEnvelope>) -> Self {
        Self { tx }
    }

    pub fn dispatch(&self, tab_id: &TabId, action: Action) {
        self.dispatch_envelope(ActionEnvelope::new(tab_id.clone(), action));
    }

    pub fn dispatch_many<I>(&self, tab_id: &TabId, actions: I)
    where
        I: IntoIterator<Item = Action>,
    {
        for action in actions.into_iter() {
            self.dispatch(tab_id, action);
        }
    }

    pub fn dispatch_envelope(&self, envelope: ActionEnvelope) {
        if let Err(err) = self.tx.send(envelope) {
            debug!(action = err.0.action.name(), "dispatch after runtime shut down");
        }
    }
}

pub fn apply_action(draft: &mut Draft<'_>, action: Action) -> Result<(), ActionError> {
    match action {
        Action::RegisterTab
        | Action::UnregisterTab
        | Action::SetLeftScreen { .. }
        | Action::OpenChat { .. }
        | Action::OpenModal { .. }
        | Action::CloseModal
        | Action::ShowNotification { .. }
        | Action::DismissNotification { .. }
        | Action::ToggleMessageSelection { .. }
        | Action::ExitMessageSelectMode
        | Action::SetSearchQuery { .. }
        | Action::SetScrollAnchor { .. } => tabs::handle_tab_action(draft, action),

        Action::LoadChats
        | Action::ChatsLoaded { .. }
        | Action::ChatsLoadFailed { .. }
        | Action::ToggleChatMuted { .. }
        | Action::DeleteChat { .. }
        | Action::LoadCountryList
        | Action::CountryListLoaded { .. }
        | Action::CountryListLoadFailed { .. } => catalog::handle_catalog_action(draft, action),

        Action::SendMessage { .. }
        | Action::SendMessageSucceeded { .. }
        | Action::SendMessageFailed { .. }
        | Action::DeleteMessages { .. }
        | Action::MessagesDeleted { .. }
        | Action::DeleteMessagesFailed { .. }
        | Action::PinMessage { .. }
        | Action::PinMessageSucceeded { .. }
        | Action::PinMessageFailed { .. } => messages::handle_message_action(draft, action),

        Action::UpdateContact { .. }
        | Action::UpdateContactSucceeded { .. }
        | Action::UpdateContactFailed { .. }
        | Action::UploadProfilePhoto { .. }
        | Action::UploadProfilePhotoSucceeded { .. }
        | Action::UploadProfilePhotoFailed { .. } => contacts::handle_contact_action(draft, action),

        Action::UpdateSettings(_)
        | Action::SetAuthSession { .. }
        | Action::SignOut
        | Action::Hydrate { .. } => session::handle_session_action(draft, action),

        Action::ApplyRemotePatch { .. } => sync::handle_sync_action(draft, action),
    }
}

/// Undoes the speculative write of a rolled-back operation, unless a later
/// operation on the same record took over its pre-image.
fn rollback(draft: &mut Draft<'_>, resolution: &Resolution) {
    if !resolution.restore {
        return;
    }
    match &resolution.op.target {
        OptimisticTarget::SendMessage {
            chat_id,
            local_id,
            previous_last_message_id,
            previous_last_message_date,
        } => {
            draft.remove_messages(chat_id, &[*local_id]);
            draft.update_chat(chat_id, |chat| {
                if chat.last_message_id == Some(*local_id) {
                    chat.last_message_id = *previous_last_message_id;
                    chat.last_message_date = *previous_last_message_date;
                }
            });
        }
        OptimisticTarget::PinMessage {
            chat_id,
            message_id,
            was_pinned,
        } => {
            draft.update_message(chat_id, message_id, |message| {
                message.is_pinned = *was_pinned
            });
        }
        OptimisticTarget::UpdateContact { previous } => {
            draft.update_user(&previous.id, |user| *user = previous.clone());
        }
        OptimisticTarget::UploadProfilePhoto {
            user_id,
            previous_photo,
        } => {
            draft.update_user(user_id, |user| user.photo = previous_photo.clone());
        }
    }
}
