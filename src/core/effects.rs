//! Side effects requested by action handlers.
//!
//! Handlers stay synchronous and pure; anything that talks to the network is
//! returned as an [`Effect`] and carried out by the runtime's executor, which
//! reports back by dispatching a "succeeded" or "failed" action.

use crate::core::entities::User;
use crate::core::ids::{ChatId, CorrelationId, MessageId, TabId, UserId};

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    LoadChats,
    SendMessage {
        chat_id: ChatId,
        text: String,
        correlation: CorrelationId,
    },
    DeleteMessages {
        chat_id: ChatId,
        message_ids: Vec<MessageId>,
    },
    PinMessage {
        chat_id: ChatId,
        message_id: MessageId,
        is_pinned: bool,
        correlation: CorrelationId,
    },
    UpdateContact {
        user: User,
        correlation: CorrelationId,
    },
    UploadProfilePhoto {
        user_id: UserId,
        file_name: String,
        correlation: CorrelationId,
    },
    FetchCountryList {
        language: String,
    },
    /// Abort every in-flight request issued by the tab.
    CancelTab,
    /// Abort every in-flight request concerning a chat, from any tab.
    CancelChat {
        chat_id: ChatId,
    },
    CancelAll,
}

impl Effect {
    /// The chat an in-flight request belongs to, used for scoped
    /// cancellation.
    pub fn chat_id(&self) -> Option<&ChatId> {
        match self {
            Effect::SendMessage { chat_id, .. }
            | Effect::DeleteMessages { chat_id, .. }
            | Effect::PinMessage { chat_id, .. } => Some(chat_id),
            _ => None,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Effect::CancelTab | Effect::CancelChat { .. } | Effect::CancelAll
        )
    }
}

/// An effect together with the tab whose action requested it.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectRequest {
    pub tab_id: TabId,
    pub effect: Effect,
}
