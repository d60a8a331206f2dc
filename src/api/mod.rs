//! The network seam.
//!
//! The runtime only talks to the server through [`ApiClient`], so tests and
//! the replay tool can substitute a scripted client for [`HttpApiClient`].

mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::entities::{Chat, CountryCode, Message, PhotoRef, User};
use crate::core::ids::{ChatId, CorrelationId, MessageId, UserId};

pub use http::HttpApiClient;

/// One page of the chat list together with the users and latest messages
/// it references.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatsPage {
    pub chats: Vec<Chat>,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("API request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("not signed in")]
    Unauthenticated,
}

impl ApiError {
    /// Error for a non-success response. A 401 means the session token was
    /// missing or rejected.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 => ApiError::Unauthenticated,
            _ => ApiError::Status { status, body },
        }
    }

    /// Failures worth retrying without user involvement.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport(err) => err.is_timeout() || err.is_connect(),
            ApiError::Status { status, .. } => *status == 429 || *status >= 500,
            ApiError::Unauthenticated => false,
        }
    }
}

#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn load_chats(&self) -> Result<ChatsPage, ApiError>;

    /// Sends a message; the server echoes the stored copy with its real id.
    async fn send_message(
        &self,
        chat_id: &ChatId,
        text: &str,
        correlation: CorrelationId,
    ) -> Result<Message, ApiError>;

    async fn delete_messages(
        &self,
        chat_id: &ChatId,
        message_ids: &[MessageId],
    ) -> Result<(), ApiError>;

    async fn pin_message(
        &self,
        chat_id: &ChatId,
        message_id: MessageId,
        is_pinned: bool,
    ) -> Result<(), ApiError>;

    async fn update_contact(&self, user: &User) -> Result<User, ApiError>;

    async fn upload_profile_photo(
        &self,
        user_id: &UserId,
        file_name: &str,
    ) -> Result<PhotoRef, ApiError>;

    async fn fetch_country_list(&self, language: &str) -> Result<Vec<CountryCode>, ApiError>;
}
