//! Identifier types for entities, tabs and optimistic operations.
//!
//! Every cross-reference in the entity store is one of these ids; records
//! never embed copies of other records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of a chat (private dialog, group or channel).
    ChatId
);
string_id!(
    /// Identifier of a user.
    UserId
);
string_id!(StickerSetId);
string_id!(
    /// Hash identifying an authorized session on another device.
    SessionId
);
string_id!(
    /// ISO 3166-1 alpha-2 country code, upper case.
    CountryIso
);
string_id!(
    /// Opaque identifier of one tab sharing the session.
    TabId
);
string_id!(
    /// Identifier of one store instance on the cross-tab channel.
    OriginId
);

impl TabId {
    /// The pseudo-tab that owns inputs not issued by any tab.
    pub fn system() -> Self {
        Self::new(crate::core::constants::SYSTEM_TAB)
    }

    pub fn is_system(&self) -> bool {
        self.0 == crate::core::constants::SYSTEM_TAB
    }
}

impl OriginId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Client-generated id tying an optimistic change to its eventual server
/// echo or failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

const LOCAL_MESSAGE_PREFIX: &str = "local-";

/// Message id within a chat.
///
/// Server ids are ordered integers; local ids name messages that exist only
/// optimistically and always sort after every server id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MessageId {
    Server(i64),
    Local(CorrelationId),
}

impl MessageId {
    pub fn is_local(&self) -> bool {
        matches!(self, MessageId::Local(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Server(id) => write!(f, "{id}"),
            MessageId::Local(correlation) => write!(f, "{LOCAL_MESSAGE_PREFIX}{correlation}"),
        }
    }
}

impl FromStr for MessageId {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = value.strip_prefix(LOCAL_MESSAGE_PREFIX) {
            return Uuid::parse_str(rest)
                .map(|uuid| MessageId::Local(CorrelationId(uuid)))
                .map_err(|err| format!("invalid local message id '{value}': {err}"));
        }
        value
            .parse::<i64>()
            .map(MessageId::Server)
            .map_err(|_| format!("invalid message id '{value}'"))
    }
}

impl TryFrom<String> for MessageId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MessageId> for String {
    fn from(value: MessageId) -> Self {
        value.to_string()
    }
}

impl From<i64> for MessageId {
    fn from(value: i64) -> Self {
        MessageId::Server(value)
    }
}
