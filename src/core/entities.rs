//! Normalized domain records and the tables that hold them.
//!
//! Every record lives in exactly one [`EntityTable`] and is addressed by its
//! id. Records are stored behind `Arc` so that a new snapshot can reuse every
//! record it did not touch; `Arc::ptr_eq` on a table or a record is how the
//! rest of the crate tells whether anything changed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::core::ids::{ChatId, CountryIso, MessageId, SessionId, StickerSetId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Chat,
    User,
    Message,
    StickerSet,
    Session,
    Country,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Chat => "chat",
            EntityKind::User => "user",
            EntityKind::Message => "message",
            EntityKind::StickerSet => "stickerSet",
            EntityKind::Session => "session",
            EntityKind::Country => "country",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record that can live in an [`EntityTable`].
pub trait Entity: Clone + PartialEq + fmt::Debug {
    type Id: Ord + Clone + fmt::Debug + fmt::Display;
    const KIND: EntityKind;

    fn id(&self) -> Self::Id;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChatKind {
    #[default]
    Private,
    Group,
    Channel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    pub title: String,
    #[serde(default)]
    pub kind: ChatKind,
    #[serde(default)]
    pub member_ids: Vec<UserId>,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub last_message_id: Option<MessageId>,
    #[serde(default)]
    pub last_message_date: Option<DateTime<Utc>>,
}

impl Entity for Chat {
    type Id = ChatId;
    const KIND: EntityKind = EntityKind::Chat;

    fn id(&self) -> ChatId {
        self.id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoRef {
    pub id: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    /// Set while the photo exists only on this client.
    #[serde(default)]
    pub is_local: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub is_contact: bool,
    #[serde(default)]
    pub photo: Option<PhotoRef>,
}

impl User {
    pub fn display_name(&self) -> String {
        match self.last_name.as_deref().filter(|name| !name.is_empty()) {
            Some(last) => format!("{} {}", self.first_name, last),
            None => self.first_name.clone(),
        }
    }
}

impl Entity for User {
    type Id = UserId;
    const KIND: EntityKind = EntityKind::User;

    fn id(&self) -> UserId {
        self.id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    #[serde(default)]
    pub sender_id: Option<UserId>,
    pub text: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub is_pinned: bool,
    /// True while the message waits for the server echo.
    #[serde(default)]
    pub is_pending: bool,
}

impl Entity for Message {
    type Id = MessageId;
    const KIND: EntityKind = EntityKind::Message;

    fn id(&self) -> MessageId {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StickerSet {
    pub id: StickerSetId,
    pub title: String,
    pub short_name: String,
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub is_installed: bool,
}

impl Entity for StickerSet {
    type Id = StickerSetId;
    const KIND: EntityKind = EntityKind::StickerSet;

    fn id(&self) -> StickerSetId {
        self.id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub device_model: String,
    pub app_name: String,
    #[serde(default)]
    pub is_current: bool,
    pub last_active: DateTime<Utc>,
}

impl Entity for Session {
    type Id = SessionId;
    const KIND: EntityKind = EntityKind::Session;

    fn id(&self) -> SessionId {
        self.id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountryCode {
    pub iso2: CountryIso,
    pub default_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub calling_codes: Vec<String>,
    #[serde(default)]
    pub is_hidden: bool,
}

impl Entity for CountryCode {
    type Id = CountryIso;
    const KIND: EntityKind = EntityKind::Country;

    fn id(&self) -> CountryIso {
        self.iso2.clone()
    }
}

/// Records of one kind keyed by id.
///
/// Serialized as a plain list of records; the key is always recomputed from
/// [`Entity::id`], so a table can never hold a record under a foreign key.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityTable<K: Ord, V> {
    by_id: BTreeMap<K, Arc<V>>,
}

impl<K: Ord, V> Default for EntityTable<K, V> {
    fn default() -> Self {
        Self {
            by_id: BTreeMap::new(),
        }
    }
}

impl<K, V> EntityTable<K, V>
where
    K: Ord + Clone,
    V: Entity<Id = K>,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = V>) -> Self {
        let by_id = records
            .into_iter()
            .map(|record| (record.id(), Arc::new(record)))
            .collect();
        Self { by_id }
    }

    pub fn get(&self, id: &K) -> Option<&Arc<V>> {
        self.by_id.get(id)
    }

    pub fn contains(&self, id: &K) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &Arc<V>)> {
        self.by_id.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &Arc<V>> {
        self.by_id.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &K> {
        self.by_id.keys()
    }

    /// Inserts or overwrites a record. Returns false when an equal record was
    /// already present; the stored `Arc` is then left untouched.
    pub fn upsert(&mut self, record: V) -> bool {
        match self.by_id.get(&record.id()) {
            Some(existing) if **existing == record => false,
            _ => {
                self.by_id.insert(record.id(), Arc::new(record));
                true
            }
        }
    }

    /// Like [`upsert`](Self::upsert) but keeps the caller's `Arc`, preserving
    /// identity shared with another snapshot.
    pub fn upsert_arc(&mut self, record: Arc<V>) -> bool {
        match self.by_id.get(&record.id()) {
            Some(existing) if Arc::ptr_eq(existing, &record) || **existing == *record => false,
            _ => {
                self.by_id.insert(record.id(), record);
                true
            }
        }
    }

    pub fn remove(&mut self, id: &K) -> Option<Arc<V>> {
        self.by_id.remove(id)
    }

    /// Applies `edit` to a copy of the record and stores it only if it
    /// differs. Returns whether the record changed.
    pub fn update(&mut self, id: &K, edit: impl FnOnce(&mut V)) -> bool {
        let Some(entry) = self.by_id.get_mut(id) else {
            return false;
        };
        let mut next = (**entry).clone();
        edit(&mut next);
        if next == **entry {
            return false;
        }
        *entry = Arc::new(next);
        true
    }
}

impl<K: Ord, V: Serialize> Serialize for EntityTable<K, V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.by_id.values().map(|record| record.as_ref()))
    }
}

impl<'de, K, V> Deserialize<'de> for EntityTable<K, V>
where
    K: Ord + Clone,
    V: Entity<Id = K> + Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let records = Vec::<V>::deserialize(deserializer)?;
        Ok(Self::from_records(records))
    }
}

pub type ChatTable = EntityTable<ChatId, Chat>;
pub type UserTable = EntityTable<UserId, User>;
pub type MessageTable = EntityTable<MessageId, Message>;
pub type StickerSetTable = EntityTable<StickerSetId, StickerSet>;
pub type SessionTable = EntityTable<SessionId, Session>;
pub type CountryTable = EntityTable<CountryIso, CountryCode>;

/// The shared, normalized domain graph.
///
/// Cloning is cheap: every field is an `Arc`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entities {
    pub chats: Arc<ChatTable>,
    pub users: Arc<UserTable>,
    /// Messages grouped per chat; a chat without loaded messages has no entry.
    pub messages: Arc<BTreeMap<ChatId, Arc<MessageTable>>>,
    pub sticker_sets: Arc<StickerSetTable>,
    pub sessions: Arc<SessionTable>,
    pub countries: Arc<CountryTable>,
}

impl Entities {
    /// True when both graphs share every table by identity.
    pub fn ptr_eq(&self, other: &Entities) -> bool {
        Arc::ptr_eq(&self.chats, &other.chats)
            && Arc::ptr_eq(&self.users, &other.users)
            && Arc::ptr_eq(&self.messages, &other.messages)
            && Arc::ptr_eq(&self.sticker_sets, &other.sticker_sets)
            && Arc::ptr_eq(&self.sessions, &other.sessions)
            && Arc::ptr_eq(&self.countries, &other.countries)
    }

    pub fn messages_in(&self, chat_id: &ChatId) -> Option<&Arc<MessageTable>> {
        self.messages.get(chat_id)
    }

    pub fn message(&self, chat_id: &ChatId, message_id: &MessageId) -> Option<&Arc<Message>> {
        self.messages_in(chat_id)?.get(message_id)
    }

    pub fn message_count(&self) -> usize {
        self.messages.values().map(|table| table.len()).sum()
    }

    /// Mutable access to one chat's message table, creating it when absent.
    pub fn messages_mut(&mut self, chat_id: &ChatId) -> &mut MessageTable {
        let by_chat = Arc::make_mut(&mut self.messages);
        let table = by_chat.entry(chat_id.clone()).or_default();
        Arc::make_mut(table)
    }

    /// Drops a chat's message table if it ended up empty.
    pub fn prune_empty_messages(&mut self, chat_id: &ChatId) {
        let is_empty = self
            .messages
            .get(chat_id)
            .is_some_and(|table| table.is_empty());
        if is_empty {
            Arc::make_mut(&mut self.messages).remove(chat_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::{sample_chat, sample_user};

    #[test]
    fn upsert_of_equal_record_keeps_identity() {
        let mut table = ChatTable::from_records([sample_chat("c1", "One")]);
        let before = Arc::clone(table.get(&ChatId::from("c1")).unwrap());

        assert!(!table.upsert(sample_chat("c1", "One")));
        assert!(Arc::ptr_eq(&before, table.get(&ChatId::from("c1")).unwrap()));

        assert!(table.upsert(sample_chat("c1", "Renamed")));
        assert!(!Arc::ptr_eq(&before, table.get(&ChatId::from("c1")).unwrap()));
    }

    #[test]
    fn update_without_change_is_not_a_write() {
        let mut table = UserTable::from_records([sample_user("u1", "Ada")]);
        let before = Arc::clone(table.get(&UserId::from("u1")).unwrap());

        assert!(!table.update(&UserId::from("u1"), |user| user.first_name = "Ada".into()));
        assert!(Arc::ptr_eq(&before, table.get(&UserId::from("u1")).unwrap()));
        assert!(table.update(&UserId::from("u1"), |user| user.is_contact = true));
        assert!(!table.update(&UserId::from("missing"), |user| user.is_contact = true));
    }

    #[test]
    fn table_serializes_as_record_list() {
        let table = ChatTable::from_records([sample_chat("c2", "Two"), sample_chat("c1", "One")]);
        let json = serde_json::to_value(&table).unwrap();
        let ids: Vec<_> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|chat| chat["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, ["c1", "c2"]);

        let back: ChatTable = serde_json::from_value(json).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn display_name_skips_empty_last_name() {
        let mut user = sample_user("u1", "Ada");
        assert_eq!(user.display_name(), "Ada");
        user.last_name = Some(String::new());
        assert_eq!(user.display_name(), "Ada");
        user.last_name = Some("Lovelace".into());
        assert_eq!(user.display_name(), "Ada Lovelace");
    }
}
