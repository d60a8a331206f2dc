//! Entity patches: the unit of change for the entity store.
//!
//! A patch names one table and lists records to upsert and ids to remove.
//! Merge patches leave sibling records alone; replace patches reset the table
//! to exactly the listed records. Applying a patch only allocates new `Arc`s
//! for what actually changed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::entities::{
    Chat, CountryCode, Entities, Entity, EntityKind, EntityTable, Message, Session, StickerSet,
    User,
};
use crate::core::ids::{ChatId, CountryIso, MessageId, SessionId, StickerSetId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PatchMode {
    #[default]
    Merge,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TablePatch<K, V> {
    #[serde(default)]
    pub mode: PatchMode,
    #[serde(default = "Vec::new")]
    pub upsert: Vec<V>,
    #[serde(default = "Vec::new")]
    pub remove: Vec<K>,
}

impl<K, V> Default for TablePatch<K, V> {
    fn default() -> Self {
        Self {
            mode: PatchMode::Merge,
            upsert: Vec::new(),
            remove: Vec::new(),
        }
    }
}

impl<K, V> TablePatch<K, V>
where
    K: Ord + Clone,
    V: Entity<Id = K>,
{
    pub fn merge(upsert: Vec<V>) -> Self {
        Self {
            mode: PatchMode::Merge,
            upsert,
            remove: Vec::new(),
        }
    }

    pub fn replace(records: Vec<V>) -> Self {
        Self {
            mode: PatchMode::Replace,
            upsert: records,
            remove: Vec::new(),
        }
    }

    pub fn removal(ids: Vec<K>) -> Self {
        Self {
            mode: PatchMode::Merge,
            upsert: Vec::new(),
            remove: ids,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mode == PatchMode::Merge && self.upsert.is_empty() && self.remove.is_empty()
    }

    fn ids(&self) -> impl Iterator<Item = K> + '_ {
        self.upsert
            .iter()
            .map(|record| record.id())
            .chain(self.remove.iter().cloned())
    }

    fn retain(&self, mut keep: impl FnMut(&K) -> bool) -> Self {
        Self {
            mode: self.mode,
            upsert: self
                .upsert
                .iter()
                .filter(|record| keep(&record.id()))
                .cloned()
                .collect(),
            remove: self.remove.iter().filter(|id| keep(id)).cloned().collect(),
        }
    }

    /// The same change against `table` as a merge: a replace becomes upserts
    /// plus explicit removal of every present id it does not list.
    fn as_merge(&self, table: &EntityTable<K, V>) -> Self {
        match self.mode {
            PatchMode::Merge => self.clone(),
            PatchMode::Replace => {
                let listed: Vec<K> = self.upsert.iter().map(|record| record.id()).collect();
                let mut remove = self.remove.clone();
                remove.extend(
                    table
                        .ids()
                        .filter(|id| !listed.contains(id) && !self.remove.contains(id))
                        .cloned(),
                );
                Self {
                    mode: PatchMode::Merge,
                    upsert: self.upsert.clone(),
                    remove,
                }
            }
        }
    }

    /// Applies the patch to `table`. Returns whether the table changed; when
    /// it did not, the `Arc` is left pointing at the original table.
    pub fn apply_to(&self, table: &mut Arc<EntityTable<K, V>>) -> bool {
        match self.mode {
            PatchMode::Merge => {
                let needs_write = self.upsert.iter().any(|record| {
                    table
                        .get(&record.id())
                        .is_none_or(|existing| **existing != *record)
                }) || self.remove.iter().any(|id| table.contains(id));
                if !needs_write {
                    return false;
                }
                let target = Arc::make_mut(table);
                for record in &self.upsert {
                    target.upsert(record.clone());
                }
                for id in &self.remove {
                    target.remove(id);
                }
                true
            }
            PatchMode::Replace => {
                let mut next = EntityTable::new();
                for record in &self.upsert {
                    match table.get(&record.id()) {
                        Some(existing) if **existing == *record => {
                            next.upsert_arc(Arc::clone(existing));
                        }
                        _ => {
                            next.upsert(record.clone());
                        }
                    }
                }
                for id in &self.remove {
                    next.remove(id);
                }
                if next == **table {
                    return false;
                }
                *table = Arc::new(next);
                true
            }
        }
    }
}

/// A change to one table of the entity store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "camelCase")]
pub enum EntityPatch {
    Chats(TablePatch<ChatId, Chat>),
    Users(TablePatch<UserId, User>),
    Messages {
        #[serde(rename = "chatId")]
        chat_id: ChatId,
        #[serde(flatten)]
        patch: TablePatch<MessageId, Message>,
    },
    StickerSets(TablePatch<StickerSetId, StickerSet>),
    Sessions(TablePatch<SessionId, Session>),
    Countries(TablePatch<CountryIso, CountryCode>),
}

impl EntityPatch {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityPatch::Chats(_) => EntityKind::Chat,
            EntityPatch::Users(_) => EntityKind::User,
            EntityPatch::Messages { .. } => EntityKind::Message,
            EntityPatch::StickerSets(_) => EntityKind::StickerSet,
            EntityPatch::Sessions(_) => EntityKind::Session,
            EntityPatch::Countries(_) => EntityKind::Country,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            EntityPatch::Chats(patch) => patch.is_empty(),
            EntityPatch::Users(patch) => patch.is_empty(),
            EntityPatch::Messages { patch, .. } => patch.is_empty(),
            EntityPatch::StickerSets(patch) => patch.is_empty(),
            EntityPatch::Sessions(patch) => patch.is_empty(),
            EntityPatch::Countries(patch) => patch.is_empty(),
        }
    }

    /// Record ids touched by the patch, in wire form.
    pub fn ids(&self) -> Vec<String> {
        match self {
            EntityPatch::Chats(patch) => patch.ids().map(|id| id.to_string()).collect(),
            EntityPatch::Users(patch) => patch.ids().map(|id| id.to_string()).collect(),
            EntityPatch::Messages { chat_id, patch } => patch
                .ids()
                .map(|id| message_key(chat_id, &id))
                .collect(),
            EntityPatch::StickerSets(patch) => patch.ids().map(|id| id.to_string()).collect(),
            EntityPatch::Sessions(patch) => patch.ids().map(|id| id.to_string()).collect(),
            EntityPatch::Countries(patch) => patch.ids().map(|id| id.to_string()).collect(),
        }
    }

    /// Keys identifying each touched record across all tables.
    pub fn entity_keys(&self) -> Vec<String> {
        let kind = self.kind();
        self.ids()
            .into_iter()
            .map(|id| entity_key(kind, &id))
            .collect()
    }

    /// Entity keys of the records the patch removes, each flagged when it
    /// names a locally minted message id.
    pub fn removed_keys(&self) -> Vec<(String, bool)> {
        let kind = self.kind();
        let plain = |ids: Vec<String>| -> Vec<(String, bool)> {
            ids.into_iter()
                .map(|id| (entity_key(kind, &id), false))
                .collect()
        };
        match self {
            EntityPatch::Chats(patch) => plain(patch.remove.iter().map(|id| id.to_string()).collect()),
            EntityPatch::Users(patch) => plain(patch.remove.iter().map(|id| id.to_string()).collect()),
            EntityPatch::Messages { chat_id, patch } => patch
                .remove
                .iter()
                .map(|id| (entity_key(kind, &message_key(chat_id, id)), id.is_local()))
                .collect(),
            EntityPatch::StickerSets(patch) => {
                plain(patch.remove.iter().map(|id| id.to_string()).collect())
            }
            EntityPatch::Sessions(patch) => {
                plain(patch.remove.iter().map(|id| id.to_string()).collect())
            }
            EntityPatch::Countries(patch) => {
                plain(patch.remove.iter().map(|id| id.to_string()).collect())
            }
        }
    }

    /// Copy of the patch keeping only records whose entity key passes `keep`.
    pub fn retain_keys(&self, mut keep: impl FnMut(&str) -> bool) -> EntityPatch {
        let kind = self.kind();
        match self {
            EntityPatch::Chats(patch) => {
                EntityPatch::Chats(patch.retain(|id| keep(&entity_key(kind, &id.to_string()))))
            }
            EntityPatch::Users(patch) => {
                EntityPatch::Users(patch.retain(|id| keep(&entity_key(kind, &id.to_string()))))
            }
            EntityPatch::Messages { chat_id, patch } => EntityPatch::Messages {
                chat_id: chat_id.clone(),
                patch: patch.retain(|id| keep(&entity_key(kind, &message_key(chat_id, id)))),
            },
            EntityPatch::StickerSets(patch) => EntityPatch::StickerSets(
                patch.retain(|id| keep(&entity_key(kind, &id.to_string()))),
            ),
            EntityPatch::Sessions(patch) => {
                EntityPatch::Sessions(patch.retain(|id| keep(&entity_key(kind, &id.to_string()))))
            }
            EntityPatch::Countries(patch) => EntityPatch::Countries(
                patch.retain(|id| keep(&entity_key(kind, &id.to_string()))),
            ),
        }
    }

    /// Rewrites a replace patch as a merge against `entities`, so every record
    /// it would drop is listed as a removal and can be checked on its own.
    pub fn as_merge(&self, entities: &Entities) -> EntityPatch {
        match self {
            EntityPatch::Chats(patch) => EntityPatch::Chats(patch.as_merge(&entities.chats)),
            EntityPatch::Users(patch) => EntityPatch::Users(patch.as_merge(&entities.users)),
            EntityPatch::Messages { chat_id, patch } => {
                let table = entities.messages_in(chat_id).cloned().unwrap_or_default();
                EntityPatch::Messages {
                    chat_id: chat_id.clone(),
                    patch: patch.as_merge(&table),
                }
            }
            EntityPatch::StickerSets(patch) => {
                EntityPatch::StickerSets(patch.as_merge(&entities.sticker_sets))
            }
            EntityPatch::Sessions(patch) => {
                EntityPatch::Sessions(patch.as_merge(&entities.sessions))
            }
            EntityPatch::Countries(patch) => {
                EntityPatch::Countries(patch.as_merge(&entities.countries))
            }
        }
    }

    /// Applies the patch to `entities`, returning whether anything changed.
    pub fn apply(&self, entities: &mut Entities) -> bool {
        match self {
            EntityPatch::Chats(patch) => patch.apply_to(&mut entities.chats),
            EntityPatch::Users(patch) => patch.apply_to(&mut entities.users),
            EntityPatch::Messages { chat_id, patch } => {
                let mut table = entities.messages.get(chat_id).cloned().unwrap_or_default();
                if !patch.apply_to(&mut table) {
                    return false;
                }
                let by_chat = Arc::make_mut(&mut entities.messages);
                if table.is_empty() {
                    by_chat.remove(chat_id);
                } else {
                    by_chat.insert(chat_id.clone(), table);
                }
                true
            }
            EntityPatch::StickerSets(patch) => patch.apply_to(&mut entities.sticker_sets),
            EntityPatch::Sessions(patch) => patch.apply_to(&mut entities.sessions),
            EntityPatch::Countries(patch) => patch.apply_to(&mut entities.countries),
        }
    }
}

pub fn message_key(chat_id: &ChatId, message_id: &MessageId) -> String {
    format!("{chat_id}/{message_id}")
}

pub fn entity_key(kind: EntityKind, id: &str) -> String {
    format!("{kind}:{id}")
}

/// Lists the records that differ between two entity graphs as merge patches.
///
/// Tables and records shared by identity are skipped without comparing their
/// contents, so the cost follows the size of the change.
pub fn diff_entities(prev: &Entities, next: &Entities) -> Vec<EntityPatch> {
    let mut patches = Vec::new();

    if let Some(patch) = diff_table(&prev.chats, &next.chats) {
        patches.push(EntityPatch::Chats(patch));
    }
    if let Some(patch) = diff_table(&prev.users, &next.users) {
        patches.push(EntityPatch::Users(patch));
    }
    if !Arc::ptr_eq(&prev.messages, &next.messages) {
        let empty = Arc::new(EntityTable::new());
        let chat_ids: std::collections::BTreeSet<&ChatId> =
            prev.messages.keys().chain(next.messages.keys()).collect();
        for chat_id in chat_ids {
            let before = prev.messages.get(chat_id).unwrap_or(&empty);
            let after = next.messages.get(chat_id).unwrap_or(&empty);
            if let Some(patch) = diff_table(before, after) {
                patches.push(EntityPatch::Messages {
                    chat_id: chat_id.clone(),
                    patch,
                });
            }
        }
    }
    if let Some(patch) = diff_table(&prev.sticker_sets, &next.sticker_sets) {
        patches.push(EntityPatch::StickerSets(patch));
    }
    if let Some(patch) = diff_table(&prev.sessions, &next.sessions) {
        patches.push(EntityPatch::Sessions(patch));
    }
    if let Some(patch) = diff_table(&prev.countries, &next.countries) {
        patches.push(EntityPatch::Countries(patch));
    }

    patches
}

fn diff_table<K, V>(
    prev: &Arc<EntityTable<K, V>>,
    next: &Arc<EntityTable<K, V>>,
) -> Option<TablePatch<K, V>>
where
    K: Ord + Clone,
    V: Entity<Id = K>,
{
    if Arc::ptr_eq(prev, next) {
        return None;
    }
    let upsert: Vec<V> = next
        .iter()
        .filter(|(id, record)| {
            prev.get(id)
                .is_none_or(|old| !Arc::ptr_eq(old, record) && **old != ***record)
        })
        .map(|(_, record)| (**record).clone())
        .collect();
    let remove: Vec<K> = prev.ids().filter(|id| !next.contains(id)).cloned().collect();
    let patch = TablePatch {
        mode: PatchMode::Merge,
        upsert,
        remove,
    };
    (!patch.is_empty()).then_some(patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::{sample_chat, sample_message, sample_user};

    fn entities_with_two_chats() -> Entities {
        let mut entities = Entities::default();
        EntityPatch::Chats(TablePatch::merge(vec![
            sample_chat("c1", "One"),
            sample_chat("c2", "Two"),
        ]))
        .apply(&mut entities);
        EntityPatch::Users(TablePatch::merge(vec![sample_user("u1", "Ada")])).apply(&mut entities);
        entities
    }

    #[test]
    fn merge_keeps_siblings_and_untouched_tables() {
        let before = entities_with_two_chats();
        let mut after = before.clone();
        let changed = EntityPatch::Chats(TablePatch::merge(vec![sample_chat("c1", "Renamed")]))
            .apply(&mut after);

        assert!(changed);
        assert_eq!(after.chats.len(), 2);
        assert_eq!(after.chats.get(&ChatId::from("c1")).unwrap().title, "Renamed");
        assert!(Arc::ptr_eq(
            before.chats.get(&ChatId::from("c2")).unwrap(),
            after.chats.get(&ChatId::from("c2")).unwrap()
        ));
        assert!(Arc::ptr_eq(&before.users, &after.users));
    }

    #[test]
    fn no_op_patch_leaves_table_identity() {
        let before = entities_with_two_chats();
        let mut after = before.clone();
        let changed = EntityPatch::Chats(TablePatch::merge(vec![sample_chat("c1", "One")]))
            .apply(&mut after);
        assert!(!changed);
        assert!(Arc::ptr_eq(&before.chats, &after.chats));
    }

    #[test]
    fn replace_resets_the_table_but_reuses_equal_records() {
        let before = entities_with_two_chats();
        let mut after = before.clone();
        EntityPatch::Chats(TablePatch::replace(vec![sample_chat("c2", "Two")])).apply(&mut after);

        assert_eq!(after.chats.len(), 1);
        assert!(Arc::ptr_eq(
            before.chats.get(&ChatId::from("c2")).unwrap(),
            after.chats.get(&ChatId::from("c2")).unwrap()
        ));
    }

    #[test]
    fn replace_as_merge_lists_every_dropped_record() {
        let entities = entities_with_two_chats();
        let replace = EntityPatch::Chats(TablePatch::replace(vec![sample_chat("c2", "Two")]));
        let merged = replace.as_merge(&entities);

        let EntityPatch::Chats(table) = &merged else {
            panic!("expected a chats patch");
        };
        assert_eq!(table.mode, PatchMode::Merge);
        assert_eq!(table.remove, vec![ChatId::from("c1")]);
        assert_eq!(merged.removed_keys(), vec![("chat:c1".to_string(), false)]);

        let mut via_replace = entities.clone();
        let mut via_merge = entities.clone();
        replace.apply(&mut via_replace);
        merged.apply(&mut via_merge);
        assert_eq!(via_replace, via_merge);
    }

    #[test]
    fn removing_last_message_drops_the_chat_table() {
        let mut entities = Entities::default();
        let message = sample_message("c1", 1, "hi");
        EntityPatch::Messages {
            chat_id: ChatId::from("c1"),
            patch: TablePatch::merge(vec![message]),
        }
        .apply(&mut entities);
        assert_eq!(entities.message_count(), 1);

        EntityPatch::Messages {
            chat_id: ChatId::from("c1"),
            patch: TablePatch::removal(vec![MessageId::Server(1)]),
        }
        .apply(&mut entities);
        assert!(entities.messages_in(&ChatId::from("c1")).is_none());
    }

    #[test]
    fn diff_reports_only_changed_records() {
        let before = entities_with_two_chats();
        let mut after = before.clone();
        EntityPatch::Chats(TablePatch::merge(vec![sample_chat("c1", "Renamed")])).apply(&mut after);
        EntityPatch::Chats(TablePatch::removal(vec![ChatId::from("c2")])).apply(&mut after);
        EntityPatch::Messages {
            chat_id: ChatId::from("c1"),
            patch: TablePatch::merge(vec![sample_message("c1", 3, "hey")]),
        }
        .apply(&mut after);

        let patches = diff_entities(&before, &after);
        assert_eq!(patches.len(), 2);
        match &patches[0] {
            EntityPatch::Chats(patch) => {
                assert_eq!(patch.upsert.len(), 1);
                assert_eq!(patch.upsert[0].title, "Renamed");
                assert_eq!(patch.remove, vec![ChatId::from("c2")]);
            }
            other => panic!("unexpected patch {other:?}"),
        }
        assert_eq!(patches[1].entity_keys(), vec!["message:c1/3".to_string()]);

        let mut replayed = before.clone();
        for patch in &patches {
            patch.apply(&mut replayed);
        }
        assert_eq!(replayed, after);
    }

    #[test]
    fn retain_keys_filters_upserts_and_removals() {
        let patch = EntityPatch::Chats(TablePatch {
            mode: PatchMode::Merge,
            upsert: vec![sample_chat("c1", "One"), sample_chat("c2", "Two")],
            remove: vec![ChatId::from("c3")],
        });
        let kept = patch.retain_keys(|key| key != "chat:c2");
        assert_eq!(kept.ids(), vec!["c1".to_string(), "c3".to_string()]);
    }

    #[test]
    fn patch_wire_format_is_tagged_by_table() {
        let patch = EntityPatch::Messages {
            chat_id: ChatId::from("c1"),
            patch: TablePatch::removal(vec![MessageId::Server(9)]),
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json["table"], "messages");
        assert_eq!(json["chatId"], "c1");
        assert_eq!(json["remove"][0], "9");
        let back: EntityPatch = serde_json::from_value(json).unwrap();
        assert_eq!(back, patch);
    }
}
