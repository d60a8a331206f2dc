use std::cmp::Reverse;
use std::sync::Arc;

use crate::core::entities::{Chat, ChatTable, MessageTable, UserTable};
use crate::core::ids::{ChatId, MessageId, TabId};
use crate::core::snapshot::Snapshot;
use crate::core::tab_state::TabState;

use super::memo::Memo;

pub type ChatMessageIds = Memo<ChatId, Option<Arc<MessageTable>>, Vec<MessageId>>;
pub type PinnedMessageIds = Memo<ChatId, Option<Arc<MessageTable>>, Vec<MessageId>>;
pub type SortedChatIds = Memo<(), Arc<ChatTable>, Vec<ChatId>>;
pub type ChatMemberNames = Memo<ChatId, (Option<Arc<Chat>>, Arc<UserTable>), Vec<String>>;
pub type SelectedMessageIds =
    Memo<TabId, (Option<Arc<TabState>>, Option<Arc<MessageTable>>), Vec<MessageId>>;
pub type UnreadTotal = Memo<(), Arc<ChatTable>, u32>;

fn chat_messages(snapshot: &Snapshot, chat_id: &ChatId) -> Option<Arc<MessageTable>> {
    snapshot.entities.messages_in(chat_id).cloned()
}

/// Message ids of a chat in display order (date, then id).
pub fn chat_message_ids() -> ChatMessageIds {
    Memo::new("chat_message_ids", chat_messages, |table, _| {
        let Some(table) = table else {
            return Vec::new();
        };
        let mut messages: Vec<_> = table.values().collect();
        messages.sort_by_key(|message| (message.date, message.id));
        messages.into_iter().map(|message| message.id).collect()
    })
}

pub fn pinned_message_ids() -> PinnedMessageIds {
    Memo::new("pinned_message_ids", chat_messages, |table, _| {
        let Some(table) = table else {
            return Vec::new();
        };
        let mut pinned: Vec<_> = table.values().filter(|message| message.is_pinned).collect();
        pinned.sort_by_key(|message| (message.date, message.id));
        pinned.into_iter().map(|message| message.id).collect()
    })
}

/// Chat list order: most recent activity first, chats without messages
/// last, ties broken by id.
pub fn sorted_chat_ids() -> SortedChatIds {
    Memo::new(
        "sorted_chat_ids",
        |snapshot: &Snapshot, _: &()| Arc::clone(&snapshot.entities.chats),
        |chats: &Arc<ChatTable>, _: &()| {
            let mut ordered: Vec<&Arc<Chat>> = chats.values().collect();
            ordered.sort_by(|a, b| {
                Reverse(a.last_message_date)
                    .cmp(&Reverse(b.last_message_date))
                    .then_with(|| a.id.cmp(&b.id))
            });
            ordered.into_iter().map(|chat| chat.id.clone()).collect()
        },
    )
}

/// Display names of a chat's members; members without a loaded user record
/// are skipped.
pub fn chat_member_names() -> ChatMemberNames {
    Memo::new(
        "chat_member_names",
        |snapshot: &Snapshot, chat_id: &ChatId| {
            (
                snapshot.entities.chats.get(chat_id).cloned(),
                Arc::clone(&snapshot.entities.users),
            )
        },
        |(chat, users): &(Option<Arc<Chat>>, Arc<UserTable>), _: &ChatId| {
            let Some(chat) = chat else {
                return Vec::new();
            };
            chat.member_ids
                .iter()
                .filter_map(|user_id| users.get(user_id))
                .map(|user| user.display_name())
                .collect()
        },
    )
}

/// The tab's selection restricted to messages that still exist.
pub fn selected_message_ids() -> SelectedMessageIds {
    Memo::new(
        "selected_message_ids",
        |snapshot: &Snapshot, tab_id: &TabId| {
            let tab = snapshot.tab(tab_id).cloned();
            let table = tab
                .as_ref()
                .and_then(|tab| tab.selection.as_ref())
                .and_then(|selection| chat_messages(snapshot, &selection.chat_id));
            (tab, table)
        },
        |(tab, table): &(Option<Arc<TabState>>, Option<Arc<MessageTable>>), _: &TabId| {
            let (Some(tab), Some(table)) = (tab, table) else {
                return Vec::new();
            };
            let Some(selection) = &tab.selection else {
                return Vec::new();
            };
            selection
                .message_ids
                .iter()
                .filter(|id| table.contains(id))
                .copied()
                .collect()
        },
    )
}

/// Unread messages across chats that are not muted.
pub fn unread_total() -> UnreadTotal {
    Memo::new(
        "unread_total",
        |snapshot: &Snapshot, _: &()| Arc::clone(&snapshot.entities.chats),
        |chats: &Arc<ChatTable>, _: &()| {
            chats
                .values()
                .filter(|chat| !chat.is_muted)
                .map(|chat| chat.unread_count)
                .sum()
        },
    )
}

/// One instance of every derived selector, owned by a store so that caches
/// are never shared between stores.
#[derive(Debug, Clone)]
pub struct SelectorSet {
    pub chat_message_ids: Arc<ChatMessageIds>,
    pub pinned_message_ids: Arc<PinnedMessageIds>,
    pub sorted_chat_ids: Arc<SortedChatIds>,
    pub chat_member_names: Arc<ChatMemberNames>,
    pub selected_message_ids: Arc<SelectedMessageIds>,
    pub unread_total: Arc<UnreadTotal>,
}

impl SelectorSet {
    pub fn new() -> Self {
        Self {
            chat_message_ids: Arc::new(chat_message_ids()),
            pinned_message_ids: Arc::new(pinned_message_ids()),
            sorted_chat_ids: Arc::new(sorted_chat_ids()),
            chat_member_names: Arc::new(chat_member_names()),
            selected_message_ids: Arc::new(selected_message_ids()),
            unread_total: Arc::new(unread_total()),
        }
    }
}

impl Default for SelectorSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::patch::{EntityPatch, TablePatch};
    use crate::utils::test_utils::{fixed_time, sample_chat, sample_message, seeded_snapshot};
    use chrono::Duration;

    #[test]
    fn message_ids_are_in_display_order_and_memoized() {
        let selectors = SelectorSet::new();
        let snapshot = seeded_snapshot();
        let c1 = ChatId::from("c1");

        let ids = selectors.chat_message_ids.select(&snapshot, &c1);
        assert_eq!(
            *ids,
            vec![MessageId::Server(1), MessageId::Server(2), MessageId::Server(3)]
        );

        let mut unrelated = snapshot.clone();
        EntityPatch::Users(TablePatch::merge(vec![crate::utils::test_utils::sample_user(
            "u3", "Edsger",
        )]))
        .apply(&mut unrelated.entities);
        let again = selectors.chat_message_ids.select(&unrelated, &c1);
        assert!(Arc::ptr_eq(&ids, &again));
        assert_eq!(selectors.chat_message_ids.computations(), 1);
    }

    #[test]
    fn chats_sort_by_recent_activity() {
        let selectors = SelectorSet::new();
        let mut snapshot = seeded_snapshot();
        let mut recent = sample_chat("c2", "Recent");
        recent.last_message_date = Some(fixed_time() + Duration::hours(1));
        EntityPatch::Chats(TablePatch::merge(vec![recent, sample_chat("c0", "Empty")]))
            .apply(&mut snapshot.entities);

        let order = selectors.sorted_chat_ids.select(&snapshot, &());
        assert_eq!(
            *order,
            vec![ChatId::from("c2"), ChatId::from("c1"), ChatId::from("c0")]
        );
    }

    #[test]
    fn member_names_compose_chats_and_users() {
        let selectors = SelectorSet::new();
        let snapshot = seeded_snapshot();
        let names = selectors
            .chat_member_names
            .select(&snapshot, &ChatId::from("c1"));
        assert_eq!(*names, vec!["Ada".to_string(), "Grace".to_string()]);
        assert!(selectors
            .chat_member_names
            .select(&snapshot, &ChatId::from("nope"))
            .is_empty());
    }

    #[test]
    fn selection_skips_deleted_messages() {
        let selectors = SelectorSet::new();
        let mut snapshot = seeded_snapshot();
        let c1 = ChatId::from("c1");
        let tabs = Arc::make_mut(&mut snapshot.by_tab);
        if let Some(tab) = tabs.get_mut(&TabId::from("A")) {
            let tab = Arc::make_mut(tab);
            tab.toggle_selection(&c1, MessageId::Server(1));
            tab.toggle_selection(&c1, MessageId::Server(2));
        }
        EntityPatch::Messages {
            chat_id: c1.clone(),
            patch: TablePatch::removal(vec![MessageId::Server(2)]),
        }
        .apply(&mut snapshot.entities);

        let selected = selectors
            .selected_message_ids
            .select(&snapshot, &TabId::from("A"));
        assert_eq!(*selected, vec![MessageId::Server(1)]);
        assert!(selectors
            .selected_message_ids
            .select(&snapshot, &TabId::from("B"))
            .is_empty());
    }

    #[test]
    fn pinned_and_unread_views() {
        let selectors = SelectorSet::new();
        let mut snapshot = seeded_snapshot();
        let mut pinned = sample_message("c1", 2, "how are you");
        pinned.is_pinned = true;
        EntityPatch::Messages {
            chat_id: ChatId::from("c1"),
            patch: TablePatch::merge(vec![pinned]),
        }
        .apply(&mut snapshot.entities);
        let mut noisy = sample_chat("c2", "Noisy");
        noisy.unread_count = 7;
        noisy.is_muted = true;
        let mut quiet = sample_chat("c3", "Quiet");
        quiet.unread_count = 2;
        EntityPatch::Chats(TablePatch::merge(vec![noisy, quiet])).apply(&mut snapshot.entities);

        assert_eq!(
            *selectors
                .pinned_message_ids
                .select(&snapshot, &ChatId::from("c1")),
            vec![MessageId::Server(2)]
        );
        assert_eq!(*selectors.unread_total.select(&snapshot, &()), 2);
    }
}
