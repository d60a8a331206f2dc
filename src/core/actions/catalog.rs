use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{rollback, Action, ActionError};
use crate::core::effects::Effect;
use crate::core::entities::{Chat, Message, User};
use crate::core::ids::ChatId;
use crate::core::optimistic::OpState;
use crate::core::patch::{EntityPatch, TablePatch};
use crate::core::snapshot::Draft;
use crate::core::tab_state::NotificationKind;

pub(super) fn handle_catalog_action(
    draft: &mut Draft<'_>,
    action: Action,
) -> Result<(), ActionError> {
    match action {
        Action::LoadChats => {
            let Some(tab) = draft.tab_mut() else {
                return Ok(());
            };
            if tab.loading.chats {
                return Ok(());
            }
            tab.loading.chats = true;
            draft.effect(Effect::LoadChats);
            Ok(())
        }
        Action::ChatsLoaded {
            chats,
            users,
            messages,
            replace,
        } => {
            chats_loaded(draft, chats, users, messages, replace);
            Ok(())
        }
        Action::ChatsLoadFailed { error } => {
            warn!(error = %error, "chat list failed to load");
            if let Some(tab) = draft.tab_mut() {
                tab.loading.chats = false;
            }
            draft.notify(NotificationKind::Error, "Could not load chats");
            Ok(())
        }
        Action::ToggleChatMuted { chat_id } => {
            if !draft.update_chat(&chat_id, |chat| chat.is_muted = !chat.is_muted) {
                return Err(ActionError::rejected(format!("unknown chat {chat_id}")));
            }
            Ok(())
        }
        Action::DeleteChat { chat_id } => {
            delete_chat(draft, &chat_id);
            Ok(())
        }
        Action::LoadCountryList => {
            let language = draft.settings().language.clone();
            if let Some(tab) = draft.tab_mut() {
                if tab.loading.country_list {
                    return Ok(());
                }
                tab.loading.country_list = true;
            }
            draft.effect(Effect::FetchCountryList { language });
            Ok(())
        }
        Action::CountryListLoaded { countries } => {
            draft.apply_patch(&EntityPatch::Countries(TablePatch::replace(countries)));
            if let Some(tab) = draft.tab_mut() {
                tab.loading.country_list = false;
            }
            Ok(())
        }
        Action::CountryListLoadFailed { error } => {
            warn!(error = %error, "country list failed to load");
            if let Some(tab) = draft.tab_mut() {
                tab.loading.country_list = false;
            }
            Ok(())
        }
        _ => unreachable!("non-catalog action routed to catalog handler"),
    }
}

fn chats_loaded(
    draft: &mut Draft<'_>,
    chats: Vec<Chat>,
    users: Vec<User>,
    messages: Vec<Message>,
    replace: bool,
) {
    if replace {
        let kept: Vec<ChatId> = chats.iter().map(|chat| chat.id.clone()).collect();
        draft.apply_patch(&EntityPatch::Chats(TablePatch::replace(chats)));

        // Messages of chats that fell off the list go with them; optimistic
        // messages of surviving chats stay.
        let stale: Vec<ChatId> = draft
            .entities()
            .messages
            .keys()
            .filter(|chat_id| !kept.contains(chat_id))
            .cloned()
            .collect();
        if !stale.is_empty() {
            let mut entities = draft.entities().clone();
            let by_chat = Arc::make_mut(&mut entities.messages);
            for chat_id in &stale {
                by_chat.remove(chat_id);
            }
            draft.replace_entities(entities);
        }
    } else {
        draft.apply_patch(&EntityPatch::Chats(TablePatch::merge(chats)));
    }
    draft.apply_patch(&EntityPatch::Users(TablePatch::merge(users)));

    let mut by_chat: BTreeMap<ChatId, Vec<Message>> = BTreeMap::new();
    for message in messages {
        by_chat.entry(message.chat_id.clone()).or_default().push(message);
    }
    for (chat_id, batch) in by_chat {
        if draft.chat(&chat_id).is_none() {
            debug!(chat = %chat_id, count = batch.len(), "dropping messages for unknown chat");
            continue;
        }
        draft.apply_patch(&EntityPatch::Messages {
            chat_id,
            patch: TablePatch::merge(batch),
        });
    }

    let now = draft.now();
    draft.set_last_sync_time(Some(now));
    if let Some(tab) = draft.tab_mut() {
        tab.loading.chats = false;
    }
}

/// Removes a chat everywhere it is stored. Pending operations in the chat
/// are rolled back and any request still in flight for it is cancelled.
fn delete_chat(draft: &mut Draft<'_>, chat_id: &ChatId) {
    for correlation in draft.ledger().pending_for_chat(chat_id) {
        match draft.ledger_mut().resolve(&correlation, OpState::RolledBack) {
            Ok(resolution) => rollback(draft, &resolution),
            Err(err) => debug!(%correlation, error = %err, "skipping rollback on chat delete"),
        }
    }
    if !draft.remove_chat(chat_id) {
        return;
    }
    if let Some(tab) = draft.tab_mut() {
        tab.forget_chat(chat_id);
    }
    draft.effect(Effect::CancelChat {
        chat_id: chat_id.clone(),
    });
}
