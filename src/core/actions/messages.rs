use tracing::debug;

use super::{rollback, Action, ActionError};
use crate::core::constants::SEND_FAILED_NOTICE;
use crate::core::effects::Effect;
use crate::core::entities::Message;
use crate::core::ids::{ChatId, CorrelationId, MessageId};
use crate::core::optimistic::{OpState, OptimisticTarget};
use crate::core::snapshot::Draft;
use crate::core::tab_state::{Modal, NotificationKind};

pub(super) fn handle_message_action(
    draft: &mut Draft<'_>,
    action: Action,
) -> Result<(), ActionError> {
    match action {
        Action::SendMessage {
            chat_id,
            text,
            correlation,
        } => send_message(draft, chat_id, text, correlation),
        Action::SendMessageSucceeded {
            correlation,
            message,
        } => {
            send_message_succeeded(draft, correlation, message);
            Ok(())
        }
        Action::SendMessageFailed { correlation, error } => {
            if !draft.ledger().is_pending(&correlation) {
                debug!(%correlation, "ignoring stale send failure");
                return Ok(());
            }
            let resolution = draft
                .ledger_mut()
                .resolve(&correlation, OpState::RolledBack)?;
            rollback(draft, &resolution);
            debug!(%correlation, error = %error, "send rolled back");
            draft.notify(NotificationKind::Error, SEND_FAILED_NOTICE);
            Ok(())
        }
        Action::DeleteMessages {
            chat_id,
            message_ids,
        } => {
            if message_ids.is_empty() {
                return Ok(());
            }
            if draft.chat(&chat_id).is_none() {
                return Err(ActionError::rejected(format!("unknown chat {chat_id}")));
            }
            if let Some(tab) = draft.tab_mut() {
                if matches!(tab.modal, Some(Modal::DeleteMessages { .. })) {
                    tab.modal = None;
                }
                tab.selection = None;
            }
            let (local, remote): (Vec<MessageId>, Vec<MessageId>) =
                message_ids.into_iter().partition(MessageId::is_local);
            if !local.is_empty() {
                // Never reached the server; drop them like a failed send.
                for id in &local {
                    if let MessageId::Local(correlation) = id {
                        if draft.ledger().is_pending(correlation) {
                            let resolution = draft
                                .ledger_mut()
                                .resolve(correlation, OpState::RolledBack)?;
                            rollback(draft, &resolution);
                        }
                    }
                }
                draft.remove_messages(&chat_id, &local);
            }
            if !remote.is_empty() {
                draft.effect(Effect::DeleteMessages {
                    chat_id,
                    message_ids: remote,
                });
            }
            Ok(())
        }
        Action::MessagesDeleted {
            chat_id,
            message_ids,
        } => {
            messages_deleted(draft, &chat_id, &message_ids);
            Ok(())
        }
        Action::DeleteMessagesFailed {
            chat_id,
            message_ids,
            error,
        } => {
            debug!(chat = %chat_id, count = message_ids.len(), error = %error, "delete failed");
            draft.notify(NotificationKind::Error, "Could not delete messages");
            Ok(())
        }
        Action::PinMessage {
            chat_id,
            message_id,
            is_pinned,
            correlation,
        } => {
            let Some(message) = draft.message(&chat_id, &message_id) else {
                return Err(ActionError::rejected(format!(
                    "unknown message {message_id} in chat {chat_id}"
                )));
            };
            if message_id.is_local() {
                return Err(ActionError::rejected("cannot pin a message that is not sent yet"));
            }
            let was_pinned = message.is_pinned;
            if let Some(tab) = draft.tab_mut() {
                if matches!(tab.modal, Some(Modal::PinMessage { .. })) {
                    tab.modal = None;
                }
            }
            if was_pinned == is_pinned {
                return Ok(());
            }
            let tab_id = draft.tab_id().clone();
            draft.ledger_mut().begin(
                correlation,
                tab_id,
                OptimisticTarget::PinMessage {
                    chat_id: chat_id.clone(),
                    message_id,
                    was_pinned,
                },
            )?;
            draft.update_message(&chat_id, &message_id, |message| {
                message.is_pinned = is_pinned
            });
            draft.effect(Effect::PinMessage {
                chat_id,
                message_id,
                is_pinned,
                correlation,
            });
            Ok(())
        }
        Action::PinMessageSucceeded { correlation } => {
            if draft.ledger().is_pending(&correlation) {
                draft
                    .ledger_mut()
                    .resolve(&correlation, OpState::Committed)?;
            } else {
                debug!(%correlation, "ignoring stale pin confirmation");
            }
            Ok(())
        }
        Action::PinMessageFailed { correlation, error } => {
            if !draft.ledger().is_pending(&correlation) {
                debug!(%correlation, "ignoring stale pin failure");
                return Ok(());
            }
            let resolution = draft
                .ledger_mut()
                .resolve(&correlation, OpState::RolledBack)?;
            rollback(draft, &resolution);
            debug!(%correlation, error = %error, "pin rolled back");
            draft.notify(NotificationKind::Error, "Could not pin message");
            Ok(())
        }
        _ => unreachable!("non-message action routed to message handler"),
    }
}

fn send_message(
    draft: &mut Draft<'_>,
    chat_id: ChatId,
    text: String,
    correlation: CorrelationId,
) -> Result<(), ActionError> {
    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(ActionError::rejected("message text is empty"));
    }
    let Some(chat) = draft.chat(&chat_id) else {
        return Err(ActionError::rejected(format!("unknown chat {chat_id}")));
    };
    let previous_last_message_id = chat.last_message_id;
    let previous_last_message_date = chat.last_message_date;
    let local_id = MessageId::Local(correlation);
    let tab_id = draft.tab_id().clone();

    draft.ledger_mut().begin(
        correlation,
        tab_id,
        OptimisticTarget::SendMessage {
            chat_id: chat_id.clone(),
            local_id,
            previous_last_message_id,
            previous_last_message_date,
        },
    )?;

    let now = draft.now();
    let sender_id = draft.auth().current_user_id().cloned();
    draft.insert_message(Message {
        id: local_id,
        chat_id: chat_id.clone(),
        sender_id,
        text: text.clone(),
        date: now,
        is_pinned: false,
        is_pending: true,
    });
    draft.update_chat(&chat_id, |chat| {
        chat.last_message_id = Some(local_id);
        chat.last_message_date = Some(now);
    });
    draft.effect(Effect::SendMessage {
        chat_id,
        text,
        correlation,
    });
    Ok(())
}

/// Swaps the local placeholder for the server's copy.
fn send_message_succeeded(draft: &mut Draft<'_>, correlation: CorrelationId, message: Message) {
    if !draft.ledger().is_pending(&correlation) {
        debug!(%correlation, "ignoring stale send confirmation");
        return;
    }
    if let Err(err) = draft
        .ledger_mut()
        .resolve(&correlation, OpState::Committed)
    {
        debug!(%correlation, error = %err, "send confirmation could not resolve");
        return;
    }

    let local_id = MessageId::Local(correlation);
    let chat_id = message.chat_id.clone();
    draft.remove_messages(&chat_id, &[local_id]);
    if draft.chat(&chat_id).is_none() {
        return;
    }

    let server_id = message.id;
    let date = message.date;
    draft.insert_message(Message {
        is_pending: false,
        ..message
    });
    draft.update_chat(&chat_id, |chat| {
        let replaces_local = chat.last_message_id == Some(local_id);
        let is_newer = chat.last_message_date.is_none_or(|last| date >= last);
        if replaces_local || is_newer {
            chat.last_message_id = Some(server_id);
            chat.last_message_date = Some(date);
        }
    });
}

fn messages_deleted(draft: &mut Draft<'_>, chat_id: &ChatId, message_ids: &[MessageId]) {
    let removed = draft.remove_messages(chat_id, message_ids);
    if let Some(tab) = draft.tab_mut() {
        tab.forget_messages(chat_id, message_ids);
    }
    if removed.is_empty() {
        return;
    }

    let last_removed = draft
        .chat(chat_id)
        .and_then(|chat| chat.last_message_id)
        .is_some_and(|last| removed.contains(&last));
    if last_removed {
        let newest = draft
            .entities()
            .messages_in(chat_id)
            .and_then(|table| table.values().max_by_key(|message| (message.date, message.id)))
            .map(|message| (message.id, message.date));
        draft.update_chat(chat_id, |chat| match newest {
            Some((id, date)) => {
                chat.last_message_id = Some(id);
                chat.last_message_date = Some(date);
            }
            None => {
                chat.last_message_id = None;
                chat.last_message_date = None;
            }
        });
    }
}
