use tracing::debug;

use super::{Action, ActionError};
use crate::core::effects::Effect;
use crate::core::optimistic::OpState;
use crate::core::snapshot::Draft;
use crate::core::sync::Announcement;

pub(super) fn handle_tab_action(draft: &mut Draft<'_>, action: Action) -> Result<(), ActionError> {
    match action {
        Action::RegisterTab => {
            if draft.tab_id().is_system() {
                return Err(ActionError::rejected("the system tab cannot be registered"));
            }
            if draft.register_tab() {
                debug!(tab = %draft.tab_id(), "tab registered");
            }
            Ok(())
        }
        Action::UnregisterTab => {
            unregister_tab(draft);
            Ok(())
        }
        Action::SetLeftScreen { screen } => {
            if let Some(tab) = draft.tab_mut() {
                tab.left_screen = screen;
            }
            Ok(())
        }
        Action::OpenChat { chat_id } => {
            if let Some(chat_id) = &chat_id {
                if draft.chat(chat_id).is_none() {
                    return Err(ActionError::rejected(format!("unknown chat {chat_id}")));
                }
            }
            if let Some(tab) = draft.tab_mut() {
                if tab.current_chat_id != chat_id {
                    tab.selection = None;
                    tab.current_chat_id = chat_id;
                }
            }
            Ok(())
        }
        Action::OpenModal { modal } => {
            if let Some(tab) = draft.tab_mut() {
                tab.modal = Some(modal);
            }
            Ok(())
        }
        Action::CloseModal => {
            if let Some(tab) = draft.tab_mut() {
                tab.modal = None;
            }
            Ok(())
        }
        Action::ShowNotification { message, kind } => {
            draft.notify(kind, message);
            Ok(())
        }
        Action::DismissNotification { id } => {
            if let Some(tab) = draft.tab_mut() {
                tab.dismiss_notification(id);
            }
            Ok(())
        }
        Action::ToggleMessageSelection {
            chat_id,
            message_id,
        } => {
            if draft.message(&chat_id, &message_id).is_none() {
                return Err(ActionError::rejected(format!(
                    "unknown message {message_id} in chat {chat_id}"
                )));
            }
            if let Some(tab) = draft.tab_mut() {
                tab.toggle_selection(&chat_id, message_id);
            }
            Ok(())
        }
        Action::ExitMessageSelectMode => {
            if let Some(tab) = draft.tab_mut() {
                tab.selection = None;
            }
            Ok(())
        }
        Action::SetSearchQuery { query, chat_id } => {
            if let Some(tab) = draft.tab_mut() {
                tab.search.query = query.filter(|query| !query.trim().is_empty());
                tab.search.chat_id = chat_id;
            }
            Ok(())
        }
        Action::SetScrollAnchor {
            chat_id,
            message_id,
        } => {
            if let Some(tab) = draft.tab_mut() {
                match message_id {
                    Some(message_id) => {
                        tab.scroll_anchors.insert(chat_id, message_id);
                    }
                    None => {
                        tab.scroll_anchors.remove(&chat_id);
                    }
                }
            }
            Ok(())
        }
        _ => unreachable!("non-tab action routed to tab handler"),
    }
}

/// Drops the tab, rolls back what it still had in flight and tells sibling
/// stores it is gone.
fn unregister_tab(draft: &mut Draft<'_>) {
    if !draft.unregister_tab() {
        return;
    }
    let tab_id = draft.tab_id().clone();

    let pending = draft.ledger().pending_for_tab(&tab_id);
    for correlation in pending {
        match draft.ledger_mut().resolve(&correlation, OpState::RolledBack) {
            Ok(resolution) => super::rollback(draft, &resolution),
            Err(err) => debug!(%correlation, error = %err, "skipping rollback on tab close"),
        }
    }

    draft.effect(Effect::CancelTab);
    draft.announce(Announcement::TabClosed {
        tab_id: tab_id.clone(),
    });
    debug!(tab = %tab_id, "tab unregistered");
}
