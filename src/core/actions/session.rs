use tracing::{debug, info};

use super::{Action, ActionError};
use crate::core::effects::Effect;
use crate::core::entities::Entities;
use crate::core::optimistic::OptimisticLedger;
use crate::core::patch::{EntityPatch, TablePatch};
use crate::core::persist::PersistedState;
use crate::core::snapshot::Draft;

pub(super) fn handle_session_action(
    draft: &mut Draft<'_>,
    action: Action,
) -> Result<(), ActionError> {
    match action {
        Action::UpdateSettings(patch) => {
            if patch.message_text_size.is_some_and(|size| size == 0) {
                return Err(ActionError::rejected("message text size must be positive"));
            }
            let language_changed = patch
                .language
                .as_ref()
                .is_some_and(|language| language != &draft.settings().language);
            draft.settings_mut().apply(&patch);
            if language_changed && draft.tab().is_some() {
                draft.follow_up(Action::LoadCountryList);
            }
            Ok(())
        }
        Action::SetAuthSession { session } => {
            let switching_user = draft
                .auth()
                .current_user_id()
                .is_some_and(|current| current != &session.user_id);
            if switching_user {
                return Err(ActionError::rejected(
                    "another account is signed in; sign out first",
                ));
            }
            draft.auth_mut().session = Some(session);
            Ok(())
        }
        Action::SignOut => {
            sign_out(draft);
            Ok(())
        }
        Action::Hydrate { state } => {
            hydrate(draft, *state);
            Ok(())
        }
        _ => unreachable!("non-session action routed to session handler"),
    }
}

fn sign_out(draft: &mut Draft<'_>) {
    if !draft.auth().is_signed_in() && draft.entities().chats.is_empty() {
        return;
    }
    draft.auth_mut().session = None;
    draft.replace_entities(Entities::default());
    *draft.ledger_mut() = OptimisticLedger::default();
    draft.set_last_sync_time(None);
    if let Some(tab) = draft.tab_mut() {
        tab.current_chat_id = None;
        tab.selection = None;
        tab.modal = None;
        tab.scroll_anchors.clear();
    }
    draft.effect(Effect::CancelAll);
    info!("signed out");
}

/// Loads a persisted blob into the store. Records the store already holds,
/// or holds a stamp for, are newer than the cache and win.
fn hydrate(draft: &mut Draft<'_>, state: PersistedState) {
    *draft.settings_mut() = state.settings;
    if !draft.auth().is_signed_in() {
        *draft.auth_mut() = state.auth;
    }

    let entities = draft.entities();
    let chats = state
        .cache
        .chats
        .into_iter()
        .filter(|chat| !entities.chats.contains(&chat.id))
        .collect();
    let users = state
        .cache
        .users
        .into_iter()
        .filter(|user| !entities.users.contains(&user.id))
        .collect();
    let countries = state
        .cache
        .countries
        .into_iter()
        .filter(|country| !entities.countries.contains(&country.iso2))
        .collect();

    let patches = [
        EntityPatch::Chats(TablePatch::merge(chats)),
        EntityPatch::Users(TablePatch::merge(users)),
        EntityPatch::Countries(TablePatch::merge(countries)),
    ];
    for patch in patches {
        let offered = patch.ids().len();
        let fresh = patch.retain_keys(|key| draft.stamps().get(key).is_none());
        let dropped = offered - fresh.ids().len();
        if dropped > 0 {
            debug!(kind = %fresh.kind(), dropped, "cached records superseded by stamped ones");
        }
        draft.apply_patch(&fresh);
    }

    draft.observe_version(state.version);
    draft.quiet();
    debug!(version = state.version, "hydrated from storage");
}
