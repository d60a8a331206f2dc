use tracing::debug;

use super::{Action, ActionError};
use crate::core::snapshot::Draft;
use crate::core::sync::Stamp;

pub(super) fn handle_sync_action(draft: &mut Draft<'_>, action: Action) -> Result<(), ActionError> {
    let Action::ApplyRemotePatch {
        origin,
        version,
        patch,
    } = action
    else {
        unreachable!("non-sync action routed to sync handler")
    };

    let stamp = Stamp::new(version, origin);
    // A replace would drop records it never names; spell those out so each
    // removal faces the same stamp check as an upsert.
    let patch = patch.as_merge(draft.entities());
    let offered = patch.entity_keys();
    let accepted = patch.retain_keys(|key| draft.stamps().admits(key, &stamp));
    let keys = accepted.entity_keys();
    if keys.len() < offered.len() {
        debug!(
            origin = %stamp.origin,
            version,
            dropped = offered.len() - keys.len(),
            "dropping stale remote records"
        );
    }

    draft.observe_version(version);
    draft.quiet();
    if accepted.is_empty() {
        return Ok(());
    }

    draft.apply_patch(&accepted);
    draft.stamps_mut().record_patch(&accepted, &stamp);
    let now = draft.now();
    draft.set_last_sync_time(Some(now));
    Ok(())
}
