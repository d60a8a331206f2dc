use tracing::debug;

use super::{rollback, Action, ActionError};
use crate::core::effects::Effect;
use crate::core::entities::PhotoRef;
use crate::core::ids::CorrelationId;
use crate::core::optimistic::{OpState, OptimisticTarget};
use crate::core::snapshot::Draft;
use crate::core::tab_state::NotificationKind;

pub(super) fn handle_contact_action(
    draft: &mut Draft<'_>,
    action: Action,
) -> Result<(), ActionError> {
    match action {
        Action::UpdateContact {
            user_id,
            first_name,
            last_name,
            correlation,
        } => {
            let first_name = first_name.trim().to_string();
            if first_name.is_empty() {
                return Err(ActionError::rejected("first name is required"));
            }
            let Some(previous) = draft.user(&user_id).map(|user| (**user).clone()) else {
                return Err(ActionError::rejected(format!("unknown user {user_id}")));
            };
            let last_name = last_name
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty());

            let mut updated = previous.clone();
            updated.first_name = first_name;
            updated.last_name = last_name;
            updated.is_contact = true;

            if updated == previous {
                return Ok(());
            }

            let tab_id = draft.tab_id().clone();
            draft.ledger_mut().begin(
                correlation,
                tab_id,
                OptimisticTarget::UpdateContact { previous },
            )?;
            let written = updated.clone();
            draft.update_user(&user_id, |user| *user = written);
            draft.effect(Effect::UpdateContact {
                user: updated,
                correlation,
            });
            Ok(())
        }
        Action::UpdateContactSucceeded { correlation, user } => {
            if !resolve_committed(draft, correlation) {
                return Ok(());
            }
            let user_id = user.id.clone();
            draft.update_user(&user_id, |current| *current = user);
            Ok(())
        }
        Action::UpdateContactFailed { correlation, error } => {
            rollback_failed(draft, correlation, &error, "Could not update contact")
        }
        Action::UploadProfilePhoto {
            file_name,
            correlation,
        } => {
            let Some(user_id) = draft.auth().current_user_id().cloned() else {
                return Err(ActionError::rejected("not signed in"));
            };
            let Some(user) = draft.user(&user_id) else {
                return Err(ActionError::rejected(format!("unknown user {user_id}")));
            };
            if file_name.trim().is_empty() {
                return Err(ActionError::rejected("file name is required"));
            }
            let previous_photo = user.photo.clone();

            let tab_id = draft.tab_id().clone();
            draft.ledger_mut().begin(
                correlation,
                tab_id,
                OptimisticTarget::UploadProfilePhoto {
                    user_id: user_id.clone(),
                    previous_photo,
                },
            )?;
            let placeholder = PhotoRef {
                id: format!("local-{correlation}"),
                width: 0,
                height: 0,
                is_local: true,
            };
            draft.update_user(&user_id, |user| user.photo = Some(placeholder));
            draft.effect(Effect::UploadProfilePhoto {
                user_id,
                file_name,
                correlation,
            });
            Ok(())
        }
        Action::UploadProfilePhotoSucceeded { correlation, photo } => {
            let Some(OptimisticTarget::UploadProfilePhoto { user_id, .. }) = draft
                .ledger()
                .get(&correlation)
                .map(|op| op.target.clone())
            else {
                debug!(%correlation, "ignoring photo confirmation for unknown upload");
                return Ok(());
            };
            if !resolve_committed(draft, correlation) {
                return Ok(());
            }
            draft.update_user(&user_id, |user| {
                user.photo = Some(PhotoRef {
                    is_local: false,
                    ..photo
                })
            });
            Ok(())
        }
        Action::UploadProfilePhotoFailed { correlation, error } => {
            rollback_failed(draft, correlation, &error, "Could not upload photo")
        }
        _ => unreachable!("non-contact action routed to contact handler"),
    }
}

/// Commits a pending operation. Returns false when the confirmation is stale.
fn resolve_committed(draft: &mut Draft<'_>, correlation: CorrelationId) -> bool {
    if !draft.ledger().is_pending(&correlation) {
        debug!(%correlation, "ignoring stale confirmation");
        return false;
    }
    match draft
        .ledger_mut()
        .resolve(&correlation, OpState::Committed)
    {
        Ok(_) => true,
        Err(err) => {
            debug!(%correlation, error = %err, "confirmation could not resolve");
            false
        }
    }
}

fn rollback_failed(
    draft: &mut Draft<'_>,
    correlation: CorrelationId,
    error: &str,
    notice: &str,
) -> Result<(), ActionError> {
    if !draft.ledger().is_pending(&correlation) {
        debug!(%correlation, "ignoring stale failure");
        return Ok(());
    }
    let resolution = draft
        .ledger_mut()
        .resolve(&correlation, OpState::RolledBack)?;
    rollback(draft, &resolution);
    debug!(%correlation, error, "operation rolled back");
    draft.notify(NotificationKind::Error, notice);
    Ok(())
}
