use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;

use super::*;
use crate::core::account::{AuthState, Settings};
use crate::core::constants::{PERSIST_SCHEMA_VERSION, SEND_FAILED_NOTICE};
use crate::core::effects::Effect;
use crate::core::optimistic::OpState;
use crate::core::patch::TablePatch;
use crate::core::persist::EntityCache;
use crate::core::snapshot::{ActionContext, DraftOutput, Snapshot};
use crate::core::sync::{Announcement, Stamp};
use crate::utils::test_utils::{fixed_time, sample_chat, seeded_snapshot};

fn ctx(tab: &str) -> ActionContext {
    ActionContext {
        tab_id: TabId::from(tab),
        issued_at: fixed_time(),
    }
}

fn run(base: &Snapshot, tab: &str, action: Action) -> DraftOutput {
    let ctx = ctx(tab);
    let mut draft = Draft::new(base, &ctx, 5);
    apply_action(&mut draft, action).unwrap();
    draft.finish()
}

fn step(base: &Snapshot, tab: &str, action: Action) -> Snapshot {
    run(base, tab, action)
        .snapshot
        .unwrap_or_else(|| base.clone())
}

fn try_run(base: &Snapshot, tab: &str, action: Action) -> Result<DraftOutput, ActionError> {
    let ctx = ctx(tab);
    let mut draft = Draft::new(base, &ctx, 5);
    apply_action(&mut draft, action)?;
    Ok(draft.finish())
}

fn c1() -> ChatId {
    ChatId::from("c1")
}

#[test]
fn from_json_rejects_unknown_names() {
    let err = Action::from_json("launchRocket", json!({})).unwrap_err();
    assert!(matches!(err, ActionParseError::UnknownAction(name) if name == "launchRocket"));
}

#[test]
fn from_json_reports_malformed_payloads() {
    let err = Action::from_json("sendMessage", json!({ "chatId": "c1" })).unwrap_err();
    assert!(matches!(err, ActionParseError::MalformedPayload { kind, .. } if kind == "sendMessage"));
}

#[test]
fn from_json_accepts_bare_payloads() {
    assert_eq!(
        Action::from_json("closeModal", serde_json::Value::Null).unwrap(),
        Action::CloseModal
    );
    assert_eq!(
        Action::from_json("openChat", json!({})).unwrap(),
        Action::OpenChat { chat_id: None }
    );
    assert_eq!(
        Action::from_json("dismissNotification", json!({ "id": 3 })).unwrap(),
        Action::DismissNotification { id: 3 }
    );
}

#[test]
fn names_match_the_wire_form() {
    let unique: BTreeSet<_> = Action::NAMES.iter().collect();
    assert_eq!(unique.len(), Action::NAMES.len());

    let samples = [
        Action::RegisterTab,
        Action::CloseModal,
        Action::LoadChats,
        Action::SignOut,
        Action::send_message("c1", "hi"),
        Action::pin_message("c1", MessageId::Server(2), true),
        Action::UpdateSettings(SettingsPatch::default()),
    ];
    for action in samples {
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["kind"], action.name());
        assert!(Action::NAMES.contains(&action.name()));
        let payload = value
            .get("payload")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        assert_eq!(Action::from_json(action.name(), payload).unwrap(), action);
    }
}

#[test]
fn send_message_is_optimistic_and_rolls_back_on_failure() {
    let base = seeded_snapshot();
    let action = Action::send_message("c1", "  hello there ");
    let Action::SendMessage { correlation, .. } = action.clone() else {
        unreachable!()
    };
    let local = MessageId::Local(correlation);

    let sent = run(&base, "A", action);
    let pending = sent.snapshot.unwrap();
    let message = pending.entities.message(&c1(), &local).unwrap();
    assert!(message.is_pending);
    assert_eq!(message.text, "hello there");
    assert_eq!(message.sender_id, Some(UserId::from("u1")));
    assert_eq!(
        pending.entities.chats.get(&c1()).unwrap().last_message_id,
        Some(local)
    );
    assert!(pending.optimistic.is_pending(&correlation));
    assert_eq!(
        sent.effects,
        vec![Effect::SendMessage {
            chat_id: c1(),
            text: "hello there".to_string(),
            correlation,
        }]
    );

    let failed = step(
        &pending,
        "A",
        Action::SendMessageFailed {
            correlation,
            error: "timeout".to_string(),
        },
    );
    assert!(failed.entities.message(&c1(), &local).is_none());
    assert_eq!(
        failed.entities.chats.get(&c1()).unwrap().last_message_id,
        Some(MessageId::Server(3))
    );
    assert_eq!(
        failed.optimistic.get(&correlation).map(|op| op.state),
        Some(OpState::RolledBack)
    );
    let tab = failed.tab(&TabId::from("A")).unwrap();
    assert_eq!(tab.notifications.len(), 1);
    assert_eq!(tab.notifications[0].message, SEND_FAILED_NOTICE);
    assert!(failed.tab(&TabId::from("B")).unwrap().notifications.is_empty());

    // A late failure for the same correlation changes nothing.
    let again = run(
        &failed,
        "A",
        Action::SendMessageFailed {
            correlation,
            error: "timeout".to_string(),
        },
    );
    assert!(again.snapshot.is_none());
}

#[test]
fn send_confirmation_swaps_in_the_server_message() {
    let base = seeded_snapshot();
    let action = Action::send_message("c1", "ping");
    let Action::SendMessage { correlation, .. } = action.clone() else {
        unreachable!()
    };
    let pending = step(&base, "A", action);

    let mut echoed = crate::utils::test_utils::sample_message("c1", 4, "ping");
    echoed.is_pending = true;
    let confirmed = step(
        &pending,
        "system",
        Action::SendMessageSucceeded {
            correlation,
            message: echoed,
        },
    );

    assert!(confirmed
        .entities
        .message(&c1(), &MessageId::Local(correlation))
        .is_none());
    let stored = confirmed
        .entities
        .message(&c1(), &MessageId::Server(4))
        .unwrap();
    assert!(!stored.is_pending);
    assert_eq!(
        confirmed.entities.chats.get(&c1()).unwrap().last_message_id,
        Some(MessageId::Server(4))
    );
    assert!(!confirmed.optimistic.is_pending(&correlation));
}

#[test]
fn empty_messages_are_rejected() {
    let base = seeded_snapshot();
    let err = try_run(&base, "A", Action::send_message("c1", "   ")).unwrap_err();
    assert!(matches!(err, ActionError::Rejected(_)));
}

#[test]
fn pin_from_one_tab_is_visible_to_the_other_and_leaves_its_ui_alone() {
    let base = seeded_snapshot();
    let action = Action::pin_message("c1", MessageId::Server(2), true);
    let Action::PinMessage { correlation, .. } = action.clone() else {
        unreachable!()
    };

    let output = run(&base, "A", action);
    let pinned = output.snapshot.unwrap();
    assert!(pinned
        .entities
        .message(&c1(), &MessageId::Server(2))
        .unwrap()
        .is_pinned);
    assert!(Arc::ptr_eq(
        base.tab(&TabId::from("B")).unwrap(),
        pinned.tab(&TabId::from("B")).unwrap()
    ));
    assert!(matches!(output.effects.as_slice(), [Effect::PinMessage { is_pinned: true, .. }]));

    let reverted = step(
        &pinned,
        "A",
        Action::PinMessageFailed {
            correlation,
            error: "forbidden".to_string(),
        },
    );
    assert!(!reverted
        .entities
        .message(&c1(), &MessageId::Server(2))
        .unwrap()
        .is_pinned);
}

#[test]
fn pinning_an_already_pinned_message_is_a_no_op() {
    let base = seeded_snapshot();
    let output = run(
        &base,
        "A",
        Action::pin_message("c1", MessageId::Server(1), false),
    );
    assert!(output.snapshot.is_none());
    assert!(output.effects.is_empty());
}

#[test]
fn stacked_contact_edits_roll_back_to_the_original() {
    let base = seeded_snapshot();
    let first = Action::update_contact("u2", "Gracie", None);
    let second = Action::update_contact("u2", "G", Some("Hopper".to_string()));
    let (Action::UpdateContact { correlation: a, .. }, Action::UpdateContact { correlation: b, .. }) =
        (first.clone(), second.clone())
    else {
        unreachable!()
    };

    let snapshot = step(&base, "A", first);
    let snapshot = step(&snapshot, "B", second);
    let u2 = UserId::from("u2");
    assert_eq!(snapshot.entities.users.get(&u2).unwrap().display_name(), "G Hopper");

    let snapshot = step(
        &snapshot,
        "A",
        Action::UpdateContactFailed {
            correlation: a,
            error: "nope".to_string(),
        },
    );
    assert_eq!(snapshot.entities.users.get(&u2).unwrap().display_name(), "G Hopper");

    let snapshot = step(
        &snapshot,
        "B",
        Action::UpdateContactFailed {
            correlation: b,
            error: "nope".to_string(),
        },
    );
    let user = snapshot.entities.users.get(&u2).unwrap();
    assert_eq!(user.display_name(), "Grace");
    assert!(!user.is_contact);
}

#[test]
fn deleted_messages_leave_the_chat_pointing_at_the_newest_survivor() {
    let base = seeded_snapshot();
    let selected = step(
        &base,
        "A",
        Action::ToggleMessageSelection {
            chat_id: c1(),
            message_id: MessageId::Server(3),
        },
    );
    let output = run(
        &selected,
        "A",
        Action::DeleteMessages {
            chat_id: c1(),
            message_ids: vec![MessageId::Server(3)],
        },
    );
    assert!(matches!(output.effects.as_slice(), [Effect::DeleteMessages { .. }]));
    let requested = output.snapshot.unwrap();
    assert!(requested.tab(&TabId::from("A")).unwrap().selection.is_none());

    let deleted = step(
        &requested,
        "A",
        Action::MessagesDeleted {
            chat_id: c1(),
            message_ids: vec![MessageId::Server(3)],
        },
    );
    assert!(deleted.entities.message(&c1(), &MessageId::Server(3)).is_none());
    assert_eq!(
        deleted.entities.chats.get(&c1()).unwrap().last_message_id,
        Some(MessageId::Server(2))
    );
}

#[test]
fn deleting_a_chat_rolls_back_its_pending_sends() {
    let base = seeded_snapshot();
    let opened = step(&base, "A", Action::OpenChat { chat_id: Some(c1()) });
    let send = Action::send_message("c1", "draft");
    let Action::SendMessage { correlation, .. } = send.clone() else {
        unreachable!()
    };
    let pending = step(&opened, "A", send);

    let output = run(&pending, "A", Action::DeleteChat { chat_id: c1() });
    let next = output.snapshot.unwrap();
    assert!(next.entities.chats.get(&c1()).is_none());
    assert!(next.entities.messages_in(&c1()).is_none());
    assert!(!next.optimistic.is_pending(&correlation));
    assert!(next.tab(&TabId::from("A")).unwrap().current_chat_id.is_none());
    assert_eq!(output.effects, vec![Effect::CancelChat { chat_id: c1() }]);
}

#[test]
fn closing_a_tab_rolls_back_its_work_and_announces_it() {
    let base = seeded_snapshot();
    let send = Action::send_message("c1", "bye");
    let Action::SendMessage { correlation, .. } = send.clone() else {
        unreachable!()
    };
    let pending = step(&base, "A", send);

    let output = run(&pending, "A", Action::UnregisterTab);
    let next = output.snapshot.unwrap();
    assert!(next.tab(&TabId::from("A")).is_none());
    assert!(next.tab(&TabId::from("B")).is_some());
    assert!(next
        .entities
        .message(&c1(), &MessageId::Local(correlation))
        .is_none());
    assert_eq!(output.effects, vec![Effect::CancelTab]);
    assert_eq!(
        output.announcements,
        vec![Announcement::TabClosed {
            tab_id: TabId::from("A")
        }]
    );
}

#[test]
fn stale_remote_records_are_dropped() {
    let mut base = seeded_snapshot();
    Arc::make_mut(&mut base.stamps).record("chat:c1", Stamp::new(5, OriginId::from("b")));

    let mut renamed = sample_chat("c1", "Stale");
    let stale = run(
        &base,
        "system",
        Action::ApplyRemotePatch {
            origin: OriginId::from("z"),
            version: 3,
            patch: EntityPatch::Chats(TablePatch::merge(vec![renamed.clone()])),
        },
    );
    assert!(stale.snapshot.is_none());
    assert_eq!(stale.observed_version, 3);
    assert!(!stale.broadcast);

    renamed.title = "Fresh".to_string();
    let fresh = step(
        &base,
        "system",
        Action::ApplyRemotePatch {
            origin: OriginId::from("a"),
            version: 6,
            patch: EntityPatch::Chats(TablePatch::merge(vec![renamed])),
        },
    );
    assert_eq!(fresh.entities.chats.get(&c1()).unwrap().title, "Fresh");
    assert_eq!(
        fresh.stamps.get("chat:c1"),
        Some(&Stamp::new(6, OriginId::from("a")))
    );
}

#[test]
fn hydrate_fills_gaps_without_overwriting_live_records() {
    let base = seeded_snapshot();
    let state = PersistedState {
        schema_version: PERSIST_SCHEMA_VERSION,
        saved_at: fixed_time(),
        version: 9,
        settings: Settings {
            language: "de".to_string(),
            ..Settings::default()
        },
        auth: AuthState::default(),
        cache: EntityCache {
            chats: vec![sample_chat("c1", "Cached"), sample_chat("c2", "Two")],
            ..EntityCache::default()
        },
    };

    let output = run(
        &base,
        "system",
        Action::Hydrate {
            state: Box::new(state),
        },
    );
    assert!(!output.broadcast);
    assert_eq!(output.observed_version, 9);
    let next = output.snapshot.unwrap();
    assert_eq!(next.entities.chats.get(&c1()).unwrap().title, "Lovelace & Hopper");
    assert!(next.entities.chats.contains(&ChatId::from("c2")));
    assert_eq!(next.settings.language, "de");
    assert!(next.auth.is_signed_in());
}

#[test]
fn language_change_reloads_country_names() {
    let base = seeded_snapshot();
    let output = run(
        &base,
        "A",
        Action::UpdateSettings(SettingsPatch {
            language: Some("fr".to_string()),
            ..SettingsPatch::default()
        }),
    );
    assert_eq!(output.follow_ups, vec![Action::LoadCountryList]);

    let same = run(
        &base,
        "A",
        Action::UpdateSettings(SettingsPatch {
            language: Some("en".to_string()),
            ..SettingsPatch::default()
        }),
    );
    assert!(same.snapshot.is_none());
    assert!(same.follow_ups.is_empty());
}

#[test]
fn sign_out_clears_the_session_and_cancels_everything() {
    let base = seeded_snapshot();
    let output = run(&base, "A", Action::SignOut);
    let next = output.snapshot.unwrap();
    assert!(!next.auth.is_signed_in());
    assert!(next.entities.chats.is_empty());
    assert!(next.last_sync_time.is_none());
    assert_eq!(output.effects, vec![Effect::CancelAll]);
}

#[test]
fn chats_loaded_with_replace_drops_missing_chats_and_their_messages() {
    let base = seeded_snapshot();
    let loading = step(&base, "A", Action::LoadChats);
    assert!(loading.tab(&TabId::from("A")).unwrap().loading.chats);

    let loaded = step(
        &loading,
        "A",
        Action::ChatsLoaded {
            chats: vec![sample_chat("c2", "Two")],
            users: Vec::new(),
            messages: Vec::new(),
            replace: true,
        },
    );
    assert!(loaded.entities.chats.get(&c1()).is_none());
    assert!(loaded.entities.messages_in(&c1()).is_none());
    assert!(!loaded.tab(&TabId::from("A")).unwrap().loading.chats);
    assert!(Arc::ptr_eq(&loaded.entities.users, &base.entities.users));
}

#[test]
fn photo_upload_shows_a_placeholder_until_confirmed() {
    let base = seeded_snapshot();
    let action = Action::upload_profile_photo("me.png");
    let Action::UploadProfilePhoto { correlation, .. } = action.clone() else {
        unreachable!()
    };
    let u1 = crate::core::ids::UserId::from("u1");

    let output = run(&base, "A", action);
    assert!(matches!(output.effects.as_slice(), [Effect::UploadProfilePhoto { .. }]));
    let pending = output.snapshot.unwrap();
    let placeholder = pending.entities.users.get(&u1).unwrap().photo.clone().unwrap();
    assert!(placeholder.is_local);

    let confirmed = step(
        &pending,
        "A",
        Action::UploadProfilePhotoSucceeded {
            correlation,
            photo: crate::core::entities::PhotoRef {
                id: "p1".to_string(),
                width: 640,
                height: 640,
                is_local: true,
            },
        },
    );
    let photo = confirmed.entities.users.get(&u1).unwrap().photo.clone().unwrap();
    assert_eq!(photo.id, "p1");
    assert!(!photo.is_local);
    assert_eq!(confirmed.optimistic.pending_count(), 0);

    let failed = step(
        &pending,
        "A",
        Action::UploadProfilePhotoFailed {
            correlation,
            error: "too large".to_string(),
        },
    );
    assert_eq!(failed.entities.users.get(&u1).unwrap().photo, None);
    assert_eq!(
        failed.tab(&TabId::from("A")).unwrap().notifications[0].message,
        "Could not upload photo"
    );
}

#[test]
fn photo_upload_requires_a_session() {
    let mut base = seeded_snapshot();
    base.auth = Arc::new(AuthState::default());
    let err = try_run(&base, "A", Action::upload_profile_photo("me.png")).unwrap_err();
    assert!(err.to_string().contains("not signed in"), "{err}");
}

#[test]
fn country_list_loads_once_per_tab() {
    let base = seeded_snapshot();
    let output = run(&base, "A", Action::LoadCountryList);
    assert_eq!(
        output.effects,
        vec![Effect::FetchCountryList {
            language: "en".to_string()
        }]
    );
    let loading = output.snapshot.unwrap();
    assert!(run(&loading, "A", Action::LoadCountryList).effects.is_empty());

    let loaded = step(
        &loading,
        "A",
        Action::CountryListLoaded {
            countries: vec![crate::core::entities::CountryCode {
                iso2: crate::core::ids::CountryIso::from("FR"),
                default_name: "France".to_string(),
                name: None,
                calling_codes: vec!["33".to_string()],
                is_hidden: false,
            }],
        },
    );
    assert_eq!(loaded.entities.countries.len(), 1);
    assert!(!loaded.tab(&TabId::from("A")).unwrap().loading.country_list);
    assert!(Arc::ptr_eq(&loaded.entities.chats, &base.entities.chats));
}
