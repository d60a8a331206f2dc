use super::*;
use crate::cli::inspect::{describe_blob, run_clear, run_inspect};
use crate::cli::replay::replay_into;
use crate::core::actions::{Action, ActionEnvelope};
use crate::core::ids::{ChatId, OriginId, TabId};
use crate::core::persist::{self, FileStorage, MemoryStorage, Storage};
use crate::core::snapshot::Snapshot;
use crate::core::store::{Store, StoreOptions};
use crate::utils::journal::ActionJournal;
use crate::utils::test_utils::{fixed_time, sample_chat, seeded_snapshot};
use std::fs;
use tempfile::TempDir;

fn parse_args(argv: &[&str]) -> Args {
    Args::try_parse_from(argv)
        .unwrap_or_else(|err| panic!("argv={argv:?} should parse successfully: {err}"))
}

fn envelope(tab: &str, action: Action) -> ActionEnvelope {
    ActionEnvelope {
        tab_id: TabId::from(tab),
        issued_at: fixed_time(),
        action,
    }
}

fn write_journal(path: &std::path::Path, envelopes: &[ActionEnvelope]) {
    let mut journal = ActionJournal::open(path).unwrap();
    for envelope in envelopes {
        journal.record(envelope).unwrap();
    }
}

fn fresh_store() -> Store {
    Store::new(StoreOptions {
        origin: OriginId::from("replay"),
        max_notifications: 5,
    })
}

#[test]
fn replay_parses_file_and_snapshot_out() {
    let args = parse_args(&[
        "chatstate",
        "replay",
        "session.jsonl",
        "--snapshot-out",
        "out.json",
    ]);
    match args.command {
        Commands::Replay { file, snapshot_out } => {
            assert_eq!(file, PathBuf::from("session.jsonl"));
            assert_eq!(snapshot_out, Some(PathBuf::from("out.json")));
        }
        _ => panic!("expected replay subcommand"),
    }
}

#[test]
fn storage_flag_is_optional() {
    match parse_args(&["chatstate", "inspect"]).command {
        Commands::Inspect { storage } => assert!(storage.is_none()),
        _ => panic!("expected inspect subcommand"),
    }
    match parse_args(&["chatstate", "clear", "--storage", "/tmp/state"]).command {
        Commands::Clear { storage } => assert_eq!(storage, Some(PathBuf::from("/tmp/state"))),
        _ => panic!("expected clear subcommand"),
    }
}

#[test]
fn a_subcommand_is_required() {
    assert!(Args::try_parse_from(["chatstate"]).is_err());
    assert!(Args::try_parse_from(["chatstate", "replay"]).is_err());
}

#[test]
fn replay_counts_outcomes_and_rebuilds_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("session.jsonl");
    write_journal(
        &path,
        &[
            envelope("A", Action::RegisterTab),
            envelope(
                "system",
                Action::ChatsLoaded {
                    chats: vec![sample_chat("c1", "One"), sample_chat("c2", "Two")],
                    users: Vec::new(),
                    messages: Vec::new(),
                    replace: false,
                },
            ),
            envelope(
                "A",
                Action::OpenChat {
                    chat_id: Some(ChatId::from("c2")),
                },
            ),
            envelope(
                "A",
                Action::OpenChat {
                    chat_id: Some(ChatId::from("c2")),
                },
            ),
            envelope(
                "A",
                Action::ToggleChatMuted {
                    chat_id: ChatId::from("missing"),
                },
            ),
        ],
    );

    let mut store = fresh_store();
    let summary = replay_into(&mut store, &path).unwrap();

    assert_eq!(summary.total(), 5);
    assert_eq!(summary.updated, 3);
    assert_eq!(summary.unchanged, 1);
    assert_eq!(summary.rejected, 1);
    assert_eq!(summary.faulted, 0);
    assert_eq!(summary.tabs, 1);
    assert_eq!(summary.chats, 2);
    assert_eq!(summary.version, 3);

    let mut again = fresh_store();
    replay_into(&mut again, &path).unwrap();
    assert_eq!(again.snapshot().as_ref(), store.snapshot().as_ref());
}

#[test]
fn replay_writes_the_snapshot_when_asked() {
    let dir = TempDir::new().unwrap();
    let journal = dir.path().join("session.jsonl");
    let out = dir.path().join("snapshot.json");
    write_journal(&journal, &[envelope("A", Action::RegisterTab)]);

    let summary = replay::run_replay(&Config::default(), &journal, Some(&out)).unwrap();
    assert_eq!(summary.tabs, 1);

    let written: Snapshot = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
    assert!(written.tab(&TabId::from("A")).is_some());
    assert_eq!(written.version, 1);
}

#[test]
fn replay_reports_the_bad_line() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.jsonl");
    fs::write(&path, "{\"tabId\":\"A\"}\n").unwrap();

    let err = replay_into(&mut fresh_store(), &path).unwrap_err();
    assert!(err.to_string().contains("line 1"), "{err}");
}

#[test]
fn inspect_summarizes_a_saved_blob() {
    let storage = MemoryStorage::default();
    assert!(describe_blob(&storage).unwrap()[0].starts_with("No persisted state"));

    persist::persist(&storage, &seeded_snapshot(), fixed_time()).unwrap();
    let lines = describe_blob(&storage).unwrap();
    assert!(lines.contains(&"  signed in: yes (u1)".to_string()), "{lines:?}");
    assert!(lines.contains(&"  chats: 1".to_string()), "{lines:?}");
    assert!(lines.contains(&"  users: 2".to_string()), "{lines:?}");
}

#[test]
fn inspect_flags_unknown_schemas() {
    let storage = MemoryStorage::with_blob("{\"schemaVersion\":99}");
    let lines = describe_blob(&storage).unwrap();
    assert!(lines[0].contains("unknown schema"), "{lines:?}");
}

#[test]
fn clear_removes_the_blob_from_the_chosen_directory() {
    let dir = TempDir::new().unwrap();
    let storage = FileStorage::in_dir(dir.path());
    storage.save("{}").unwrap();

    run_clear(&Config::default(), Some(dir.path().to_path_buf())).unwrap();
    assert!(!storage.path().exists());

    let lines = run_inspect(&Config::default(), Some(dir.path().to_path_buf())).unwrap();
    assert!(lines[0].starts_with("No persisted state"));
}

#[test]
fn build_description_starts_with_the_package_version() {
    assert!(build_description().starts_with(env!("CARGO_PKG_VERSION")));
}
