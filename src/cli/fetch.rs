use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tracing::info;

use crate::api::HttpApiClient;
use crate::cli::inspect::resolve_storage;
use crate::core::account::SettingsPatch;
use crate::core::actions::Action;
use crate::core::config::Config;
use crate::core::ids::{OriginId, TabId};
use crate::core::persist::Storage;
use crate::core::store::{Store, StoreOptions};
use crate::core::sync::SyncHub;
use crate::runtime::Runtime;
use crate::utils::journal::ActionJournal;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const CLI_TAB: &str = "cli";

/// Starts a runtime on the persisted state, loads the chat list once through
/// a dedicated tab and shuts down, which writes the blob.
pub async fn run_fetch(
    config: &Config,
    storage: Option<PathBuf>,
    journal: Option<PathBuf>,
) -> Result<String, Box<dyn Error>> {
    let storage = Arc::new(resolve_storage(config, storage)?);
    let api = HttpApiClient::new(
        Client::new(),
        config.api_base_url(),
        config.api_token.clone(),
    );

    let origin = OriginId::generate();
    let mut store = Store::new(StoreOptions {
        origin: origin.clone(),
        max_notifications: config.max_notifications(),
    });
    if let Some(path) = journal.or_else(|| config.journal_path.clone()) {
        store.set_journal(Some(ActionJournal::open(path)?));
    }

    let hub = SyncHub::from_config(config);
    let mut runtime = Runtime::new(store, Arc::new(api), storage.clone())
        .with_persist_interval(Duration::from_millis(config.persist_interval_ms()))
        .with_sync(hub.connect(origin));
    runtime.bootstrap()?;
    let handle = runtime.handle();
    let task = tokio::spawn(runtime.run());

    let tab = TabId::from(CLI_TAB);
    let synced_before = handle.snapshot().last_sync_time;
    let mut actions = vec![Action::RegisterTab];
    if let Some(language) = &config.language {
        actions.push(Action::UpdateSettings(SettingsPatch {
            language: Some(language.clone()),
            ..SettingsPatch::default()
        }));
    }
    actions.push(Action::LoadChats);
    handle.dispatcher().dispatch_many(&tab, actions);

    let finished = tokio::time::timeout(
        FETCH_TIMEOUT,
        handle.wait_for(|snapshot| {
            snapshot.tab(&tab).is_some_and(|state| {
                !state.loading.chats
                    && (snapshot.last_sync_time != synced_before
                        || !state.notifications.is_empty())
            })
        }),
    )
    .await;

    let snapshot = handle.snapshot();
    handle.shutdown();
    task.await?;

    let Ok(Some(_)) = finished else {
        return Err("timed out waiting for the chat list".into());
    };
    if let Some(notice) = snapshot
        .tab(&tab)
        .and_then(|state| state.notifications.last())
    {
        return Err(notice.message.clone().into());
    }

    info!(version = snapshot.version, "fetch complete");
    Ok(format!(
        "✅ Loaded {} chats and {} users; state saved to {}",
        snapshot.entities.chats.len(),
        snapshot.entities.users.len(),
        storage.describe()
    ))
}
