use std::path::PathBuf;

use crate::core::config::Config;
use crate::core::persist::{self, FileStorage, PersistError, Storage};

/// The `--storage` override, then the configured directory, then the
/// platform data directory.
pub fn resolve_storage(
    config: &Config,
    storage: Option<PathBuf>,
) -> Result<FileStorage, PersistError> {
    match storage.or_else(|| config.storage_dir()) {
        Some(dir) => Ok(FileStorage::in_dir(dir)),
        None => FileStorage::from_project_dirs(),
    }
}

/// Lines summarizing the persisted blob.
pub fn run_inspect(
    config: &Config,
    storage: Option<PathBuf>,
) -> Result<Vec<String>, PersistError> {
    let storage = resolve_storage(config, storage)?;
    describe_blob(&storage)
}

pub fn describe_blob(storage: &dyn Storage) -> Result<Vec<String>, PersistError> {
    let location = storage.describe();
    let Some(blob) = storage.load()? else {
        return Ok(vec![format!("No persisted state at {location}")]);
    };
    let Some(state) = persist::decode(&blob)? else {
        return Ok(vec![format!(
            "Persisted state at {location} uses an unknown schema and will be discarded"
        )]);
    };

    let signed_in = match &state.auth.session {
        Some(session) => format!("yes ({})", session.user_id),
        None => "no".to_string(),
    };
    Ok(vec![
        format!("Persisted state at {location}:"),
        format!("  schema: {}", state.schema_version),
        format!("  saved at: {}", state.saved_at.to_rfc3339()),
        format!("  version: {}", state.version),
        format!("  signed in: {signed_in}"),
        format!("  language: {}", state.settings.language),
        format!("  chats: {}", state.cache.chats.len()),
        format!("  users: {}", state.cache.users.len()),
        format!("  countries: {}", state.cache.countries.len()),
    ])
}

/// Removes the blob and returns where it was.
pub fn run_clear(config: &Config, storage: Option<PathBuf>) -> Result<String, PersistError> {
    let storage = resolve_storage(config, storage)?;
    storage.clear()?;
    Ok(storage.describe())
}
