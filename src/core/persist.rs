//! Durable storage of the parts of a snapshot that outlive a session.
//!
//! Only settings, the auth session and a cache of chats, users and country
//! codes are written. Messages, tab state and the optimistic ledger never
//! are; records with a pending optimistic change are written with their
//! pre-image so a reload never shows an unconfirmed edit.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::core::account::{AuthState, Settings};
use crate::core::config::data::path_display;
use crate::core::constants::PERSIST_SCHEMA_VERSION;
use crate::core::entities::{Chat, CountryCode, User};
use crate::core::ids::{ChatId, UserId};
use crate::core::optimistic::OptimisticTarget;
use crate::core::snapshot::Snapshot;

const STATE_FILE_NAME: &str = "state.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub schema_version: u32,
    pub saved_at: DateTime<Utc>,
    /// Store version at save time; the next session continues after it.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub auth: AuthState,
    #[serde(default)]
    pub cache: EntityCache,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityCache {
    #[serde(default)]
    pub chats: Vec<Chat>,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub countries: Vec<CountryCode>,
}

impl EntityCache {
    pub fn record_count(&self) -> usize {
        self.chats.len() + self.users.len() + self.countries.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("failed to access {}: {source}", path_display(.path))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode persisted state: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("persisted state is corrupted: {0}")]
    Corrupted(#[source] serde_json::Error),
    #[error("could not determine a data directory")]
    NoDataDir,
}

/// Where the persisted blob lives.
pub trait Storage: Send + Sync {
    fn load(&self) -> Result<Option<String>, PersistError>;
    fn save(&self, blob: &str) -> Result<(), PersistError>;
    fn clear(&self) -> Result<(), PersistError>;
    /// Human-readable location, for logs and the CLI.
    fn describe(&self) -> String;
}

/// A JSON file replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(STATE_FILE_NAME),
        }
    }

    /// Storage under the platform data directory.
    pub fn from_project_dirs() -> Result<Self, PersistError> {
        let dirs = ProjectDirs::from("org", "chatstate", "chatstate").ok_or(PersistError::NoDataDir)?;
        Ok(Self::in_dir(dirs.data_dir()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> PersistError {
        PersistError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl Storage for FileStorage {
    fn load(&self) -> Result<Option<String>, PersistError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.io_error(err)),
        }
    }

    fn save(&self, blob: &str) -> Result<(), PersistError> {
        let parent = self
            .path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty());
        if let Some(dir) = parent {
            fs::create_dir_all(dir).map_err(|err| self.io_error(err))?;
        }

        let mut temp_file = match parent {
            Some(dir) => NamedTempFile::new_in(dir),
            None => NamedTempFile::new(),
        }
        .map_err(|err| self.io_error(err))?;
        temp_file
            .write_all(blob.as_bytes())
            .map_err(|err| self.io_error(err))?;
        temp_file
            .as_file_mut()
            .sync_all()
            .map_err(|err| self.io_error(err))?;
        temp_file
            .persist(&self.path)
            .map_err(|err| self.io_error(err.error))?;
        Ok(())
    }

    fn clear(&self) -> Result<(), PersistError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.io_error(err)),
        }
    }

    fn describe(&self) -> String {
        path_display(&self.path)
    }
}

/// Keeps the blob in memory. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    blob: Arc<Mutex<Option<String>>>,
}

impl MemoryStorage {
    pub fn with_blob(blob: impl Into<String>) -> Self {
        Self {
            blob: Arc::new(Mutex::new(Some(blob.into()))),
        }
    }

    pub fn blob(&self) -> Option<String> {
        self.blob
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Storage for MemoryStorage {
    fn load(&self) -> Result<Option<String>, PersistError> {
        Ok(self.blob())
    }

    fn save(&self, blob: &str) -> Result<(), PersistError> {
        *self
            .blob
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(blob.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<(), PersistError> {
        *self
            .blob
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

pub fn encode(state: &PersistedState) -> Result<String, PersistError> {
    serde_json::to_string(state).map_err(PersistError::Encode)
}

/// Parses a persisted blob.
///
/// Schema 1 blobs are upgraded. A blob from an unknown schema is discarded
/// with a warning and `Ok(None)` is returned so the session starts empty;
/// text that is not a JSON object at all is an error.
pub fn decode(text: &str) -> Result<Option<PersistedState>, PersistError> {
    let mut value: serde_json::Value =
        serde_json::from_str(text).map_err(PersistError::Corrupted)?;
    let schema = value
        .get("schemaVersion")
        .and_then(serde_json::Value::as_u64);

    match schema {
        Some(1) => {
            upgrade_v1(&mut value);
            debug!("upgraded persisted state from schema 1");
        }
        Some(version) if version == u64::from(PERSIST_SCHEMA_VERSION) => {}
        other => {
            warn!(
                schema = ?other,
                expected = PERSIST_SCHEMA_VERSION,
                "discarding persisted state with unknown schema"
            );
            return Ok(None);
        }
    }

    serde_json::from_value(value)
        .map(Some)
        .map_err(PersistError::Corrupted)
}

/// Schema 1 kept the cache under `entities` and had no store version.
fn upgrade_v1(value: &mut serde_json::Value) {
    let Some(fields) = value.as_object_mut() else {
        return;
    };
    if let Some(entities) = fields.remove("entities") {
        fields.insert("cache".to_string(), entities);
    }
    fields.insert(
        "schemaVersion".to_string(),
        serde_json::Value::from(PERSIST_SCHEMA_VERSION),
    );
    fields
        .entry("version")
        .or_insert_with(|| serde_json::Value::from(0u64));
}

/// Builds the blob contents for `snapshot`, replacing records that carry a
/// pending optimistic change with their pre-image.
pub fn snapshot_to_persisted(snapshot: &Snapshot, saved_at: DateTime<Utc>) -> PersistedState {
    let mut chat_overrides: BTreeMap<ChatId, Chat> = BTreeMap::new();
    let mut user_overrides: BTreeMap<UserId, User> = BTreeMap::new();
    let mut photo_restored: BTreeSet<UserId> = BTreeSet::new();

    for op in snapshot.optimistic.pending_by_age() {
        match &op.target {
            OptimisticTarget::SendMessage {
                chat_id,
                local_id,
                previous_last_message_id,
                previous_last_message_date,
            } => {
                let Some(chat) = snapshot.entities.chats.get(chat_id) else {
                    continue;
                };
                let chat = chat_overrides
                    .entry(chat_id.clone())
                    .or_insert_with(|| (**chat).clone());
                if chat.last_message_id == Some(*local_id) {
                    chat.last_message_id = *previous_last_message_id;
                    chat.last_message_date = *previous_last_message_date;
                }
            }
            OptimisticTarget::PinMessage { .. } => {}
            OptimisticTarget::UpdateContact { previous } => {
                if !user_overrides.contains_key(&previous.id) {
                    user_overrides.insert(previous.id.clone(), previous.clone());
                }
            }
            OptimisticTarget::UploadProfilePhoto {
                user_id,
                previous_photo,
            } => {
                if !photo_restored.insert(user_id.clone()) {
                    continue;
                }
                let Some(user) = snapshot.entities.users.get(user_id) else {
                    continue;
                };
                let user = user_overrides
                    .entry(user_id.clone())
                    .or_insert_with(|| (**user).clone());
                user.photo = previous_photo.clone();
            }
        }
    }

    let chats = snapshot
        .entities
        .chats
        .values()
        .map(|chat| {
            chat_overrides
                .remove(&chat.id)
                .unwrap_or_else(|| (**chat).clone())
        })
        .collect();
    let users = snapshot
        .entities
        .users
        .values()
        .map(|user| {
            user_overrides
                .remove(&user.id)
                .unwrap_or_else(|| (**user).clone())
        })
        .collect();
    let countries = snapshot
        .entities
        .countries
        .values()
        .map(|country| (**country).clone())
        .collect();

    PersistedState {
        schema_version: PERSIST_SCHEMA_VERSION,
        saved_at,
        version: snapshot.version,
        settings: (*snapshot.settings).clone(),
        auth: (*snapshot.auth).clone(),
        cache: EntityCache {
            chats,
            users,
            countries,
        },
    }
}

/// Writes the persistable part of `snapshot` to `storage`.
pub fn persist(
    storage: &dyn Storage,
    snapshot: &Snapshot,
    now: DateTime<Utc>,
) -> Result<(), PersistError> {
    let state = snapshot_to_persisted(snapshot, now);
    let blob = encode(&state)?;
    storage.save(&blob)?;
    debug!(
        version = state.version,
        records = state.cache.record_count(),
        target = %storage.describe(),
        "persisted state"
    );
    Ok(())
}

/// Reads and decodes whatever `storage` holds.
pub fn hydrate(storage: &dyn Storage) -> Result<Option<PersistedState>, PersistError> {
    let Some(blob) = storage.load()? else {
        info!(target = %storage.describe(), "no persisted state");
        return Ok(None);
    };
    decode(&blob)
}

/// Whether anything that [`snapshot_to_persisted`] reads differs between the
/// two snapshots.
pub fn persistable_changed(prev: &Snapshot, next: &Snapshot) -> bool {
    !Arc::ptr_eq(&prev.settings, &next.settings)
        || !Arc::ptr_eq(&prev.auth, &next.auth)
        || !Arc::ptr_eq(&prev.optimistic, &next.optimistic)
        || !Arc::ptr_eq(&prev.entities.chats, &next.entities.chats)
        || !Arc::ptr_eq(&prev.entities.users, &next.entities.users)
        || !Arc::ptr_eq(&prev.entities.countries, &next.entities.countries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::{CorrelationId, MessageId, TabId};
    use crate::utils::test_utils::{fixed_time, sample_chat, seeded_snapshot};
    use tempfile::TempDir;

    #[test]
    fn only_cacheable_slices_are_written() {
        let snapshot = seeded_snapshot();
        let state = snapshot_to_persisted(&snapshot, fixed_time());
        let json: serde_json::Value = serde_json::from_str(&encode(&state).unwrap()).unwrap();

        assert_eq!(json["schemaVersion"], PERSIST_SCHEMA_VERSION);
        assert_eq!(json["cache"]["chats"].as_array().unwrap().len(), 1);
        assert_eq!(json["cache"]["users"].as_array().unwrap().len(), 2);
        assert!(json.get("byTab").is_none());
        assert!(json["cache"].get("messages").is_none());
        assert_eq!(json["auth"]["session"]["userId"], "u1");
    }

    #[test]
    fn pending_edits_are_written_as_their_pre_image() {
        let mut snapshot = seeded_snapshot();
        let correlation = CorrelationId::generate();
        let local = MessageId::Local(correlation);
        let original = snapshot.entities.chats.get(&ChatId::from("c1")).unwrap().clone();

        Arc::make_mut(&mut snapshot.optimistic)
            .begin(
                correlation,
                TabId::from("A"),
                OptimisticTarget::SendMessage {
                    chat_id: ChatId::from("c1"),
                    local_id: local,
                    previous_last_message_id: original.last_message_id,
                    previous_last_message_date: original.last_message_date,
                },
            )
            .unwrap();
        Arc::make_mut(&mut snapshot.entities.chats).update(&ChatId::from("c1"), |chat| {
            chat.last_message_id = Some(local);
        });

        let state = snapshot_to_persisted(&snapshot, fixed_time());
        assert_eq!(state.cache.chats[0], *original);
    }

    #[test]
    fn schema_one_blobs_are_upgraded() {
        let blob = serde_json::json!({
            "schemaVersion": 1,
            "savedAt": "2024-03-01T12:00:00Z",
            "settings": { "language": "de", "theme": "dark", "messageTextSize": 14,
                          "notificationsEnabled": false, "archiveCollapsed": true },
            "entities": { "chats": [sample_chat("c1", "Old")] }
        })
        .to_string();

        let state = decode(&blob).unwrap().unwrap();
        assert_eq!(state.schema_version, PERSIST_SCHEMA_VERSION);
        assert_eq!(state.version, 0);
        assert_eq!(state.settings.language, "de");
        assert_eq!(state.cache.chats[0].title, "Old");
    }

    #[test]
    fn unknown_schema_is_discarded() {
        let blob = r#"{"schemaVersion": 99, "savedAt": "2024-03-01T12:00:00Z"}"#;
        assert!(decode(blob).unwrap().is_none());
        assert!(decode(r#"{"savedAt": "2024-03-01T12:00:00Z"}"#)
            .unwrap()
            .is_none());
    }

    #[test]
    fn corrupted_blob_is_an_error() {
        assert!(matches!(decode("{ nope"), Err(PersistError::Corrupted(_))));
        let wrong_shape = r#"{"schemaVersion": 2, "savedAt": 17}"#;
        assert!(matches!(decode(wrong_shape), Err(PersistError::Corrupted(_))));
    }

    #[test]
    fn file_storage_round_trips_and_clears() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::in_dir(dir.path().join("nested"));
        assert!(hydrate(&storage).unwrap().is_none());

        let snapshot = seeded_snapshot();
        persist(&storage, &snapshot, fixed_time()).unwrap();
        assert!(storage.path().exists());

        let restored = hydrate(&storage).unwrap().unwrap();
        assert_eq!(restored, snapshot_to_persisted(&snapshot, fixed_time()));

        storage.clear().unwrap();
        storage.clear().unwrap();
        assert!(!storage.path().exists());
    }

    #[test]
    fn tab_only_changes_do_not_need_a_save() {
        let snapshot = seeded_snapshot();
        let mut next = snapshot.clone();
        Arc::make_mut(&mut next.by_tab).remove(&TabId::from("B"));
        assert!(!persistable_changed(&snapshot, &next));

        Arc::make_mut(&mut next.settings).language = "fr".into();
        assert!(persistable_changed(&snapshot, &next));
    }
}
