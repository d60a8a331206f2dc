use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk settings for the runtime and CLI. Every key is optional; the
/// accessors in `defaults` resolve unset keys.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct Config {
    /// Root of the REST API, e.g. "https://chat.example.org/api"
    pub api_base_url: Option<String>,
    /// Bearer token sent with every API request
    pub api_token: Option<String>,
    /// Directory holding the persisted state blob
    pub storage_dir: Option<PathBuf>,
    /// Minimum time between two writes of the persisted blob
    pub persist_interval_ms: Option<u64>,
    /// Notifications kept per tab before the oldest is dropped
    pub max_notifications: Option<usize>,
    pub sync_channel_capacity: Option<usize>,
    /// Filter directive used when RUST_LOG is unset (e.g. "chatstate=debug")
    pub log_filter: Option<String>,
    /// UI language; also selects the country list locale
    pub language: Option<String>,
    /// When set, every dispatched action is appended to this file
    pub journal_path: Option<PathBuf>,
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
///
/// # Examples
/// - Unix: `/home/user/.local/share/chatstate/state.json` → `~/.local/share/chatstate/state.json`
/// - Windows: `C:\\Users\\user\\AppData\\Roaming\\chatstate` → `C:\\Users\\user\\AppData\\Roaming\\chatstate`
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
