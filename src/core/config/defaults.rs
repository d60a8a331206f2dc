use std::path::PathBuf;

use crate::core::config::data::Config;
use crate::core::constants::{
    DEFAULT_API_BASE_URL, DEFAULT_LANGUAGE, DEFAULT_MAX_NOTIFICATIONS,
    DEFAULT_PERSIST_INTERVAL_MS, DEFAULT_SYNC_CHANNEL_CAPACITY,
};

const DEFAULT_LOG_FILTER: &str = "warn";

impl Config {
    pub fn api_base_url(&self) -> &str {
        self.api_base_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or(DEFAULT_API_BASE_URL)
    }

    pub fn persist_interval_ms(&self) -> u64 {
        self.persist_interval_ms
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_PERSIST_INTERVAL_MS)
    }

    pub fn max_notifications(&self) -> usize {
        self.max_notifications
            .filter(|max| *max > 0)
            .unwrap_or(DEFAULT_MAX_NOTIFICATIONS)
    }

    pub fn sync_channel_capacity(&self) -> usize {
        self.sync_channel_capacity
            .filter(|capacity| *capacity > 0)
            .unwrap_or(DEFAULT_SYNC_CHANNEL_CAPACITY)
    }

    pub fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }

    pub fn language(&self) -> &str {
        self.language.as_deref().unwrap_or(DEFAULT_LANGUAGE)
    }

    /// The configured storage directory, if any. Callers fall back to the
    /// platform data directory.
    pub fn storage_dir(&self) -> Option<PathBuf> {
        self.storage_dir.clone()
    }

    /// Layers `other` on top of `self`: keys set in `other` win.
    pub fn merged_with(&self, other: &Config) -> Config {
        Config {
            api_base_url: other.api_base_url.clone().or_else(|| self.api_base_url.clone()),
            api_token: other.api_token.clone().or_else(|| self.api_token.clone()),
            storage_dir: other.storage_dir.clone().or_else(|| self.storage_dir.clone()),
            persist_interval_ms: other.persist_interval_ms.or(self.persist_interval_ms),
            max_notifications: other.max_notifications.or(self.max_notifications),
            sync_channel_capacity: other.sync_channel_capacity.or(self.sync_channel_capacity),
            log_filter: other.log_filter.clone().or_else(|| self.log_filter.clone()),
            language: other.language.clone().or_else(|| self.language.clone()),
            journal_path: other.journal_path.clone().or_else(|| self.journal_path.clone()),
        }
    }
}
