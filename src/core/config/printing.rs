use crate::core::config::data::{path_display, Config};

impl Config {
    /// Lines describing the resolved configuration, as printed by
    /// `chatstate config`. The API token is never shown.
    pub fn describe(&self) -> Vec<String> {
        let mut lines = vec!["Current configuration:".to_string()];
        lines.push(format!("  api-base-url: {}", self.api_base_url()));
        lines.push(format!(
            "  api-token: {}",
            if self.api_token.is_some() { "(set)" } else { "(unset)" }
        ));
        match &self.storage_dir {
            Some(dir) => lines.push(format!("  storage-dir: {}", path_display(dir))),
            None => lines.push("  storage-dir: (platform default)".to_string()),
        }
        lines.push(format!(
            "  persist-interval-ms: {}",
            self.persist_interval_ms()
        ));
        lines.push(format!("  max-notifications: {}", self.max_notifications()));
        lines.push(format!(
            "  sync-channel-capacity: {}",
            self.sync_channel_capacity()
        ));
        lines.push(format!("  log-filter: {}", self.log_filter()));
        lines.push(format!("  language: {}", self.language()));
        match &self.journal_path {
            Some(path) => lines.push(format!("  journal: {}", path_display(path))),
            None => lines.push("  journal: off".to_string()),
        }
        lines
    }

    pub fn print_all(&self) {
        for line in self.describe() {
            println!("{line}");
        }
    }
}
