//! Shared constants used across the crate

/// Version of the persisted blob layout written by this build.
pub const PERSIST_SCHEMA_VERSION: u32 = 2;

/// Resolved optimistic operations kept around for duplicate-echo detection.
pub const MAX_RESOLVED_OPS: usize = 64;

pub const DEFAULT_MAX_NOTIFICATIONS: usize = 5;
pub const DEFAULT_PERSIST_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_SYNC_CHANNEL_CAPACITY: usize = 256;
pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8080/api";
pub const DEFAULT_LANGUAGE: &str = "en";

/// Distinct argument sets a single memoized selector remembers.
pub const DEFAULT_MEMO_CAPACITY: usize = 32;

/// Removal stamps a store keeps to reject stale resurrecting patches.
pub const MAX_TOMBSTONES: usize = 1024;

/// Tab id used for inputs that do not come from a tab, such as remote
/// patches and hydration. Never registered as a real tab.
pub const SYSTEM_TAB: &str = "system";

pub const SEND_FAILED_NOTICE: &str = "Message failed to send";
