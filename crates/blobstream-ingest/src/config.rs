//! Collection configuration

use regex::Regex;

/// Default chunk buffer size in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default number of chunks between checkpoint commits
pub const DEFAULT_COMMIT_INTERVAL: u64 = 100;

/// Retry policy for objects that fail processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryLimit {
    /// Keep the checkpoint and retry on every collection cycle until the
    /// object eventually succeeds
    #[default]
    Unbounded,
    /// Drop the checkpoint and abandon the object after this many recorded
    /// failures
    Bounded(u32),
}

impl RetryLimit {
    pub fn exhausted(&self, error_count: u32) -> bool {
        match self {
            RetryLimit::Unbounded => false,
            RetryLimit::Bounded(max) => error_count >= *max,
        }
    }
}

/// Character set selection for decoded text
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CharacterSet {
    /// Detect from the byte-order mark once, then persist the result in the
    /// object's checkpoint; falls back to UTF-8
    #[default]
    Auto,
    /// An encoding label, e.g. "utf-16le"
    Named(String),
}

/// Configuration for one collection task
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub retry_limit: RetryLimit,
    pub character_set: CharacterSet,
    /// Parse line-delimited content as CSV, treating the first line of each
    /// member as the header row
    pub parse_csv_with_header: bool,
    pub csv_delimiter: u8,
    /// Keys matching this pattern are always collected, even when the
    /// blacklist also matches
    pub key_whitelist: Option<Regex>,
    pub key_blacklist: Option<Regex>,
    /// Maximum number of folder segments above the leaf for folder-style keys
    pub recursion_depth: Option<u32>,
    pub buffer_size: usize,
    /// Chunks consumed between periodic checkpoint commits
    pub commit_interval: u64,
    /// Disable the small-object in-memory fast path; every object then keeps
    /// a live streaming connection regardless of size
    pub force_streaming: bool,
    pub sourcetype: String,
    pub index: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            retry_limit: RetryLimit::Unbounded,
            character_set: CharacterSet::Auto,
            parse_csv_with_header: false,
            csv_delimiter: b',',
            key_whitelist: None,
            key_blacklist: None,
            recursion_depth: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            force_streaming: false,
            sourcetype: "blobstream:object".to_string(),
            index: "main".to_string(),
        }
    }
}

impl IngestConfig {
    /// Whether an object key passes the configured filters.
    ///
    /// Whitelist wins over blacklist; the depth bound applies before either.
    pub fn should_process(&self, key: &str) -> bool {
        if let Some(depth) = self.recursion_depth {
            let folders = key.trim_matches('/').split('/').count().saturating_sub(1);
            if folders as u32 > depth {
                return false;
            }
        }

        if let Some(ref allow) = self.key_whitelist {
            if allow.is_match(key) {
                return true;
            }
        }

        if let Some(ref deny) = self.key_blacklist {
            if deny.is_match(key) {
                return false;
            }
        }

        self.key_whitelist.is_none()
    }
}
