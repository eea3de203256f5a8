//! Conversation context store configuration.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStorageMode {
    Memory,
    Database,
}

#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub storage_mode: ContextStorageMode,
    pub db_path: std::path::PathBuf,
    pub default_ttl_days: u32,
    pub default_max_tokens: u32,
    pub safety_margin: u32,
    pub memory_cleanup_interval_seconds: u64,
    pub memory_max_records: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            storage_mode: ContextStorageMode::Memory,
            db_path: std::path::PathBuf::from("./gatekeeper.sqlite3"),
            default_ttl_days: 7,
            default_max_tokens: 32_000,
            safety_margin: 512,
            memory_cleanup_interval_seconds: 300,
            memory_max_records: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileContextConfig {
    pub storage_mode: Option<String>,
    pub db_path: Option<String>,
    pub default_ttl_days: Option<u32>,
    pub default_max_tokens: Option<u32>,
    pub safety_margin: Option<u32>,
    pub memory_cleanup_interval_seconds: Option<u64>,
    pub memory_max_records: Option<usize>,
}

impl ContextConfig {
    pub(crate) fn apply_file(mut self, file: FileContextConfig) -> Self {
        if let Some(mode) = file.storage_mode {
            self.storage_mode = parse_mode(&mode);
        }
        if let Some(path) = file.db_path {
            self.db_path = path.into();
        }
        if let Some(v) = file.default_ttl_days {
            self.default_ttl_days = v;
        }
        if let Some(v) = file.default_max_tokens {
            self.default_max_tokens = v;
        }
        if let Some(v) = file.safety_margin {
            self.safety_margin = v;
        }
        if let Some(v) = file.memory_cleanup_interval_seconds {
            self.memory_cleanup_interval_seconds = v;
        }
        if let Some(v) = file.memory_max_records {
            self.memory_max_records = v;
        }
        self
    }
}

fn parse_mode(s: &str) -> ContextStorageMode {
    match s.to_lowercase().as_str() {
        "database" => ContextStorageMode::Database,
        _ => ContextStorageMode::Memory,
    }
}
