//! Upstream provider key configuration.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStorageMode {
    Memory,
    Database,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Keys configured inline; only consulted in `memory` storage mode.
    pub memory_keys: Vec<String>,
    pub key_storage_mode: KeyStorageMode,
    pub database_path: std::path::PathBuf,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            memory_keys: Vec::new(),
            key_storage_mode: KeyStorageMode::Memory,
            database_path: std::path::PathBuf::from("./gatekeeper.sqlite3"),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileUpstreamConfig {
    pub base_url: Option<String>,
    pub memory_keys: Option<Vec<String>>,
    pub key_storage_mode: Option<String>,
    pub database_path: Option<String>,
}

impl UpstreamConfig {
    pub(crate) fn apply_file(mut self, file: FileUpstreamConfig) -> Self {
        if let Some(url) = file.base_url {
            self.base_url = url;
        }
        if let Some(keys) = file.memory_keys {
            self.memory_keys = keys;
        }
        if let Some(mode) = file.key_storage_mode {
            self.key_storage_mode = parse_mode(&mode);
        }
        if let Some(path) = file.database_path {
            self.database_path = path.into();
        }
        self
    }

    pub(crate) fn apply_env(mut self) -> Self {
        if let Ok(url) = std::env::var("GATEKEEPER_UPSTREAM_BASE_URL") {
            self.base_url = url;
        }
        if let Ok(mode) = std::env::var("GATEKEEPER_KEY_STORAGE_MODE") {
            self.key_storage_mode = parse_mode(&mode);
        }
        self
    }
}

fn parse_mode(s: &str) -> KeyStorageMode {
    match s.to_lowercase().as_str() {
        "database" => KeyStorageMode::Database,
        _ => KeyStorageMode::Memory,
    }
}
