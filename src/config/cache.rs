//! Cache Metadata Index configuration.

use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enable_native_caching: bool,
    pub refresh_interval_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_native_caching: true,
            refresh_interval_seconds: 600,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileCacheConfig {
    pub enable_native_caching: Option<bool>,
    pub refresh_interval_seconds: Option<u64>,
}

impl CacheConfig {
    pub(crate) fn apply_file(mut self, file: FileCacheConfig) -> Self {
        if let Some(v) = file.enable_native_caching {
            self.enable_native_caching = v;
        }
        if let Some(v) = file.refresh_interval_seconds {
            self.refresh_interval_seconds = v;
        }
        self
    }
}
