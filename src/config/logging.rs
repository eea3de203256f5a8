//! Log output configuration.

use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub max_file_size_mb: u64,
    pub backup_count: u32,
    pub rotation: LogRotation,
    pub cleanup_days: u32,
    pub debug: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl LogRotation {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "hourly" => Self::Hourly,
            "never" => Self::Never,
            _ => Self::Daily,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: 50,
            backup_count: 5,
            rotation: LogRotation::Daily,
            cleanup_days: 14,
            debug: false,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileLoggingConfig {
    pub max_file_size_mb: Option<u64>,
    pub backup_count: Option<u32>,
    pub rotation: Option<String>,
    pub cleanup_days: Option<u32>,
    pub debug: Option<bool>,
}

impl LoggingConfig {
    pub(crate) fn apply_file(mut self, file: FileLoggingConfig) -> Self {
        if let Some(v) = file.max_file_size_mb {
            self.max_file_size_mb = v;
        }
        if let Some(v) = file.backup_count {
            self.backup_count = v;
        }
        if let Some(v) = file.rotation {
            self.rotation = LogRotation::from_str(&v);
        }
        if let Some(v) = file.cleanup_days {
            self.cleanup_days = v;
        }
        if let Some(v) = file.debug {
            self.debug = v;
        }
        self
    }

    pub(crate) fn apply_env(mut self) -> Self {
        if let Ok(v) = std::env::var("GATEKEEPER_DEBUG") {
            self.debug = v == "1" || v.eq_ignore_ascii_case("true");
        }
        self
    }
}
