//! Configuration, loaded once at startup and treated as immutable.
//!
//! Precedence, highest first:
//! 1. Environment variables (`GATEKEEPER_*`)
//! 2. Config file (`~/.config/gatekeeper/config.toml`)
//! 3. Built-in defaults

mod auth;
mod cache;
mod context;
mod limits;
mod logging;
mod safety;
mod scheduler;
mod upstream;

pub use auth::AuthConfig;
pub use cache::CacheConfig;
pub use context::{ContextConfig, ContextStorageMode};
pub use limits::RateLimitConfig;
pub use logging::{LogRotation, LoggingConfig};
pub use safety::SafetyConfig;
pub use scheduler::SchedulerConfig;
pub use upstream::{KeyStorageMode, UpstreamConfig};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

use crate::model_limits::ModelLimit;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_dir: PathBuf,
    pub auth: AuthConfig,
    pub upstream: UpstreamConfig,
    pub rate_limits: RateLimitConfig,
    pub model_limit_overrides: HashMap<String, ModelLimit>,
    pub context: ContextConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    pub safety: SafetyConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8085".parse().unwrap(),
            log_dir: PathBuf::from("./logs"),
            auth: AuthConfig::default(),
            upstream: UpstreamConfig::default(),
            rate_limits: RateLimitConfig::default(),
            model_limit_overrides: HashMap::new(),
            context: ContextConfig::default(),
            cache: CacheConfig::default(),
            scheduler: SchedulerConfig::default(),
            safety: SafetyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub bind_addr: Option<String>,
    pub log_dir: Option<String>,
    pub auth: Option<auth::FileAuthConfig>,
    pub upstream: Option<upstream::FileUpstreamConfig>,
    pub rate_limits: Option<limits::FileRateLimitConfig>,
    #[serde(default)]
    pub model_limits: HashMap<String, limits::FileModelLimit>,
    pub context: Option<context::FileContextConfig>,
    pub cache: Option<cache::FileCacheConfig>,
    pub scheduler: Option<scheduler::FileSchedulerConfig>,
    pub safety: Option<safety::FileSafetyConfig>,
    pub logging: Option<logging::FileLoggingConfig>,
}

impl Config {
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("gatekeeper").join("config.toml"))
    }

    /// Load in the documented order: defaults, then file, then environment.
    ///
    /// # Panics
    /// If a config file exists but fails to parse — a broken config should
    /// fail fast rather than silently fall back to defaults.
    pub fn load() -> Self {
        let file = Self::load_file_config();
        let mut config = Self::default();

        if let Some(bind_addr) = file.bind_addr.and_then(|s| s.parse().ok()) {
            config.bind_addr = bind_addr;
        }
        if let Some(log_dir) = file.log_dir {
            config.log_dir = log_dir.into();
        }
        if let Some(auth) = file.auth {
            config.auth = config.auth.apply_file(auth);
        }
        if let Some(upstream) = file.upstream {
            config.upstream = config.upstream.apply_file(upstream);
        }
        if let Some(rate_limits) = file.rate_limits {
            config.rate_limits = config.rate_limits.apply_file(rate_limits);
        }
        if !file.model_limits.is_empty() {
            config.model_limit_overrides = limits::parse_model_overrides(file.model_limits);
        }
        if let Some(context) = file.context {
            config.context = config.context.apply_file(context);
        }
        if let Some(cache) = file.cache {
            config.cache = config.cache.apply_file(cache);
        }
        if let Some(scheduler) = file.scheduler {
            config.scheduler = config.scheduler.apply_file(scheduler);
        }
        if let Some(safety) = file.safety {
            config.safety = config.safety.apply_file(safety);
        }
        if let Some(logging) = file.logging {
            config.logging = config.logging.apply_file(logging);
        }

        config.auth = config.auth.apply_env();
        config.upstream = config.upstream.apply_env();
        config.logging = config.logging.apply_env();

        if let Ok(addr) = std::env::var("GATEKEEPER_BIND_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.bind_addr = parsed;
            }
        }

        config
    }

    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };
        match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                panic!("failed to parse config file at {}: {e}", path.display())
            }),
            Err(_) => FileConfig::default(),
        }
    }

    pub fn ensure_config_exists(&self) {
        let Some(path) = Self::config_path() else {
            return;
        };
        if path.exists() {
            return;
        }
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let _ = std::fs::write(&path, "# gatekeeper configuration\n# see README for recognized keys\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_binds_to_loopback() {
        let config = Config::default();
        assert_eq!(config.bind_addr.ip().to_string(), "127.0.0.1");
    }

    #[test]
    fn scheduler_timezone_falls_back_on_bad_name() {
        let mut scheduler = SchedulerConfig::default();
        scheduler.quota_timezone = "not/a/zone".to_string();
        assert_eq!(scheduler.timezone(), chrono_tz::America::Los_Angeles);
    }
}
