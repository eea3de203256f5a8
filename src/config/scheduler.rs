//! Background task scheduling configuration.

use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub usage_report_interval_minutes: u64,
    pub quota_timezone: String,
    pub score_refresh_interval_seconds: i64,
    pub key_cooldown_seconds: i64,
    pub sticky_session_ttl_seconds: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            usage_report_interval_minutes: 60,
            quota_timezone: "America/Los_Angeles".to_string(),
            score_refresh_interval_seconds: 30,
            key_cooldown_seconds: 45,
            sticky_session_ttl_seconds: 300,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileSchedulerConfig {
    pub usage_report_interval_minutes: Option<u64>,
    pub quota_timezone: Option<String>,
    pub score_refresh_interval_seconds: Option<i64>,
    pub key_cooldown_seconds: Option<i64>,
    pub sticky_session_ttl_seconds: Option<i64>,
}

impl SchedulerConfig {
    pub(crate) fn apply_file(mut self, file: FileSchedulerConfig) -> Self {
        if let Some(v) = file.usage_report_interval_minutes {
            self.usage_report_interval_minutes = v;
        }
        if let Some(v) = file.quota_timezone {
            self.quota_timezone = v;
        }
        if let Some(v) = file.score_refresh_interval_seconds {
            self.score_refresh_interval_seconds = v;
        }
        if let Some(v) = file.key_cooldown_seconds {
            self.key_cooldown_seconds = v;
        }
        if let Some(v) = file.sticky_session_ttl_seconds {
            self.sticky_session_ttl_seconds = v;
        }
        self
    }

    pub fn timezone(&self) -> chrono_tz::Tz {
        self.quota_timezone
            .parse()
            .unwrap_or(chrono_tz::America::Los_Angeles)
    }
}
