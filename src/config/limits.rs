//! Per-IP rate limit configuration and model-limit overrides.

use std::collections::HashMap;

use serde::Deserialize;

use crate::model_limits::ModelLimit;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub per_ip_per_minute: u32,
    pub per_ip_per_day: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_ip_per_minute: 60,
            per_ip_per_day: 5_000,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileRateLimitConfig {
    pub per_ip_per_minute: Option<u32>,
    pub per_ip_per_day: Option<u32>,
}

impl RateLimitConfig {
    pub(crate) fn apply_file(mut self, file: FileRateLimitConfig) -> Self {
        if let Some(v) = file.per_ip_per_minute {
            self.per_ip_per_minute = v;
        }
        if let Some(v) = file.per_ip_per_day {
            self.per_ip_per_day = v;
        }
        self
    }
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileModelLimit {
    pub rpm: u32,
    pub rpd: u32,
    pub tpm_input: u32,
    pub tpd_input: u32,
    pub input_token_limit: u32,
    pub output_token_limit: u32,
}

impl From<FileModelLimit> for ModelLimit {
    fn from(f: FileModelLimit) -> Self {
        ModelLimit {
            rpm: f.rpm,
            rpd: f.rpd,
            tpm_input: f.tpm_input,
            tpd_input: f.tpd_input,
            input_token_limit: f.input_token_limit,
            output_token_limit: f.output_token_limit,
        }
    }
}

pub(crate) fn parse_model_overrides(
    raw: HashMap<String, FileModelLimit>,
) -> HashMap<String, ModelLimit> {
    raw.into_iter().map(|(k, v)| (k, v.into())).collect()
}
