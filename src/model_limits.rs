//! Model Limits Registry.
//!
//! Static per-model quota/token limits, loaded once at startup. Grounded on
//! the teacher's `pricing::get_pricing` — a plain match over model ids with
//! a documented fallback for unknown models.

use std::collections::HashMap;

/// Per-model quota and token limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelLimit {
    pub rpm: u32,
    pub rpd: u32,
    pub tpm_input: u32,
    pub tpd_input: u32,
    pub input_token_limit: u32,
    pub output_token_limit: u32,
}

/// Built-in limits for known models. Kept as a simple table (not a match
/// statement, unlike the teacher's pricing table) because the registry
/// additionally supports configured overrides/additions at startup.
fn builtin_limits() -> Vec<(&'static str, ModelLimit)> {
    vec![
        (
            "gemini-1.5-pro",
            ModelLimit {
                rpm: 360,
                rpd: 10_000,
                tpm_input: 4_000_000,
                tpd_input: 50_000_000,
                input_token_limit: 2_097_152,
                output_token_limit: 8_192,
            },
        ),
        (
            "gemini-1.5-flash",
            ModelLimit {
                rpm: 1_000,
                rpd: 50_000,
                tpm_input: 4_000_000,
                tpd_input: 100_000_000,
                input_token_limit: 1_048_576,
                output_token_limit: 8_192,
            },
        ),
        (
            "gemini-2.0-flash",
            ModelLimit {
                rpm: 2_000,
                rpd: 100_000,
                tpm_input: 4_000_000,
                tpd_input: 200_000_000,
                input_token_limit: 1_048_576,
                output_token_limit: 8_192,
            },
        ),
    ]
}

/// Registry of per-model limits, loaded once and treated as immutable for
/// the lifetime of the process.
#[derive(Debug, Clone)]
pub struct ModelLimitsRegistry {
    limits: HashMap<String, ModelLimit>,
    /// Used when a model is looked up and found missing.
    fallback_input_token_limit: u32,
}

impl ModelLimitsRegistry {
    /// Build the registry from the built-in table plus any configured
    /// overrides/additions. Overrides replace a built-in entry by model id.
    pub fn new(overrides: HashMap<String, ModelLimit>, fallback_input_token_limit: u32) -> Self {
        let mut limits: HashMap<String, ModelLimit> = builtin_limits()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        limits.extend(overrides);
        Self {
            limits,
            fallback_input_token_limit,
        }
    }

    /// Look up a model's limits. Unknown models are not an error — callers
    /// pass the request through untranslated and untracked.
    pub fn lookup(&self, model_id: &str) -> Option<&ModelLimit> {
        self.limits.get(model_id)
    }

    pub fn fallback_input_token_limit(&self) -> u32 {
        self.fallback_input_token_limit
    }

    /// All model ids known to the registry, for reporting and for
    /// `GET /v1/models` fallback listings.
    pub fn model_ids(&self) -> impl Iterator<Item = &str> {
        self.limits.keys().map(String::as_str)
    }

    /// Normalize a client-supplied model id: lowercase, trim known vendor
    /// prefixes.
    pub fn normalize_model_id(raw: &str) -> String {
        let lower = raw.trim().to_lowercase();
        lower
            .strip_prefix("models/")
            .map(str::to_string)
            .unwrap_or(lower)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_resolves() {
        let registry = ModelLimitsRegistry::new(HashMap::new(), 32_000);
        let limit = registry.lookup("gemini-1.5-flash").expect("should exist");
        assert_eq!(limit.rpm, 1_000);
    }

    #[test]
    fn unknown_model_is_missing_not_error() {
        let registry = ModelLimitsRegistry::new(HashMap::new(), 32_000);
        assert!(registry.lookup("totally-unknown-model").is_none());
        assert_eq!(registry.fallback_input_token_limit(), 32_000);
    }

    #[test]
    fn normalize_strips_prefix_and_case() {
        assert_eq!(
            ModelLimitsRegistry::normalize_model_id("Models/Gemini-1.5-Pro"),
            "gemini-1.5-pro"
        );
    }

    #[test]
    fn override_replaces_builtin() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "gemini-1.5-flash".to_string(),
            ModelLimit {
                rpm: 1,
                rpd: 1,
                tpm_input: 1,
                tpd_input: 1,
                input_token_limit: 1,
                output_token_limit: 1,
            },
        );
        let registry = ModelLimitsRegistry::new(overrides, 32_000);
        assert_eq!(registry.lookup("gemini-1.5-flash").unwrap().rpm, 1);
    }
}
