//! Upstream safety-filtering configuration.

use serde::Deserialize;

#[derive(Debug, Clone, Default)]
pub struct SafetyConfig {
    pub disable_safety_filtering: bool,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileSafetyConfig {
    pub disable_safety_filtering: Option<bool>,
}

impl SafetyConfig {
    pub(crate) fn apply_file(mut self, file: FileSafetyConfig) -> Self {
        if let Some(v) = file.disable_safety_filtering {
            self.disable_safety_filtering = v;
        }
        self
    }
}
