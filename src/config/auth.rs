//! Caller authentication configuration.

use std::collections::HashSet;

use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Credentials accepted on `Authorization: Bearer <credential>`.
    pub credentials: HashSet<String>,
    /// Credential granted admin-only endpoints (key management).
    pub admin_credential: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credentials: HashSet::new(),
            admin_credential: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileAuthConfig {
    pub credentials: Option<Vec<String>>,
    pub admin_credential: Option<String>,
}

impl AuthConfig {
    pub(crate) fn apply_file(mut self, file: FileAuthConfig) -> Self {
        if let Some(credentials) = file.credentials {
            self.credentials = credentials.into_iter().collect();
        }
        if let Some(admin) = file.admin_credential {
            self.admin_credential = Some(admin);
        }
        self
    }

    pub(crate) fn apply_env(mut self) -> Self {
        if let Ok(raw) = std::env::var("GATEKEEPER_CREDENTIALS") {
            self.credentials = raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        if let Ok(admin) = std::env::var("GATEKEEPER_ADMIN_CREDENTIAL") {
            self.admin_credential = Some(admin);
        }
        self
    }
}
