//! Shared axum state.

use std::sync::Arc;

use crate::dispatch::Dispatcher;

/// Cloned into every request handler. Cheap to clone — everything behind it
/// is already an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    /// Credential gating the admin key-management routes. `None` disables
    /// the admin surface entirely rather than accepting any credential.
    pub admin_credential: Option<String>,
}
