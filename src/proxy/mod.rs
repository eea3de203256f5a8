//! HTTP surface: axum router, shared state, and route handlers.

pub mod routes;
pub mod server;
pub mod state;

pub use server::start_proxy;
pub use state::AppState;
