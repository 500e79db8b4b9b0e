//! Runtime manager library
//!
//! Runs simulation systems as supervised container sessions and collects
//! their typed results.

use std::sync::Arc;

pub mod api;
pub mod config;
pub mod container;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod results;
pub mod session;
pub mod store;
pub mod sysdef;

/// Application state shared across all handlers
pub struct AppState {
    pub config: config::AppConfig,
    pub sessions: Arc<session::SessionManager>,
    pub catalog: Arc<sysdef::SystemCatalog>,
}
