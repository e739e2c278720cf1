//! HTTP interface for InvoiceFlow.
//!
//! This crate exposes the workflow engine over a small JSON API:
//!
//! - Invoice submission and instance inspection (state, checkpoints, audit).
//! - The human review queue: list OPEN reviews, post a verdict.
//! - A health endpoint with store and cache figures.

pub mod api;
pub mod error;
pub mod server;
pub mod state;

pub use error::ApiError;
pub use server::{WebServer, router};
pub use state::AppState;

use serde::{Deserialize, Serialize};

/// Web server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// The address to bind the HTTP server to.
    pub bind_addr: String,
    /// The port to listen on.
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".into(),
            port: 8080,
        }
    }
}
