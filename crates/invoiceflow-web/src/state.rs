//! Shared application state for the web server.
//!
//! [`AppState`] is wrapped in an `Arc` and shared across all request
//! handlers. The executor and gateway are cheap handles onto the same
//! stores, so cloning them per request is fine.

use std::time::Instant;

use invoiceflow_engine::{Executor, HitlGateway};

use crate::WebConfig;

/// Shared state accessible from every Axum handler.
#[derive(Clone)]
pub struct AppState {
    /// Drives and inspects workflow instances.
    pub executor: Executor,

    /// Review queue access and verdict handling.
    pub hitl: HitlGateway,

    /// Web server configuration.
    pub config: WebConfig,

    /// When the server started, for uptime reporting.
    pub started_at: Instant,
}

impl AppState {
    pub fn new(executor: Executor, config: WebConfig) -> Self {
        Self {
            hitl: HitlGateway::new(executor.clone()),
            executor,
            config,
            started_at: Instant::now(),
        }
    }
}
