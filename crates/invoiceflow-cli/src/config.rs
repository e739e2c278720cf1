//! Application configuration.
//!
//! Resolution order: built-in defaults, then `invoiceflow.toml` (or the
//! `--config` path), then `.env`, then `INVOICEFLOW_*` environment
//! variables.
//!
//! ```toml
//! [store]
//! path = "data/invoiceflow.db"
//! synchronous = "full"
//!
//! [engine]
//! match_threshold = 0.9
//!
//! [engine.vendors."ACME CORP"]
//! match_threshold = 0.8
//!
//! [web]
//! port = 8080
//!
//! fixtures = "fixtures/erp.json"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use invoiceflow_engine::EngineConfig;
use invoiceflow_store::StoreConfig;
use invoiceflow_web::WebConfig;
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub engine: EngineConfig,
    pub web: WebConfig,
    /// JSON file with purchase orders and vendor records for the local
    /// tool fixtures.
    pub fixtures: Option<PathBuf>,
}

impl AppConfig {
    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config = Self::from_toml_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            info!(path = %path.display(), "configuration loaded");
            config
        } else {
            warn!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config
            .engine
            .validate()
            .context("invalid engine configuration")?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse TOML config")
    }

    /// Apply `INVOICEFLOW_*` overrides read through `lookup`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = lookup("INVOICEFLOW_DB_PATH") {
            self.store.path = PathBuf::from(path);
        }
        if let Some(bind) = lookup("INVOICEFLOW_BIND") {
            self.web.bind_addr = bind;
        }
        if let Some(port) = lookup("INVOICEFLOW_PORT") {
            self.web.port = port
                .parse()
                .with_context(|| format!("INVOICEFLOW_PORT is not a port number: {port}"))?;
        }
        if let Some(threshold) = lookup("INVOICEFLOW_MATCH_THRESHOLD") {
            self.engine.match_threshold = threshold.parse().with_context(|| {
                format!("INVOICEFLOW_MATCH_THRESHOLD is not a number: {threshold}")
            })?;
        }
        if let Some(fixtures) = lookup("INVOICEFLOW_FIXTURES") {
            self.fixtures = Some(PathBuf::from(fixtures));
        }
        Ok(())
    }
}
