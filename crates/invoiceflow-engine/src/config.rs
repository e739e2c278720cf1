//! Engine configuration.
//!
//! Everything the executor treats as policy rather than topology lives
//! here: the match threshold, tolerable-variance patterns, call deadlines,
//! retry budgets and the external tool pools. Loaded from TOML; every field
//! has a default so an empty file is a valid configuration.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::stage::Stage;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Bounded retry with exponential backoff for one external call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts per call (0 = no retries).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff_ms: u64,
    /// Multiplier applied to the delay after each retry.
    pub backoff_factor: f64,
    /// Upper bound on any single delay.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 200,
            backoff_factor: 2.0,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = (self.initial_backoff_ms as f64) * self.backoff_factor.powi(exponent);
        let capped = millis.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

// ---------------------------------------------------------------------------
// Tool pools
// ---------------------------------------------------------------------------

/// Interchangeable providers per capability. The first entry is the default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPools {
    pub ocr: Vec<String>,
    pub enrichment: Vec<String>,
    pub erp: Vec<String>,
    pub email: Vec<String>,
}

impl Default for ToolPools {
    fn default() -> Self {
        let pool = |names: &[&str]| names.iter().map(|s| s.to_string()).collect();
        Self {
            ocr: pool(&["gpt-4o", "tesseract", "aws_textract"]),
            enrichment: pool(&["clearbit", "people_data_labs", "vendor_db"]),
            erp: pool(&["sap_sandbox", "netsuite", "mock_erp"]),
            email: pool(&["sendgrid", "smartlead", "ses"]),
        }
    }
}

// ---------------------------------------------------------------------------
// Matching policy
// ---------------------------------------------------------------------------

/// What counts as a match and what counts as an explainable variance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingPolicy {
    /// Absolute difference treated as an exact match (rounding noise).
    pub tolerance: Decimal,
    /// Additive tax rates, as fractions (0.10 = 10%).
    pub tax_rates: Vec<Decimal>,
    /// Known fixed fees that may be added on top of a PO amount.
    pub fixed_fees: Vec<Decimal>,
}

impl Default for MatchingPolicy {
    fn default() -> Self {
        Self {
            tolerance: Decimal::new(1, 2),
            tax_rates: vec![
                Decimal::new(5, 2),
                Decimal::new(8, 2),
                Decimal::new(10, 2),
                Decimal::new(18, 2),
                Decimal::new(20, 2),
            ],
            fixed_fees: Vec::new(),
        }
    }
}

/// Per-vendor adjustments keyed by normalised vendor name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VendorOverride {
    pub match_threshold: Option<f64>,
    pub tax_rates: Option<Vec<Decimal>>,
    pub fixed_fees: Option<Vec<Decimal>>,
}

// ---------------------------------------------------------------------------
// Engine configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum match score for automatic approval.
    pub match_threshold: f64,
    /// Deadline for a single oracle or tool call.
    pub call_timeout_ms: u64,
    /// How long a verdict hand-over waits for a run that still owns the
    /// instance to let go of it.
    pub claim_wait_ms: u64,
    /// Retry policy applied to every external call.
    pub retry: RetryPolicy,
    /// Per-stage retry overrides keyed by stage name (e.g. `"POSTING"`).
    pub stage_retry: BTreeMap<String, RetryPolicy>,
    pub tools: ToolPools,
    pub matching: MatchingPolicy,
    pub vendors: BTreeMap<String, VendorOverride>,
    /// Invoices above this amount are extracted at high priority.
    pub high_priority_amount: Decimal,
    /// Credit limit assumed when enrichment does not report one.
    pub default_credit_limit: Decimal,
    /// Enrichment risk score above which a vendor is flagged.
    pub risk_score_limit: f64,
    /// Channel that receives finance notifications.
    pub finance_channel: String,
    /// Base URL of the review dashboard; the instance id is appended.
    pub review_url_base: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.9,
            call_timeout_ms: 30_000,
            claim_wait_ms: 5_000,
            retry: RetryPolicy::default(),
            stage_retry: BTreeMap::new(),
            tools: ToolPools::default(),
            matching: MatchingPolicy::default(),
            vendors: BTreeMap::new(),
            high_priority_amount: Decimal::from(5_000),
            default_credit_limit: Decimal::from(10_000),
            risk_score_limit: 75.0,
            finance_channel: "#finance-ap".into(),
            review_url_base: "http://localhost:8080/reviews".into(),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| EngineError::Config(format!("failed to parse TOML config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "engine config file does not exist, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("failed to read config file: {e}")))?;
        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), "engine configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let threshold_ok = |t: f64| (0.0..=1.0).contains(&t);
        if !threshold_ok(self.match_threshold) {
            return Err(EngineError::Config(format!(
                "match_threshold must be within [0, 1], got {}",
                self.match_threshold
            )));
        }
        for (vendor, ov) in &self.vendors {
            if let Some(t) = ov.match_threshold {
                if !threshold_ok(t) {
                    return Err(EngineError::Config(format!(
                        "match_threshold for vendor `{vendor}` must be within [0, 1], got {t}"
                    )));
                }
            }
        }
        for name in self.stage_retry.keys() {
            if Stage::parse(name).is_none() {
                return Err(EngineError::Config(format!(
                    "stage_retry refers to unknown stage `{name}`"
                )));
            }
        }
        if self.call_timeout_ms == 0 {
            return Err(EngineError::Config("call_timeout_ms must be positive".into()));
        }
        for (name, pool) in [
            ("ocr", &self.tools.ocr),
            ("enrichment", &self.tools.enrichment),
            ("erp", &self.tools.erp),
            ("email", &self.tools.email),
        ] {
            if pool.is_empty() {
                return Err(EngineError::Config(format!("tool pool `{name}` is empty")));
            }
        }
        if self.matching.tolerance < Decimal::ZERO {
            return Err(EngineError::Config("matching tolerance must not be negative".into()));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn claim_wait(&self) -> Duration {
        Duration::from_millis(self.claim_wait_ms)
    }

    pub fn retry_for(&self, stage: Stage) -> &RetryPolicy {
        self.stage_retry.get(stage.as_str()).unwrap_or(&self.retry)
    }

    /// Threshold for `vendor` (normalised name), falling back to the global one.
    pub fn threshold_for(&self, vendor: &str) -> f64 {
        self.vendors
            .get(vendor)
            .and_then(|ov| ov.match_threshold)
            .unwrap_or(self.match_threshold)
    }

    /// Matching policy for `vendor` with any overrides applied.
    pub fn matching_for(&self, vendor: &str) -> MatchingPolicy {
        let mut policy = self.matching.clone();
        if let Some(ov) = self.vendors.get(vendor) {
            if let Some(rates) = &ov.tax_rates {
                policy.tax_rates = rates.clone();
            }
            if let Some(fees) = &ov.fixed_fees {
                policy.fixed_fees = fees.clone();
            }
        }
        policy
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!((config.match_threshold - 0.9).abs() < f64::EPSILON);
        assert_eq!(config.tools.ocr[0], "gpt-4o");
    }

    #[test]
    fn vendor_overrides_apply() {
        let config = EngineConfig::from_toml_str(
            r#"
            match_threshold = 0.95

            [matching]
            tax_rates = [0.1]

            [vendors."ACME CORP"]
            match_threshold = 0.8
            tax_rates = [0.07]
            "#,
        )
        .unwrap();

        assert!((config.threshold_for("ACME CORP") - 0.8).abs() < f64::EPSILON);
        assert!((config.threshold_for("OTHER") - 0.95).abs() < f64::EPSILON);
        assert_eq!(config.matching_for("ACME CORP").tax_rates, vec![Decimal::new(7, 2)]);
        assert_eq!(config.matching_for("OTHER").tax_rates, vec![Decimal::new(1, 1)]);
    }

    #[test]
    fn stage_retry_override() {
        let config = EngineConfig::from_toml_str(
            r#"
            [stage_retry.POSTING]
            max_retries = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.retry_for(Stage::Posting).max_retries, 5);
        assert_eq!(config.retry_for(Stage::Retrieve).max_retries, 2);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(EngineConfig::from_toml_str("match_threshold = 1.5").is_err());
        assert!(EngineConfig::from_toml_str("[stage_retry.NOPE]\nmax_retries = 1").is_err());
        assert!(EngineConfig::from_toml_str("[tools]\nocr = []").is_err());
        assert!(EngineConfig::from_toml_str("call_timeout_ms = 0").is_err());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff_ms: 100,
            backoff_factor: 2.0,
            max_backoff_ms: 300,
        };
        assert_eq!(policy.max_attempts(), 6);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(policy.backoff(9), Duration::from_millis(300));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }
}
