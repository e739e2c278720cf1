//! Workflow instances and the documents they carry.
//!
//! A [`WorkflowInstance`] is serialized whole into every checkpoint, so the
//! latest checkpoint alone is enough to resume it. Stage outputs accumulate
//! in [`WorkflowInstance::context`] and are never overwritten.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use invoiceflow_store::{InstanceStatus, Verdict};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result, StageError};
use crate::stage::{Stage, Transition};

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Scheduling priority of an instance. Lower value = more urgent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
}

impl Priority {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            i64::MIN..=0 => Self::Critical,
            1 => Self::High,
            2 => Self::Normal,
            _ => Self::Low,
        }
    }
}

/// One invoice or purchase-order line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    #[serde(default = "one")]
    pub quantity: Decimal,
    #[serde(default)]
    pub unit_price: Decimal,
    pub amount: Decimal,
}

fn one() -> Decimal {
    Decimal::ONE
}

impl LineItem {
    pub fn new(description: impl Into<String>, quantity: Decimal, unit_price: Decimal) -> Self {
        Self {
            description: description.into(),
            quantity,
            unit_price,
            amount: quantity * unit_price,
        }
    }
}

/// A submitted invoice, either fully structured or a reference to a file
/// that still needs extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceDocument {
    pub invoice_id: String,
    pub vendor_name: String,
    #[serde(default)]
    pub vendor_tax_id: Option<String>,
    pub amount: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub po_number: Option<String>,
    #[serde(default)]
    pub invoice_date: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub subtotal: Option<Decimal>,
    #[serde(default)]
    pub tax_amount: Option<Decimal>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    /// File references (paths or URIs) for documents that need extraction.
    #[serde(default)]
    pub attachments: Vec<String>,
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// A stage's contribution to the context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub output: serde_json::Value,
    pub transition: Transition,
    pub completed_at: DateTime<Utc>,
}

/// A human verdict waiting to be consumed by `HITL_DECISION`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictRecord {
    pub review_id: String,
    pub verdict: Verdict,
    pub rationale: String,
    pub reviewer: String,
}

/// Why an instance ended up FAILED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub stage: Stage,
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: String,
    /// Next stage to execute, or the stage the instance ended in.
    pub stage: Stage,
    pub status: InstanceStatus,
    pub priority: Priority,
    pub document: InvoiceDocument,
    /// Stage name → recorded output.
    pub context: BTreeMap<String, StageRecord>,
    /// Stage name → retries spent on its external calls.
    pub retries: BTreeMap<String, u32>,
    #[serde(default)]
    pub pending_verdict: Option<VerdictRecord>,
    #[serde(default)]
    pub failure: Option<Failure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// A fresh instance at `INTAKE`, status RUNNING.
    pub fn new(document: InvoiceDocument, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            stage: Stage::Intake,
            status: InstanceStatus::Running,
            priority,
            document,
            context: BTreeMap::new(),
            retries: BTreeMap::new(),
            pending_verdict: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn record(&self, stage: Stage) -> Option<&StageRecord> {
        self.context.get(stage.as_str())
    }

    pub fn has_output(&self, stage: Stage) -> bool {
        self.context.contains_key(stage.as_str())
    }

    /// Decode a recorded output, or fail the stage that depends on it.
    pub fn output<T: DeserializeOwned>(&self, stage: Stage) -> std::result::Result<T, StageError> {
        let record = self.record(stage).ok_or_else(|| {
            StageError::validation(format!("context has no output from {stage}"))
        })?;
        Ok(serde_json::from_value(record.output.clone())?)
    }

    /// Append a stage output. Recorded outputs are never replaced.
    pub fn append(
        &mut self,
        stage: Stage,
        output: serde_json::Value,
        transition: Transition,
    ) -> Result<()> {
        if self.has_output(stage) {
            return Err(EngineError::conflict(
                &self.id,
                format!("{stage} already has a recorded output"),
            ));
        }
        self.context.insert(
            stage.as_str().to_string(),
            StageRecord {
                output,
                transition,
                completed_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Move the instance along `transition`.
    pub fn apply(&mut self, transition: &Transition) {
        match transition {
            Transition::Next { stage } => {
                self.stage = *stage;
            }
            Transition::Suspend { stage } => {
                self.stage = *stage;
                self.status = InstanceStatus::Paused;
            }
            Transition::Finish => {
                self.status = InstanceStatus::Completed;
            }
            Transition::Fail { reason } => {
                self.fail(self.stage, "REJECTED", reason.clone());
            }
        }
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, stage: Stage, kind: &str, message: String) {
        self.status = InstanceStatus::Failed;
        self.failure = Some(Failure {
            stage,
            kind: kind.to_string(),
            message,
            at: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    pub fn add_retries(&mut self, stage: Stage, retries: u32) {
        if retries > 0 {
            *self.retries.entry(stage.as_str().to_string()).or_insert(0) += retries;
        }
    }

    /// Stages with a recorded output, in the order they completed.
    pub fn completed_stages(&self) -> Vec<Stage> {
        let mut done: Vec<(DateTime<Utc>, Stage)> = self
            .context
            .iter()
            .filter_map(|(name, record)| Stage::parse(name).map(|s| (record.completed_at, s)))
            .collect();
        done.sort();
        done.into_iter().map(|(_, stage)| stage).collect()
    }
}

impl fmt::Display for WorkflowInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{} @ {}]", self.id, self.status, self.stage)
    }
}
