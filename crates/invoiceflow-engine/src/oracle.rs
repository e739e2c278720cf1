//! Decision oracle interface.
//!
//! The oracle makes the semantic judgments the pipeline cannot compute:
//! which extraction tool suits a document, which PO line an invoice line
//! refers to. The engine treats it as a request/response function and
//! records each judgment verbatim in the audit trail.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What the oracle is being asked to decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// Pick one tool from a capability pool.
    SelectTool,
    /// Pick the PO line an invoice line corresponds to, or none.
    PairLineItem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub kind: DecisionKind,
    /// The thing being decided about (file name, invoice line description).
    pub subject: String,
    /// Choices, addressed by index in [`Judgment::choice`].
    pub options: Vec<String>,
    /// Extra facts the oracle may use.
    #[serde(default)]
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    /// Index into [`DecisionRequest::options`], or `None` for "none fit".
    pub choice: Option<usize>,
    pub rationale: String,
}

/// Reasons an oracle call did not produce a judgment. All of them are
/// retried by the engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
    #[error("oracle returned an unusable answer: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn decide(&self, request: &DecisionRequest) -> Result<Judgment, OracleError>;
}
