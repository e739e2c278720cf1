//! Durable invoice workflow engine for InvoiceFlow.
//!
//! This crate provides:
//!
//! - **Stage graph**: the fixed twelve-node pipeline and its permitted
//!   transitions, in [`stage`].
//! - **Executor**: checkpointed, crash-recoverable execution of instances
//!   via [`executor::Executor`].
//! - **Two-way matching**: invoice lines against purchase-order lines with
//!   tolerance and tax/fee explanation, in [`matching`].
//! - **Human review**: suspension, first-writer-wins verdicts and resume
//!   via [`hitl::HitlGateway`].
//!
//! External effects go through two collaborator traits the host supplies:
//! [`oracle::DecisionOracle`] for judgments and [`tools::ToolInvoker`] for
//! side-effecting tools.

pub mod calls;
pub mod config;
pub mod error;
pub mod executor;
pub mod hitl;
pub mod instance;
pub mod matching;
pub mod oracle;
pub mod stage;
pub mod stages;
pub mod tools;

pub use config::{EngineConfig, MatchingPolicy, RetryPolicy, ToolPools, VendorOverride};
pub use error::{EngineError, Result, StageError};
pub use executor::{Executor, Recovery, RunOutcome, Stores};
pub use hitl::{HitlGateway, Resolution};
pub use instance::{InvoiceDocument, LineItem, Priority, WorkflowInstance};
pub use invoiceflow_store::{InstanceStatus, Verdict};
pub use matching::{Discrepancy, MatchResult};
pub use oracle::{DecisionKind, DecisionOracle, DecisionRequest, Judgment, OracleError};
pub use stage::{Stage, Transition};
pub use tools::{ToolError, ToolInvoker};
