//! Tool invoker interface.
//!
//! Tools are the side-effecting half of the outside world: extraction, ERP
//! reads and writes, notifications. Every call carries an
//! `idempotency_key` argument so a replayed call can be deduplicated by
//! the receiving system.

use async_trait::async_trait;
use serde_json::Value;

/// Tool names used by the pipeline.
pub mod names {
    pub const ACCEPT_INVOICE_PAYLOAD: &str = "accept_invoice_payload";
    pub const OCR_EXTRACT: &str = "ocr_extract";
    pub const PARSE_LINE_ITEMS: &str = "parse_line_items";
    pub const ENRICH_VENDOR: &str = "enrich_vendor";
    pub const FETCH_ERP_DATA: &str = "fetch_erp_data";
    pub const ACCEPT_OR_REJECT_INVOICE: &str = "accept_or_reject_invoice";
    pub const POST_TO_ERP: &str = "post_to_erp";
    pub const SCHEDULE_PAYMENT: &str = "schedule_payment";
    pub const SEND_NOTIFICATION: &str = "send_notification";
    pub const OUTPUT_FINAL_PAYLOAD: &str = "output_final_payload";
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    /// Network trouble, throttling, a flaky backend. Worth retrying.
    #[error("transient tool failure: {0}")]
    Transient(String),
    /// The tool understood the request and refused it.
    #[error("tool rejected the request: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, tool: &str, args: Value) -> Result<Value, ToolError>;
}
