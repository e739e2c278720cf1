//! Local collaborators for running the pipeline on one machine.
//!
//! [`LocalTools`] answers the tool calls the pipeline makes with a small
//! built-in vendor directory plus optional purchase-order fixtures, and
//! [`HeuristicOracle`] makes the two judgments the pipeline asks for with
//! plain rules instead of a model.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use invoiceflow_engine::stages::{EntryKind, LedgerEntry, PurchaseOrder, normalize_vendor};
use invoiceflow_engine::tools::names;
use invoiceflow_engine::{
    DecisionKind, DecisionOracle, DecisionRequest, Judgment, LineItem, OracleError, ToolError,
    ToolInvoker,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

// ═══════════════════════════════════════════════════════════════════════
//  Fixtures
// ═══════════════════════════════════════════════════════════════════════

/// Contents of the `fixtures` JSON file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Fixtures {
    /// Vendor records keyed by normalised name.
    pub vendors: HashMap<String, Value>,
    pub purchase_orders: Vec<PurchaseOrder>,
}

impl Fixtures {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fixtures {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse fixtures {}", path.display()))
    }
}

fn builtin_vendors() -> HashMap<String, Value> {
    HashMap::from([
        (
            "ACME CORP".to_string(),
            json!({
                "tax_id": "US-99887766",
                "address": "123 Coyote Way, NV",
                "credit_score": 750,
                "risk_score": 10,
                "credit_limit": 50000,
                "email": "finance@acmecorp.com",
            }),
        ),
        (
            "SHADY SHELL CO".to_string(),
            json!({
                "tax_id": null,
                "address": "Unknown",
                "credit_score": 300,
                "risk_score": 90,
                "credit_limit": 1000,
                "email": "admin@shadyshell.com",
            }),
        ),
        (
            "BRIGHTTECH SOLUTIONS".to_string(),
            json!({
                "tax_id": "US-BTS-2024-X",
                "address": "404 Cloud Blvd, Server City, CA",
                "credit_score": 820,
                "risk_score": 5,
                "credit_limit": 100000,
                "email": "billing@brighttech.solutions",
            }),
        ),
    ])
}

// ═══════════════════════════════════════════════════════════════════════
//  Tools
// ═══════════════════════════════════════════════════════════════════════

/// In-process tool invoker backed by fixtures.
pub struct LocalTools {
    vendors: HashMap<String, Value>,
    purchase_orders: Vec<PurchaseOrder>,
    /// Responses of accepted postings, keyed by idempotency key.
    postings: Mutex<HashMap<String, Value>>,
}

impl LocalTools {
    pub fn new(fixtures: Fixtures) -> Self {
        let mut vendors = builtin_vendors();
        vendors.extend(fixtures.vendors);
        Self {
            vendors,
            purchase_orders: fixtures.purchase_orders,
            postings: Mutex::new(HashMap::new()),
        }
    }

    fn enrich_vendor(&self, args: &Value) -> Value {
        let name = args
            .get("normalized_name")
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN");
        let key = name.trim().to_uppercase();
        let mut data = match self.vendors.get(&key) {
            Some(data) => data.clone(),
            None => {
                warn!(vendor = %key, "vendor not in directory, using fallback profile");
                json!({
                    "tax_id": null,
                    "address": "Unknown Address",
                    "risk_score": 50,
                    "credit_limit": 5000,
                    "email": null,
                })
            }
        };
        if let Some(map) = data.as_object_mut() {
            map.insert("name".into(), Value::String(name.to_string()));
        }
        json!({
            "status": "success",
            "vendor_data": data,
            "source_used": args.get("source").cloned().unwrap_or(Value::Null),
        })
    }

    fn fetch_erp_data(&self, args: &Value) -> Value {
        let po_number = args.get("po_number").and_then(Value::as_str);
        let vendor = args.get("vendor_name").and_then(Value::as_str);
        let matches: Vec<&PurchaseOrder> = self
            .purchase_orders
            .iter()
            .filter(|po| match po_number {
                Some(number) => po.po_number == number,
                None => match (vendor, po.vendor_name.as_deref()) {
                    (Some(wanted), Some(have)) => {
                        normalize_vendor(have).is_ok_and(|have| have == wanted)
                    }
                    _ => false,
                },
            })
            .collect();
        debug!(?po_number, found = matches.len(), "purchase orders fetched");
        json!({
            "purchase_orders": matches,
            "goods_receipts": [],
            "invoice_history": [],
        })
    }

    fn post_to_erp(&self, args: &Value) -> Result<Value, ToolError> {
        let key = args
            .get("idempotency_key")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::Rejected("idempotency_key is required".into()))?
            .to_string();
        let entries: Vec<LedgerEntry> =
            serde_json::from_value(args.get("entries").cloned().unwrap_or(Value::Null))
                .map_err(|e| ToolError::Rejected(format!("malformed entries: {e}")))?;

        let total = |kind: EntryKind| -> Decimal {
            entries
                .iter()
                .filter(|e| e.kind == kind)
                .map(|e| e.amount)
                .sum()
        };
        let (debits, credits) = (total(EntryKind::Debit), total(EntryKind::Credit));
        if debits != credits {
            return Err(ToolError::Rejected(format!(
                "unbalanced journal: debits {debits} != credits {credits}"
            )));
        }

        let mut postings = self
            .postings
            .lock()
            .map_err(|_| ToolError::Transient("posting ledger lock poisoned".into()))?;
        if let Some(previous) = postings.get(&key) {
            info!(%key, "duplicate posting suppressed");
            return Ok(previous.clone());
        }
        let response = json!({
            "status": "POSTED",
            "erp_document_id": format!("TXN-{:05}", postings.len() + 1),
            "erp_system": args.get("erp_system").cloned().unwrap_or(Value::Null),
            "lines": entries.len(),
            "total": debits,
        });
        postings.insert(key, response.clone());
        Ok(response)
    }
}

#[async_trait]
impl ToolInvoker for LocalTools {
    async fn invoke(&self, tool: &str, args: Value) -> Result<Value, ToolError> {
        debug!(tool, "local tool call");
        match tool {
            names::ACCEPT_INVOICE_PAYLOAD => {
                let invoice_id = args
                    .pointer("/invoice/invoice_id")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                Ok(json!({ "status": "accepted", "raw_id": format!("raw-{invoice_id}") }))
            }
            names::OCR_EXTRACT => {
                let file = args
                    .get("file")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ToolError::Rejected("file is required".into()))?;
                let text = tokio::fs::read_to_string(file).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        ToolError::Rejected(format!("no such document: {file}"))
                    } else {
                        ToolError::Transient(format!("reading {file}: {e}"))
                    }
                })?;
                Ok(json!({ "text": text, "engine": args.get("engine") }))
            }
            names::PARSE_LINE_ITEMS => {
                let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
                Ok(json!({ "parsed_data": parse_invoice_text(text) }))
            }
            names::ENRICH_VENDOR => Ok(self.enrich_vendor(&args)),
            names::FETCH_ERP_DATA => Ok(self.fetch_erp_data(&args)),
            names::ACCEPT_OR_REJECT_INVOICE => Ok(json!({
                "status": "success",
                "audit_id": format!(
                    "AUDIT-{}",
                    args.get("review_id").and_then(Value::as_str).unwrap_or("none")
                ),
                "decision": args.get("decision"),
            })),
            names::POST_TO_ERP => self.post_to_erp(&args),
            names::SCHEDULE_PAYMENT => Ok(json!({
                "status": "SCHEDULED",
                "payment_id": format!(
                    "PAY-{}",
                    args.get("invoice_id").and_then(Value::as_str).unwrap_or("none")
                ),
                "due_date": args.get("due_date"),
            })),
            names::SEND_NOTIFICATION => {
                info!(
                    channel = args.get("channel").and_then(serde_json::Value::as_str).unwrap_or("?"),
                    recipient = args.get("recipient").and_then(serde_json::Value::as_str).unwrap_or("?"),
                    "notification sent"
                );
                Ok(json!({ "sent": true }))
            }
            names::OUTPUT_FINAL_PAYLOAD => Ok(json!({ "delivered": true })),
            other => Err(ToolError::Rejected(format!("unknown tool: {other}"))),
        }
    }
}

/// Parse plain invoice text.
///
/// Header lines start with a keyword (`INVOICE`, `PO`, `VENDOR`,
/// `CURRENCY`, `DATE`, `DUE`, `SUBTOTAL`, `TAX`, `TOTAL`), optionally
/// followed by a colon. Any other line ending in an amount is a line item.
pub fn parse_invoice_text(text: &str) -> Value {
    let mut header = serde_json::Map::new();
    let mut lines: Vec<LineItem> = Vec::new();

    for raw in text.lines() {
        let line = raw.trim();
        let Some((first, rest)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let keyword = first.trim_end_matches(':').to_uppercase();
        let rest = rest.trim().trim_start_matches(':').trim();

        let field = match keyword.as_str() {
            "INVOICE" => Some(("invoice_id", false)),
            "PO" => Some(("po_number", false)),
            "VENDOR" => Some(("vendor_name", false)),
            "CURRENCY" => Some(("currency", false)),
            "DATE" => Some(("invoice_date", false)),
            "DUE" => Some(("due_date", false)),
            "SUBTOTAL" => Some(("subtotal", true)),
            "TAX" => Some(("tax_amount", true)),
            "TOTAL" => Some(("total_amount", true)),
            _ => None,
        };
        match field {
            Some((name, true)) => {
                if let Some(amount) = parse_amount(rest) {
                    header.insert(name.into(), json!(amount));
                }
            }
            Some((name, false)) if !rest.is_empty() => {
                header.insert(name.into(), Value::String(rest.to_string()));
            }
            Some(_) => {}
            None => {
                if let Some((description, amount)) = line.rsplit_once(char::is_whitespace)
                    && let Some(amount) = parse_amount(amount)
                {
                    lines.push(LineItem {
                        description: description.trim().to_string(),
                        quantity: Decimal::ONE,
                        unit_price: amount,
                        amount,
                    });
                }
            }
        }
    }

    header.insert("line_items".into(), json!(lines));
    Value::Object(header)
}

fn parse_amount(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

// ═══════════════════════════════════════════════════════════════════════
//  Oracle
// ═══════════════════════════════════════════════════════════════════════

/// Rule-based decision oracle.
#[derive(Debug, Default)]
pub struct HeuristicOracle;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tif", "tiff"];

/// Minimum token overlap for two descriptions to be paired.
const PAIRING_THRESHOLD: f64 = 0.5;

#[async_trait]
impl DecisionOracle for HeuristicOracle {
    async fn decide(&self, request: &DecisionRequest) -> Result<Judgment, OracleError> {
        if request.options.is_empty() {
            return Ok(Judgment {
                choice: None,
                rationale: "no options offered".into(),
            });
        }
        Ok(match request.kind {
            DecisionKind::SelectTool => select_tool(request),
            DecisionKind::PairLineItem => pair_line(request),
        })
    }
}

fn select_tool(request: &DecisionRequest) -> Judgment {
    let context = |key: &str| {
        request
            .context
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase()
    };
    if context("priority") == "high" {
        return Judgment {
            choice: Some(0),
            rationale: format!("high priority document; using {}", request.options[0]),
        };
    }
    let extension = context("extension");
    if IMAGE_EXTENSIONS.contains(&extension.as_str())
        && let Some(index) = request
            .options
            .iter()
            .position(|o| o.eq_ignore_ascii_case("tesseract"))
    {
        return Judgment {
            choice: Some(index),
            rationale: format!("{extension} image; local OCR is sufficient"),
        };
    }
    Judgment {
        choice: Some(0),
        rationale: format!("default extraction for .{extension} documents"),
    }
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn pair_line(request: &DecisionRequest) -> Judgment {
    let subject = tokens(&request.subject);
    let best = request
        .options
        .iter()
        .enumerate()
        .map(|(index, option)| {
            let option = tokens(option);
            let union = subject.union(&option).count();
            let score = if union == 0 {
                0.0
            } else {
                subject.intersection(&option).count() as f64 / union as f64
            };
            (index, score)
        })
        .max_by(|a, b| a.1.total_cmp(&b.1));

    match best {
        Some((index, score)) if score >= PAIRING_THRESHOLD => Judgment {
            choice: Some(index),
            rationale: format!(
                "'{}' shares {:.0}% of its terms with '{}'",
                request.subject,
                score * 100.0,
                request.options[index]
            ),
        },
        _ => Judgment {
            choice: None,
            rationale: format!("no PO line resembles '{}'", request.subject),
        },
    }
}
