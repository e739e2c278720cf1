//! Stage handlers.
//!
//! Each handler reads the instance (submission plus earlier outputs),
//! performs its external calls through [`StageCalls`] and returns an output
//! delta with a transition. Handlers never write to the instance; the
//! executor records what they return.

use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use invoiceflow_store::{NewReview, ReviewStore, Verdict};
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::calls::StageCalls;
use crate::config::EngineConfig;
use crate::error::StageError;
use crate::instance::{InvoiceDocument, LineItem, WorkflowInstance};
use crate::matching::{
    InvoiceSide, LinePairer, MatchResult, check_amount, checked_total, two_way_match,
};
use crate::oracle::{DecisionKind, DecisionRequest};
use crate::stage::{Stage, Transition};
use crate::tools::names;

pub const ACCOUNTS_PAYABLE: &str = "2000-AP-TRADE";
pub const GENERAL_EXPENSE: &str = "5000-GEN-EXP";
pub const TAX_PAYABLE: &str = "2200-TAX-PAYABLE";

pub const HUMAN_APPROVER: &str = "human_reviewer";
pub const POLICY_APPROVER: &str = "auto_approval_policy";

// ═══════════════════════════════════════════════════════════════════════
//  Stage outputs
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeOutput {
    pub raw_id: String,
    pub invoice_id: String,
    pub vendor_name: String,
    pub amount: Decimal,
    pub currency: String,
}

/// The invoice as the rest of the pipeline sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedInvoice {
    pub invoice_id: String,
    pub po_number: Option<String>,
    pub vendor_name: String,
    pub currency: String,
    pub total: Decimal,
    pub subtotal: Option<Decimal>,
    pub tax_amount: Option<Decimal>,
    pub line_items: Vec<LineItem>,
    pub invoice_date: Option<String>,
    pub due_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionChoice {
    pub tool: String,
    pub rationale: String,
    /// The oracle picked something outside the pool.
    pub fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnderstandOutput {
    pub invoice: ParsedInvoice,
    pub extraction: Option<ExtractionChoice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepareOutput {
    pub normalized_vendor: String,
    pub enrichment_source: String,
    pub vendor_profile: Value,
    pub flags: Vec<String>,
    pub risk_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseOrder {
    pub po_number: String,
    #[serde(default)]
    pub vendor_name: Option<String>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub total_amount: Option<Decimal>,
}

impl PurchaseOrder {
    /// Lines to match against; a PO with only a header total counts as one line.
    pub fn match_lines(&self) -> Vec<LineItem> {
        match (&self.line_items[..], self.total_amount) {
            ([], Some(total)) => vec![LineItem {
                description: format!("{} total", self.po_number),
                quantity: Decimal::ONE,
                unit_price: total,
                amount: total,
            }],
            (lines, _) => lines.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrieveOutput {
    pub connector: String,
    pub purchase_orders: Vec<PurchaseOrder>,
    pub goods_receipts: Vec<Value>,
    pub invoice_history: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Route {
    AutoApprove,
    HumanReview,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchOutput {
    pub po_number: Option<String>,
    pub result: MatchResult,
    pub threshold: f64,
    pub route: Route,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewOutput {
    pub review_id: String,
    pub reason: String,
    pub review_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutput {
    pub review_id: String,
    pub verdict: Verdict,
    pub rationale: String,
    pub reviewer: String,
    pub acknowledgement: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    Debit,
    Credit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub kind: EntryKind,
    pub account_code: String,
    pub account_name: String,
    pub amount: Decimal,
    pub currency: String,
    pub memo: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileOutput {
    pub entries: Vec<LedgerEntry>,
    pub total_debit: Decimal,
    pub total_credit: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApproveOutput {
    pub approver: String,
    pub basis: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostingOutput {
    pub connector: String,
    pub posting: Value,
    pub payment: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyOutput {
    pub notifications: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteOutput {
    pub summary: Value,
    pub receipt: Value,
}

// ═══════════════════════════════════════════════════════════════════════
//  Dispatch
// ═══════════════════════════════════════════════════════════════════════

/// Shared, read-only dependencies of the handlers.
pub struct StageEnv<'a> {
    pub config: &'a EngineConfig,
    pub reviews: &'a ReviewStore,
}

/// What a handler hands back to the executor.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub output: Value,
    pub transition: Transition,
}

impl StageOutcome {
    fn new<T: Serialize>(output: &T, transition: Transition) -> Result<Self, StageError> {
        Ok(Self {
            output: serde_json::to_value(output)?,
            transition,
        })
    }
}

pub async fn execute(
    stage: Stage,
    instance: &WorkflowInstance,
    env: &StageEnv<'_>,
    calls: &mut StageCalls<'_>,
) -> Result<StageOutcome, StageError> {
    match stage {
        Stage::Intake => intake(instance, calls).await,
        Stage::Understand => understand(instance, env, calls).await,
        Stage::Prepare => prepare(instance, env, calls).await,
        Stage::Retrieve => retrieve(instance, env, calls).await,
        Stage::Match => match_two_way(instance, env, calls).await,
        Stage::CheckpointHitl => checkpoint_hitl(instance, env).await,
        Stage::HitlDecision => hitl_decision(instance, calls).await,
        Stage::Reconcile => reconcile(instance),
        Stage::Approve => approve(instance),
        Stage::Posting => posting(instance, env, calls).await,
        Stage::Notify => notify(instance, env, calls).await,
        Stage::Complete => complete(instance, calls).await,
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Handlers
// ═══════════════════════════════════════════════════════════════════════

async fn intake(
    instance: &WorkflowInstance,
    calls: &mut StageCalls<'_>,
) -> Result<StageOutcome, StageError> {
    let doc = &instance.document;
    validate_submission(doc)?;

    let response = calls
        .tool(names::ACCEPT_INVOICE_PAYLOAD, json!({ "invoice": doc }))
        .await?;
    let raw_id = response
        .get("raw_id")
        .and_then(Value::as_str)
        .unwrap_or(&doc.invoice_id)
        .to_string();

    let output = IntakeOutput {
        raw_id,
        invoice_id: doc.invoice_id.clone(),
        vendor_name: doc.vendor_name.clone(),
        amount: doc.amount,
        currency: currency_of(doc),
    };
    StageOutcome::new(&output, Transition::next(Stage::Understand))
}

pub fn validate_submission(doc: &InvoiceDocument) -> Result<(), StageError> {
    if doc.invoice_id.trim().is_empty() {
        return Err(StageError::validation("invoice_id is required"));
    }
    if doc.vendor_name.trim().is_empty() {
        return Err(StageError::validation("vendor_name is required"));
    }
    if doc.amount < Decimal::ZERO {
        return Err(StageError::validation(format!(
            "amount must not be negative, got {}",
            doc.amount
        )));
    }
    if let Some(line) = doc.line_items.iter().find(|l| l.amount < Decimal::ZERO) {
        return Err(StageError::validation(format!(
            "line item `{}` has a negative amount",
            line.description
        )));
    }
    check_amount("amount", doc.amount)?;
    for (what, value) in [("subtotal", doc.subtotal), ("tax_amount", doc.tax_amount)] {
        if let Some(value) = value {
            check_amount(what, value)?;
        }
    }
    for line in &doc.line_items {
        let what = format!("line item `{}`", line.description);
        check_amount(&what, line.amount)?;
        check_amount(&what, line.unit_price)?;
        check_amount(&what, line.quantity)?;
    }
    Ok(())
}

fn currency_of(doc: &InvoiceDocument) -> String {
    doc.currency
        .as_deref()
        .filter(|c| !c.trim().is_empty())
        .unwrap_or("USD")
        .to_uppercase()
}

/// Fields an extraction tool may report; anything missing comes from the
/// submission.
#[derive(Debug, Default, Deserialize)]
struct Extracted {
    #[serde(default)]
    invoice_id: Option<String>,
    #[serde(default)]
    po_number: Option<String>,
    #[serde(default)]
    vendor_name: Option<String>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    total_amount: Option<Decimal>,
    #[serde(default)]
    subtotal: Option<Decimal>,
    #[serde(default)]
    tax_amount: Option<Decimal>,
    #[serde(default)]
    line_items: Vec<LineItem>,
    #[serde(default)]
    invoice_date: Option<String>,
    #[serde(default)]
    due_date: Option<String>,
}

async fn understand(
    instance: &WorkflowInstance,
    env: &StageEnv<'_>,
    calls: &mut StageCalls<'_>,
) -> Result<StageOutcome, StageError> {
    let doc = &instance.document;

    if !doc.line_items.is_empty() {
        let output = UnderstandOutput {
            invoice: ParsedInvoice {
                invoice_id: doc.invoice_id.clone(),
                po_number: doc.po_number.clone(),
                vendor_name: doc.vendor_name.clone(),
                currency: currency_of(doc),
                total: doc.amount,
                subtotal: doc.subtotal,
                tax_amount: doc.tax_amount,
                line_items: doc.line_items.clone(),
                invoice_date: doc.invoice_date.clone(),
                due_date: doc.due_date.clone(),
            },
            extraction: None,
        };
        return StageOutcome::new(&output, Transition::next(Stage::Prepare));
    }

    let pool = &env.config.tools.ocr;
    let default_tool = pool
        .first()
        .ok_or_else(|| StageError::validation("ocr tool pool is empty"))?;
    let file = doc
        .attachments
        .first()
        .cloned()
        .unwrap_or_else(|| format!("{}.pdf", doc.invoice_id));
    let extension = Path::new(&file)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase();
    let priority = if doc.amount > env.config.high_priority_amount {
        "High"
    } else {
        "Normal"
    };

    let judgment = calls
        .decide(DecisionRequest {
            kind: DecisionKind::SelectTool,
            subject: file.clone(),
            options: pool.clone(),
            context: json!({ "extension": extension, "priority": priority }),
        })
        .await?;

    let extraction = match judgment.choice.and_then(|i| pool.get(i)) {
        Some(tool) => ExtractionChoice {
            tool: tool.clone(),
            rationale: judgment.rationale,
            fallback: false,
        },
        None => ExtractionChoice {
            tool: default_tool.clone(),
            rationale: format!(
                "{} [selection outside the ocr pool; fell back to {default_tool}]",
                judgment.rationale
            ),
            fallback: true,
        },
    };

    let text = calls
        .tool(
            names::OCR_EXTRACT,
            json!({ "file": file, "engine": extraction.tool }),
        )
        .await?;
    let text = text.get("text").cloned().unwrap_or(text);
    let parsed = calls
        .tool(
            names::PARSE_LINE_ITEMS,
            json!({ "text": text, "invoice_id": doc.invoice_id }),
        )
        .await?;
    let parsed = parsed.get("parsed_data").cloned().unwrap_or(parsed);
    let extracted: Extracted = serde_json::from_value(parsed)?;

    let output = UnderstandOutput {
        invoice: ParsedInvoice {
            invoice_id: extracted.invoice_id.unwrap_or_else(|| doc.invoice_id.clone()),
            po_number: extracted.po_number.or_else(|| doc.po_number.clone()),
            vendor_name: extracted
                .vendor_name
                .unwrap_or_else(|| doc.vendor_name.clone()),
            currency: extracted
                .currency
                .map(|c| c.to_uppercase())
                .unwrap_or_else(|| currency_of(doc)),
            total: extracted.total_amount.unwrap_or(doc.amount),
            subtotal: extracted.subtotal.or(doc.subtotal),
            tax_amount: extracted.tax_amount.or(doc.tax_amount),
            line_items: extracted.line_items,
            invoice_date: extracted.invoice_date.or_else(|| doc.invoice_date.clone()),
            due_date: extracted.due_date.or_else(|| doc.due_date.clone()),
        },
        extraction: Some(extraction),
    };
    StageOutcome::new(&output, Transition::next(Stage::Prepare))
}

static LEGAL_SUFFIX: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"\b(INC|LTD|LLC|PVT|GMBH)\b"));

/// Uppercase, drop legal-form suffixes and punctuation, collapse spaces.
///
/// `"Acme Corp, Inc."` becomes `"ACME CORP"`.
pub fn normalize_vendor(raw: &str) -> Result<String, StageError> {
    let suffix = LEGAL_SUFFIX
        .as_ref()
        .map_err(|e| StageError::validation(format!("vendor suffix pattern: {e}")))?;
    let upper = raw.to_uppercase();
    let stripped = suffix.replace_all(&upper, " ");
    let cleaned: String = stripped
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();
    Ok(cleaned.split_whitespace().collect::<Vec<_>>().join(" "))
}

async fn prepare(
    instance: &WorkflowInstance,
    env: &StageEnv<'_>,
    calls: &mut StageCalls<'_>,
) -> Result<StageOutcome, StageError> {
    let understood: UnderstandOutput = instance.output(Stage::Understand)?;
    let invoice = &understood.invoice;
    let normalized = normalize_vendor(&invoice.vendor_name)?;
    let source = env
        .config
        .tools
        .enrichment
        .first()
        .cloned()
        .ok_or_else(|| StageError::validation("enrichment tool pool is empty"))?;

    let response = calls
        .tool(
            names::ENRICH_VENDOR,
            json!({ "normalized_name": normalized, "source": source }),
        )
        .await?;
    let profile = response.get("vendor_data").cloned().unwrap_or(response);

    let mut flags = Vec::new();
    let risk_score = profile
        .get("risk_score")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    if risk_score > env.config.risk_score_limit {
        flags.push("HIGH_RISK_VENDOR".to_string());
    }
    let has_tax_id = profile
        .get("tax_id")
        .and_then(Value::as_str)
        .is_some_and(|s| !s.trim().is_empty())
        || instance
            .document
            .vendor_tax_id
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty());
    if !has_tax_id {
        flags.push("MISSING_TAX_ID".to_string());
    }
    let credit_limit = profile
        .get("credit_limit")
        .and_then(|v| serde_json::from_value::<Decimal>(v.clone()).ok())
        .unwrap_or(env.config.default_credit_limit);
    if invoice.total > credit_limit {
        flags.push("EXCEEDS_CREDIT_LIMIT".to_string());
    }

    let output = PrepareOutput {
        risk_level: if flags.is_empty() { "LOW" } else { "HIGH" }.to_string(),
        normalized_vendor: normalized,
        enrichment_source: source,
        vendor_profile: profile,
        flags,
    };
    StageOutcome::new(&output, Transition::next(Stage::Retrieve))
}

#[derive(Debug, Deserialize)]
struct ErpResponse {
    #[serde(default)]
    purchase_orders: Vec<PurchaseOrder>,
    #[serde(default)]
    goods_receipts: Vec<Value>,
    #[serde(default)]
    invoice_history: Vec<Value>,
}

async fn retrieve(
    instance: &WorkflowInstance,
    env: &StageEnv<'_>,
    calls: &mut StageCalls<'_>,
) -> Result<StageOutcome, StageError> {
    let understood: UnderstandOutput = instance.output(Stage::Understand)?;
    let prepared: PrepareOutput = instance.output(Stage::Prepare)?;
    let connector = env
        .config
        .tools
        .erp
        .first()
        .cloned()
        .ok_or_else(|| StageError::validation("erp tool pool is empty"))?;

    let response = calls
        .tool(
            names::FETCH_ERP_DATA,
            json!({
                "vendor_name": prepared.normalized_vendor,
                "po_number": understood.invoice.po_number,
                "erp_system": connector,
            }),
        )
        .await?;
    let erp: ErpResponse = serde_json::from_value(response)?;

    let output = RetrieveOutput {
        connector,
        purchase_orders: erp.purchase_orders,
        goods_receipts: erp.goods_receipts,
        invoice_history: erp.invoice_history,
    };
    StageOutcome::new(&output, Transition::next(Stage::Match))
}

/// Line pairing delegated to the decision oracle.
struct OraclePairer<'c, 'a> {
    calls: &'c mut StageCalls<'a>,
    vendor: String,
}

#[async_trait]
impl LinePairer for OraclePairer<'_, '_> {
    async fn pair(
        &mut self,
        line: &LineItem,
        candidates: &[LineItem],
    ) -> Result<Option<usize>, StageError> {
        let judgment = self
            .calls
            .decide(DecisionRequest {
                kind: DecisionKind::PairLineItem,
                subject: line.description.clone(),
                options: candidates.iter().map(|c| c.description.clone()).collect(),
                context: json!({
                    "vendor": self.vendor,
                    "invoice_amount": line.amount,
                    "candidate_amounts": candidates.iter().map(|c| c.amount).collect::<Vec<_>>(),
                }),
            })
            .await?;
        Ok(judgment.choice)
    }
}

async fn match_two_way(
    instance: &WorkflowInstance,
    env: &StageEnv<'_>,
    calls: &mut StageCalls<'_>,
) -> Result<StageOutcome, StageError> {
    let understood: UnderstandOutput = instance.output(Stage::Understand)?;
    let prepared: PrepareOutput = instance.output(Stage::Prepare)?;
    let retrieved: RetrieveOutput = instance.output(Stage::Retrieve)?;
    let invoice = &understood.invoice;

    let target = retrieved
        .purchase_orders
        .iter()
        .find(|po| invoice.po_number.as_deref() == Some(po.po_number.as_str()))
        .or_else(|| retrieved.purchase_orders.first());
    let po_lines = target.map(PurchaseOrder::match_lines).unwrap_or_default();

    let vendor = prepared.normalized_vendor;
    let threshold = env.config.threshold_for(&vendor);
    let policy = env.config.matching_for(&vendor);

    let mut pairer = OraclePairer {
        calls,
        vendor: vendor.clone(),
    };
    let result = two_way_match(
        InvoiceSide {
            lines: &invoice.line_items,
            total: invoice.total,
            subtotal: invoice.subtotal,
        },
        &po_lines,
        &policy,
        &mut pairer,
    )
    .await?;

    let (route, next) = if result.score >= threshold {
        (Route::AutoApprove, Stage::Reconcile)
    } else {
        (Route::HumanReview, Stage::CheckpointHitl)
    };
    info!(
        instance_id = %instance.id,
        score = result.score,
        threshold,
        ?route,
        "two-way match scored"
    );

    let output = MatchOutput {
        po_number: target.map(|po| po.po_number.clone()),
        result,
        threshold,
        route,
    };
    StageOutcome::new(&output, Transition::next(next))
}

/// Build the review record for an instance that failed the match threshold.
pub fn review_request(
    instance: &WorkflowInstance,
    matched: &MatchOutput,
    config: &EngineConfig,
) -> NewReview {
    let doc = &instance.document;
    let review_url = format!(
        "{}/{}",
        config.review_url_base.trim_end_matches('/'),
        instance.id
    );
    NewReview {
        instance_id: instance.id.clone(),
        match_result: serde_json::to_value(&matched.result).unwrap_or(Value::Null),
        callback: format!("resume:{}:{}", instance.id, Stage::HitlDecision),
        reason: format!(
            "match score {:.2} below threshold {:.2}",
            matched.result.score, matched.threshold
        ),
        summary: json!({
            "invoice_id": doc.invoice_id,
            "vendor_name": doc.vendor_name,
            "amount": doc.amount,
            "currency": currency_of(doc),
            "po_number": matched.po_number,
            "score": matched.result.score,
            "review_url": review_url,
        }),
    }
}

async fn checkpoint_hitl(
    instance: &WorkflowInstance,
    env: &StageEnv<'_>,
) -> Result<StageOutcome, StageError> {
    let matched: MatchOutput = instance.output(Stage::Match)?;
    let request = review_request(instance, &matched, env.config);
    let review_url = request.summary["review_url"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    let (review, _created) = env.reviews.create(request).await?;

    let output = ReviewOutput {
        review_id: review.review_id,
        reason: review.reason,
        review_url,
    };
    StageOutcome::new(
        &output,
        Transition::Suspend {
            stage: Stage::HitlDecision,
        },
    )
}

async fn hitl_decision(
    instance: &WorkflowInstance,
    calls: &mut StageCalls<'_>,
) -> Result<StageOutcome, StageError> {
    let verdict = instance
        .pending_verdict
        .clone()
        .ok_or_else(|| StageError::validation("no verdict recorded for this instance"))?;

    let acknowledgement = calls
        .tool(
            names::ACCEPT_OR_REJECT_INVOICE,
            json!({
                "invoice_id": instance.document.invoice_id,
                "review_id": verdict.review_id,
                "decision": verdict.verdict,
                "rationale": verdict.rationale,
                "reviewer": verdict.reviewer,
            }),
        )
        .await?;

    let transition = match verdict.verdict {
        Verdict::Accept => Transition::next(Stage::Reconcile),
        Verdict::Reject => Transition::Fail {
            reason: format!(
                "rejected by {}: {}",
                verdict.reviewer, verdict.rationale
            ),
        },
    };
    let output = DecisionOutput {
        review_id: verdict.review_id,
        verdict: verdict.verdict,
        rationale: verdict.rationale,
        reviewer: verdict.reviewer,
        acknowledgement,
    };
    StageOutcome::new(&output, transition)
}

fn reconcile(instance: &WorkflowInstance) -> Result<StageOutcome, StageError> {
    let understood: UnderstandOutput = instance.output(Stage::Understand)?;
    let matched: MatchOutput = instance.output(Stage::Match)?;
    let invoice = &understood.invoice;
    let vendor = &invoice.vendor_name;

    if invoice.total <= Decimal::ZERO {
        return Err(StageError::validation("zero amount invoice"));
    }

    let entry = |kind, code: &str, name: String, amount: Decimal, memo: String| LedgerEntry {
        kind,
        account_code: code.to_string(),
        account_name: name,
        amount,
        currency: invoice.currency.clone(),
        memo,
    };

    let tax = matched.result.tax_adjustment.unwrap_or(Decimal::ZERO);
    let mut entries = vec![entry(
        EntryKind::Credit,
        ACCOUNTS_PAYABLE,
        format!("Accounts Payable - {vendor}"),
        invoice.total,
        format!("invoice {}", invoice.invoice_id),
    )];

    if invoice.line_items.is_empty() {
        entries.push(entry(
            EntryKind::Debit,
            GENERAL_EXPENSE,
            "General Expense".into(),
            invoice
                .total
                .checked_sub(tax)
                .ok_or_else(|| StageError::validation("invoice total minus tax overflows"))?,
            format!("invoice {}", invoice.invoice_id),
        ));
    } else {
        for line in invoice.line_items.iter().filter(|l| !l.amount.is_zero()) {
            entries.push(entry(
                EntryKind::Debit,
                GENERAL_EXPENSE,
                "General Expense".into(),
                line.amount,
                line.description.clone(),
            ));
        }
    }
    if tax > Decimal::ZERO {
        entries.push(entry(
            EntryKind::Debit,
            TAX_PAYABLE,
            "Tax Payable".into(),
            tax,
            "recognised invoice tax".into(),
        ));
    }

    let debits = |entries: &[LedgerEntry]| {
        checked_total(
            entries
                .iter()
                .filter(|e| e.kind == EntryKind::Debit)
                .map(|e| e.amount),
        )
    };
    let remainder = invoice
        .total
        .checked_sub(debits(&entries)?)
        .ok_or_else(|| StageError::validation("invoice total minus its debits overflows"))?;
    if remainder < Decimal::ZERO {
        return Err(StageError::validation(format!(
            "line items exceed the invoice total by {}",
            -remainder
        )));
    }
    if remainder > Decimal::ZERO {
        entries.push(entry(
            EntryKind::Debit,
            GENERAL_EXPENSE,
            "General Expense".into(),
            remainder,
            "unallocated invoice charges".into(),
        ));
    }

    let output = ReconcileOutput {
        total_debit: debits(&entries)?,
        total_credit: invoice.total,
        entries,
    };
    StageOutcome::new(&output, Transition::next(Stage::Approve))
}

fn approve(instance: &WorkflowInstance) -> Result<StageOutcome, StageError> {
    let human = instance
        .record(Stage::HitlDecision)
        .and_then(|r| serde_json::from_value::<DecisionOutput>(r.output.clone()).ok())
        .filter(|d| d.verdict == Verdict::Accept);

    let output = match human {
        Some(decision) => ApproveOutput {
            approver: HUMAN_APPROVER.into(),
            basis: format!("accepted by {}: {}", decision.reviewer, decision.rationale),
        },
        None => {
            let matched: MatchOutput = instance.output(Stage::Match)?;
            ApproveOutput {
                approver: POLICY_APPROVER.into(),
                basis: format!(
                    "match score {:.2} at or above threshold {:.2}",
                    matched.result.score, matched.threshold
                ),
            }
        }
    };
    StageOutcome::new(&output, Transition::next(Stage::Posting))
}

async fn posting(
    instance: &WorkflowInstance,
    env: &StageEnv<'_>,
    calls: &mut StageCalls<'_>,
) -> Result<StageOutcome, StageError> {
    let understood: UnderstandOutput = instance.output(Stage::Understand)?;
    let reconciled: ReconcileOutput = instance.output(Stage::Reconcile)?;
    let invoice = &understood.invoice;
    if reconciled.entries.is_empty() {
        return Err(StageError::validation("no ledger entries to post"));
    }
    let connector = env
        .config
        .tools
        .erp
        .first()
        .cloned()
        .ok_or_else(|| StageError::validation("erp tool pool is empty"))?;

    let posting = calls
        .tool(
            names::POST_TO_ERP,
            json!({
                "invoice_id": invoice.invoice_id,
                "erp_system": connector,
                "entries": reconciled.entries,
            }),
        )
        .await?;
    let payment = calls
        .tool(
            names::SCHEDULE_PAYMENT,
            json!({
                "invoice_id": invoice.invoice_id,
                "vendor_name": invoice.vendor_name,
                "amount": invoice.total,
                "currency": invoice.currency,
                "due_date": invoice.due_date,
            }),
        )
        .await?;

    let output = PostingOutput {
        connector,
        posting,
        payment,
    };
    StageOutcome::new(&output, Transition::next(Stage::Notify))
}

async fn notify(
    instance: &WorkflowInstance,
    env: &StageEnv<'_>,
    calls: &mut StageCalls<'_>,
) -> Result<StageOutcome, StageError> {
    let understood: UnderstandOutput = instance.output(Stage::Understand)?;
    let prepared: PrepareOutput = instance.output(Stage::Prepare)?;
    let approved: ApproveOutput = instance.output(Stage::Approve)?;
    let invoice = &understood.invoice;
    let provider = env
        .config
        .tools
        .email
        .first()
        .cloned()
        .ok_or_else(|| StageError::validation("email tool pool is empty"))?;

    let message = format!(
        "Invoice {} for {} {} has been approved by {} and scheduled for payment.",
        invoice.invoice_id, invoice.total, invoice.currency, approved.approver
    );

    let mut notifications = Vec::new();
    if let Some(email) = prepared
        .vendor_profile
        .get("email")
        .and_then(Value::as_str)
        .filter(|e| !e.is_empty())
    {
        let sent = calls
            .tool(
                names::SEND_NOTIFICATION,
                json!({
                    "channel": "email",
                    "provider": provider,
                    "recipient": email,
                    "message": message,
                }),
            )
            .await?;
        notifications.push(json!({ "channel": "email", "recipient": email, "result": sent }));
    }
    let sent = calls
        .tool(
            names::SEND_NOTIFICATION,
            json!({
                "channel": "slack",
                "recipient": env.config.finance_channel,
                "message": message,
            }),
        )
        .await?;
    notifications.push(json!({
        "channel": "slack",
        "recipient": env.config.finance_channel,
        "result": sent,
    }));

    StageOutcome::new(&NotifyOutput { notifications }, Transition::next(Stage::Complete))
}

async fn complete(
    instance: &WorkflowInstance,
    calls: &mut StageCalls<'_>,
) -> Result<StageOutcome, StageError> {
    let understood: UnderstandOutput = instance.output(Stage::Understand)?;
    let matched: MatchOutput = instance.output(Stage::Match)?;
    let approved: ApproveOutput = instance.output(Stage::Approve)?;
    let posted: PostingOutput = instance.output(Stage::Posting)?;
    let invoice = &understood.invoice;

    let summary = json!({
        "instance_id": instance.id,
        "invoice_id": invoice.invoice_id,
        "vendor_name": invoice.vendor_name,
        "amount": invoice.total,
        "currency": invoice.currency,
        "match_score": matched.result.score,
        "route": matched.route,
        "approver": approved.approver,
        "posting": posted.posting,
        "payment": posted.payment,
    });
    let receipt = calls
        .tool(names::OUTPUT_FINAL_PAYLOAD, json!({ "summary": summary }))
        .await?;

    StageOutcome::new(&CompleteOutput { summary, receipt }, Transition::Finish)
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_names_are_normalised() {
        assert_eq!(normalize_vendor("Acme Corp, Inc.").unwrap(), "ACME CORP");
        assert_eq!(
            normalize_vendor("BrightTech Solutions Pvt. Ltd").unwrap(),
            "BRIGHTTECH SOLUTIONS"
        );
        assert_eq!(normalize_vendor("Nordwind GmbH").unwrap(), "NORDWIND");
        assert_eq!(normalize_vendor("Lincoln Logistics").unwrap(), "LINCOLN LOGISTICS");
    }

    #[test]
    fn purchase_order_without_lines_matches_on_total() {
        let po = PurchaseOrder {
            po_number: "PO-7".into(),
            vendor_name: None,
            line_items: Vec::new(),
            total_amount: Some(Decimal::from(230)),
        };
        let lines = po.match_lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].amount, Decimal::from(230));
    }

    #[test]
    fn submission_validation() {
        let mut doc = InvoiceDocument {
            invoice_id: "INV-1".into(),
            vendor_name: "Acme".into(),
            vendor_tax_id: None,
            amount: Decimal::from(10),
            currency: None,
            po_number: None,
            invoice_date: None,
            due_date: None,
            subtotal: None,
            tax_amount: None,
            line_items: Vec::new(),
            attachments: Vec::new(),
        };
        assert!(validate_submission(&doc).is_ok());
        assert_eq!(currency_of(&doc), "USD");

        doc.amount = Decimal::from(-1);
        assert!(matches!(validate_submission(&doc), Err(StageError::Validation(_))));

        doc.amount = Decimal::from(10);
        doc.invoice_id = " ".into();
        assert!(validate_submission(&doc).is_err());
    }

    #[test]
    fn submission_amounts_are_bounded() {
        let half = Decimal::MAX / Decimal::TWO + Decimal::ONE;
        let huge = |description: &str| LineItem {
            description: description.into(),
            quantity: Decimal::ONE,
            unit_price: half,
            amount: half,
        };
        let doc = InvoiceDocument {
            invoice_id: "INV-9".into(),
            vendor_name: "Acme".into(),
            vendor_tax_id: None,
            amount: Decimal::MAX,
            currency: None,
            po_number: None,
            invoice_date: None,
            due_date: None,
            subtotal: None,
            tax_amount: None,
            line_items: vec![huge("Rack"), huge("Cable")],
            attachments: Vec::new(),
        };
        assert!(matches!(validate_submission(&doc), Err(StageError::Validation(_))));

        let fine = InvoiceDocument {
            amount: Decimal::from(1_000_000),
            line_items: vec![LineItem::new("Rack", Decimal::TWO, Decimal::from(500_000))],
            ..doc
        };
        assert!(validate_submission(&fine).is_ok());
    }
}
