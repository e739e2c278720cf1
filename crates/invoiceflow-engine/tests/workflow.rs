//! End-to-end tests for the invoiceflow-engine crate.
//!
//! Instances run against an on-disk SQLite database with scripted
//! collaborators: a fixture tool invoker that answers like a small ERP and
//! an oracle that always picks a fixed option.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use invoiceflow_engine::{
    DecisionKind, DecisionOracle, DecisionRequest, EngineConfig, EngineError, Executor,
    HitlGateway, InstanceStatus, InvoiceDocument, Judgment, LineItem, OracleError, Priority,
    RetryPolicy, Stage, Stores, ToolError, ToolInvoker, Verdict,
};
use invoiceflow_store::{AuditKind, Database, ResolveOutcome, ReviewStatus};
use rust_decimal::Decimal;
use serde_json::{Value, json};

// ═══════════════════════════════════════════════════════════════════════
//  Fixtures
// ═══════════════════════════════════════════════════════════════════════

struct FixedOracle {
    tool_choice: Option<usize>,
}

#[async_trait]
impl DecisionOracle for FixedOracle {
    async fn decide(&self, request: &DecisionRequest) -> Result<Judgment, OracleError> {
        let choice = match request.kind {
            DecisionKind::SelectTool => self.tool_choice,
            DecisionKind::PairLineItem => Some(0),
        };
        Ok(Judgment {
            choice,
            rationale: format!("fixed choice for {}", request.subject),
        })
    }
}

#[derive(Default)]
struct FixtureTools {
    calls: Mutex<Vec<(String, Value)>>,
    /// Tools that always fail transiently.
    broken: Vec<&'static str>,
}

impl FixtureTools {
    fn broken(tools: &[&'static str]) -> Self {
        Self {
            broken: tools.to_vec(),
            ..Self::default()
        }
    }

    fn count(&self, tool: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == tool)
            .count()
    }

    fn args(&self, tool: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == tool)
            .map(|(_, args)| args.clone())
            .collect()
    }
}

#[async_trait]
impl ToolInvoker for FixtureTools {
    async fn invoke(&self, tool: &str, args: Value) -> Result<Value, ToolError> {
        self.calls
            .lock()
            .unwrap()
            .push((tool.to_string(), args.clone()));
        if self.broken.contains(&tool) {
            return Err(ToolError::Transient(format!("{tool} backend unreachable")));
        }
        let result = match tool {
            "accept_invoice_payload" => json!({ "raw_id": "raw-1" }),
            "ocr_extract" => json!({ "text": "INVOICE INV-9 Cloud Hosting 230.00 TOTAL 253.00" }),
            "parse_line_items" => json!({
                "parsed_data": {
                    "po_number": "PO-1",
                    "subtotal": "230",
                    "total_amount": "253",
                    "line_items": [{ "description": "Cloud Hosting", "amount": "230" }],
                }
            }),
            "enrich_vendor" => json!({
                "vendor_data": {
                    "risk_score": 10,
                    "credit_limit": 50000,
                    "tax_id": "TX-ACME",
                    "email": "ap@acme.test",
                }
            }),
            "fetch_erp_data" => json!({
                "purchase_orders": [{
                    "po_number": "PO-1",
                    "line_items": [{
                        "description": "Cloud Hosting",
                        "quantity": "1",
                        "unit_price": "230",
                        "amount": "230",
                    }],
                }],
                "goods_receipts": [],
                "invoice_history": [],
            }),
            "accept_or_reject_invoice" => json!({ "status": "acknowledged" }),
            "post_to_erp" => json!({ "erp_document_id": "DOC-1", "status": "POSTED" }),
            "schedule_payment" => json!({ "payment_id": "PAY-1", "status": "SCHEDULED" }),
            "send_notification" => json!({ "sent": true }),
            "output_final_payload" => json!({ "delivered": true }),
            other => return Err(ToolError::Rejected(format!("unknown tool {other}"))),
        };
        Ok(result)
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        call_timeout_ms: 2_000,
        retry: RetryPolicy {
            max_retries: 2,
            initial_backoff_ms: 1,
            backoff_factor: 2.0,
            max_backoff_ms: 5,
        },
        ..EngineConfig::default()
    }
}

async fn open(path: &Path) -> Database {
    Database::open_and_migrate(path.to_path_buf()).await.unwrap()
}

fn executor(db: Database, tools: Arc<FixtureTools>) -> Executor {
    Executor::new(
        Stores::new(db),
        Arc::new(FixedOracle { tool_choice: Some(0) }),
        tools,
        fast_config(),
    )
}

/// Invoice that agrees with PO-1 once 10% tax is accounted for.
fn matching_invoice() -> InvoiceDocument {
    InvoiceDocument {
        invoice_id: "INV-1".into(),
        vendor_name: "Acme Corp, Inc.".into(),
        vendor_tax_id: None,
        amount: Decimal::from(253),
        currency: Some("usd".into()),
        po_number: Some("PO-1".into()),
        invoice_date: Some("2026-09-01".into()),
        due_date: Some("2026-10-01".into()),
        subtotal: Some(Decimal::from(230)),
        tax_amount: Some(Decimal::from(23)),
        line_items: vec![LineItem::new("Cloud Hosting", Decimal::ONE, Decimal::from(230))],
        attachments: Vec::new(),
    }
}

/// Invoice billing far more than PO-1 allows.
fn overbilled_invoice() -> InvoiceDocument {
    InvoiceDocument {
        invoice_id: "INV-2".into(),
        amount: Decimal::from(9999),
        subtotal: None,
        tax_amount: None,
        line_items: vec![LineItem::new("Cloud Hosting", Decimal::ONE, Decimal::from(9999))],
        ..matching_invoice()
    }
}

const HAPPY_PATH: [Stage; 10] = [
    Stage::Intake,
    Stage::Understand,
    Stage::Prepare,
    Stage::Retrieve,
    Stage::Match,
    Stage::Reconcile,
    Stage::Approve,
    Stage::Posting,
    Stage::Notify,
    Stage::Complete,
];

// ═══════════════════════════════════════════════════════════════════════
//  Straight-through processing
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn matching_invoice_completes_without_review() {
    let dir = tempfile::tempdir().unwrap();
    let tools = Arc::new(FixtureTools::default());
    let exec = executor(open(&dir.path().join("flow.db")).await, Arc::clone(&tools));

    let id = exec.submit(matching_invoice(), Priority::Normal).await.unwrap();
    let outcome = exec.run(&id).await.unwrap();
    assert_eq!(outcome.status, InstanceStatus::Completed);
    assert_eq!(outcome.stage, Stage::Complete);

    let inst = exec.load(&id).await.unwrap();
    assert_eq!(inst.completed_stages(), HAPPY_PATH.to_vec());

    let matched = &inst.record(Stage::Match).unwrap().output;
    assert_eq!(matched["result"]["score"], 1.0);
    assert_eq!(matched["route"], "AUTO_APPROVE");

    let entries = inst.record(Stage::Reconcile).unwrap().output["entries"]
        .as_array()
        .unwrap()
        .clone();
    let codes: Vec<&str> = entries
        .iter()
        .map(|e| e["account_code"].as_str().unwrap())
        .collect();
    assert_eq!(codes, ["2000-AP-TRADE", "5000-GEN-EXP", "2200-TAX-PAYABLE"]);

    let approve = &inst.record(Stage::Approve).unwrap().output;
    assert_eq!(approve["approver"], "auto_approval_policy");

    // Email to the vendor plus the finance channel.
    assert_eq!(tools.count("send_notification"), 2);
    assert!(exec.stores().reviews.list_open(10, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn audit_trail_brackets_every_stage() {
    let dir = tempfile::tempdir().unwrap();
    let tools = Arc::new(FixtureTools::default());
    let exec = executor(open(&dir.path().join("flow.db")).await, tools);

    let id = exec.submit(matching_invoice(), Priority::High).await.unwrap();
    exec.run(&id).await.unwrap();

    let trail = exec.audit_trail(&id).await.unwrap();
    let brackets: Vec<(String, AuditKind)> = trail
        .iter()
        .filter(|e| matches!(e.kind, AuditKind::Enter | AuditKind::Exit))
        .map(|e| (e.stage.clone(), e.kind))
        .collect();
    let expected: Vec<(String, AuditKind)> = HAPPY_PATH
        .iter()
        .flat_map(|s| {
            [
                (s.as_str().to_string(), AuditKind::Enter),
                (s.as_str().to_string(), AuditKind::Exit),
            ]
        })
        .collect();
    assert_eq!(brackets, expected);

    let seqs: Vec<i64> = trail.iter().map(|e| e.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn tool_calls_carry_stable_idempotency_keys() {
    let dir = tempfile::tempdir().unwrap();
    let tools = Arc::new(FixtureTools::default());
    let exec = executor(open(&dir.path().join("flow.db")).await, Arc::clone(&tools));

    let id = exec.submit(matching_invoice(), Priority::Normal).await.unwrap();
    exec.run(&id).await.unwrap();

    let posted = tools.args("post_to_erp");
    assert_eq!(posted.len(), 1);
    assert_eq!(
        posted[0]["idempotency_key"],
        format!("{id}:POSTING:post_to_erp:1")
    );

    let keys: Vec<String> = tools
        .args("send_notification")
        .iter()
        .map(|a| a["idempotency_key"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        keys,
        [
            format!("{id}:NOTIFY:send_notification:1"),
            format!("{id}:NOTIFY:send_notification:2"),
        ]
    );
}

#[tokio::test]
async fn unstructured_invoice_goes_through_extraction() {
    let dir = tempfile::tempdir().unwrap();
    let tools = Arc::new(FixtureTools::default());
    let exec = Executor::new(
        Stores::new(open(&dir.path().join("flow.db")).await),
        // Out of range: the engine falls back to the pool default.
        Arc::new(FixedOracle { tool_choice: Some(99) }),
        tools.clone(),
        fast_config(),
    );

    let doc = InvoiceDocument {
        line_items: Vec::new(),
        attachments: vec!["scans/inv-9.png".into()],
        ..matching_invoice()
    };
    let id = exec.submit(doc, Priority::Normal).await.unwrap();
    let outcome = exec.run(&id).await.unwrap();
    assert_eq!(outcome.status, InstanceStatus::Completed);

    let inst = exec.load(&id).await.unwrap();
    let understood = &inst.record(Stage::Understand).unwrap().output;
    assert_eq!(understood["extraction"]["tool"], "gpt-4o");
    assert_eq!(understood["extraction"]["fallback"], true);
    assert_eq!(understood["invoice"]["line_items"][0]["description"], "Cloud Hosting");

    let ocr = tools.args("ocr_extract");
    assert_eq!(ocr[0]["engine"], "gpt-4o");

    let decisions: Vec<_> = exec
        .audit_trail(&id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == AuditKind::Decision)
        .collect();
    assert_eq!(decisions[0].stage, "UNDERSTAND");
    assert_eq!(decisions[0].payload["choice"], 99);
    assert!(decisions[0].payload["selected"].is_null());
}

// ═══════════════════════════════════════════════════════════════════════
//  Human review
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn low_score_pauses_with_one_open_review() {
    let dir = tempfile::tempdir().unwrap();
    let tools = Arc::new(FixtureTools::default());
    let exec = executor(open(&dir.path().join("flow.db")).await, tools);

    let id = exec.submit(overbilled_invoice(), Priority::Normal).await.unwrap();
    let outcome = exec.run(&id).await.unwrap();
    assert_eq!(outcome.status, InstanceStatus::Paused);
    assert_eq!(outcome.stage, Stage::HitlDecision);

    let open = exec.stores().reviews.list_open(10, 0).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].instance_id, id);
    assert!(open[0].reason.contains("below threshold"));
    assert_eq!(open[0].callback, format!("resume:{id}:HITL_DECISION"));

    // Asking again returns the same review.
    let gateway = HitlGateway::new(exec.clone());
    let again = gateway.create_review(&id).await.unwrap();
    assert_eq!(again.review_id, open[0].review_id);
    assert_eq!(exec.stores().reviews.count_open().await.unwrap(), 1);
}

#[tokio::test]
async fn accepted_review_resumes_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let tools = Arc::new(FixtureTools::default());
    let exec = executor(open(&dir.path().join("flow.db")).await, Arc::clone(&tools));
    let gateway = HitlGateway::new(exec.clone());

    let id = exec.submit(overbilled_invoice(), Priority::Normal).await.unwrap();
    exec.run(&id).await.unwrap();
    let review = gateway.list_open(10, 0).await.unwrap().remove(0);

    let resolution = gateway
        .resolve(&review.review_id, Verdict::Accept, "price change agreed", "dana")
        .await
        .unwrap();
    assert_eq!(resolution.review.status, ReviewStatus::Resolved);
    let outcome = resolution.run.await.unwrap().unwrap();
    assert_eq!(outcome.status, InstanceStatus::Completed);

    let inst = exec.load(&id).await.unwrap();
    assert_eq!(
        inst.record(Stage::Approve).unwrap().output["approver"],
        "human_reviewer"
    );
    assert_eq!(tools.count("accept_or_reject_invoice"), 1);
    assert_eq!(tools.count("post_to_erp"), 1);
}

#[tokio::test]
async fn rejected_review_fails_instance_without_posting() {
    let dir = tempfile::tempdir().unwrap();
    let tools = Arc::new(FixtureTools::default());
    let exec = executor(open(&dir.path().join("flow.db")).await, Arc::clone(&tools));
    let gateway = HitlGateway::new(exec.clone());

    let id = exec.submit(overbilled_invoice(), Priority::Normal).await.unwrap();
    exec.run(&id).await.unwrap();
    let review = gateway.list_open(10, 0).await.unwrap().remove(0);

    let resolution = gateway
        .resolve(&review.review_id, Verdict::Reject, "not ordered", "dana")
        .await
        .unwrap();
    let outcome = resolution.run.await.unwrap().unwrap();
    assert_eq!(outcome.status, InstanceStatus::Failed);

    let inst = exec.load(&id).await.unwrap();
    let failure = inst.failure.unwrap();
    assert_eq!(failure.stage, Stage::HitlDecision);
    assert!(failure.message.contains("not ordered"));
    assert_eq!(tools.count("post_to_erp"), 0);
}

#[tokio::test]
async fn second_verdict_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let tools = Arc::new(FixtureTools::default());
    let exec = executor(open(&dir.path().join("flow.db")).await, tools);
    let gateway = HitlGateway::new(exec.clone());

    let id = exec.submit(overbilled_invoice(), Priority::Normal).await.unwrap();
    exec.run(&id).await.unwrap();
    let review = gateway.list_open(10, 0).await.unwrap().remove(0);

    let first = gateway
        .resolve(&review.review_id, Verdict::Accept, "ok", "dana")
        .await
        .unwrap();
    first.run.await.unwrap().unwrap();

    let second = gateway
        .resolve(&review.review_id, Verdict::Reject, "changed my mind", "eli")
        .await;
    assert!(matches!(second, Err(EngineError::AlreadyResolved(_))));

    let stored = gateway.get(&review.review_id).await.unwrap();
    assert_eq!(stored.verdict, Some(Verdict::Accept));
    assert_eq!(stored.reviewer.as_deref(), Some("dana"));
    assert_eq!(exec.load(&id).await.unwrap().status, InstanceStatus::Completed);
}

#[tokio::test]
async fn unknown_review_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let exec = executor(
        open(&dir.path().join("flow.db")).await,
        Arc::new(FixtureTools::default()),
    );
    let gateway = HitlGateway::new(exec);
    let err = gateway
        .resolve("no-such-review", Verdict::Accept, "", "dana")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownReview(_)));
}

#[tokio::test]
async fn verdict_for_an_instance_that_is_not_paused_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let tools = Arc::new(FixtureTools::default());
    let exec = executor(open(&dir.path().join("flow.db")).await, Arc::clone(&tools));
    let gateway = HitlGateway::new(exec.clone());

    let id = exec.submit(matching_invoice(), Priority::Normal).await.unwrap();
    assert_eq!(exec.run(&id).await.unwrap().status, InstanceStatus::Completed);
    let review = gateway.create_review(&id).await.unwrap();
    let versions = exec.stores().checkpoints.history(&id).await.unwrap().len();
    let audit_len = exec.audit_trail(&id).await.unwrap().len();

    let err = gateway
        .resolve(&review.review_id, Verdict::Reject, "too late", "dana")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StateConflict { .. }));

    let stored = gateway.get(&review.review_id).await.unwrap();
    assert_eq!(stored.status, ReviewStatus::Open);
    assert_eq!(stored.verdict, None);
    let inst = exec.load(&id).await.unwrap();
    assert_eq!(inst.status, InstanceStatus::Completed);
    assert!(inst.record(Stage::HitlDecision).is_none());
    assert_eq!(exec.stores().checkpoints.history(&id).await.unwrap().len(), versions);
    assert_eq!(exec.audit_trail(&id).await.unwrap().len(), audit_len);
    assert_eq!(tools.count("accept_or_reject_invoice"), 0);
}

// ═══════════════════════════════════════════════════════════════════════
//  Failures and recovery
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn exhausted_retries_fail_the_instance() {
    let dir = tempfile::tempdir().unwrap();
    let tools = Arc::new(FixtureTools::broken(&["enrich_vendor"]));
    let exec = executor(open(&dir.path().join("flow.db")).await, Arc::clone(&tools));

    let id = exec.submit(matching_invoice(), Priority::Normal).await.unwrap();
    let outcome = exec.run(&id).await.unwrap();
    assert_eq!(outcome.status, InstanceStatus::Failed);
    assert_eq!(outcome.stage, Stage::Prepare);

    // One attempt plus two retries, each with the same key.
    let attempts = tools.args("enrich_vendor");
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|a| a["idempotency_key"] == attempts[0]["idempotency_key"]));

    let inst = exec.load(&id).await.unwrap();
    assert_eq!(inst.failure.as_ref().unwrap().kind, "TRANSIENT_TOOL_ERROR");
    assert_eq!(inst.retries["PREPARE"], 2);

    let trail = exec.audit_trail(&id).await.unwrap();
    let last = trail.last().unwrap();
    assert_eq!(last.kind, AuditKind::Error);
    assert_eq!(last.payload["kind"], "TRANSIENT_TOOL_ERROR");
}

#[tokio::test]
async fn crash_after_checkpoint_does_not_repeat_the_stage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flow.db");
    let tools = Arc::new(FixtureTools::default());

    let db = open(&path).await;
    // Make the EXIT write of RETRIEVE fail, as if the process died right
    // after the checkpoint landed.
    db.execute(|conn| {
        conn.execute_batch(
            "CREATE TRIGGER crash_after_retrieve BEFORE INSERT ON audit_entries \
             WHEN NEW.stage = 'RETRIEVE' AND NEW.kind = 'EXIT' \
             BEGIN SELECT RAISE(ABORT, 'simulated crash'); END;",
        )?;
        Ok(())
    })
    .await
    .unwrap();

    let first = executor(db.clone(), Arc::clone(&tools));
    let id = first.submit(matching_invoice(), Priority::Normal).await.unwrap();
    let err = first.run(&id).await.unwrap_err();
    assert!(matches!(err, EngineError::Store(_)));

    let stranded = first.load(&id).await.unwrap();
    assert_eq!(stranded.status, InstanceStatus::Running);
    assert_eq!(stranded.stage, Stage::Match);

    db.execute(|conn| {
        conn.execute_batch("DROP TRIGGER crash_after_retrieve;")?;
        Ok(())
    })
    .await
    .unwrap();
    drop(first);

    // "Restart": fresh connection, fresh executor.
    let restarted = executor(open(&path).await, Arc::clone(&tools));
    let recovery = restarted.recover().await.unwrap();
    assert!(recovery.parked.is_empty());
    assert_eq!(recovery.resumed.len(), 1);
    for (_, handle) in recovery.resumed {
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.status, InstanceStatus::Completed);
    }

    assert_eq!(tools.count("fetch_erp_data"), 1);

    let inst = restarted.load(&id).await.unwrap();
    assert_eq!(inst.completed_stages(), HAPPY_PATH.to_vec());

    let trail = restarted.audit_trail(&id).await.unwrap();
    let retrieve_exit = trail
        .iter()
        .find(|e| e.stage == "RETRIEVE" && e.kind == AuditKind::Exit)
        .unwrap();
    assert_eq!(retrieve_exit.payload["recovered"], true);
    let enters = trail
        .iter()
        .filter(|e| e.stage == "RETRIEVE" && e.kind == AuditKind::Enter)
        .count();
    assert_eq!(enters, 1);
}

#[tokio::test]
async fn recovery_leaves_unresolved_reviews_parked() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flow.db");
    let tools = Arc::new(FixtureTools::default());

    let exec = executor(open(&path).await, Arc::clone(&tools));
    let paused = exec.submit(overbilled_invoice(), Priority::Normal).await.unwrap();
    exec.run(&paused).await.unwrap();
    let queued = exec.submit(matching_invoice(), Priority::Critical).await.unwrap();
    drop(exec);

    let restarted = executor(open(&path).await, Arc::clone(&tools));
    let recovery = restarted.recover().await.unwrap();
    assert_eq!(recovery.parked, vec![paused.clone()]);

    let mut finished = HashMap::new();
    for (id, handle) in recovery.resumed {
        finished.insert(id, handle.await.unwrap().unwrap().status);
    }
    assert_eq!(finished.get(&queued), Some(&InstanceStatus::Completed));
    assert_eq!(
        restarted.load(&paused).await.unwrap().status,
        InstanceStatus::Paused
    );
}

#[tokio::test]
async fn recovery_hands_over_a_verdict_recorded_before_a_crash() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flow.db");
    let tools = Arc::new(FixtureTools::default());

    let exec = executor(open(&path).await, Arc::clone(&tools));
    let id = exec.submit(overbilled_invoice(), Priority::Normal).await.unwrap();
    exec.run(&id).await.unwrap();
    let review = exec
        .stores()
        .reviews
        .latest_for_instance(&id)
        .await
        .unwrap()
        .unwrap();

    // The verdict reaches the store, then the process dies before resuming.
    let stored = exec
        .stores()
        .reviews
        .resolve(&review.review_id, Verdict::Accept, "price change agreed", "dana")
        .await
        .unwrap();
    assert!(matches!(stored, ResolveOutcome::Resolved(_)));
    drop(exec);

    let restarted = executor(open(&path).await, Arc::clone(&tools));
    assert_eq!(restarted.load(&id).await.unwrap().status, InstanceStatus::Paused);
    let recovery = restarted.recover().await.unwrap();
    assert!(recovery.parked.is_empty());
    assert_eq!(recovery.resumed.len(), 1);

    let (resumed, handle) = recovery.resumed.into_iter().next().unwrap();
    assert_eq!(resumed, id);
    assert_eq!(handle.await.unwrap().unwrap().status, InstanceStatus::Completed);

    let inst = restarted.load(&id).await.unwrap();
    assert_eq!(
        inst.record(Stage::Approve).unwrap().output["approver"],
        "human_reviewer"
    );
    assert_eq!(tools.count("accept_or_reject_invoice"), 1);
    let human_decisions = restarted
        .audit_trail(&id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == AuditKind::Decision && e.payload["source"] == "human")
        .count();
    assert_eq!(human_decisions, 1);
}
