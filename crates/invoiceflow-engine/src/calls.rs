//! Guarded external calls.
//!
//! A stage never talks to the oracle or a tool directly; it goes through
//! [`StageCalls`], which bounds each attempt with a timeout, retries
//! transient failures with exponential backoff, stamps tool calls with an
//! idempotency key and audits every attempt whatever its outcome.

use std::collections::HashMap;
use std::time::Duration;

use invoiceflow_store::{AuditKind, AuditTrail};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::StageError;
use crate::oracle::{DecisionOracle, DecisionRequest, Judgment, OracleError};
use crate::stage::Stage;
use crate::tools::{ToolError, ToolInvoker};

/// Call gateway for one execution of one stage.
pub struct StageCalls<'a> {
    instance_id: &'a str,
    stage: Stage,
    audit: &'a AuditTrail,
    oracle: &'a dyn DecisionOracle,
    tools: &'a dyn ToolInvoker,
    retry: RetryPolicy,
    timeout: Duration,
    /// Tool name → calls made so far in this stage.
    sequence: HashMap<String, u32>,
    retries: u32,
}

impl<'a> StageCalls<'a> {
    pub fn new(
        instance_id: &'a str,
        stage: Stage,
        audit: &'a AuditTrail,
        oracle: &'a dyn DecisionOracle,
        tools: &'a dyn ToolInvoker,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            instance_id,
            stage,
            audit,
            oracle,
            tools,
            retry,
            timeout,
            sequence: HashMap::new(),
            retries: 0,
        }
    }

    /// Retries spent so far across all calls.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// `<instance>:<stage>:<tool>:<n>`, stable across replays of the stage.
    fn next_key(&mut self, tool: &str) -> String {
        let n = self.sequence.entry(tool.to_string()).or_insert(0);
        *n += 1;
        format!("{}:{}:{}:{}", self.instance_id, self.stage, tool, n)
    }

    async fn record(&self, kind: AuditKind, payload: Value) -> Result<(), StageError> {
        self.audit
            .append(self.instance_id, self.stage.as_str(), kind, payload)
            .await?;
        Ok(())
    }

    async fn back_off(&mut self, attempt: u32, call: &str) {
        let delay = self.retry.backoff(attempt);
        self.retries += 1;
        warn!(
            instance_id = self.instance_id,
            stage = %self.stage,
            call,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "retrying external call"
        );
        tokio::time::sleep(delay).await;
    }

    /// Invoke `tool`. `args` should be a JSON object; the idempotency key is
    /// added to it.
    pub async fn tool(&mut self, tool: &str, args: Value) -> Result<Value, StageError> {
        let key = self.next_key(tool);
        let args = match args {
            Value::Object(mut map) => {
                map.insert("idempotency_key".into(), Value::String(key));
                Value::Object(map)
            }
            other => json!({ "input": other, "idempotency_key": key }),
        };

        let max_attempts = self.retry.max_attempts();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            debug!(instance_id = self.instance_id, tool, attempt, "invoking tool");
            let outcome = tokio::time::timeout(self.timeout, self.tools.invoke(tool, args.clone())).await;

            match outcome {
                Ok(Ok(result)) => {
                    self.record(
                        AuditKind::ToolCall,
                        json!({
                            "tool": tool,
                            "args": args,
                            "attempt": attempt,
                            "outcome": "ok",
                            "result": result,
                        }),
                    )
                    .await?;
                    return Ok(result);
                }
                Ok(Err(ToolError::Rejected(message))) => {
                    self.record(
                        AuditKind::ToolCall,
                        json!({
                            "tool": tool,
                            "args": args,
                            "attempt": attempt,
                            "outcome": "rejected",
                            "error": message,
                        }),
                    )
                    .await?;
                    return Err(StageError::ToolRejected {
                        tool: tool.to_string(),
                        message,
                    });
                }
                Ok(Err(ToolError::Transient(message))) => {
                    self.record(
                        AuditKind::ToolCall,
                        json!({
                            "tool": tool,
                            "args": args,
                            "attempt": attempt,
                            "outcome": "transient",
                            "error": message,
                        }),
                    )
                    .await?;
                    last_error = message;
                }
                Err(_elapsed) => {
                    let message = format!("timed out after {} ms", self.timeout.as_millis());
                    self.record(
                        AuditKind::ToolCall,
                        json!({
                            "tool": tool,
                            "args": args,
                            "attempt": attempt,
                            "outcome": "timeout",
                            "error": message,
                        }),
                    )
                    .await?;
                    last_error = message;
                }
            }

            if attempt < max_attempts {
                self.back_off(attempt, tool).await;
            }
        }

        Err(StageError::Transient {
            call: tool.to_string(),
            attempts: max_attempts,
            message: last_error,
        })
    }

    /// Ask the oracle. The judgment is audited verbatim, including a choice
    /// outside the offered options; interpreting it is the caller's job.
    pub async fn decide(&mut self, request: DecisionRequest) -> Result<Judgment, StageError> {
        let max_attempts = self.retry.max_attempts();
        let mut timed_out = false;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let outcome = tokio::time::timeout(self.timeout, self.oracle.decide(&request)).await;

            match outcome {
                Ok(Ok(judgment)) => {
                    self.record(
                        AuditKind::Decision,
                        json!({
                            "request": request,
                            "attempt": attempt,
                            "outcome": "ok",
                            "choice": judgment.choice,
                            "selected": judgment.choice.and_then(|i| request.options.get(i)),
                            "rationale": judgment.rationale,
                        }),
                    )
                    .await?;
                    return Ok(judgment);
                }
                Ok(Err(err)) => {
                    let message = err.to_string();
                    let label = match err {
                        OracleError::Unavailable(_) => "unavailable",
                        OracleError::Malformed(_) => "malformed",
                    };
                    self.record(
                        AuditKind::Decision,
                        json!({
                            "request": request,
                            "attempt": attempt,
                            "outcome": label,
                            "error": message,
                        }),
                    )
                    .await?;
                    timed_out = false;
                    last_error = message;
                }
                Err(_elapsed) => {
                    self.record(
                        AuditKind::Decision,
                        json!({
                            "request": request,
                            "attempt": attempt,
                            "outcome": "timeout",
                            "error": format!("timed out after {} ms", self.timeout.as_millis()),
                        }),
                    )
                    .await?;
                    timed_out = true;
                }
            }

            if attempt < max_attempts {
                self.back_off(attempt, "decision_oracle").await;
            }
        }

        if timed_out {
            Err(StageError::OracleTimeout {
                attempts: max_attempts,
            })
        } else {
            Err(StageError::Transient {
                call: "decision_oracle".into(),
                attempts: max_attempts,
                message: last_error,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use invoiceflow_store::Database;

    use crate::oracle::DecisionKind;

    /// Fails transiently `failures` times, then echoes its arguments.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        seen: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl ToolInvoker for Flaky {
        async fn invoke(&self, tool: &str, args: Value) -> Result<Value, ToolError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(args.clone());
            if tool == "refuse" {
                return Err(ToolError::Rejected("unbalanced entries".into()));
            }
            if n < self.failures {
                return Err(ToolError::Transient("connection reset".into()));
            }
            Ok(json!({ "echo": args }))
        }
    }

    struct SlowOracle;

    #[async_trait]
    impl DecisionOracle for SlowOracle {
        async fn decide(&self, _request: &DecisionRequest) -> Result<Judgment, OracleError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Judgment {
                choice: Some(0),
                rationale: "too late".into(),
            })
        }
    }

    struct FirstOption;

    #[async_trait]
    impl DecisionOracle for FirstOption {
        async fn decide(&self, _request: &DecisionRequest) -> Result<Judgment, OracleError> {
            Ok(Judgment {
                choice: Some(0),
                rationale: "first is fine".into(),
            })
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff_ms: 1,
            backoff_factor: 1.0,
            max_backoff_ms: 1,
        }
    }

    fn flaky(failures: u32) -> Flaky {
        Flaky {
            failures,
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    async fn trail() -> AuditTrail {
        AuditTrail::new(Database::in_memory_migrated().await.unwrap())
    }

    #[tokio::test]
    async fn transient_failures_are_retried_and_audited() {
        let audit = trail().await;
        let tools = flaky(2);
        let mut calls = StageCalls::new(
            "i-1",
            Stage::Retrieve,
            &audit,
            &FirstOption,
            &tools,
            fast_retry(2),
            Duration::from_secs(1),
        );

        let result = calls
            .tool("fetch_erp_data", json!({ "po_number": "PO-1" }))
            .await
            .unwrap();
        assert_eq!(result["echo"]["po_number"], "PO-1");
        assert_eq!(calls.retries(), 2);

        let entries = audit.entries("i-1").await.unwrap();
        let outcomes: Vec<_> = entries
            .iter()
            .map(|e| e.payload["outcome"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(outcomes, vec!["transient", "transient", "ok"]);
    }

    #[tokio::test]
    async fn retries_keep_the_same_idempotency_key() {
        let audit = trail().await;
        let tools = flaky(1);
        let mut calls = StageCalls::new(
            "i-1",
            Stage::Posting,
            &audit,
            &FirstOption,
            &tools,
            fast_retry(1),
            Duration::from_secs(1),
        );

        calls.tool("post_to_erp", json!({})).await.unwrap();
        calls.tool("post_to_erp", json!({})).await.unwrap();

        let seen = tools.seen.lock().unwrap();
        let keys: Vec<_> = seen
            .iter()
            .map(|a| a["idempotency_key"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            keys,
            vec![
                "i-1:POSTING:post_to_erp:1",
                "i-1:POSTING:post_to_erp:1",
                "i-1:POSTING:post_to_erp:2",
            ]
        );
    }

    #[tokio::test]
    async fn exhausted_retries_escalate() {
        let audit = trail().await;
        let tools = flaky(10);
        let mut calls = StageCalls::new(
            "i-1",
            Stage::Retrieve,
            &audit,
            &FirstOption,
            &tools,
            fast_retry(2),
            Duration::from_secs(1),
        );

        let err = calls.tool("fetch_erp_data", json!({})).await.unwrap_err();
        assert!(matches!(err, StageError::Transient { attempts: 3, .. }));
        assert_eq!(tools.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let audit = trail().await;
        let tools = flaky(0);
        let mut calls = StageCalls::new(
            "i-1",
            Stage::Posting,
            &audit,
            &FirstOption,
            &tools,
            fast_retry(3),
            Duration::from_secs(1),
        );

        let err = calls.tool("refuse", json!({})).await.unwrap_err();
        assert!(matches!(err, StageError::ToolRejected { .. }));
        assert_eq!(tools.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oracle_timeout_is_bounded() {
        let audit = trail().await;
        let tools = flaky(0);
        let mut calls = StageCalls::new(
            "i-1",
            Stage::Understand,
            &audit,
            &SlowOracle,
            &tools,
            fast_retry(1),
            Duration::from_millis(20),
        );

        let err = calls
            .decide(DecisionRequest {
                kind: DecisionKind::SelectTool,
                subject: "invoice.pdf".into(),
                options: vec!["tesseract".into()],
                context: json!({}),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::OracleTimeout { attempts: 2 }));
        assert_eq!(audit.count("i-1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn judgment_is_audited_verbatim() {
        let audit = trail().await;
        let tools = flaky(0);
        let mut calls = StageCalls::new(
            "i-1",
            Stage::Understand,
            &audit,
            &FirstOption,
            &tools,
            fast_retry(0),
            Duration::from_secs(1),
        );

        calls
            .decide(DecisionRequest {
                kind: DecisionKind::SelectTool,
                subject: "invoice.pdf".into(),
                options: vec!["tesseract".into(), "aws_textract".into()],
                context: json!({}),
            })
            .await
            .unwrap();

        let entries = audit.entries("i-1").await.unwrap();
        assert_eq!(entries[0].kind, AuditKind::Decision);
        assert_eq!(entries[0].payload["selected"], "tesseract");
        assert_eq!(entries[0].payload["rationale"], "first is fine");
    }
}
