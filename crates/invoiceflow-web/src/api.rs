//! REST API route handlers.
//!
//! Provides endpoints for invoice submission, instance inspection, the
//! review queue and service health.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use invoiceflow_engine::stages::validate_submission;
use invoiceflow_engine::{
    EngineError, InstanceStatus, InvoiceDocument, Priority, RunOutcome, Stage, Verdict,
    WorkflowInstance,
};
use invoiceflow_store::{AuditEntry, PendingReview};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

type ApiResult<T> = Result<T, ApiError>;

/// Filter and paging parameters of the list endpoints.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListParams {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ListParams {
    fn page(&self) -> (i64, i64) {
        (
            self.limit.unwrap_or(50).clamp(1, 500),
            self.offset.unwrap_or(0).max(0),
        )
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct WaitParams {
    /// Hold the response until the triggered run stops.
    pub wait: bool,
}

/// Where a run stopped, as reported to HTTP clients.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub status: InstanceStatus,
    pub stage: Stage,
}

async fn finish(handle: JoinHandle<invoiceflow_engine::Result<RunOutcome>>) -> ApiResult<RunReport> {
    let outcome = handle.await.map_err(EngineError::from)??;
    Ok(RunReport {
        status: outcome.status,
        stage: outcome.stage,
    })
}

// ---------------------------------------------------------------------------
// GET /api/health
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub instances: InstanceCounts,
    pub open_reviews: i64,
    pub cache: CacheFigures,
}

#[derive(Serialize)]
pub struct InstanceCounts {
    pub running: i64,
    pub paused: i64,
    pub completed: i64,
    pub failed: i64,
}

#[derive(Serialize)]
pub struct CacheFigures {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Report liveness and queue figures. Any store failure makes the whole
/// check fail with a 500.
pub async fn health(State(state): State<Arc<AppState>>) -> ApiResult<Json<HealthResponse>> {
    let stores = state.executor.stores();
    let count = |status| stores.checkpoints.count(status);
    let instances = InstanceCounts {
        running: count(InstanceStatus::Running).await.map_err(EngineError::from)?,
        paused: count(InstanceStatus::Paused).await.map_err(EngineError::from)?,
        completed: count(InstanceStatus::Completed).await.map_err(EngineError::from)?,
        failed: count(InstanceStatus::Failed).await.map_err(EngineError::from)?,
    };
    let open_reviews = stores.reviews.count_open().await.map_err(EngineError::from)?;
    let stats = stores.checkpoints.cache().stats();

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        instances,
        open_reviews,
        cache: CacheFigures {
            hits: stats.hits(),
            misses: stats.misses(),
            hit_rate: stats.hit_rate(),
        },
    }))
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

/// Request body for `POST /api/invoices`.
#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub invoice: InvoiceDocument,
    /// Defaults to `high` above the configured amount, `normal` otherwise.
    #[serde(default)]
    pub priority: Option<Priority>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub instance_id: String,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunReport>,
}

/// POST /api/invoices: create an instance and start running it.
pub async fn submit_invoice(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WaitParams>,
    Json(body): Json<SubmitBody>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    validate_submission(&body.invoice).map_err(|e| ApiError::Invalid(e.to_string()))?;

    let high_above: Decimal = state.executor.config().high_priority_amount;
    let priority = body.priority.unwrap_or(if body.invoice.amount > high_above {
        Priority::High
    } else {
        Priority::Normal
    });

    let instance_id = state.executor.submit(body.invoice, priority).await?;
    let handle = state.executor.spawn(instance_id.clone());
    info!(%instance_id, ?priority, "invoice accepted over http");

    let run = if params.wait {
        Some(finish(handle).await?)
    } else {
        None
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            instance_id,
            priority,
            run,
        }),
    ))
}

/// Row of the instance listing.
#[derive(Debug, Serialize)]
pub struct InstanceSummary {
    pub instance_id: String,
    pub invoice_id: String,
    pub vendor_name: String,
    pub amount: Decimal,
    pub status: InstanceStatus,
    pub stage: Stage,
    pub priority: Priority,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl From<WorkflowInstance> for InstanceSummary {
    fn from(inst: WorkflowInstance) -> Self {
        Self {
            failure: inst
                .failure
                .as_ref()
                .map(|f| format!("{}: {}", f.kind, f.message)),
            instance_id: inst.id,
            invoice_id: inst.document.invoice_id,
            vendor_name: inst.document.vendor_name,
            amount: inst.document.amount,
            status: inst.status,
            stage: inst.stage,
            priority: inst.priority,
            updated_at: inst.updated_at.to_rfc3339(),
        }
    }
}

/// GET /api/instances: latest state of each instance.
pub async fn list_instances(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<InstanceSummary>>> {
    let status = params
        .status
        .as_deref()
        .map(|s| InstanceStatus::parse(&s.to_uppercase()))
        .transpose()
        .map_err(|e| ApiError::Invalid(e.to_string()))?;
    let (limit, offset) = params.page();
    let instances = state.executor.list_instances(status, limit, offset).await?;
    Ok(Json(instances.into_iter().map(InstanceSummary::from).collect()))
}

/// GET /api/instances/{id}: full state plus checkpoint history.
pub async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let instance = state.executor.load(&id).await?;
    let history = state
        .executor
        .stores()
        .checkpoints
        .history(&id)
        .await
        .map_err(EngineError::from)?;
    Ok(Json(json!({ "instance": instance, "checkpoints": history })))
}

/// GET /api/instances/{id}/audit: the instance's audit trail in order.
pub async fn instance_audit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    // 404 for ids that never existed rather than an empty trail.
    state.executor.load(&id).await?;
    Ok(Json(state.executor.audit_trail(&id).await?))
}

// ---------------------------------------------------------------------------
// Reviews
// ---------------------------------------------------------------------------

/// GET /api/reviews: OPEN reviews, oldest first.
pub async fn list_reviews(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<PendingReview>>> {
    let (limit, offset) = params.page();
    Ok(Json(state.hitl.list_open(limit, offset).await?))
}

/// GET /api/reviews/{id}
pub async fn get_review(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<PendingReview>> {
    Ok(Json(state.hitl.get(&id).await?))
}

/// Request body for posting a verdict.
#[derive(Debug, Deserialize)]
pub struct VerdictBody {
    /// `ACCEPT` or `REJECT`, any case.
    pub verdict: String,
    #[serde(default)]
    pub rationale: String,
    pub reviewer: String,
}

#[derive(Debug, Serialize)]
pub struct VerdictResponse {
    pub review: PendingReview,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunReport>,
}

/// POST /api/reviews/{id}/verdict: resolve a review and resume its instance.
pub async fn post_verdict(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<WaitParams>,
    Json(body): Json<VerdictBody>,
) -> ApiResult<Json<VerdictResponse>> {
    let verdict = Verdict::parse(&body.verdict).map_err(|e| ApiError::Invalid(e.to_string()))?;
    if body.reviewer.trim().is_empty() {
        return Err(ApiError::Invalid("reviewer is required".into()));
    }

    let resolution = state
        .hitl
        .resolve(&id, verdict, &body.rationale, &body.reviewer)
        .await?;
    let run = if params.wait {
        Some(finish(resolution.run).await?)
    } else {
        None
    };
    Ok(Json(VerdictResponse {
        review: resolution.review,
        run,
    }))
}
