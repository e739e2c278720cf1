//! Durable workflow executor.
//!
//! The executor drives one instance at a time per execution unit through
//! the stage graph. After every stage it writes a full checkpoint, so a
//! process that dies at any point can pick the instance up again from its
//! latest checkpoint with no completed stage re-executed.
//!
//! Per stage the order of effects is:
//!
//! 1. `ENTER` audit entry
//! 2. stage handler (its tool calls and decisions audit themselves)
//! 3. checkpoint with the output appended and the transition applied
//! 4. `EXIT` audit entry
//!
//! A crash between 3 and 4 leaves an `ENTER` without an `EXIT`; the next
//! run closes it before continuing.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use invoiceflow_store::{
    AuditEntry, AuditKind, AuditTrail, CheckpointStore, Database, InstanceStatus, NewCheckpoint,
    PendingReview, ReviewStatus, ReviewStore, SnapshotCache,
};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, instrument, warn};

use crate::calls::StageCalls;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result, StageError};
use crate::instance::{InvoiceDocument, Priority, VerdictRecord, WorkflowInstance};
use crate::oracle::DecisionOracle;
use crate::stage::{Stage, Transition};
use crate::stages::{self, StageEnv};
use crate::tools::ToolInvoker;

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// The three persistent stores the executor writes to. All share one
/// database.
#[derive(Clone)]
pub struct Stores {
    pub checkpoints: CheckpointStore,
    pub audit: AuditTrail,
    pub reviews: ReviewStore,
}

impl Stores {
    pub fn new(db: Database) -> Self {
        Self {
            checkpoints: CheckpointStore::new(db.clone()),
            audit: AuditTrail::new(db.clone()),
            reviews: ReviewStore::new(db),
        }
    }

    pub fn with_cache(db: Database, cache: SnapshotCache) -> Self {
        Self {
            checkpoints: CheckpointStore::with_cache(db.clone(), cache),
            audit: AuditTrail::new(db.clone()),
            reviews: ReviewStore::new(db),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Where a run left the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub instance_id: String,
    pub status: InstanceStatus,
    pub stage: Stage,
}

impl RunOutcome {
    fn of(instance: &WorkflowInstance) -> Self {
        Self {
            instance_id: instance.id.clone(),
            status: instance.status,
            stage: instance.stage,
        }
    }
}

/// Result of [`Executor::recover`].
#[derive(Debug, Default)]
pub struct Recovery {
    /// Instances handed back to an execution unit.
    pub resumed: Vec<(String, JoinHandle<Result<RunOutcome>>)>,
    /// Instances waiting on a human verdict.
    pub parked: Vec<String>,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

const CLAIM_POLL: Duration = Duration::from_millis(10);
const HANDOVER_ATTEMPTS: u32 = 5;
const HANDOVER_BACKOFF: Duration = Duration::from_millis(200);

struct Inner {
    stores: Stores,
    oracle: Arc<dyn DecisionOracle>,
    tools: Arc<dyn ToolInvoker>,
    config: EngineConfig,
    /// Instances currently owned by an execution unit in this process.
    active: DashMap<String, ()>,
}

/// Releases an instance claim when dropped.
struct Claim {
    inner: Arc<Inner>,
    instance_id: String,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.inner.active.remove(&self.instance_id);
    }
}

/// Cheap to clone; clones share stores, collaborators and claims.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    pub fn new(
        stores: Stores,
        oracle: Arc<dyn DecisionOracle>,
        tools: Arc<dyn ToolInvoker>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                stores,
                oracle,
                tools,
                config,
                active: DashMap::new(),
            }),
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.inner.stores
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Whether an execution unit in this process currently owns `instance_id`.
    pub fn is_active(&self, instance_id: &str) -> bool {
        self.inner.active.contains_key(instance_id)
    }

    fn claim(&self, instance_id: &str) -> Result<Claim> {
        match self.inner.active.entry(instance_id.to_string()) {
            Entry::Occupied(_) => Err(EngineError::AlreadyActive(instance_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(Claim {
                    inner: Arc::clone(&self.inner),
                    instance_id: instance_id.to_string(),
                })
            }
        }
    }

    /// Like [`Self::claim`], but waits up to the configured claim wait for
    /// the current owner to finish.
    async fn claim_when_free(&self, instance_id: &str) -> Result<Claim> {
        let deadline = Instant::now() + self.inner.config.claim_wait();
        loop {
            match self.claim(instance_id) {
                Err(EngineError::AlreadyActive(_)) if Instant::now() < deadline => {
                    sleep(CLAIM_POLL).await;
                }
                other => return other,
            }
        }
    }

    // -- instance state -----------------------------------------------------

    /// Create an instance at `INTAKE` and write its first checkpoint.
    #[instrument(skip(self, document), fields(invoice_id = %document.invoice_id))]
    pub async fn submit(&self, document: InvoiceDocument, priority: Priority) -> Result<String> {
        let instance = WorkflowInstance::new(document, priority);
        self.persist(&instance).await?;
        info!(instance_id = %instance.id, ?priority, "instance submitted");
        Ok(instance.id)
    }

    /// Latest checkpointed state of an instance.
    pub async fn load(&self, instance_id: &str) -> Result<WorkflowInstance> {
        let stored = self
            .inner
            .stores
            .checkpoints
            .get_latest(instance_id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))?;
        Ok(serde_json::from_value(stored.state)?)
    }

    /// Latest state of every instance, optionally filtered by status.
    pub async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WorkflowInstance>> {
        let stored = self
            .inner
            .stores
            .checkpoints
            .list_latest(status, limit, offset)
            .await?;
        stored
            .into_iter()
            .map(|s| serde_json::from_value(s.state).map_err(EngineError::from))
            .collect()
    }

    pub async fn audit_trail(&self, instance_id: &str) -> Result<Vec<AuditEntry>> {
        Ok(self.inner.stores.audit.entries(instance_id).await?)
    }

    async fn persist(&self, instance: &WorkflowInstance) -> Result<i64> {
        let version = self
            .inner
            .stores
            .checkpoints
            .put(
                &instance.id,
                NewCheckpoint {
                    stage: instance.stage.as_str().to_string(),
                    status: instance.status,
                    priority: instance.priority.as_i64(),
                    state: serde_json::to_value(instance)?,
                },
            )
            .await?;
        debug!(instance_id = %instance.id, version, stage = %instance.stage, "checkpoint written");
        Ok(version)
    }

    // -- execution ----------------------------------------------------------

    /// Drive an instance until it pauses, completes or fails.
    ///
    /// An error return means the run stopped for a reason outside the
    /// instance (persistence, a claim held elsewhere); the instance keeps its
    /// last checkpoint and can be run again.
    #[instrument(skip(self))]
    pub async fn run(&self, instance_id: &str) -> Result<RunOutcome> {
        let _claim = self.claim(instance_id)?;
        let mut instance = self.load(instance_id).await?;

        if instance.status == InstanceStatus::Running {
            self.close_interrupted_stage(&instance).await?;
        }

        while instance.status == InstanceStatus::Running {
            let stage = instance.stage;
            if let Some(record) = instance.record(stage) {
                let transition = record.transition.clone();
                debug!(instance_id, %stage, "stage output already recorded; not re-executing");
                instance.apply(&transition);
                self.persist(&instance).await?;
                continue;
            }
            self.step(&mut instance).await?;
        }

        info!(
            instance_id,
            status = %instance.status,
            stage = %instance.stage,
            "run finished"
        );
        Ok(RunOutcome::of(&instance))
    }

    /// Run an instance on its own task.
    pub fn spawn(&self, instance_id: impl Into<String>) -> JoinHandle<Result<RunOutcome>> {
        let executor = self.clone();
        let instance_id = instance_id.into();
        tokio::spawn(async move {
            let outcome = executor.run(&instance_id).await;
            if let Err(e) = &outcome {
                error!(%instance_id, error = %e, "instance run aborted");
            }
            outcome
        })
    }

    /// If the audit trail ends inside a stage whose output the checkpoint
    /// already holds, the previous run died between checkpoint and `EXIT`.
    async fn close_interrupted_stage(&self, instance: &WorkflowInstance) -> Result<()> {
        let audit = &self.inner.stores.audit;
        let entries = audit.entries(&instance.id).await?;
        let open = entries
            .iter()
            .rev()
            .find(|e| matches!(e.kind, AuditKind::Enter | AuditKind::Exit | AuditKind::Error))
            .filter(|e| e.kind == AuditKind::Enter);

        let Some(enter) = open else {
            return Ok(());
        };
        let Some(stage) = Stage::parse(&enter.stage) else {
            return Ok(());
        };
        if let Some(record) = instance.record(stage) {
            warn!(instance_id = %instance.id, %stage, "closing stage interrupted after checkpoint");
            audit
                .append(
                    &instance.id,
                    stage.as_str(),
                    AuditKind::Exit,
                    json!({ "transition": record.transition, "recovered": true }),
                )
                .await?;
        }
        Ok(())
    }

    /// Execute the current stage once and checkpoint the result.
    async fn step(&self, instance: &mut WorkflowInstance) -> Result<()> {
        let inner = &self.inner;
        let stage = instance.stage;
        let instance_id = instance.id.clone();

        inner
            .stores
            .audit
            .append(
                &instance_id,
                stage.as_str(),
                AuditKind::Enter,
                json!({ "priority": instance.priority, "completed": instance.completed_stages() }),
            )
            .await?;

        let env = StageEnv {
            config: &inner.config,
            reviews: &inner.stores.reviews,
        };
        let mut calls = StageCalls::new(
            &instance_id,
            stage,
            &inner.stores.audit,
            inner.oracle.as_ref(),
            inner.tools.as_ref(),
            inner.config.retry_for(stage).clone(),
            inner.config.call_timeout(),
        );
        let result = stages::execute(stage, instance, &env, &mut calls).await;
        let retries = calls.retries();
        instance.add_retries(stage, retries);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(StageError::Store(e)) => return Err(e.into()),
            Err(err) => return self.fail_stage(instance, stage, &err, retries).await,
        };

        if !stage.permits(&outcome.transition) {
            let illegal = EngineError::IllegalTransition {
                from: stage,
                to: outcome.transition.to_string(),
            };
            let message = illegal.to_string();
            inner
                .stores
                .audit
                .append(
                    &instance_id,
                    stage.as_str(),
                    AuditKind::Error,
                    json!({ "kind": "ILLEGAL_TRANSITION", "message": message }),
                )
                .await?;
            instance.fail(stage, "ILLEGAL_TRANSITION", message);
            self.persist(instance).await?;
            return Err(illegal);
        }

        let transition: Transition = outcome.transition;
        instance.append(stage, outcome.output, transition.clone())?;
        instance.apply(&transition);
        self.persist(instance).await?;

        inner
            .stores
            .audit
            .append(
                &instance_id,
                stage.as_str(),
                AuditKind::Exit,
                json!({ "transition": transition, "retries": retries, "status": instance.status }),
            )
            .await?;

        info!(instance_id = %instance_id, %stage, %transition, retries, "stage completed");
        Ok(())
    }

    async fn fail_stage(
        &self,
        instance: &mut WorkflowInstance,
        stage: Stage,
        err: &StageError,
        retries: u32,
    ) -> Result<()> {
        warn!(instance_id = %instance.id, %stage, kind = err.kind(), error = %err, "stage failed");
        self.inner
            .stores
            .audit
            .append(
                &instance.id,
                stage.as_str(),
                AuditKind::Error,
                json!({ "kind": err.kind(), "message": err.to_string(), "retries": retries }),
            )
            .await?;
        instance.fail(stage, err.kind(), err.to_string());
        self.persist(instance).await?;
        Ok(())
    }

    // -- human review -------------------------------------------------------

    /// Hand a resolved review's verdict to its paused instance and mark the
    /// instance RUNNING again. Does not start execution; see [`Self::spawn`].
    ///
    /// The run that paused the instance may still hold it for a moment after
    /// its PAUSED checkpoint; the claim is awaited for up to
    /// [`EngineConfig::claim_wait_ms`].
    #[instrument(skip(self, review), fields(review_id = %review.review_id, instance_id = %review.instance_id))]
    pub async fn resume(&self, review: &PendingReview) -> Result<()> {
        let _claim = self.claim_when_free(&review.instance_id).await?;
        let mut instance = self.load(&review.instance_id).await?;

        if instance.status != InstanceStatus::Paused || instance.stage != Stage::HitlDecision {
            return Err(EngineError::conflict(
                &instance.id,
                format!("expected PAUSED at HITL_DECISION, found {} at {}", instance.status, instance.stage),
            ));
        }
        if instance.has_output(Stage::HitlDecision) {
            return Err(EngineError::conflict(&instance.id, "verdict already consumed"));
        }
        let verdict = match (review.status, review.verdict) {
            (ReviewStatus::Resolved, Some(verdict)) => verdict,
            _ => {
                return Err(EngineError::conflict(
                    &instance.id,
                    format!("review {} carries no verdict", review.review_id),
                ));
            }
        };

        let record = VerdictRecord {
            review_id: review.review_id.clone(),
            verdict,
            rationale: review.rationale.clone().unwrap_or_default(),
            reviewer: review.reviewer.clone().unwrap_or_default(),
        };
        self.inner
            .stores
            .audit
            .append(
                &instance.id,
                Stage::HitlDecision.as_str(),
                AuditKind::Decision,
                json!({ "source": "human", "verdict": record }),
            )
            .await?;

        instance.pending_verdict = Some(record);
        instance.status = InstanceStatus::Running;
        instance.updated_at = chrono::Utc::now();
        self.persist(&instance).await?;

        info!(%verdict, "instance resumed with human verdict");
        Ok(())
    }

    /// Resume `review`'s instance on its own task, then run it.
    ///
    /// Used when a recorded verdict could not be handed over inline. The
    /// hand-over is retried a few times; a conflict (the verdict was already
    /// consumed, the instance moved on) ends it. Whatever is still left over
    /// is picked up by [`Self::recover`].
    pub fn spawn_resume(&self, review: PendingReview) -> JoinHandle<Result<RunOutcome>> {
        let executor = self.clone();
        tokio::spawn(async move {
            let instance_id = review.instance_id.clone();
            let mut attempt = 1;
            loop {
                match executor.resume(&review).await {
                    Ok(()) => break,
                    Err(e @ EngineError::StateConflict { .. }) => {
                        warn!(%instance_id, error = %e, "verdict hand-over abandoned");
                        return Err(e);
                    }
                    Err(e) if attempt < HANDOVER_ATTEMPTS => {
                        warn!(%instance_id, attempt, error = %e, "verdict hand-over failed; retrying");
                        sleep(HANDOVER_BACKOFF * attempt).await;
                        attempt += 1;
                    }
                    Err(e) => {
                        error!(%instance_id, error = %e, "verdict hand-over failed; left for recovery");
                        return Err(e);
                    }
                }
            }
            let outcome = executor.run(&instance_id).await;
            if let Err(e) = &outcome {
                error!(%instance_id, error = %e, "instance run aborted");
            }
            outcome
        })
    }

    // -- recovery -----------------------------------------------------------

    /// Pick up every non-terminal instance after a restart.
    ///
    /// RUNNING instances are re-spawned in priority order. A PAUSED instance
    /// whose review was resolved but never handed over is resumed; the rest
    /// stay parked until a verdict arrives.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<Recovery> {
        let ids = self.inner.stores.checkpoints.list_pending().await?;
        let mut recovery = Recovery::default();

        for id in ids {
            if self.is_active(&id) {
                continue;
            }
            let instance = self.load(&id).await?;
            match instance.status {
                InstanceStatus::Running => {
                    let handle = self.spawn(id.clone());
                    recovery.resumed.push((id, handle));
                }
                InstanceStatus::Paused => {
                    let review = self.inner.stores.reviews.latest_for_instance(&id).await?;
                    match review {
                        Some(review)
                            if review.status == ReviewStatus::Resolved
                                && !instance.has_output(Stage::HitlDecision) =>
                        {
                            let handle = self.spawn_resume(review);
                            recovery.resumed.push((id, handle));
                        }
                        _ => recovery.parked.push(id),
                    }
                }
                InstanceStatus::Completed | InstanceStatus::Failed => {}
            }
        }

        info!(
            resumed = recovery.resumed.len(),
            parked = recovery.parked.len(),
            "recovery scan finished"
        );
        Ok(recovery)
    }
}
