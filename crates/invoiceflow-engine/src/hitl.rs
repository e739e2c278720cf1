//! Human review gateway.
//!
//! Reviews are opened by the `CHECKPOINT_HITL` stage and resolved from the
//! outside (HTTP, CLI). Resolution is first-writer-wins: the first verdict
//! on an OPEN review is recorded and resumes the instance; any later one
//! gets [`EngineError::AlreadyResolved`] and changes nothing.

use invoiceflow_store::{InstanceStatus, PendingReview, ResolveOutcome, ReviewStatus, Verdict};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::error::{EngineError, Result};
use crate::executor::{Executor, RunOutcome};
use crate::stage::Stage;
use crate::stages::{self, MatchOutput};

/// A recorded verdict and the run it set off.
#[derive(Debug)]
pub struct Resolution {
    pub review: PendingReview,
    pub run: JoinHandle<Result<RunOutcome>>,
}

#[derive(Clone)]
pub struct HitlGateway {
    executor: Executor,
}

impl HitlGateway {
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }

    /// Open a review for an instance whose match has been recorded.
    ///
    /// Idempotent: while the instance has an OPEN review, that review is
    /// returned instead of a new one.
    #[instrument(skip(self))]
    pub async fn create_review(&self, instance_id: &str) -> Result<PendingReview> {
        let instance = self.executor.load(instance_id).await?;
        let record = instance.record(Stage::Match).ok_or_else(|| {
            EngineError::conflict(instance_id, "no match result recorded for this instance")
        })?;
        let matched: MatchOutput = serde_json::from_value(record.output.clone())?;
        let request = stages::review_request(&instance, &matched, self.executor.config());

        let (review, created) = self.executor.stores().reviews.create(request).await?;
        if created {
            info!(review_id = %review.review_id, "review opened");
        }
        Ok(review)
    }

    pub async fn get(&self, review_id: &str) -> Result<PendingReview> {
        self.executor
            .stores()
            .reviews
            .get(review_id)
            .await?
            .ok_or_else(|| EngineError::UnknownReview(review_id.to_string()))
    }

    /// OPEN reviews, oldest first.
    pub async fn list_open(&self, limit: i64, offset: i64) -> Result<Vec<PendingReview>> {
        Ok(self.executor.stores().reviews.list_open(limit, offset).await?)
    }

    /// Record a verdict and resume the paused instance.
    ///
    /// Once the verdict is stored the call succeeds; if the instance cannot
    /// be resumed right away the hand-over continues on the returned run.
    #[instrument(skip(self, rationale))]
    pub async fn resolve(
        &self,
        review_id: &str,
        verdict: Verdict,
        rationale: &str,
        reviewer: &str,
    ) -> Result<Resolution> {
        let review = self.get(review_id).await?;
        if review.status == ReviewStatus::Resolved {
            return Err(EngineError::AlreadyResolved(review_id.to_string()));
        }

        let instance = self.executor.load(&review.instance_id).await?;
        if instance.status != InstanceStatus::Paused || instance.stage != Stage::HitlDecision {
            return Err(EngineError::conflict(
                &instance.id,
                format!(
                    "instance is {} at {}; only PAUSED instances accept verdicts",
                    instance.status, instance.stage
                ),
            ));
        }

        let resolved = match self
            .executor
            .stores()
            .reviews
            .resolve(review_id, verdict, rationale, reviewer)
            .await?
        {
            ResolveOutcome::Resolved(review) => review,
            ResolveOutcome::AlreadyResolved(_) => {
                warn!("lost the race to resolve review");
                return Err(EngineError::AlreadyResolved(review_id.to_string()));
            }
            ResolveOutcome::Unknown => {
                return Err(EngineError::UnknownReview(review_id.to_string()));
            }
        };

        // The verdict is recorded now; from here on the hand-over must not be
        // lost, only deferred.
        let run = match self.executor.resume(&resolved).await {
            Ok(()) => self.executor.spawn(resolved.instance_id.clone()),
            Err(e) => {
                warn!(instance_id = %resolved.instance_id, error = %e, "inline hand-over failed; deferring");
                self.executor.spawn_resume(resolved.clone())
            }
        };
        info!(instance_id = %resolved.instance_id, %verdict, "review resolved");

        Ok(Resolution {
            review: resolved,
            run,
        })
    }
}
