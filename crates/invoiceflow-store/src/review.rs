//! Pending human reviews.
//!
//! A review is created OPEN when an instance is routed to a human and moves
//! to RESOLVED exactly once. A partial unique index guarantees at most one
//! OPEN review per instance; resolution is a conditional update, so two
//! racing verdicts cannot both win.

use chrono::Utc;
use rusqlite::{OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
    Open,
    Resolved,
}

impl ReviewStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Resolved => "RESOLVED",
        }
    }

    pub fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "OPEN" => Ok(Self::Open),
            "RESOLVED" => Ok(Self::Resolved),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown review status: {other}"
            ))),
        }
    }
}

/// A reviewer's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Accept,
    Reject,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "ACCEPT",
            Self::Reject => "REJECT",
        }
    }

    pub fn parse(s: &str) -> StoreResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ACCEPT" => Ok(Self::Accept),
            "REJECT" => Ok(Self::Reject),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown verdict: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields supplied when an instance is routed to review.
#[derive(Debug, Clone)]
pub struct NewReview {
    pub instance_id: String,
    /// The match result that triggered the review.
    pub match_result: serde_json::Value,
    /// Where the verdict is delivered (the instance's resume entry point).
    pub callback: String,
    /// Human-readable hold reason.
    pub reason: String,
    /// Dashboard summary: invoice id, vendor, amount, review URL.
    pub summary: serde_json::Value,
}

/// A persisted review record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingReview {
    pub review_id: String,
    pub instance_id: String,
    pub match_result: serde_json::Value,
    pub callback: String,
    pub reason: String,
    pub summary: serde_json::Value,
    pub status: ReviewStatus,
    pub verdict: Option<Verdict>,
    pub rationale: Option<String>,
    pub reviewer: Option<String>,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

/// Result of [`ReviewStore::resolve`].
#[derive(Debug, Clone)]
pub enum ResolveOutcome {
    /// This call moved the review from OPEN to RESOLVED.
    Resolved(PendingReview),
    /// The review was already RESOLVED; the stored record is unchanged.
    AlreadyResolved(PendingReview),
    /// No review with that id exists.
    Unknown,
}

// ═══════════════════════════════════════════════════════════════════════
//  ReviewStore
// ═══════════════════════════════════════════════════════════════════════

const COLUMNS: &str = "review_id, instance_id, match_result, callback, reason, summary, status, \
                       verdict, rationale, reviewer, created_at, resolved_at";

#[derive(Clone)]
pub struct ReviewStore {
    db: Database,
}

impl ReviewStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create an OPEN review, or return the instance's existing OPEN review.
    ///
    /// The boolean is `true` when a new record was inserted.
    #[instrument(skip(self, review), fields(instance_id = %review.instance_id))]
    pub async fn create(&self, review: NewReview) -> StoreResult<(PendingReview, bool)> {
        let review_id = Uuid::now_v7().to_string();
        let match_result = serde_json::to_string(&review.match_result)?;
        let summary = serde_json::to_string(&review.summary)?;
        let now = Utc::now().timestamp_millis();

        let (row, created) = self
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let existing = tx
                    .query_row(
                        &format!(
                            "SELECT {COLUMNS} FROM pending_reviews \
                             WHERE instance_id = ?1 AND status = 'OPEN'"
                        ),
                        rusqlite::params![review.instance_id],
                        ReviewRow::from_row,
                    )
                    .optional()?;
                if let Some(row) = existing {
                    tx.commit()?;
                    return Ok((row, false));
                }

                tx.execute(
                    "INSERT INTO pending_reviews \
                     (review_id, instance_id, match_result, callback, reason, summary, status, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'OPEN', ?7)",
                    rusqlite::params![
                        review_id,
                        review.instance_id,
                        match_result,
                        review.callback,
                        review.reason,
                        summary,
                        now
                    ],
                )?;
                let row = tx.query_row(
                    &format!("SELECT {COLUMNS} FROM pending_reviews WHERE review_id = ?1"),
                    rusqlite::params![review_id],
                    ReviewRow::from_row,
                )?;
                tx.commit()?;
                Ok((row, true))
            })
            .await?;

        let review = row.into_review()?;
        if created {
            info!(review_id = %review.review_id, "review opened");
        } else {
            debug!(review_id = %review.review_id, "open review already exists");
        }
        Ok((review, created))
    }

    #[instrument(skip(self))]
    pub async fn get(&self, review_id: &str) -> StoreResult<Option<PendingReview>> {
        let id = review_id.to_string();
        self.db
            .execute(move |conn| {
                conn.query_row(
                    &format!("SELECT {COLUMNS} FROM pending_reviews WHERE review_id = ?1"),
                    rusqlite::params![id],
                    ReviewRow::from_row,
                )
                .optional()?
                .map(ReviewRow::into_review)
                .transpose()
            })
            .await
    }

    /// The most recently created review for the instance, in any status.
    pub async fn latest_for_instance(
        &self,
        instance_id: &str,
    ) -> StoreResult<Option<PendingReview>> {
        let id = instance_id.to_string();
        self.db
            .execute(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {COLUMNS} FROM pending_reviews \
                         WHERE instance_id = ?1 ORDER BY created_at DESC, review_id DESC LIMIT 1"
                    ),
                    rusqlite::params![id],
                    ReviewRow::from_row,
                )
                .optional()?
                .map(ReviewRow::into_review)
                .transpose()
            })
            .await
    }

    /// OPEN reviews, oldest first.
    #[instrument(skip(self))]
    pub async fn list_open(&self, limit: i64, offset: i64) -> StoreResult<Vec<PendingReview>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM pending_reviews WHERE status = 'OPEN' \
                     ORDER BY created_at ASC, review_id ASC LIMIT ?1 OFFSET ?2"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![limit, offset], ReviewRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(ReviewRow::into_review).collect()
            })
            .await
    }

    /// Record a verdict. Only the first call for a review takes effect.
    #[instrument(skip(self, rationale), fields(verdict = %verdict))]
    pub async fn resolve(
        &self,
        review_id: &str,
        verdict: Verdict,
        rationale: &str,
        reviewer: &str,
    ) -> StoreResult<ResolveOutcome> {
        let id = review_id.to_string();
        let rationale = rationale.to_string();
        let reviewer = reviewer.to_string();
        let now = Utc::now().timestamp_millis();

        let outcome = self
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let changed = tx.execute(
                    "UPDATE pending_reviews \
                     SET status = 'RESOLVED', verdict = ?2, rationale = ?3, reviewer = ?4, resolved_at = ?5 \
                     WHERE review_id = ?1 AND status = 'OPEN'",
                    rusqlite::params![id, verdict.as_str(), rationale, reviewer, now],
                )?;
                let row = tx
                    .query_row(
                        &format!("SELECT {COLUMNS} FROM pending_reviews WHERE review_id = ?1"),
                        rusqlite::params![id],
                        ReviewRow::from_row,
                    )
                    .optional()?;
                tx.commit()?;

                Ok(match row {
                    None => RawOutcome::Unknown,
                    Some(row) if changed == 1 => RawOutcome::Resolved(row),
                    Some(row) => RawOutcome::AlreadyResolved(row),
                })
            })
            .await?;

        let outcome = match outcome {
            RawOutcome::Unknown => ResolveOutcome::Unknown,
            RawOutcome::Resolved(row) => {
                info!(review_id, "review resolved");
                ResolveOutcome::Resolved(row.into_review()?)
            }
            RawOutcome::AlreadyResolved(row) => ResolveOutcome::AlreadyResolved(row.into_review()?),
        };
        Ok(outcome)
    }

    /// Number of OPEN reviews.
    pub async fn count_open(&self) -> StoreResult<i64> {
        self.db
            .execute(|conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM pending_reviews WHERE status = 'OPEN'",
                    [],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Internal row mapping
// ═══════════════════════════════════════════════════════════════════════

enum RawOutcome {
    Resolved(ReviewRow),
    AlreadyResolved(ReviewRow),
    Unknown,
}

struct ReviewRow {
    review_id: String,
    instance_id: String,
    match_result: String,
    callback: String,
    reason: String,
    summary: String,
    status: String,
    verdict: Option<String>,
    rationale: Option<String>,
    reviewer: Option<String>,
    created_at: i64,
    resolved_at: Option<i64>,
}

impl ReviewRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            review_id: row.get(0)?,
            instance_id: row.get(1)?,
            match_result: row.get(2)?,
            callback: row.get(3)?,
            reason: row.get(4)?,
            summary: row.get(5)?,
            status: row.get(6)?,
            verdict: row.get(7)?,
            rationale: row.get(8)?,
            reviewer: row.get(9)?,
            created_at: row.get(10)?,
            resolved_at: row.get(11)?,
        })
    }

    fn into_review(self) -> StoreResult<PendingReview> {
        Ok(PendingReview {
            match_result: serde_json::from_str(&self.match_result)?,
            summary: serde_json::from_str(&self.summary)?,
            status: ReviewStatus::parse(&self.status)?,
            verdict: self.verdict.as_deref().map(Verdict::parse).transpose()?,
            review_id: self.review_id,
            instance_id: self.instance_id,
            callback: self.callback,
            reason: self.reason,
            rationale: self.rationale,
            reviewer: self.reviewer,
            created_at: self.created_at,
            resolved_at: self.resolved_at,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────
