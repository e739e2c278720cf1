//! Versioned checkpoint log for workflow instances.
//!
//! Every `put` appends a new immutable version for the instance; nothing is
//! ever overwritten. The `instance_heads` table tracks the newest version so
//! that status queries and crash recovery never scan the whole log.
//!
//! `put` holds the instance's [`KeyedLocks`] guard for the whole write, so at
//! most one write per instance is in flight. It returns only after the
//! SQLite transaction committed under the configured `synchronous` level.

use chrono::Utc;
use rusqlite::{OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::cache::SnapshotCache;
use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::locks::KeyedLocks;

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// Lifecycle status of a workflow instance as recorded in its checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown instance status: {other}"
            ))),
        }
    }

    /// `COMPLETED` and `FAILED` are one-way.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A snapshot to append.
#[derive(Debug, Clone)]
pub struct NewCheckpoint {
    /// Stage the instance will execute next (or the terminal stage).
    pub stage: String,
    pub status: InstanceStatus,
    /// Scheduling priority, 0 = most urgent.
    pub priority: i64,
    /// Full serialized instance state.
    pub state: serde_json::Value,
}

/// A persisted, immutable checkpoint version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCheckpoint {
    pub instance_id: String,
    /// 1-based, strictly increasing per instance.
    pub version: i64,
    pub stage: String,
    pub status: InstanceStatus,
    pub priority: i64,
    pub state: serde_json::Value,
    /// Unix timestamp (milliseconds) when the version was written.
    pub created_at: i64,
}

/// Header of a checkpoint version without its state payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub version: i64,
    pub stage: String,
    pub status: InstanceStatus,
    pub created_at: i64,
}

// ═══════════════════════════════════════════════════════════════════════
//  CheckpointStore
// ═══════════════════════════════════════════════════════════════════════

/// Append-and-supersede log of instance snapshots.
#[derive(Clone)]
pub struct CheckpointStore {
    db: Database,
    locks: KeyedLocks,
    cache: SnapshotCache,
}

impl CheckpointStore {
    pub fn new(db: Database) -> Self {
        Self::with_cache(db, SnapshotCache::default())
    }

    pub fn with_cache(db: Database, cache: SnapshotCache) -> Self {
        Self {
            db,
            locks: KeyedLocks::new(),
            cache,
        }
    }

    /// Append a new checkpoint version and return its version number.
    #[instrument(skip(self, checkpoint), fields(stage = %checkpoint.stage, status = %checkpoint.status))]
    pub async fn put(&self, instance_id: &str, checkpoint: NewCheckpoint) -> StoreResult<i64> {
        if instance_id.is_empty() {
            return Err(StoreError::InvalidArgument("empty instance id".into()));
        }

        let _guard = self.locks.lock(instance_id).await;

        let id = instance_id.to_string();
        let state_json = serde_json::to_string(&checkpoint.state)?;
        let stage = checkpoint.stage.clone();
        let status = checkpoint.status.as_str();
        let priority = checkpoint.priority;
        let now = Utc::now().timestamp_millis();

        let version = self
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let version: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(version), 0) + 1 FROM checkpoints WHERE instance_id = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "INSERT INTO checkpoints (instance_id, version, stage, status, priority, state, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![id, version, stage, status, priority, state_json, now],
                )?;
                tx.execute(
                    "INSERT INTO instance_heads (instance_id, version, stage, status, priority, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6) \
                     ON CONFLICT(instance_id) DO UPDATE SET \
                        version = excluded.version, stage = excluded.stage, status = excluded.status, \
                        priority = excluded.priority, updated_at = excluded.updated_at",
                    rusqlite::params![id, version, stage, status, priority, now],
                )?;
                tx.commit()?;
                Ok(version)
            })
            .await?;

        self.cache
            .offer(StoredCheckpoint {
                instance_id: instance_id.to_string(),
                version,
                stage: checkpoint.stage,
                status: checkpoint.status,
                priority: checkpoint.priority,
                state: checkpoint.state,
                created_at: now,
            })
            .await;

        debug!(instance_id, version, "checkpoint written");
        Ok(version)
    }

    /// The highest-version checkpoint for `instance_id`, if any.
    #[instrument(skip(self))]
    pub async fn get_latest(&self, instance_id: &str) -> StoreResult<Option<StoredCheckpoint>> {
        if let Some(hit) = self.cache.get(instance_id).await {
            return Ok(Some(hit));
        }

        let id = instance_id.to_string();
        self.db
            .execute(move |conn| {
                conn.query_row(
                    "SELECT instance_id, version, stage, status, priority, state, created_at \
                     FROM checkpoints WHERE instance_id = ?1 ORDER BY version DESC LIMIT 1",
                    rusqlite::params![id],
                    CheckpointRow::from_row,
                )
                .optional()?
                .map(CheckpointRow::into_stored)
                .transpose()
            })
            .await
    }

    /// A specific historical version.
    #[instrument(skip(self))]
    pub async fn get_version(
        &self,
        instance_id: &str,
        version: i64,
    ) -> StoreResult<Option<StoredCheckpoint>> {
        let id = instance_id.to_string();
        self.db
            .execute(move |conn| {
                conn.query_row(
                    "SELECT instance_id, version, stage, status, priority, state, created_at \
                     FROM checkpoints WHERE instance_id = ?1 AND version = ?2",
                    rusqlite::params![id, version],
                    CheckpointRow::from_row,
                )
                .optional()?
                .map(CheckpointRow::into_stored)
                .transpose()
            })
            .await
    }

    /// All versions of an instance, oldest first, without state payloads.
    #[instrument(skip(self))]
    pub async fn history(&self, instance_id: &str) -> StoreResult<Vec<CheckpointHeader>> {
        let id = instance_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT version, stage, status, created_at FROM checkpoints \
                     WHERE instance_id = ?1 ORDER BY version ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![id], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                rows.into_iter()
                    .map(|(version, stage, status, created_at)| {
                        Ok(CheckpointHeader {
                            version,
                            stage,
                            status: InstanceStatus::parse(&status)?,
                            created_at,
                        })
                    })
                    .collect()
            })
            .await
    }

    /// Instances whose latest status is `RUNNING` or `PAUSED`.
    ///
    /// Ordered by priority (most urgent first), then by age.
    #[instrument(skip(self))]
    pub async fn list_pending(&self) -> StoreResult<Vec<String>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT instance_id FROM instance_heads \
                     WHERE status IN ('RUNNING', 'PAUSED') \
                     ORDER BY priority ASC, created_at ASC",
                )?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ids)
            })
            .await
    }

    /// Latest checkpoint of every instance, most recently updated first.
    #[instrument(skip(self))]
    pub async fn list_latest(
        &self,
        status: Option<InstanceStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<StoredCheckpoint>> {
        let status = status.map(|s| s.as_str());
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT c.instance_id, c.version, c.stage, c.status, c.priority, c.state, c.created_at \
                     FROM instance_heads h \
                     JOIN checkpoints c ON c.instance_id = h.instance_id AND c.version = h.version \
                     WHERE ?1 IS NULL OR h.status = ?1 \
                     ORDER BY h.updated_at DESC, h.instance_id ASC LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![status, limit, offset], CheckpointRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;

                rows.into_iter().map(CheckpointRow::into_stored).collect()
            })
            .await
    }

    /// Number of instances whose latest status is `status`.
    #[instrument(skip(self))]
    pub async fn count(&self, status: InstanceStatus) -> StoreResult<i64> {
        let status = status.as_str();
        self.db
            .execute(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM instance_heads WHERE status = ?1",
                    rusqlite::params![status],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Internal row mapping
// ═══════════════════════════════════════════════════════════════════════

/// Raw row before JSON and enum decoding, so the rusqlite closure stays
/// infallible with respect to `StoreError`.
struct CheckpointRow {
    instance_id: String,
    version: i64,
    stage: String,
    status: String,
    priority: i64,
    state: String,
    created_at: i64,
}

impl CheckpointRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            instance_id: row.get(0)?,
            version: row.get(1)?,
            stage: row.get(2)?,
            status: row.get(3)?,
            priority: row.get(4)?,
            state: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_stored(self) -> StoreResult<StoredCheckpoint> {
        Ok(StoredCheckpoint {
            status: InstanceStatus::parse(&self.status)?,
            state: serde_json::from_str(&self.state)?,
            instance_id: self.instance_id,
            version: self.version,
            stage: self.stage,
            priority: self.priority,
            created_at: self.created_at,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────
