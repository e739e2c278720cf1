//! Append-only audit trail.
//!
//! Entries are numbered per instance starting at 1 and are never updated or
//! deleted (SQLite triggers reject both). Appends for one instance are
//! serialised, so sequence numbers are gap-free and reflect commit order.

use chrono::Utc;
use rusqlite::TransactionBehavior;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::locks::KeyedLocks;

/// What happened at a given point in a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    Enter,
    ToolCall,
    Decision,
    Exit,
    Error,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enter => "ENTER",
            Self::ToolCall => "TOOL_CALL",
            Self::Decision => "DECISION",
            Self::Exit => "EXIT",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "ENTER" => Ok(Self::Enter),
            "TOOL_CALL" => Ok(Self::ToolCall),
            "DECISION" => Ok(Self::Decision),
            "EXIT" => Ok(Self::Exit),
            "ERROR" => Ok(Self::Error),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown audit kind: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single persisted audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub instance_id: String,
    pub seq: i64,
    pub stage: String,
    pub kind: AuditKind,
    pub payload: serde_json::Value,
    /// Unix timestamp (milliseconds).
    pub recorded_at: i64,
}

/// Write-once event log, one sequence per instance.
#[derive(Clone)]
pub struct AuditTrail {
    db: Database,
    locks: KeyedLocks,
}

impl AuditTrail {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            locks: KeyedLocks::new(),
        }
    }

    /// Append an entry and return its sequence number.
    #[instrument(skip(self, payload), fields(kind = %kind))]
    pub async fn append(
        &self,
        instance_id: &str,
        stage: &str,
        kind: AuditKind,
        payload: serde_json::Value,
    ) -> StoreResult<i64> {
        let _guard = self.locks.lock(instance_id).await;

        let id = instance_id.to_string();
        let stage = stage.to_string();
        let payload = serde_json::to_string(&payload)?;
        let now = Utc::now().timestamp_millis();

        let seq = self
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let seq: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(seq), 0) + 1 FROM audit_entries WHERE instance_id = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "INSERT INTO audit_entries (instance_id, seq, stage, kind, payload, recorded_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![id, seq, stage, kind.as_str(), payload, now],
                )?;
                tx.commit()?;
                Ok(seq)
            })
            .await?;

        debug!(instance_id, seq, "audit entry appended");
        Ok(seq)
    }

    /// Every entry for `instance_id` in sequence order.
    pub async fn entries(&self, instance_id: &str) -> StoreResult<Vec<AuditEntry>> {
        self.entries_since(instance_id, 0).await
    }

    /// Entries with `seq > after`, in sequence order.
    #[instrument(skip(self))]
    pub async fn entries_since(&self, instance_id: &str, after: i64) -> StoreResult<Vec<AuditEntry>> {
        let id = instance_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT instance_id, seq, stage, kind, payload, recorded_at FROM audit_entries \
                     WHERE instance_id = ?1 AND seq > ?2 ORDER BY seq ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![id, after], |row| {
                        Ok(AuditRow {
                            instance_id: row.get(0)?,
                            seq: row.get(1)?,
                            stage: row.get(2)?,
                            kind: row.get(3)?,
                            payload: row.get(4)?,
                            recorded_at: row.get(5)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                rows.into_iter().map(AuditRow::into_entry).collect()
            })
            .await
    }

    /// Number of entries recorded for `instance_id`.
    pub async fn count(&self, instance_id: &str) -> StoreResult<i64> {
        let id = instance_id.to_string();
        self.db
            .execute(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM audit_entries WHERE instance_id = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
    }
}

struct AuditRow {
    instance_id: String,
    seq: i64,
    stage: String,
    kind: String,
    payload: String,
    recorded_at: i64,
}

impl AuditRow {
    fn into_entry(self) -> StoreResult<AuditEntry> {
        Ok(AuditEntry {
            kind: AuditKind::parse(&self.kind)?,
            payload: serde_json::from_str(&self.payload)?,
            instance_id: self.instance_id,
            seq: self.seq,
            stage: self.stage,
            recorded_at: self.recorded_at,
        })
    }
}
