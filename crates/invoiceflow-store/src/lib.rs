//! # invoiceflow-store
//!
//! Durable state for InvoiceFlow.
//!
//! Provides SQLite-backed persistence in WAL mode for the three records the
//! workflow engine relies on across restarts: versioned instance
//! checkpoints, the append-only audit trail, and the human review queue.
//! A `moka` hot cache fronts the latest checkpoint per instance.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  SnapshotCache (moka, latest per id)     │
//! ├──────────────────────────────────────────┤
//! │  CheckpointStore (versions + heads)      │
//! │  AuditTrail      (append-only, per id)   │
//! │  ReviewStore     (OPEN -> RESOLVED once) │
//! │  KeyedLocks      (per-instance writers)  │
//! ├──────────────────────────────────────────┤
//! │  Database (rusqlite WAL, sync=FULL)      │
//! │  Migrations (versioned, transactional)   │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use invoiceflow_store::{CheckpointStore, Database, InstanceStatus, NewCheckpoint};
//!
//! let db = Database::open_and_migrate("data/invoiceflow.db").await?;
//! let checkpoints = CheckpointStore::new(db.clone());
//! let version = checkpoints
//!     .put("inst-1", NewCheckpoint {
//!         stage: "INTAKE".into(),
//!         status: InstanceStatus::Running,
//!         priority: 2,
//!         state: serde_json::json!({}),
//!     })
//!     .await?;
//! ```

pub mod audit;
pub mod cache;
pub mod checkpoint;
pub mod db;
pub mod error;
pub mod locks;
pub mod migration;
pub mod review;

// ── re-exports ───────────────────────────────────────────────────────

pub use audit::{AuditEntry, AuditKind, AuditTrail};
pub use cache::{CacheStats, SnapshotCache};
pub use checkpoint::{
    CheckpointHeader, CheckpointStore, InstanceStatus, NewCheckpoint, StoredCheckpoint,
};
pub use db::{Database, StoreConfig, Synchronous};
pub use error::{StoreError, StoreResult};
pub use locks::{KeyGuard, KeyedLocks};
pub use review::{NewReview, PendingReview, ResolveOutcome, ReviewStatus, ReviewStore, Verdict};
