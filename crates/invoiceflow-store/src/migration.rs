//! Versioned schema for checkpoints, the audit trail and the review queue.
//!
//! Applied versions are recorded in `_migrations`; [`run_all`] only runs
//! what is missing, one transaction per version.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// Append only; versions must increase.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "checkpoints: versioned instance snapshots plus head index",
        sql: r#"
            CREATE TABLE checkpoints (
                instance_id TEXT    NOT NULL,
                version     INTEGER NOT NULL,
                stage       TEXT    NOT NULL,
                status      TEXT    NOT NULL CHECK(status IN ('RUNNING','PAUSED','COMPLETED','FAILED')),
                priority    INTEGER NOT NULL DEFAULT 2,
                state       TEXT    NOT NULL,
                created_at  INTEGER NOT NULL,
                PRIMARY KEY (instance_id, version)
            ) WITHOUT ROWID;

            CREATE TABLE instance_heads (
                instance_id TEXT PRIMARY KEY,
                version     INTEGER NOT NULL,
                stage       TEXT    NOT NULL,
                status      TEXT    NOT NULL,
                priority    INTEGER NOT NULL DEFAULT 2,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            );
            CREATE INDEX idx_instance_heads_status ON instance_heads(status);
        "#,
    },
    Migration {
        version: 2,
        description: "audit trail: append-only per-instance event log",
        sql: r#"
            CREATE TABLE audit_entries (
                instance_id TEXT    NOT NULL,
                seq         INTEGER NOT NULL,
                stage       TEXT    NOT NULL,
                kind        TEXT    NOT NULL CHECK(kind IN ('ENTER','TOOL_CALL','DECISION','EXIT','ERROR')),
                payload     TEXT    NOT NULL,
                recorded_at INTEGER NOT NULL,
                PRIMARY KEY (instance_id, seq)
            ) WITHOUT ROWID;

            CREATE TRIGGER audit_entries_no_update BEFORE UPDATE ON audit_entries
            BEGIN
                SELECT RAISE(ABORT, 'audit entries are immutable');
            END;

            CREATE TRIGGER audit_entries_no_delete BEFORE DELETE ON audit_entries
            BEGIN
                SELECT RAISE(ABORT, 'audit entries are immutable');
            END;
        "#,
    },
    Migration {
        version: 3,
        description: "pending reviews: human-in-the-loop queue",
        sql: r#"
            CREATE TABLE pending_reviews (
                review_id    TEXT PRIMARY KEY,
                instance_id  TEXT NOT NULL,
                match_result TEXT NOT NULL,
                callback     TEXT NOT NULL,
                reason       TEXT NOT NULL,
                summary      TEXT NOT NULL DEFAULT '{}',
                status       TEXT NOT NULL CHECK(status IN ('OPEN','RESOLVED')),
                verdict      TEXT CHECK(verdict IS NULL OR verdict IN ('ACCEPT','REJECT')),
                rationale    TEXT,
                reviewer     TEXT,
                created_at   INTEGER NOT NULL,
                resolved_at  INTEGER
            );
            CREATE INDEX idx_pending_reviews_instance ON pending_reviews(instance_id);
            CREATE INDEX idx_pending_reviews_status ON pending_reviews(status);
            CREATE UNIQUE INDEX idx_pending_reviews_one_open
                ON pending_reviews(instance_id) WHERE status = 'OPEN';
        "#,
    },
];

// ── public API ───────────────────────────────────────────────────────

/// Run all pending migrations against `conn`.
///
/// This is a **synchronous** function; call it from `spawn_blocking`.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        debug!(schema_version = current, "schema up to date");
        return Ok(());
    }
    for migration in pending {
        apply(conn, migration)?;
    }

    info!(
        schema_version = MIGRATIONS.last().map_or(0, |m| m.version),
        "schema migrated"
    );
    Ok(())
}

/// Return the latest applied migration version, or 0 if none.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    let version: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::Migration {
            version: 0,
            message: format!("cannot read schema version: {e}"),
        })?;
    Ok(version)
}

// ── internals ────────────────────────────────────────────────────────

fn ensure_migrations_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })?;
    Ok(())
}

/// Apply one migration and record it, atomically.
fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    let failed = |stage: &str, e: rusqlite::Error| StoreError::Migration {
        version: migration.version,
        message: format!("{stage}: {e}"),
    };
    info!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );

    // Dropping the transaction without commit rolls it back.
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| failed("begin", e))?;
    if let Err(e) = tx.execute_batch(migration.sql) {
        warn!(version = migration.version, error = %e, "migration failed, rolling back");
        return Err(failed("schema", e));
    }
    tx.execute(
        "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![
            migration.version,
            migration.description,
            chrono::Utc::now().timestamp()
        ],
    )
    .map_err(|e| failed("record", e))?;
    tx.commit().map_err(|e| failed("commit", e))?;
    Ok(())
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_conn() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn migrations_are_ordered() {
        for window in MIGRATIONS.windows(2) {
            assert!(
                window[1].version > window[0].version,
                "migration versions must be strictly increasing: {} >= {}",
                window[0].version,
                window[1].version,
            );
        }
    }

    const LATEST_VERSION: u32 = 3;

    #[test]
    fn run_all_on_fresh_db() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), LATEST_VERSION);
    }

    #[test]
    fn run_all_is_idempotent() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), LATEST_VERSION);
    }

    #[test]
    fn migrations_create_all_tables() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE '\\_%' ESCAPE '\\' ORDER BY name",
                )
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .map(|r| r.unwrap())
                .collect()
        };

        for expected in ["checkpoints", "instance_heads", "audit_entries", "pending_reviews"] {
            assert!(tables.contains(&expected.to_string()), "missing table {expected}");
        }
    }

    #[test]
    fn checkpoint_versions_cannot_be_overwritten() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        conn.execute(
            "INSERT INTO checkpoints (instance_id, version, stage, status, state, created_at) \
             VALUES ('i-1', 1, 'INTAKE', 'RUNNING', '{}', 0)",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO checkpoints (instance_id, version, stage, status, state, created_at) \
             VALUES ('i-1', 1, 'UNDERSTAND', 'RUNNING', '{}', 0)",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn audit_entries_reject_update_and_delete() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        conn.execute(
            "INSERT INTO audit_entries (instance_id, seq, stage, kind, payload, recorded_at) \
             VALUES ('i-1', 1, 'INTAKE', 'ENTER', '{}', 0)",
            [],
        )
        .unwrap();

        assert!(
            conn.execute("UPDATE audit_entries SET payload = '[]'", [])
                .is_err()
        );
        assert!(conn.execute("DELETE FROM audit_entries", []).is_err());
    }

    #[test]
    fn only_one_open_review_per_instance() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        let insert = |id: &str, status: &str| {
            conn.execute(
                "INSERT INTO pending_reviews (review_id, instance_id, match_result, callback, reason, status, created_at) \
                 VALUES (?1, 'i-1', '{}', 'cb', 'low score', ?2, 0)",
                rusqlite::params![id, status],
            )
        };

        insert("r-1", "OPEN").unwrap();
        assert!(insert("r-2", "OPEN").is_err());
        insert("r-3", "RESOLVED").unwrap();
    }
}
