//! SQLite database handle — one file, WAL mode, shared by every component.
//!
//! All shared mutable state (claims, job status, throttle counters) is
//! mutated through conditional `UPDATE`s inside this database, never via
//! read-then-write in application memory.

use std::path::Path;
use std::sync::{Arc, Mutex};

use cascade_core::{CascadeError, Result};
use rusqlite::Connection;

/// Cloneable handle to the engine database.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open or create the engine database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)
            .map_err(|e| CascadeError::storage(format!("DB open: {e}")))?;
        // WAL allows concurrent readers alongside the writer and avoids
        // "database is locked" under the worker pool.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(|e| CascadeError::storage(format!("DB pragma: {e}")))?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CascadeError::storage(format!("DB open: {e}")))?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Run a closure against the connection.
    pub fn with<R>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<R>) -> Result<R> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| CascadeError::storage("DB mutex poisoned"))?;
        f(&conn).map_err(|e| CascadeError::storage(e.to_string()))
    }

    /// Run a closure inside a transaction; rolls back on error.
    pub fn with_tx<R>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction) -> rusqlite::Result<R>,
    ) -> Result<R> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| CascadeError::storage("DB mutex poisoned"))?;
        let tx = conn
            .transaction()
            .map_err(|e| CascadeError::storage(format!("DB tx: {e}")))?;
        let out = f(&tx).map_err(|e| CascadeError::storage(e.to_string()))?;
        tx.commit()
            .map_err(|e| CascadeError::storage(format!("DB commit: {e}")))?;
        Ok(out)
    }

    /// Create the schema.
    fn migrate(&self) -> Result<()> {
        self.with(|conn| {
            conn.execute_batch(
                "
            -- Inbound events (never deleted, retained for audit)
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                source TEXT NOT NULL,             -- 'domain', 'provider', 'schedule'
                aggregate_type TEXT,
                aggregate_id TEXT,
                payload TEXT NOT NULL,            -- JSON
                correlation_id TEXT,
                dedupe_key TEXT,
                occurred_at TEXT NOT NULL,
                claimed_at TEXT,
                claimed_by TEXT,
                processed_at TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 5
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_events_dedupe
                ON events (tenant_id, dedupe_key) WHERE dedupe_key IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_events_unprocessed
                ON events (processed_at, claimed_at);

            -- Tenant rule definitions (whole-document replace on update)
            CREATE TABLE IF NOT EXISTS rules (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                trigger_types TEXT NOT NULL,      -- JSON array of event types
                schedule TEXT,                    -- JSON ScheduleSpec
                conditions TEXT,                  -- JSON Condition tree, NULL = always
                throttle TEXT,                    -- JSON ThrottleSpec, NULL = unthrottled
                actions TEXT NOT NULL,            -- JSON array of ActionSpec
                next_run_at TEXT,                 -- schedule rules only
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rules_tenant ON rules (tenant_id, enabled);

            -- Durable action invocations
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                rule_id TEXT NOT NULL,
                event_id TEXT,                    -- NULL for manually triggered jobs
                action_type TEXT NOT NULL,
                resolved_params TEXT NOT NULL,    -- JSON
                status TEXT NOT NULL DEFAULT 'queued',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 5,
                next_run_at TEXT NOT NULL,
                idempotency_key TEXT NOT NULL UNIQUE,
                last_error TEXT,
                claimed_at TEXT,
                claimed_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs (status, next_run_at);

            -- Fixed-boundary throttle buckets
            CREATE TABLE IF NOT EXISTS throttle_buckets (
                rule_id TEXT NOT NULL,
                window TEXT NOT NULL,             -- 'minute', 'hour', 'day'
                bucket_start TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (rule_id, window, bucket_start)
            );

            -- Append-only audit trail (never updated, never deleted)
            CREATE TABLE IF NOT EXISTS execution_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                rule_id TEXT,
                event_id TEXT,
                job_id TEXT,
                outcome TEXT NOT NULL,            -- 'triggered', 'filtered', 'executed', 'failed'
                detail TEXT,
                error TEXT,
                latency_ms INTEGER,
                attempt INTEGER,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_log_rule ON execution_log (rule_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_log_event ON execution_log (event_id);
         ",
            )
        })
    }
}
