//! Execution Log — append-only audit trail.
//!
//! One entry per (event, rule) evaluation and per job execution attempt.
//! Entries are never updated or deleted; corrections are new entries. This
//! is the trail operators use to answer "why didn't my rule fire".

use cascade_core::{from_db_time, to_db_time, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::Serialize;

use crate::db::Db;

/// How a match attempt or job execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Rule matched and its jobs were enqueued.
    Triggered,
    /// Rule did not fire: condition false or throttle exhausted.
    Filtered,
    /// Action handler succeeded.
    Executed,
    /// Evaluation error or action failure.
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Triggered => "triggered",
            Outcome::Filtered => "filtered",
            Outcome::Executed => "executed",
            Outcome::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "triggered" => Some(Outcome::Triggered),
            "filtered" => Some(Outcome::Filtered),
            "executed" => Some(Outcome::Executed),
            "failed" => Some(Outcome::Failed),
            _ => None,
        }
    }
}

/// Immutable log record.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub tenant_id: String,
    pub rule_id: Option<String>,
    pub event_id: Option<String>,
    pub job_id: Option<String>,
    pub outcome: Outcome,
    /// Human-readable context, e.g. `condition` vs `throttle` for
    /// filtered outcomes.
    pub detail: Option<String>,
    pub error: Option<String>,
    pub latency_ms: Option<i64>,
    pub attempt: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// Append-only sink plus query surface.
#[derive(Clone)]
pub struct ExecutionLog {
    db: Db,
}

/// Builder-ish record for one appended entry.
pub struct Record<'a> {
    pub tenant_id: &'a str,
    pub rule_id: Option<&'a str>,
    pub event_id: Option<&'a str>,
    pub job_id: Option<&'a str>,
    pub outcome: Outcome,
    pub detail: Option<String>,
    pub error: Option<String>,
    pub latency_ms: Option<i64>,
    pub attempt: Option<u32>,
}

fn row_to_entry(row: &Row) -> rusqlite::Result<LogEntry> {
    let outcome_str: String = row.get(5)?;
    Ok(LogEntry {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        rule_id: row.get(2)?,
        event_id: row.get(3)?,
        job_id: row.get(4)?,
        outcome: Outcome::parse(&outcome_str).unwrap_or(Outcome::Failed),
        detail: row.get(6)?,
        error: row.get(7)?,
        latency_ms: row.get(8)?,
        attempt: row.get(9)?,
        created_at: from_db_time(&row.get::<_, String>(10)?).unwrap_or_else(Utc::now),
    })
}

const LOG_SELECT: &str = "SELECT id, tenant_id, rule_id, event_id, job_id, outcome, detail, \
     error, latency_ms, attempt, created_at FROM execution_log";

impl ExecutionLog {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Append one entry. There is no update path by design.
    pub fn append(&self, record: Record<'_>) -> Result<i64> {
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO execution_log
                 (tenant_id, rule_id, event_id, job_id, outcome, detail, error, latency_ms,
                  attempt, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.tenant_id,
                    record.rule_id,
                    record.event_id,
                    record.job_id,
                    record.outcome.as_str(),
                    record.detail,
                    record.error,
                    record.latency_ms,
                    record.attempt,
                    to_db_time(Utc::now()),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn by_rule(&self, rule_id: &str, limit: usize) -> Result<Vec<LogEntry>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{LOG_SELECT} WHERE rule_id = ?1 ORDER BY id DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![rule_id, limit as i64], row_to_entry)?;
            rows.collect()
        })
    }

    pub fn by_event(&self, event_id: &str) -> Result<Vec<LogEntry>> {
        self.db.with(|conn| {
            let mut stmt =
                conn.prepare(&format!("{LOG_SELECT} WHERE event_id = ?1 ORDER BY id"))?;
            let rows = stmt.query_map(params![event_id], row_to_entry)?;
            rows.collect()
        })
    }

    pub fn by_outcome(&self, tenant_id: &str, outcome: Outcome, limit: usize) -> Result<Vec<LogEntry>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{LOG_SELECT} WHERE tenant_id = ?1 AND outcome = ?2 ORDER BY id DESC LIMIT ?3"
            ))?;
            let rows = stmt.query_map(
                params![tenant_id, outcome.as_str(), limit as i64],
                row_to_entry,
            )?;
            rows.collect()
        })
    }

    pub fn in_range(
        &self,
        tenant_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LogEntry>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{LOG_SELECT} WHERE tenant_id = ?1 AND created_at >= ?2 AND created_at < ?3
                 ORDER BY id"
            ))?;
            let rows = stmt.query_map(
                params![tenant_id, to_db_time(from), to_db_time(to)],
                row_to_entry,
            )?;
            rows.collect()
        })
    }

    /// Newest entries for a tenant (CLI tail).
    pub fn recent(&self, tenant_id: &str, limit: usize) -> Result<Vec<LogEntry>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{LOG_SELECT} WHERE tenant_id = ?1 ORDER BY id DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![tenant_id, limit as i64], row_to_entry)?;
            rows.collect()
        })
    }
}
