//! Throttle Controller — per-rule firing counters in fixed windows.
//!
//! Counters live in the database and are bumped with a single
//! increment-and-read statement, so competing workers cannot over-admit.
//! Exceeding the limit is expected control flow (`filtered`), not an
//! error.

use cascade_core::{to_db_time, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::db::Db;
use crate::rule::ThrottleSpec;

/// Decides admit/reject per rule per time window.
#[derive(Clone)]
pub struct ThrottleController {
    db: Db,
}

impl ThrottleController {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Count a candidate firing against the current bucket and admit it
    /// if the resulting count stays within the limit. A rule without a
    /// throttle spec always admits.
    pub fn admit(&self, rule_id: &str, spec: Option<&ThrottleSpec>) -> Result<bool> {
        self.admit_at(rule_id, spec, Utc::now())
    }

    /// [`ThrottleController::admit`] with an explicit clock, for tests and
    /// deterministic replay.
    pub fn admit_at(
        &self,
        rule_id: &str,
        spec: Option<&ThrottleSpec>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(spec) = spec else { return Ok(true) };
        let bucket = to_db_time(spec.window.bucket_start(now));

        // Atomic increment-and-read; no read-then-write in memory.
        let count: i64 = self.db.with(|conn| {
            conn.query_row(
                "INSERT INTO throttle_buckets (rule_id, window, bucket_start, count)
                 VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT(rule_id, window, bucket_start)
                    DO UPDATE SET count = count + 1
                 RETURNING count",
                params![rule_id, spec.window.as_str(), bucket],
                |r| r.get(0),
            )
        })?;

        let admitted = count <= i64::from(spec.limit);
        if !admitted {
            tracing::debug!(
                "🚦 Throttled rule {rule_id}: {count} > {} per {}",
                spec.limit,
                spec.window.as_str()
            );
        }
        Ok(admitted)
    }

    /// Would the rule admit right now? Read-only peek that does not
    /// consume budget — used by the dry-run preview.
    pub fn would_admit(&self, rule_id: &str, spec: Option<&ThrottleSpec>) -> Result<bool> {
        let Some(spec) = spec else { return Ok(true) };
        let bucket = to_db_time(spec.window.bucket_start(Utc::now()));
        let count: i64 = self.db.with(|conn| {
            conn.query_row(
                "SELECT COALESCE(
                    (SELECT count FROM throttle_buckets
                     WHERE rule_id = ?1 AND window = ?2 AND bucket_start = ?3), 0)",
                params![rule_id, spec.window.as_str(), bucket],
                |r| r.get(0),
            )
        })?;
        Ok(count < i64::from(spec.limit))
    }
}
