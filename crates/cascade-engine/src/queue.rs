//! Job Queue — durable queue of action invocations with retry, backoff,
//! and dead-lettering.
//!
//! Enqueue is idempotent on the job's idempotency key; claims follow the
//! same lease discipline as the event store. Status flips are conditional
//! updates keyed on the current status, so a stale worker cannot clobber
//! a job another worker already moved on.

use cascade_core::{from_db_time, new_id, to_db_time, Result};
use chrono::{Duration, Utc};
use rand::Rng;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use crate::db::Db;
use crate::job::{idempotency_key, Job, JobStatus};
use crate::rule::ActionSpec;

/// Durable action-invocation queue.
#[derive(Clone)]
pub struct JobQueue {
    db: Db,
    backoff_base_secs: u64,
    backoff_cap_secs: u64,
}

/// Queue depth by status (operator visibility).
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queued: u64,
    pub running: u64,
    pub succeeded: u64,
    pub dead: u64,
}

const JOB_SELECT: &str = "SELECT id, tenant_id, rule_id, event_id, action_type, resolved_params, \
     status, attempts, max_attempts, next_run_at, idempotency_key, last_error, claimed_at, \
     claimed_by, created_at, updated_at FROM jobs";

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    let params_str: String = row.get(5)?;
    let status_str: String = row.get(6)?;
    Ok(Job {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        rule_id: row.get(2)?,
        event_id: row.get(3)?,
        action_type: row.get(4)?,
        resolved_params: serde_json::from_str(&params_str).unwrap_or_default(),
        status: JobStatus::parse(&status_str).unwrap_or(JobStatus::Queued),
        attempts: row.get(7)?,
        max_attempts: row.get(8)?,
        next_run_at: from_db_time(&row.get::<_, String>(9)?).unwrap_or_else(Utc::now),
        idempotency_key: row.get(10)?,
        last_error: row.get(11)?,
        claimed_at: row
            .get::<_, Option<String>>(12)?
            .and_then(|s| from_db_time(&s)),
        claimed_by: row.get(13)?,
        created_at: from_db_time(&row.get::<_, String>(14)?).unwrap_or_else(Utc::now),
        updated_at: from_db_time(&row.get::<_, String>(15)?).unwrap_or_else(Utc::now),
    })
}

impl JobQueue {
    pub fn new(db: Db, backoff_base_secs: u64, backoff_cap_secs: u64) -> Self {
        Self {
            db,
            backoff_base_secs,
            backoff_cap_secs,
        }
    }

    /// Enqueue one job per action, in declared order, under the rule's
    /// deterministic idempotency keys. Re-enqueueing an already present
    /// key is a no-op, so replays of the same event are safe.
    /// Returns ids of the jobs actually inserted.
    pub fn enqueue_actions(
        &self,
        tenant_id: &str,
        rule_id: &str,
        event_id: Option<&str>,
        actions: &[(ActionSpec, serde_json::Value)],
        max_attempts: u32,
    ) -> Result<Vec<String>> {
        let now = to_db_time(Utc::now());
        self.db.with_tx(|tx| {
            let mut inserted = Vec::new();
            for (index, (spec, resolved)) in actions.iter().enumerate() {
                let id = new_id("job");
                let key = idempotency_key(rule_id, event_id, index);
                let n = tx.execute(
                    "INSERT OR IGNORE INTO jobs
                     (id, tenant_id, rule_id, event_id, action_type, resolved_params, status,
                      attempts, max_attempts, next_run_at, idempotency_key, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', 0, ?7, ?8, ?9, ?8, ?8)",
                    params![
                        id,
                        tenant_id,
                        rule_id,
                        event_id,
                        spec.action_type,
                        resolved.to_string(),
                        max_attempts,
                        now,
                        key,
                    ],
                )?;
                if n == 1 {
                    inserted.push(id);
                }
            }
            Ok(inserted)
        })
    }

    /// Claim up to `n` due jobs under a lease. Mirrors the event store's
    /// claim discipline: conditional per-row updates, expired leases are
    /// reclaimable.
    pub fn claim_batch(&self, n: usize, lease_secs: u64, worker_id: &str) -> Result<Vec<Job>> {
        let now = Utc::now();
        let now_s = to_db_time(now);
        let cutoff = to_db_time(now - Duration::seconds(lease_secs as i64));

        let ids = self.db.with_tx(|tx| {
            let candidates: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM jobs
                     WHERE (status = 'queued' AND next_run_at <= ?1)
                        OR (status = 'running' AND claimed_at < ?2)
                     ORDER BY next_run_at
                     LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![now_s, cutoff, n as i64], |r| r.get(0))?;
                rows.collect::<rusqlite::Result<Vec<String>>>()?
            };

            let mut claimed = Vec::with_capacity(candidates.len());
            for id in candidates {
                let updated = tx.execute(
                    "UPDATE jobs
                     SET status = 'running', claimed_at = ?1, claimed_by = ?2,
                         attempts = attempts + 1, updated_at = ?1
                     WHERE id = ?3
                       AND ((status = 'queued' AND next_run_at <= ?1)
                         OR (status = 'running' AND claimed_at < ?4))",
                    params![now_s, worker_id, id, cutoff],
                )?;
                if updated == 1 {
                    claimed.push(id);
                }
            }
            Ok(claimed)
        })?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(job) = self.get(id)? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Record handler success. Conditional on the job still running under
    /// the caller's claim; a worker whose lease was reclaimed is a no-op.
    pub fn complete(&self, job_id: &str, worker_id: &str) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "UPDATE jobs SET status = 'succeeded', last_error = NULL, updated_at = ?1
                 WHERE id = ?2 AND status = 'running' AND claimed_by = ?3",
                params![to_db_time(Utc::now()), job_id, worker_id],
            )
        })?;
        Ok(())
    }

    /// Record a failed attempt. Retryable failures go back to `queued`
    /// with exponential backoff until the attempt budget is exhausted;
    /// permanent failures (and exhausted budgets) dead-letter. Conditional
    /// on the caller's claim, so a stale worker cannot dead-letter a job
    /// another worker reclaimed. Returns the status the job landed in.
    pub fn fail(&self, job: &Job, error: &str, permanent: bool, worker_id: &str) -> Result<JobStatus> {
        let exhausted = job.attempts >= job.max_attempts;
        if permanent || exhausted {
            let updated = self.db.with(|conn| {
                conn.execute(
                    "UPDATE jobs SET status = 'dead', last_error = ?1, updated_at = ?2
                     WHERE id = ?3 AND status = 'running' AND claimed_by = ?4",
                    params![error, to_db_time(Utc::now()), job.id, worker_id],
                )
            })?;
            if updated == 0 {
                return self.current_status(&job.id);
            }
            tracing::warn!(
                "💀 Job {} dead-lettered after {} attempt(s): {error}",
                job.id,
                job.attempts
            );
            return Ok(JobStatus::Dead);
        }

        let delay = self.backoff_delay(job.attempts);
        let next = Utc::now() + delay;
        let updated = self.db.with(|conn| {
            conn.execute(
                "UPDATE jobs SET status = 'queued', last_error = ?1, next_run_at = ?2,
                        claimed_at = NULL, claimed_by = NULL, updated_at = ?3
                 WHERE id = ?4 AND status = 'running' AND claimed_by = ?5",
                params![error, to_db_time(next), to_db_time(Utc::now()), job.id, worker_id],
            )
        })?;
        if updated == 0 {
            return self.current_status(&job.id);
        }
        tracing::debug!(
            "🔁 Job {} retry {}/{} in {}s",
            job.id,
            job.attempts,
            job.max_attempts,
            delay.num_seconds()
        );
        Ok(JobStatus::Queued)
    }

    /// Status as currently stored, for callers whose claim turned out
    /// stale. A vanished row reports dead.
    fn current_status(&self, job_id: &str) -> Result<JobStatus> {
        Ok(self
            .get(job_id)?
            .map(|j| j.status)
            .unwrap_or(JobStatus::Dead))
    }

    /// Exponential backoff with jitter, capped.
    fn backoff_delay(&self, attempts: u32) -> Duration {
        let exp = self
            .backoff_base_secs
            .saturating_mul(1u64 << attempts.min(20))
            .min(self.backoff_cap_secs)
            .max(1);
        let jitter = rand::thread_rng().gen_range(0..=exp / 4 + 1);
        Duration::seconds((exp + jitter) as i64)
    }

    /// Operator replay of a dead-lettered job: reset to `queued` with the
    /// attempt budget cleared. Never happens automatically.
    pub fn retry_dead(&self, job_id: &str) -> Result<bool> {
        let updated = self.db.with(|conn| {
            conn.execute(
                "UPDATE jobs SET status = 'queued', attempts = 0, next_run_at = ?1,
                        claimed_at = NULL, claimed_by = NULL, updated_at = ?1
                 WHERE id = ?2 AND status = 'dead'",
                params![to_db_time(Utc::now()), job_id],
            )
        })?;
        if updated == 1 {
            tracing::info!("♻️ Dead job {job_id} requeued by operator");
        }
        Ok(updated == 1)
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>> {
        self.db.with(|conn| {
            conn.query_row(&format!("{JOB_SELECT} WHERE id = ?1"), params![id], row_to_job)
                .optional()
        })
    }

    /// Jobs derived from one event (test hook and operator tooling).
    pub fn for_event(&self, event_id: &str) -> Result<Vec<Job>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{JOB_SELECT} WHERE event_id = ?1 ORDER BY created_at, rowid"
            ))?;
            let rows = stmt.query_map(params![event_id], row_to_job)?;
            rows.collect()
        })
    }

    /// Recent jobs for a tenant, newest first.
    pub fn list(&self, tenant_id: &str, limit: usize) -> Result<Vec<Job>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{JOB_SELECT} WHERE tenant_id = ?1 ORDER BY created_at DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![tenant_id, limit as i64], row_to_job)?;
            rows.collect()
        })
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.db.with(|conn| {
            let count = |status: &str| -> rusqlite::Result<u64> {
                conn.query_row(
                    "SELECT COUNT(*) FROM jobs WHERE status = ?1",
                    params![status],
                    |r| r.get::<_, i64>(0).map(|n| n as u64),
                )
            };
            Ok(QueueStats {
                queued: count("queued")?,
                running: count("running")?,
                succeeded: count("succeeded")?,
                dead: count("dead")?,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> JobQueue {
        JobQueue::new(Db::open_in_memory().unwrap(), 5, 3600)
    }

    fn action(action_type: &str) -> (ActionSpec, serde_json::Value) {
        (
            ActionSpec {
                action_type: action_type.to_string(),
                params: json!({}),
            },
            json!({"level": "final"}),
        )
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let q = queue();
        let first = q
            .enqueue_actions("t1", "r1", Some("e1"), &[action("dunning.send")], 5)
            .unwrap();
        assert_eq!(first.len(), 1);
        // Redelivery of the same event enqueues nothing new.
        let second = q
            .enqueue_actions("t1", "r1", Some("e1"), &[action("dunning.send")], 5)
            .unwrap();
        assert!(second.is_empty());
        assert_eq!(q.for_event("e1").unwrap().len(), 1);
    }

    #[test]
    fn test_actions_keep_declared_order() {
        let q = queue();
        q.enqueue_actions(
            "t1",
            "r1",
            Some("e1"),
            &[action("first.send"), action("second.create")],
            5,
        )
        .unwrap();
        let jobs = q.for_event("e1").unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].action_type, "first.send");
        assert_eq!(jobs[1].action_type, "second.create");
    }

    #[test]
    fn test_declared_order_survives_double_digit_indexes() {
        let q = queue();
        let actions: Vec<_> = (0..12).map(|i| action(&format!("step.{i}"))).collect();
        q.enqueue_actions("t1", "r1", Some("e1"), &actions, 5).unwrap();
        let jobs = q.for_event("e1").unwrap();
        assert_eq!(jobs.len(), 12);
        for (i, job) in jobs.iter().enumerate() {
            assert_eq!(job.action_type, format!("step.{i}"));
        }
    }

    #[test]
    fn test_claim_and_complete() {
        let q = queue();
        q.enqueue_actions("t1", "r1", Some("e1"), &[action("dunning.send")], 5)
            .unwrap();
        let claimed = q.claim_batch(10, 60, "w1").unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, JobStatus::Running);
        assert_eq!(claimed[0].attempts, 1);

        // No double-claim while the lease lives.
        assert!(q.claim_batch(10, 60, "w2").unwrap().is_empty());

        q.complete(&claimed[0].id, "w1").unwrap();
        let job = q.get(&claimed[0].id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
    }

    #[test]
    fn test_retry_then_dead_letter() {
        let q = queue();
        q.enqueue_actions("t1", "r1", Some("e1"), &[action("dunning.send")], 2)
            .unwrap();

        // Attempt 1: retryable failure goes back to queued.
        let job = q.claim_batch(1, 60, "w1").unwrap().remove(0);
        assert_eq!(q.fail(&job, "timeout", false, "w1").unwrap(), JobStatus::Queued);
        let j = q.get(&job.id).unwrap().unwrap();
        assert_eq!(j.status, JobStatus::Queued);
        assert!(j.next_run_at > Utc::now());

        // Force due and claim again: attempts hits max, dead-letters.
        q.db.with(|c| {
            c.execute(
                "UPDATE jobs SET next_run_at = ?1 WHERE id = ?2",
                params![to_db_time(Utc::now() - Duration::seconds(1)), job.id],
            )
        })
        .unwrap();
        let job = q.claim_batch(1, 60, "w1").unwrap().remove(0);
        assert_eq!(job.attempts, 2);
        assert_eq!(q.fail(&job, "timeout", false, "w1").unwrap(), JobStatus::Dead);
        assert_eq!(q.get(&job.id).unwrap().unwrap().status, JobStatus::Dead);

        // Dead jobs never come back on their own.
        assert!(q.claim_batch(10, 0, "w1").unwrap().is_empty());
    }

    #[test]
    fn test_permanent_failure_dead_letters_immediately() {
        let q = queue();
        q.enqueue_actions("t1", "r1", Some("e1"), &[action("dunning.send")], 5)
            .unwrap();
        let job = q.claim_batch(1, 60, "w1").unwrap().remove(0);
        assert_eq!(
            q.fail(&job, "config mismatch", true, "w1").unwrap(),
            JobStatus::Dead
        );
    }

    #[test]
    fn test_operator_replay_of_dead_job() {
        let q = queue();
        q.enqueue_actions("t1", "r1", Some("e1"), &[action("dunning.send")], 1)
            .unwrap();
        let job = q.claim_batch(1, 60, "w1").unwrap().remove(0);
        q.fail(&job, "boom", false, "w1").unwrap();
        assert_eq!(q.get(&job.id).unwrap().unwrap().status, JobStatus::Dead);

        assert!(q.retry_dead(&job.id).unwrap());
        let j = q.get(&job.id).unwrap().unwrap();
        assert_eq!(j.status, JobStatus::Queued);
        assert_eq!(j.attempts, 0);
        // Replaying a non-dead job is refused.
        assert!(!q.retry_dead(&job.id).unwrap());
    }

    #[test]
    fn test_expired_job_lease_is_reclaimable() {
        let q = queue();
        q.enqueue_actions("t1", "r1", Some("e1"), &[action("dunning.send")], 5)
            .unwrap();
        let a = q.claim_batch(1, 0, "w1").unwrap();
        assert_eq!(a.len(), 1);
        let b = q.claim_batch(1, 0, "w2").unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(a[0].id, b[0].id);
        assert_eq!(b[0].attempts, 2);
    }

    #[test]
    fn test_stale_claimant_cannot_flip_a_reclaimed_job() {
        let q = queue();
        q.enqueue_actions("t1", "r1", Some("e1"), &[action("dunning.send")], 5)
            .unwrap();
        // w1's lease expires immediately; w2 reclaims the job.
        let stale = q.claim_batch(1, 0, "w1").unwrap().remove(0);
        let live = q.claim_batch(1, 0, "w2").unwrap().remove(0);
        assert_eq!(stale.id, live.id);

        // w1's late dead-letter is a no-op and reports the current status.
        assert_eq!(
            q.fail(&stale, "late failure", true, "w1").unwrap(),
            JobStatus::Running
        );
        assert_eq!(q.get(&live.id).unwrap().unwrap().status, JobStatus::Running);

        // w2's outcome wins.
        q.complete(&live.id, "w2").unwrap();
        assert_eq!(q.get(&live.id).unwrap().unwrap().status, JobStatus::Succeeded);

        // A late complete from w1 no longer changes anything either.
        q.complete(&stale.id, "w1").unwrap();
        assert_eq!(q.get(&live.id).unwrap().unwrap().status, JobStatus::Succeeded);
    }

    #[test]
    fn test_stats() {
        let q = queue();
        q.enqueue_actions("t1", "r1", Some("e1"), &[action("a"), action("b")], 5)
            .unwrap();
        let job = q.claim_batch(1, 60, "w1").unwrap().remove(0);
        q.complete(&job.id, "w1").unwrap();
        let stats = q.stats().unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.dead, 0);
    }
}
