//! Action Dispatcher — claims jobs and drives them through their handler.
//!
//! The only component that performs effects against external systems.
//! Config is re-validated against the catalog at dispatch time because
//! entries can be deactivated after jobs referencing them were enqueued;
//! that rejection is permanent. Handler invocations run under a timeout,
//! and a timeout is a retryable failure.

use std::sync::Arc;
use std::time::Duration;

use cascade_core::Result;
use tokio::sync::watch;

use crate::catalog::{ActionCatalog, ActionFailure};
use crate::job::{Job, JobStatus};
use crate::log::{ExecutionLog, Outcome, Record};
use crate::queue::JobQueue;

/// Claims jobs from the queue and invokes bound action handlers.
pub struct ActionDispatcher {
    pub worker_id: String,
    queue: JobQueue,
    catalog: Arc<ActionCatalog>,
    log: ExecutionLog,
    claim_batch_size: usize,
    lease_secs: u64,
    action_timeout: Duration,
}

impl ActionDispatcher {
    pub fn new(
        worker_id: &str,
        queue: JobQueue,
        catalog: Arc<ActionCatalog>,
        log: ExecutionLog,
        claim_batch_size: usize,
        lease_secs: u64,
        action_timeout_secs: u64,
    ) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            queue,
            catalog,
            log,
            claim_batch_size,
            lease_secs,
            action_timeout: Duration::from_secs(action_timeout_secs.max(1)),
        }
    }

    /// Claim one batch of due jobs and execute them. Returns the number
    /// of jobs handled.
    pub async fn run_once(&self) -> Result<usize> {
        let jobs = self
            .queue
            .claim_batch(self.claim_batch_size, self.lease_secs, &self.worker_id)?;
        let count = jobs.len();
        for job in jobs {
            self.execute(&job).await?;
        }
        Ok(count)
    }

    /// Execute one claimed job and record its outcome.
    pub async fn execute(&self, job: &Job) -> Result<JobStatus> {
        let started = std::time::Instant::now();

        // Dispatch-time catalog validation; a mismatch here is a
        // rule/catalog problem, not a transient condition.
        if let Err(e) = self
            .catalog
            .validate_config(&job.action_type, &job.resolved_params)
        {
            let status = self.queue.fail(job, &e.to_string(), true, &self.worker_id)?;
            self.record(job, Outcome::Failed, Some(e.to_string()), started);
            return Ok(status);
        }

        let Some(handler) = self.catalog.handler(&job.action_type) else {
            let msg = format!("no handler bound for action type '{}'", job.action_type);
            let status = self.queue.fail(job, &msg, true, &self.worker_id)?;
            self.record(job, Outcome::Failed, Some(msg), started);
            return Ok(status);
        };

        let result = tokio::time::timeout(self.action_timeout, handler.execute(&job.resolved_params))
            .await
            .unwrap_or_else(|_| {
                Err(ActionFailure::Retryable(format!(
                    "action timed out after {}s",
                    self.action_timeout.as_secs()
                )))
            });

        match result {
            Ok(_) => {
                self.queue.complete(&job.id, &self.worker_id)?;
                tracing::info!(
                    "✅ Job {} executed ({}, attempt {})",
                    job.id,
                    job.action_type,
                    job.attempts
                );
                self.record(job, Outcome::Executed, None, started);
                Ok(JobStatus::Succeeded)
            }
            Err(failure) => {
                let permanent = matches!(failure, ActionFailure::Permanent(_));
                let status = self.queue.fail(job, failure.message(), permanent, &self.worker_id)?;
                self.record(job, Outcome::Failed, Some(failure.message().to_string()), started);
                Ok(status)
            }
        }
    }

    fn record(&self, job: &Job, outcome: Outcome, error: Option<String>, started: std::time::Instant) {
        if let Err(e) = self.log.append(Record {
            tenant_id: &job.tenant_id,
            rule_id: Some(&job.rule_id),
            event_id: job.event_id.as_deref(),
            job_id: Some(&job.id),
            outcome,
            detail: Some(job.action_type.clone()),
            error,
            latency_ms: Some(started.elapsed().as_millis() as i64),
            attempt: Some(job.attempts),
        }) {
            tracing::warn!("⚠️ Execution log append failed: {e}");
        }
    }
}

/// Run a dispatcher loop until `shutdown` flips to true.
pub async fn run_dispatcher_loop(
    dispatcher: Arc<ActionDispatcher>,
    poll_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("🚚 Dispatcher {} started", dispatcher.worker_id);
    let mut interval = tokio::time::interval(Duration::from_secs(poll_secs.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match dispatcher.run_once().await {
                    Ok(n) if n > 0 => continue,
                    Ok(_) => {}
                    Err(e) => tracing::warn!("⚠️ Dispatcher {} poll failed: {e}", dispatcher.worker_id),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("🚚 Dispatcher {} stopped", dispatcher.worker_id);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::testing::ScriptedHandler;
    use crate::catalog::ActionHandler;
    use crate::db::Db;
    use crate::rule::ActionSpec;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    fn setup(
        handler: Arc<dyn ActionHandler>,
        schema: Value,
    ) -> (ActionDispatcher, JobQueue, ExecutionLog, Db) {
        let db = Db::open_in_memory().unwrap();
        let queue = JobQueue::new(db.clone(), 1, 10);
        let log = ExecutionLog::new(db.clone());
        let catalog = Arc::new(ActionCatalog::new());
        catalog.register("dunning.send", "send dunning", schema, &[], handler);
        let dispatcher = ActionDispatcher::new(
            "dispatch-test",
            queue.clone(),
            catalog,
            log.clone(),
            16,
            60,
            5,
        );
        (dispatcher, queue, log, db)
    }

    fn enqueue_one(queue: &JobQueue, max_attempts: u32) -> String {
        let ids = queue
            .enqueue_actions(
                "t1",
                "r1",
                Some("e1"),
                &[(
                    ActionSpec {
                        action_type: "dunning.send".into(),
                        params: json!({}),
                    },
                    json!({"level": "final"}),
                )],
                max_attempts,
            )
            .unwrap();
        ids[0].clone()
    }

    #[tokio::test]
    async fn test_success_path_logs_executed() {
        let handler = ScriptedHandler::succeeding();
        let (dispatcher, queue, log, _db) = setup(handler.clone(), json!({"required": ["level"]}));
        let job_id = enqueue_one(&queue, 5);

        assert_eq!(dispatcher.run_once().await.unwrap(), 1);

        assert_eq!(queue.get(&job_id).unwrap().unwrap().status, JobStatus::Succeeded);
        assert_eq!(handler.call_count(), 1);
        let entries = log.by_event("e1").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, Outcome::Executed);
        assert_eq!(entries[0].job_id.as_deref(), Some(job_id.as_str()));
        assert!(entries[0].latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_retryable_failure_requeues_then_succeeds() {
        let handler = ScriptedHandler::failing(1, false);
        let (dispatcher, queue, _log, db) = setup(handler.clone(), json!({}));
        let job_id = enqueue_one(&queue, 5);

        dispatcher.run_once().await.unwrap();
        let job = queue.get(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.is_some());

        // Force the retry due and run again; second attempt succeeds.
        db.with(|c| {
            c.execute(
                "UPDATE jobs SET next_run_at = ?1 WHERE id = ?2",
                rusqlite::params![cascade_core::to_db_time(chrono::Utc::now()), job_id],
            )
        })
        .unwrap();
        dispatcher.run_once().await.unwrap();
        assert_eq!(queue.get(&job_id).unwrap().unwrap().status, JobStatus::Succeeded);
        assert_eq!(handler.call_count(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_dead_letters_without_retry() {
        let handler = ScriptedHandler::failing(99, true);
        let (dispatcher, queue, log, _db) = setup(handler.clone(), json!({}));
        let job_id = enqueue_one(&queue, 5);

        dispatcher.run_once().await.unwrap();
        assert_eq!(queue.get(&job_id).unwrap().unwrap().status, JobStatus::Dead);
        assert_eq!(handler.call_count(), 1);
        let failed = log.by_outcome("t1", Outcome::Failed, 10).unwrap();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn test_config_mismatch_is_permanent_and_skips_handler() {
        let handler = ScriptedHandler::succeeding();
        // Schema demands a field the resolved params lack.
        let (dispatcher, queue, log, _db) =
            setup(handler.clone(), json!({"required": ["recipient"]}));
        let job_id = enqueue_one(&queue, 5);

        dispatcher.run_once().await.unwrap();
        assert_eq!(queue.get(&job_id).unwrap().unwrap().status, JobStatus::Dead);
        assert_eq!(handler.call_count(), 0);
        assert!(log.by_outcome("t1", Outcome::Failed, 10).unwrap()[0]
            .error
            .as_deref()
            .unwrap()
            .contains("recipient"));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_retryable() {
        struct SlowHandler;
        #[async_trait]
        impl ActionHandler for SlowHandler {
            async fn execute(&self, _params: &Value) -> std::result::Result<Value, ActionFailure> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!({}))
            }
        }
        let db = Db::open_in_memory().unwrap();
        let queue = JobQueue::new(db.clone(), 1, 10);
        let log = ExecutionLog::new(db.clone());
        let catalog = Arc::new(ActionCatalog::new());
        catalog.register("dunning.send", "slow", json!({}), &[], Arc::new(SlowHandler));
        let dispatcher =
            ActionDispatcher::new("dispatch-test", queue.clone(), catalog, log, 16, 60, 1);
        let job_id = enqueue_one(&queue, 5);

        // Paused clock auto-advances to the 1s action timeout.
        tokio::time::pause();
        dispatcher.run_once().await.unwrap();

        let job = queue.get(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.last_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_deactivated_type_dead_letters_at_dispatch() {
        let handler = ScriptedHandler::succeeding();
        let db = Db::open_in_memory().unwrap();
        let queue = JobQueue::new(db.clone(), 1, 10);
        let log = ExecutionLog::new(db.clone());
        let catalog = Arc::new(ActionCatalog::new());
        catalog.register("dunning.send", "send", json!({}), &[], handler.clone());
        let dispatcher = ActionDispatcher::new(
            "dispatch-test",
            queue.clone(),
            catalog.clone(),
            log,
            16,
            60,
            5,
        );
        let job_id = enqueue_one(&queue, 5);

        // Deactivated after the job was enqueued.
        catalog.deactivate("dunning.send");
        dispatcher.run_once().await.unwrap();
        assert_eq!(queue.get(&job_id).unwrap().unwrap().status, JobStatus::Dead);
        assert_eq!(handler.call_count(), 0);
    }
}
