//! Processing loop — claim → match → conditions → throttle → enqueue.
//!
//! Workers are competing consumers over the event store; there is no
//! coordinator. Everything up to enqueue is synchronous and side-effect
//! free (conditions, throttle admission), so a crashed worker's events are
//! simply re-claimed after lease expiry and re-run safely: the jobs'
//! idempotency keys absorb the redelivery.

use std::sync::Arc;

use cascade_core::{CascadeError, Result};
use serde::Serialize;
use tokio::sync::watch;

use crate::catalog::ActionCatalog;
use crate::event::Event;
use crate::log::{ExecutionLog, Outcome, Record};
use crate::queue::JobQueue;
use crate::registry::{RuleRegistry, RuleSnapshot};
use crate::rule::Rule;
use crate::store::EventStore;
use crate::template;
use crate::throttle::ThrottleController;

/// One event-processing worker.
pub struct EngineWorker {
    pub worker_id: String,
    store: EventStore,
    registry: RuleRegistry,
    throttle: ThrottleController,
    queue: JobQueue,
    catalog: Arc<ActionCatalog>,
    log: ExecutionLog,
    claim_batch_size: usize,
    lease_secs: u64,
    job_max_attempts: u32,
}

/// Result of one rule evaluated against one event.
#[derive(Debug)]
enum RuleVerdict {
    /// Jobs enqueued (ids of the newly inserted ones).
    Fired(Vec<String>),
    FilteredByCondition,
    FilteredByThrottle,
    Failed(CascadeError),
}

impl EngineWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: &str,
        store: EventStore,
        registry: RuleRegistry,
        throttle: ThrottleController,
        queue: JobQueue,
        catalog: Arc<ActionCatalog>,
        log: ExecutionLog,
        claim_batch_size: usize,
        lease_secs: u64,
        job_max_attempts: u32,
    ) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            store,
            registry,
            throttle,
            queue,
            catalog,
            log,
            claim_batch_size,
            lease_secs,
            job_max_attempts,
        }
    }

    /// Claim one batch and process it. Returns the number of events
    /// handled; zero means the store was empty.
    pub fn process_once(&self) -> Result<usize> {
        let events = self
            .store
            .claim_batch(self.claim_batch_size, self.lease_secs, &self.worker_id)?;
        let count = events.len();
        for event in events {
            if let Err(e) = self.process_event(&event) {
                // Transient storage trouble: release so another worker can
                // retry; the attempt counter bounds how often.
                tracing::warn!("⚠️ Event {} processing failed: {e}", event.id);
                self.store.release_claim(&event.id, &self.worker_id).ok();
            }
        }
        Ok(count)
    }

    /// Evaluate every candidate rule for one event, enqueue jobs for the
    /// ones that fire, and mark the event processed. The rule snapshot is
    /// taken fresh per event, so a disable lands here immediately.
    fn process_event(&self, event: &Event) -> Result<()> {
        let snapshot = self.registry.snapshot(&event.tenant_id)?;
        self.process_with_snapshot(event, &snapshot)?;
        // Processed = all derived jobs durably enqueued. Action completion
        // is retried independently by the dispatcher.
        self.store.mark_processed(&event.id)
    }

    fn process_with_snapshot(&self, event: &Event, snapshot: &RuleSnapshot) -> Result<()> {
        for rule in snapshot.matching(event) {
            let verdict = self.evaluate_rule(rule, event);
            self.record_verdict(rule, event, &verdict);
        }
        Ok(())
    }

    fn evaluate_rule(&self, rule: &Rule, event: &Event) -> RuleVerdict {
        // Conditions: pure, no side effects. An evaluation error means
        // "not matched + failed", never "fire".
        if let Some(conditions) = &rule.conditions {
            match conditions.evaluate(&event.payload) {
                Ok(true) => {}
                Ok(false) => return RuleVerdict::FilteredByCondition,
                Err(e) => return RuleVerdict::Failed(e),
            }
        }

        // Resolve and validate every action before consuming throttle
        // budget or enqueuing anything: a rule/catalog mismatch fails the
        // whole firing.
        let mut resolved = Vec::with_capacity(rule.actions.len());
        for spec in &rule.actions {
            let params = match template::resolve(&spec.params, event) {
                Ok(p) => p,
                Err(e) => return RuleVerdict::Failed(e),
            };
            if let Err(e) = self.catalog.validate_config(&spec.action_type, &params) {
                return RuleVerdict::Failed(e);
            }
            resolved.push((spec.clone(), params));
        }

        match self.throttle.admit(&rule.id, rule.throttle.as_ref()) {
            Ok(true) => {}
            Ok(false) => return RuleVerdict::FilteredByThrottle,
            Err(e) => return RuleVerdict::Failed(e),
        }

        match self.queue.enqueue_actions(
            &event.tenant_id,
            &rule.id,
            Some(&event.id),
            &resolved,
            self.job_max_attempts,
        ) {
            Ok(ids) => RuleVerdict::Fired(ids),
            Err(e) => RuleVerdict::Failed(e),
        }
    }

    fn record_verdict(&self, rule: &Rule, event: &Event, verdict: &RuleVerdict) {
        let (outcome, detail, error) = match verdict {
            RuleVerdict::Fired(ids) => {
                tracing::info!(
                    "⚡ Rule '{}' triggered by {} ({} job(s))",
                    rule.name,
                    event.event_type,
                    ids.len()
                );
                (
                    Outcome::Triggered,
                    Some(format!("{} job(s) enqueued", ids.len())),
                    None,
                )
            }
            RuleVerdict::FilteredByCondition => {
                (Outcome::Filtered, Some("condition".to_string()), None)
            }
            RuleVerdict::FilteredByThrottle => {
                (Outcome::Filtered, Some("throttle".to_string()), None)
            }
            RuleVerdict::Failed(e) => {
                tracing::warn!("⚠️ Rule '{}' failed on event {}: {e}", rule.name, event.id);
                (Outcome::Failed, None, Some(e.to_string()))
            }
        };
        // Log append failures must not abort other rules.
        if let Err(e) = self.log.append(Record {
            tenant_id: &event.tenant_id,
            rule_id: Some(&rule.id),
            event_id: Some(&event.id),
            job_id: None,
            outcome,
            detail,
            error,
            latency_ms: None,
            attempt: None,
        }) {
            tracing::warn!("⚠️ Execution log append failed: {e}");
        }
    }

    /// Manual test hook: run matching, conditions, and a throttle peek
    /// against a synthetic event without enqueuing jobs or consuming
    /// throttle budget.
    pub fn preview(&self, rule: &Rule, event: &Event) -> Result<RulePreview> {
        let matches_trigger = rule.matches_event(event);

        let (condition_passed, condition_error) = match &rule.conditions {
            None => (Some(true), None),
            Some(c) => match c.evaluate(&event.payload) {
                Ok(v) => (Some(v), None),
                Err(e) => (None, Some(e.to_string())),
            },
        };

        let throttle_would_admit = self
            .throttle
            .would_admit(&rule.id, rule.throttle.as_ref())?;

        let mut actions = Vec::new();
        if matches_trigger && condition_passed == Some(true) {
            for spec in &rule.actions {
                match template::resolve(&spec.params, event) {
                    Ok(params) => {
                        let config_error = self
                            .catalog
                            .validate_config(&spec.action_type, &params)
                            .err()
                            .map(|e| e.to_string());
                        actions.push(PreviewAction {
                            action_type: spec.action_type.clone(),
                            resolved_params: params,
                            config_error,
                        })
                    }
                    Err(e) => actions.push(PreviewAction {
                        action_type: spec.action_type.clone(),
                        resolved_params: serde_json::Value::Null,
                        config_error: Some(e.to_string()),
                    }),
                }
            }
        }

        let would_fire = matches_trigger
            && condition_passed == Some(true)
            && throttle_would_admit
            && actions.iter().all(|a| a.config_error.is_none());

        Ok(RulePreview {
            matches_trigger,
            condition_passed,
            condition_error,
            throttle_would_admit,
            would_fire,
            actions,
        })
    }
}

/// What [`EngineWorker::preview`] reports per stage.
#[derive(Debug, Clone, Serialize)]
pub struct RulePreview {
    pub matches_trigger: bool,
    /// `None` when the condition tree failed to evaluate.
    pub condition_passed: Option<bool>,
    pub condition_error: Option<String>,
    pub throttle_would_admit: bool,
    pub would_fire: bool,
    pub actions: Vec<PreviewAction>,
}

/// One action that would fire, with its params resolved.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewAction {
    pub action_type: String,
    pub resolved_params: serde_json::Value,
    pub config_error: Option<String>,
}

/// Run a worker loop until `shutdown` flips to true. Polls when idle.
pub async fn run_worker_loop(
    worker: Arc<EngineWorker>,
    poll_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("🛞 Worker {} started", worker.worker_id);
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(poll_secs.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match worker.process_once() {
                    // Keep draining while the store has work.
                    Ok(n) if n > 0 => continue,
                    Ok(_) => {}
                    Err(e) => tracing::warn!("⚠️ Worker {} poll failed: {e}", worker.worker_id),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("🛞 Worker {} stopped", worker.worker_id);
                    return;
                }
            }
        }
    }
}
