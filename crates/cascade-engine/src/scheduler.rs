//! Scheduler — turns time into events.
//!
//! Independently of inbound traffic, due schedule rules are converted into
//! synthesized `schedule.tick` events in the event store, so time-based
//! and event-based triggers flow through the identical matching pipeline.
//! The tick's dedupe key and the conditional `next_run_at` advance make it
//! safe to run several scheduler instances at once.

use std::sync::Arc;

use cascade_core::Result;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;

use crate::cron::{next_run_from_cron, parse_tz};
use crate::event::NewEvent;
use crate::registry::RuleRegistry;
use crate::rule::{Rule, ScheduleSpec};
use crate::store::EventStore;

/// Evaluates schedule-triggered rules and synthesizes trigger events.
pub struct Scheduler {
    registry: RuleRegistry,
    store: EventStore,
}

impl Scheduler {
    pub fn new(registry: RuleRegistry, store: EventStore) -> Self {
        Self { registry, store }
    }

    /// One pass over all enabled schedule rules. Returns how many tick
    /// events were synthesized.
    pub fn tick(&self) -> Result<usize> {
        self.tick_at(Utc::now())
    }

    /// [`Scheduler::tick`] with an explicit clock.
    pub fn tick_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut fired = 0;
        for rule in self.registry.schedule_rules()? {
            match self.fire_if_due(&rule, now) {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => {
                    // A broken schedule on one rule must not stall the rest.
                    tracing::warn!("⏰ Schedule evaluation failed for rule {}: {e}", rule.id);
                }
            }
        }
        Ok(fired)
    }

    fn fire_if_due(&self, rule: &Rule, now: DateTime<Utc>) -> Result<bool> {
        let Some(spec) = rule.trigger.schedule.as_ref() else {
            return Ok(false);
        };

        let Some(due) = rule.next_run_at else {
            // Fresh schedule rule: seed next_run_at without firing.
            let next = next_due(spec, now)?;
            self.registry.advance_next_run(&rule.id, None, Some(next))?;
            return Ok(false);
        };

        if due > now {
            return Ok(false);
        }

        // Submit before advancing, so a crash between the two leaves the
        // slot still due rather than silently skipped. The tick's dedupe
        // key collapses the resubmit (and any concurrent submitter) into
        // one event.
        self.store
            .submit(NewEvent::schedule_tick(&rule.tenant_id, &rule.id, &rule.name, due))?;

        // Conditional advance: whoever wins the CAS owns this slot.
        // Losing the race means another scheduler already counted it.
        let next = next_due(spec, now)?;
        if !self
            .registry
            .advance_next_run(&rule.id, Some(due), Some(next))?
        {
            return Ok(false);
        }
        tracing::info!("⏰ Schedule fired: '{}' due {}", rule.name, due);
        Ok(true)
    }
}

/// Next due time for a spec, strictly after `now`.
pub fn next_due(spec: &ScheduleSpec, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match spec {
        ScheduleSpec::Cron {
            expression,
            timezone,
        } => next_run_from_cron(expression, now, parse_tz(timezone)?),
        ScheduleSpec::Interval { every_secs } => {
            Ok(now + Duration::seconds((*every_secs).max(1) as i64))
        }
    }
}

/// Run the scheduler loop until `shutdown` flips to true.
pub async fn run_scheduler_loop(
    scheduler: Arc<Scheduler>,
    tick_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("⏰ Scheduler started (tick every {tick_secs}s)");
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(tick_secs.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = scheduler.tick() {
                    tracing::warn!("⏰ Scheduler tick failed: {e}");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("⏰ Scheduler stopped");
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
    use crate::catalog::ActionCatalog;
    use crate::db::Db;
    use crate::event::SCHEDULE_TICK;
    use serde_json::json;

    fn setup() -> (Scheduler, RuleRegistry, EventStore, ActionCatalog) {
        let db = Db::open_in_memory().unwrap();
        let registry = RuleRegistry::new(db.clone());
        let store = EventStore::new(db.clone());
        let catalog = ActionCatalog::new();
        catalog.register(
            "report.generate",
            "generate a report",
            json!({}),
            &[],
            ScriptedHandler::succeeding(),
        );
        (
            Scheduler::new(registry.clone(), store.clone()),
            registry,
            store,
            catalog,
        )
    }

    fn interval_rule(registry: &RuleRegistry, catalog: &ActionCatalog, every_secs: u64) -> Rule {
        let rule = Rule::new("t1", "weekly-report", &[])
            .with_schedule(ScheduleSpec::Interval { every_secs })
            .with_action("report.generate", json!({}));
        registry.save(&rule, catalog).unwrap();
        rule
    }

    #[test]
    fn test_first_tick_seeds_without_firing() {
        let (scheduler, registry, store, catalog) = setup();
        let rule = interval_rule(&registry, &catalog, 3600);

        assert_eq!(scheduler.tick().unwrap(), 0);
        let seeded = registry.get(&rule.id).unwrap().unwrap();
        assert!(seeded.next_run_at.is_some());
        assert_eq!(store.unprocessed_count().unwrap(), 0);
    }

    #[test]
    fn test_due_rule_fires_one_tick_event() {
        let (scheduler, registry, store, catalog) = setup();
        let rule = interval_rule(&registry, &catalog, 3600);

        let t0 = Utc::now();
        scheduler.tick_at(t0).unwrap(); // seeds t0 + 1h
        let due = registry.get(&rule.id).unwrap().unwrap().next_run_at.unwrap();

        let fired = scheduler.tick_at(due + Duration::seconds(1)).unwrap();
        assert_eq!(fired, 1);
        assert_eq!(store.unprocessed_count().unwrap(), 1);

        let claimed = store.claim_batch(1, 60, "w").unwrap().remove(0);
        assert_eq!(claimed.event_type, SCHEDULE_TICK);
        assert_eq!(claimed.payload["rule_id"], json!(rule.id));

        // next_run_at advanced past the fired slot.
        let advanced = registry.get(&rule.id).unwrap().unwrap().next_run_at.unwrap();
        assert!(advanced > due);
    }

    #[test]
    fn test_interval_spacing() {
        let (scheduler, registry, _store, catalog) = setup();
        let rule = interval_rule(&registry, &catalog, 600);

        let t0 = Utc::now();
        scheduler.tick_at(t0).unwrap();
        let first = registry.get(&rule.id).unwrap().unwrap().next_run_at.unwrap();

        scheduler.tick_at(first).unwrap();
        let second = registry.get(&rule.id).unwrap().unwrap().next_run_at.unwrap();
        assert_eq!((second - first).num_seconds(), 600);
    }

    #[test]
    fn test_disabled_rule_never_fires() {
        let (scheduler, registry, store, catalog) = setup();
        let rule = interval_rule(&registry, &catalog, 60);
        scheduler.tick().unwrap(); // seed
        registry.set_enabled(&rule.id, false).unwrap();

        scheduler
            .tick_at(Utc::now() + Duration::seconds(120))
            .unwrap();
        assert_eq!(store.unprocessed_count().unwrap(), 0);
    }

    #[test]
    fn test_interrupted_fire_is_resumed_without_duplicating_the_tick() {
        let (scheduler, registry, store, catalog) = setup();
        let rule = interval_rule(&registry, &catalog, 3600);

        scheduler.tick_at(Utc::now()).unwrap(); // seed
        let due = registry.get(&rule.id).unwrap().unwrap().next_run_at.unwrap();

        // A prior process submitted the tick but died before it could
        // advance next_run_at. The slot is still due.
        store
            .submit(NewEvent::schedule_tick(&rule.tenant_id, &rule.id, &rule.name, due))
            .unwrap();
        assert_eq!(store.unprocessed_count().unwrap(), 1);

        // The next pass resubmits (deduped away) and finishes the advance.
        let fired = scheduler.tick_at(due + Duration::seconds(1)).unwrap();
        assert_eq!(fired, 1);
        assert_eq!(store.unprocessed_count().unwrap(), 1);
        let advanced = registry.get(&rule.id).unwrap().unwrap().next_run_at.unwrap();
        assert!(advanced > due);
    }

    #[test]
    fn test_concurrent_schedulers_fire_once() {
        let (scheduler_a, registry, store, catalog) = setup();
        let scheduler_b = Scheduler::new(registry.clone(), store.clone());
        let rule = interval_rule(&registry, &catalog, 3600);

        scheduler_a.tick_at(Utc::now()).unwrap(); // seed
        let due = registry.get(&rule.id).unwrap().unwrap().next_run_at.unwrap();
        let t = due + Duration::seconds(1);

        let fired = scheduler_a.tick_at(t).unwrap() + scheduler_b.tick_at(t).unwrap();
        assert_eq!(fired, 1);
        assert_eq!(store.unprocessed_count().unwrap(), 1);
    }
}
