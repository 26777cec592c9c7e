//! Rule Registry — tenant-scoped rule definitions.
//!
//! Updates are whole-document replaces: there are no partial patches to
//! nested fields. The processing loop never reads rules directly; it takes
//! a [`RuleSnapshot`] per cycle, so tests can inject fixed rule sets and a
//! disable lands at the next snapshot, not mid-evaluation.

use cascade_core::{from_db_time, to_db_time, CascadeError, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use crate::catalog::ActionCatalog;
use crate::db::Db;
use crate::event::Event;
use crate::rule::Rule;

/// Persistent store of rule definitions.
#[derive(Clone)]
pub struct RuleRegistry {
    db: Db,
}

const RULE_SELECT: &str = "SELECT id, tenant_id, name, enabled, trigger_types, schedule, \
     conditions, throttle, actions, next_run_at, created_at, updated_at FROM rules";

fn row_to_rule(row: &Row) -> rusqlite::Result<Rule> {
    let trigger_types: String = row.get(4)?;
    let schedule: Option<String> = row.get(5)?;
    let conditions: Option<String> = row.get(6)?;
    let throttle: Option<String> = row.get(7)?;
    let actions: String = row.get(8)?;
    Ok(Rule {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        enabled: row.get::<_, i64>(3)? != 0,
        trigger: crate::rule::Trigger {
            event_types: serde_json::from_str(&trigger_types).unwrap_or_default(),
            schedule: schedule.and_then(|s| serde_json::from_str(&s).ok()),
        },
        conditions: conditions.and_then(|s| serde_json::from_str(&s).ok()),
        throttle: throttle.and_then(|s| serde_json::from_str(&s).ok()),
        actions: serde_json::from_str(&actions).unwrap_or_default(),
        next_run_at: row
            .get::<_, Option<String>>(9)?
            .and_then(|s| from_db_time(&s)),
        created_at: from_db_time(&row.get::<_, String>(10)?).unwrap_or_else(Utc::now),
        updated_at: from_db_time(&row.get::<_, String>(11)?).unwrap_or_else(Utc::now),
    })
}

impl RuleRegistry {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create or replace a rule. The whole definition is rewritten;
    /// validation rejects rules referencing unregistered or inactive
    /// action types before anything is stored.
    pub fn save(&self, rule: &Rule, catalog: &ActionCatalog) -> Result<()> {
        self.validate(rule, catalog)?;
        let now = to_db_time(Utc::now());
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO rules
                 (id, tenant_id, name, enabled, trigger_types, schedule, conditions, throttle,
                  actions, next_run_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                    tenant_id = excluded.tenant_id,
                    name = excluded.name,
                    enabled = excluded.enabled,
                    trigger_types = excluded.trigger_types,
                    schedule = excluded.schedule,
                    conditions = excluded.conditions,
                    throttle = excluded.throttle,
                    actions = excluded.actions,
                    next_run_at = excluded.next_run_at,
                    updated_at = excluded.updated_at",
                params![
                    rule.id,
                    rule.tenant_id,
                    rule.name,
                    rule.enabled as i64,
                    serde_json::to_string(&rule.trigger.event_types).unwrap_or_default(),
                    rule.trigger
                        .schedule
                        .as_ref()
                        .and_then(|s| serde_json::to_string(s).ok()),
                    rule.conditions
                        .as_ref()
                        .and_then(|c| serde_json::to_string(c).ok()),
                    rule.throttle
                        .as_ref()
                        .and_then(|t| serde_json::to_string(t).ok()),
                    serde_json::to_string(&rule.actions).unwrap_or_default(),
                    rule.next_run_at.map(to_db_time),
                    now,
                ],
            )
        })?;
        tracing::info!("📐 Rule saved: '{}' ({})", rule.name, rule.id);
        Ok(())
    }

    fn validate(&self, rule: &Rule, catalog: &ActionCatalog) -> Result<()> {
        if rule.name.trim().is_empty() {
            return Err(CascadeError::validation("rule name is empty"));
        }
        if rule.trigger.event_types.is_empty() && rule.trigger.schedule.is_none() {
            return Err(CascadeError::validation(
                "rule needs at least one trigger event type or a schedule",
            ));
        }
        if rule.actions.is_empty() {
            return Err(CascadeError::validation("rule has no actions"));
        }
        for action in &rule.actions {
            catalog.ensure_active(&action.action_type)?;
        }
        Ok(())
    }

    /// Enable or disable a rule. Takes effect at the next snapshot; jobs
    /// already enqueued are unaffected.
    pub fn set_enabled(&self, rule_id: &str, enabled: bool) -> Result<bool> {
        let updated = self.db.with(|conn| {
            conn.execute(
                "UPDATE rules SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
                params![enabled as i64, to_db_time(Utc::now()), rule_id],
            )
        })?;
        Ok(updated == 1)
    }

    pub fn delete(&self, rule_id: &str) -> Result<bool> {
        let deleted = self
            .db
            .with(|conn| conn.execute("DELETE FROM rules WHERE id = ?1", params![rule_id]))?;
        Ok(deleted == 1)
    }

    pub fn get(&self, rule_id: &str) -> Result<Option<Rule>> {
        self.db.with(|conn| {
            conn.query_row(
                &format!("{RULE_SELECT} WHERE id = ?1"),
                params![rule_id],
                row_to_rule,
            )
            .optional()
        })
    }

    /// All rules for a tenant, enabled or not (management listing).
    pub fn list(&self, tenant_id: &str) -> Result<Vec<Rule>> {
        self.db.with(|conn| {
            let mut stmt =
                conn.prepare(&format!("{RULE_SELECT} WHERE tenant_id = ?1 ORDER BY name"))?;
            let rows = stmt.query_map(params![tenant_id], row_to_rule)?;
            rows.collect()
        })
    }

    /// Enabled rules for a tenant, frozen for one processing cycle.
    pub fn snapshot(&self, tenant_id: &str) -> Result<RuleSnapshot> {
        let rules = self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{RULE_SELECT} WHERE tenant_id = ?1 AND enabled = 1"
            ))?;
            let rows = stmt.query_map(params![tenant_id], row_to_rule)?;
            rows.collect::<rusqlite::Result<Vec<Rule>>>()
        })?;
        Ok(RuleSnapshot { rules })
    }

    /// All enabled schedule-triggered rules across tenants (scheduler).
    pub fn schedule_rules(&self) -> Result<Vec<Rule>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{RULE_SELECT} WHERE enabled = 1 AND schedule IS NOT NULL"
            ))?;
            let rows = stmt.query_map([], row_to_rule)?;
            rows.collect()
        })
    }

    /// Advance a schedule rule's due time, but only if it still holds the
    /// expected value — competing scheduler instances race on this.
    pub fn advance_next_run(
        &self,
        rule_id: &str,
        expected: Option<chrono::DateTime<Utc>>,
        next: Option<chrono::DateTime<Utc>>,
    ) -> Result<bool> {
        let updated = self.db.with(|conn| match expected {
            Some(expected) => conn.execute(
                "UPDATE rules SET next_run_at = ?1 WHERE id = ?2 AND next_run_at = ?3",
                params![next.map(to_db_time), rule_id, to_db_time(expected)],
            ),
            None => conn.execute(
                "UPDATE rules SET next_run_at = ?1 WHERE id = ?2 AND next_run_at IS NULL",
                params![next.map(to_db_time), rule_id],
            ),
        })?;
        Ok(updated == 1)
    }
}

/// Read-through snapshot of a tenant's enabled rules, passed into each
/// processing cycle instead of a process-wide singleton.
#[derive(Debug, Clone)]
pub struct RuleSnapshot {
    rules: Vec<Rule>,
}

impl RuleSnapshot {
    /// Build a snapshot from fixed rules (tests, previews).
    pub fn fixed(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Candidate rules for an event, in unspecified order.
    pub fn matching<'a>(&'a self, event: &'a Event) -> impl Iterator<Item = &'a Rule> + 'a {
        self.rules.iter().filter(move |r| r.matches_event(event))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
