//! Event model — immutable facts submitted to the engine.

use cascade_core::new_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved event type emitted by the scheduler for due schedule rules.
pub const SCHEDULE_TICK: &str = "schedule.tick";

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Emitted by a business module (invoice overdue, client created, …).
    Domain,
    /// Relayed from an external provider integration.
    Provider,
    /// Synthesized by the scheduler for a due schedule rule.
    Schedule,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Domain => "domain",
            EventSource::Provider => "provider",
            EventSource::Schedule => "schedule",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "domain" => Some(EventSource::Domain),
            "provider" => Some(EventSource::Provider),
            "schedule" => Some(EventSource::Schedule),
            _ => None,
        }
    }
}

/// A stored event, as seen by the processing loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub tenant_id: String,
    pub event_type: String,
    pub source: EventSource,
    pub aggregate_type: Option<String>,
    pub aggregate_id: Option<String>,
    pub payload: serde_json::Value,
    pub correlation_id: Option<String>,
    pub dedupe_key: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
}

impl Event {
    /// An unstored event for dry-run previews. Never persisted.
    pub fn synthetic(tenant_id: &str, event_type: &str, payload: serde_json::Value) -> Self {
        Self {
            id: new_id("preview"),
            tenant_id: tenant_id.to_string(),
            event_type: event_type.to_string(),
            source: EventSource::Domain,
            aggregate_type: None,
            aggregate_id: None,
            payload,
            correlation_id: None,
            dedupe_key: None,
            occurred_at: Utc::now(),
            claimed_at: None,
            claimed_by: None,
            processed_at: None,
            attempts: 0,
            max_attempts: 1,
        }
    }
}

/// An event as submitted by a producer, before it is assigned an id.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub tenant_id: String,
    pub event_type: String,
    pub source: EventSource,
    pub payload: serde_json::Value,
    pub aggregate_type: Option<String>,
    pub aggregate_id: Option<String>,
    pub correlation_id: Option<String>,
    pub dedupe_key: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl NewEvent {
    /// A domain event with the given type and payload.
    pub fn domain(tenant_id: &str, event_type: &str, payload: serde_json::Value) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            event_type: event_type.to_string(),
            source: EventSource::Domain,
            payload,
            aggregate_type: None,
            aggregate_id: None,
            correlation_id: None,
            dedupe_key: None,
            occurred_at: Utc::now(),
        }
    }

    /// A schedule tick for a due rule. The dedupe key pins one tick per
    /// due slot even when several scheduler instances race.
    pub fn schedule_tick(tenant_id: &str, rule_id: &str, rule_name: &str, due: DateTime<Utc>) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            event_type: SCHEDULE_TICK.to_string(),
            source: EventSource::Schedule,
            payload: serde_json::json!({
                "rule_id": rule_id,
                "rule_name": rule_name,
                "scheduled_for": due.to_rfc3339(),
            }),
            aggregate_type: None,
            aggregate_id: None,
            correlation_id: None,
            dedupe_key: Some(format!("tick:{rule_id}:{}", due.timestamp())),
            occurred_at: due,
        }
    }

    pub fn with_dedupe_key(mut self, key: &str) -> Self {
        self.dedupe_key = Some(key.to_string());
        self
    }

    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_string());
        self
    }

    pub fn with_aggregate(mut self, aggregate_type: &str, aggregate_id: &str) -> Self {
        self.aggregate_type = Some(aggregate_type.to_string());
        self.aggregate_id = Some(aggregate_id.to_string());
        self
    }

    /// Boundary validation: required fields must be non-empty.
    pub fn validate(&self) -> cascade_core::Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(cascade_core::CascadeError::validation("event tenant_id is empty"));
        }
        if self.event_type.trim().is_empty() {
            return Err(cascade_core::CascadeError::validation("event type is empty"));
        }
        Ok(())
    }

    pub(crate) fn assign_id(&self) -> String {
        new_id("evt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_empty_type() {
        let mut ev = NewEvent::domain("t1", "Invoice.Overdue", serde_json::json!({}));
        assert!(ev.validate().is_ok());
        ev.event_type = "  ".into();
        assert!(ev.validate().is_err());
    }

    #[test]
    fn test_schedule_tick_dedupe_key() {
        let due = Utc::now();
        let a = NewEvent::schedule_tick("t1", "r1", "daily", due);
        let b = NewEvent::schedule_tick("t1", "r1", "daily", due);
        assert_eq!(a.dedupe_key, b.dedupe_key);
        assert_eq!(a.event_type, SCHEDULE_TICK);
        assert_eq!(a.source, EventSource::Schedule);
    }
}
