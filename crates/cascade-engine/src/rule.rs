//! Rule definitions — tenant-owned bindings of trigger → conditions →
//! throttle → ordered action list.

use cascade_core::new_id;
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::event::{Event, SCHEDULE_TICK};

/// What makes a rule a candidate for an event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trigger {
    /// Event types this rule listens for.
    #[serde(default)]
    pub event_types: Vec<String>,
    /// Time-based trigger; fires as synthesized `schedule.tick` events.
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
}

/// Recurrence for schedule-triggered rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// 5-field cron expression evaluated in the given IANA time zone.
    Cron {
        expression: String,
        #[serde(default = "default_tz")]
        timezone: String,
    },
    /// Fixed interval in seconds.
    Interval { every_secs: u64 },
}

fn default_tz() -> String {
    "UTC".to_string()
}

/// Fixed-boundary throttle window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleWindow {
    Minute,
    Hour,
    Day,
}

impl ThrottleWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThrottleWindow::Minute => "minute",
            ThrottleWindow::Hour => "hour",
            ThrottleWindow::Day => "day",
        }
    }

    /// Start of the bucket containing `now`. Buckets roll at fixed
    /// boundaries, not sliding windows.
    pub fn bucket_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let base = Utc
            .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
            .single()
            .unwrap_or(now);
        match self {
            ThrottleWindow::Minute => base
                + Duration::hours(i64::from(now.hour()))
                + Duration::minutes(i64::from(now.minute())),
            ThrottleWindow::Hour => base + Duration::hours(i64::from(now.hour())),
            ThrottleWindow::Day => base,
        }
    }
}

/// Rate limit: at most `limit` firings per `window` bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleSpec {
    pub window: ThrottleWindow,
    pub limit: u32,
}

/// One action in a rule's ordered action list. Params may contain
/// `{{payload.*}}` placeholders resolved at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// A tenant-owned automation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub enabled: bool,
    pub trigger: Trigger,
    /// `None` = always true.
    pub conditions: Option<Condition>,
    /// `None` = unthrottled.
    pub throttle: Option<ThrottleSpec>,
    pub actions: Vec<ActionSpec>,
    /// Next due time for schedule rules; maintained by the scheduler.
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    /// A new enabled rule listening for the given event types.
    pub fn new(tenant_id: &str, name: &str, event_types: &[&str]) -> Self {
        let now = Utc::now();
        Self {
            id: new_id("rule"),
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            enabled: true,
            trigger: Trigger {
                event_types: event_types.iter().map(|s| s.to_string()).collect(),
                schedule: None,
            },
            conditions: None,
            throttle: None,
            actions: Vec::new(),
            next_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_schedule(mut self, schedule: ScheduleSpec) -> Self {
        self.trigger.schedule = Some(schedule);
        self
    }

    pub fn with_conditions(mut self, conditions: Condition) -> Self {
        self.conditions = Some(conditions);
        self
    }

    pub fn with_throttle(mut self, window: ThrottleWindow, limit: u32) -> Self {
        self.throttle = Some(ThrottleSpec { window, limit });
        self
    }

    pub fn with_action(mut self, action_type: &str, params: serde_json::Value) -> Self {
        self.actions.push(ActionSpec {
            action_type: action_type.to_string(),
            params,
        });
        self
    }

    /// Whether this rule is a candidate for the given event.
    ///
    /// Schedule ticks are addressed to a single rule: they match only the
    /// rule whose id is carried in the tick payload.
    pub fn matches_event(&self, event: &Event) -> bool {
        if event.event_type == SCHEDULE_TICK {
            return self.trigger.schedule.is_some()
                && event.payload["rule_id"].as_str() == Some(self.id.as_str());
        }
        self.trigger
            .event_types
            .iter()
            .any(|t| t == &event.event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventSource, NewEvent};

    fn stored(ev: NewEvent) -> Event {
        Event {
            id: "evt-test".into(),
            tenant_id: ev.tenant_id,
            event_type: ev.event_type,
            source: ev.source,
            aggregate_type: None,
            aggregate_id: None,
            payload: ev.payload,
            correlation_id: None,
            dedupe_key: None,
            occurred_at: ev.occurred_at,
            claimed_at: None,
            claimed_by: None,
            processed_at: None,
            attempts: 0,
            max_attempts: 5,
        }
    }

    #[test]
    fn test_matches_by_event_type() {
        let rule = Rule::new("t1", "overdue", &["Invoice.Overdue"]);
        let hit = stored(NewEvent::domain("t1", "Invoice.Overdue", serde_json::json!({})));
        let miss = stored(NewEvent::domain("t1", "Invoice.Paid", serde_json::json!({})));
        assert!(rule.matches_event(&hit));
        assert!(!rule.matches_event(&miss));
    }

    #[test]
    fn test_schedule_tick_addressed_to_one_rule() {
        let rule = Rule::new("t1", "digest", &[])
            .with_schedule(ScheduleSpec::Interval { every_secs: 3600 });
        let other = Rule::new("t1", "other", &[])
            .with_schedule(ScheduleSpec::Interval { every_secs: 3600 });

        let tick = stored(NewEvent::schedule_tick("t1", &rule.id, "digest", Utc::now()));
        assert_eq!(tick.source, EventSource::Schedule);
        assert!(rule.matches_event(&tick));
        assert!(!other.matches_event(&tick));
    }

    #[test]
    fn test_bucket_boundaries_fixed() {
        let t = Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap();
        assert_eq!(
            ThrottleWindow::Minute.bucket_start(t),
            Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 0).unwrap()
        );
        assert_eq!(
            ThrottleWindow::Hour.bucket_start(t),
            Utc.with_ymd_and_hms(2026, 3, 14, 15, 0, 0).unwrap()
        );
        assert_eq!(
            ThrottleWindow::Day.bucket_start(t),
            Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).unwrap()
        );
    }
}
