//! Job model — one queued invocation of a single action.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job lifecycle. Terminal states: `Succeeded`, `Dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            "dead" => Some(JobStatus::Dead),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Dead)
    }
}

/// A durable action invocation derived from a matched rule firing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub tenant_id: String,
    pub rule_id: String,
    /// `None` for manually triggered jobs.
    pub event_id: Option<String>,
    pub action_type: String,
    /// Params with event-payload placeholders already substituted.
    pub resolved_params: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_run_at: DateTime<Utc>,
    pub idempotency_key: String,
    pub last_error: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Deterministic key: replays of the same event never double-enqueue the
/// same action of the same rule.
pub fn idempotency_key(rule_id: &str, event_id: Option<&str>, action_index: usize) -> String {
    format!("{rule_id}:{}:{action_index}", event_id.unwrap_or("manual"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_deterministic() {
        let a = idempotency_key("r1", Some("e1"), 0);
        let b = idempotency_key("r1", Some("e1"), 0);
        assert_eq!(a, b);
        assert_ne!(a, idempotency_key("r1", Some("e1"), 1));
        assert_ne!(a, idempotency_key("r1", Some("e2"), 0));
        assert_ne!(a, idempotency_key("r1", None, 0));
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Dead.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
        assert_eq!(JobStatus::parse("dead"), Some(JobStatus::Dead));
    }
}
