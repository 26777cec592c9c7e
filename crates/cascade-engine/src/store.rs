//! Event Store — durable, deduplicated ingestion with claim leases.
//!
//! Producers call [`EventStore::submit`]; the processing loop claims
//! batches under a lease and marks events processed once all derived jobs
//! are durably enqueued. Events are never deleted.

use cascade_core::{from_db_time, to_db_time, Result};
use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::Db;
use crate::event::{Event, EventSource, NewEvent};

/// Durable record of every inbound event.
#[derive(Clone)]
pub struct EventStore {
    db: Db,
    /// Delivery-attempt budget stamped on newly submitted events.
    max_attempts: u32,
}

const EVENT_SELECT: &str = "SELECT id, tenant_id, event_type, source, aggregate_type, \
     aggregate_id, payload, correlation_id, dedupe_key, occurred_at, claimed_at, claimed_by, \
     processed_at, attempts, max_attempts FROM events";

fn row_to_event(row: &Row) -> rusqlite::Result<Event> {
    let source_str: String = row.get(3)?;
    let payload_str: String = row.get(6)?;
    Ok(Event {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        event_type: row.get(2)?,
        source: EventSource::parse(&source_str).unwrap_or(EventSource::Domain),
        aggregate_type: row.get(4)?,
        aggregate_id: row.get(5)?,
        payload: serde_json::from_str(&payload_str).unwrap_or_default(),
        correlation_id: row.get(7)?,
        dedupe_key: row.get(8)?,
        occurred_at: from_db_time(&row.get::<_, String>(9)?).unwrap_or_else(Utc::now),
        claimed_at: row
            .get::<_, Option<String>>(10)?
            .and_then(|s| from_db_time(&s)),
        claimed_by: row.get(11)?,
        processed_at: row
            .get::<_, Option<String>>(12)?
            .and_then(|s| from_db_time(&s)),
        attempts: row.get(13)?,
        max_attempts: row.get(14)?,
    })
}

impl EventStore {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            max_attempts: 5,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Submit an event. If the tenant already has an event with the same
    /// dedupe key, the existing event's id is returned and nothing else
    /// happens — the idempotent producer contract.
    pub fn submit(&self, event: NewEvent) -> Result<String> {
        event.validate()?;
        let id = event.assign_id();

        let inserted = self.db.with(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO events
                 (id, tenant_id, event_type, source, aggregate_type, aggregate_id, payload,
                  correlation_id, dedupe_key, occurred_at, attempts, max_attempts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11)",
                params![
                    id,
                    event.tenant_id,
                    event.event_type,
                    event.source.as_str(),
                    event.aggregate_type,
                    event.aggregate_id,
                    event.payload.to_string(),
                    event.correlation_id,
                    event.dedupe_key,
                    to_db_time(event.occurred_at),
                    self.max_attempts,
                ],
            )
        })?;

        if inserted == 1 {
            tracing::debug!("📨 Event submitted: {} ({})", event.event_type, id);
            return Ok(id);
        }

        // Dedupe collision: hand back the existing id.
        let existing: Option<String> = self.db.with(|conn| {
            conn.query_row(
                "SELECT id FROM events WHERE tenant_id = ?1 AND dedupe_key = ?2",
                params![event.tenant_id, event.dedupe_key],
                |r| r.get(0),
            )
            .optional()
        })?;
        match existing {
            Some(existing_id) => {
                tracing::debug!(
                    "📨 Duplicate event suppressed: {} → {}",
                    event.event_type,
                    existing_id
                );
                Ok(existing_id)
            }
            // Insert was ignored but no row matches: lost a race with a
            // concurrent delete-free writer; surface as storage error.
            None => Err(cascade_core::CascadeError::storage(
                "event insert ignored without dedupe match",
            )),
        }
    }

    /// Atomically claim up to `n` unprocessed events whose claim is absent
    /// or expired. Each claim is a per-row conditional update, so two
    /// workers never hold the same live claim.
    pub fn claim_batch(&self, n: usize, lease_secs: u64, worker_id: &str) -> Result<Vec<Event>> {
        let now = Utc::now();
        let cutoff = to_db_time(now - Duration::seconds(lease_secs as i64));
        let now_s = to_db_time(now);

        let claimed_ids = self.db.with_tx(|tx| {
            let candidates: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM events
                     WHERE processed_at IS NULL
                       AND attempts < max_attempts
                       AND (claimed_at IS NULL OR claimed_at < ?1)
                     ORDER BY occurred_at
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![cutoff, n as i64], |r| r.get(0))?;
                rows.collect::<rusqlite::Result<Vec<String>>>()?
            };

            let mut claimed = Vec::with_capacity(candidates.len());
            for id in candidates {
                // Claim succeeds only if the row is still unclaimed/expired
                // at write time.
                let updated = tx.execute(
                    "UPDATE events
                     SET claimed_at = ?1, claimed_by = ?2, attempts = attempts + 1
                     WHERE id = ?3
                       AND processed_at IS NULL
                       AND (claimed_at IS NULL OR claimed_at < ?4)",
                    params![now_s, worker_id, id, cutoff],
                )?;
                if updated == 1 {
                    claimed.push(id);
                }
            }
            Ok(claimed)
        })?;

        let mut events = Vec::with_capacity(claimed_ids.len());
        for id in &claimed_ids {
            if let Some(ev) = self.get(id)? {
                events.push(ev);
            }
        }
        if !events.is_empty() {
            tracing::debug!("📬 Claimed {} event(s) for {}", events.len(), worker_id);
        }
        Ok(events)
    }

    /// Mark an event processed. Idempotent: a second call is a no-op.
    pub fn mark_processed(&self, event_id: &str) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "UPDATE events SET processed_at = ?1 WHERE id = ?2 AND processed_at IS NULL",
                params![to_db_time(Utc::now()), event_id],
            )
        })?;
        Ok(())
    }

    /// Release a claim without marking processed, making the event
    /// immediately reclaimable (used when a worker hits a transient
    /// storage error mid-event).
    pub fn release_claim(&self, event_id: &str, worker_id: &str) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "UPDATE events SET claimed_at = NULL, claimed_by = NULL
                 WHERE id = ?1 AND claimed_by = ?2 AND processed_at IS NULL",
                params![event_id, worker_id],
            )
        })?;
        Ok(())
    }

    /// Fetch a single event by id.
    pub fn get(&self, id: &str) -> Result<Option<Event>> {
        self.db.with(|conn| {
            conn.query_row(
                &format!("{EVENT_SELECT} WHERE id = ?1"),
                params![id],
                row_to_event,
            )
            .optional()
        })
    }

    /// Number of events not yet processed (operator visibility).
    pub fn unprocessed_count(&self) -> Result<u64> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM events WHERE processed_at IS NULL",
                [],
                |r| r.get::<_, i64>(0).map(|n| n as u64),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> EventStore {
        EventStore::new(Db::open_in_memory().unwrap())
    }

    #[test]
    fn test_submit_and_get() {
        let store = store();
        let id = store
            .submit(NewEvent::domain("t1", "Invoice.Overdue", json!({"days_overdue": 35})))
            .unwrap();
        let ev = store.get(&id).unwrap().unwrap();
        assert_eq!(ev.event_type, "Invoice.Overdue");
        assert_eq!(ev.payload["days_overdue"], json!(35));
        assert!(ev.processed_at.is_none());
    }

    #[test]
    fn test_dedupe_returns_existing_id() {
        let store = store();
        let first = store
            .submit(NewEvent::domain("t1", "Invoice.Overdue", json!({})).with_dedupe_key("inv-9"))
            .unwrap();
        let second = store
            .submit(NewEvent::domain("t1", "Invoice.Overdue", json!({})).with_dedupe_key("inv-9"))
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(store.unprocessed_count().unwrap(), 1);

        // Same key under another tenant is a distinct event.
        let other = store
            .submit(NewEvent::domain("t2", "Invoice.Overdue", json!({})).with_dedupe_key("inv-9"))
            .unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let store = store();
        store
            .submit(NewEvent::domain("t1", "Client.Created", json!({})))
            .unwrap();

        let a = store.claim_batch(10, 60, "worker-a").unwrap();
        assert_eq!(a.len(), 1);
        // Second worker sees nothing while the lease is live.
        let b = store.claim_batch(10, 60, "worker-b").unwrap();
        assert!(b.is_empty());
    }

    #[test]
    fn test_expired_lease_is_reclaimable() {
        let store = store();
        store
            .submit(NewEvent::domain("t1", "Client.Created", json!({})))
            .unwrap();

        let a = store.claim_batch(10, 0, "worker-a").unwrap();
        assert_eq!(a.len(), 1);
        // lease_secs = 0 expires immediately; another worker takes over.
        let b = store.claim_batch(10, 0, "worker-b").unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(a[0].id, b[0].id);
        assert_eq!(b[0].attempts, 2);
    }

    #[test]
    fn test_mark_processed_idempotent() {
        let store = store();
        let id = store
            .submit(NewEvent::domain("t1", "Client.Created", json!({})))
            .unwrap();
        store.mark_processed(&id).unwrap();
        let first = store.get(&id).unwrap().unwrap().processed_at.unwrap();
        store.mark_processed(&id).unwrap();
        let second = store.get(&id).unwrap().unwrap().processed_at.unwrap();
        assert_eq!(first, second);
        assert!(store.claim_batch(10, 60, "w").unwrap().is_empty());
    }

    #[test]
    fn test_rejects_malformed_event() {
        let store = store();
        let mut ev = NewEvent::domain("t1", "X", json!({}));
        ev.tenant_id = String::new();
        assert!(store.submit(ev).is_err());
    }
}
