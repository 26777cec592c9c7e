//! # Cascade Engine
//!
//! Tenant-scoped automation engine: a durable event bus that matches
//! domain events against user-defined rules, evaluates conditions,
//! enforces rate limits, and dispatches actions through a versioned
//! capability catalog with at-least-once delivery.
//!
//! ## Architecture
//! ```text
//! producer → EventStore (dedupe)
//!   → EngineWorker claims a batch (lease)
//!     → RuleSnapshot lookup by event type
//!       → Condition tree evaluation (pure)
//!         → resolve {{payload.*}} placeholders + catalog validation
//!           → ThrottleController admit/reject
//!             → JobQueue (one job per action, idempotency key)
//! ActionDispatcher claims jobs (lease)
//!   → ActionCatalog config validation
//!     → ActionHandler::execute (timeout)
//!       → retry w/ backoff | dead-letter
//! ExecutionLog records every outcome (append-only)
//! Scheduler synthesizes schedule.tick events through the same pipeline
//! ```
//!
//! Delivery is at-least-once: claims are leases that expire on worker
//! crash, and the dedupe key on events plus the idempotency key on jobs
//! make redelivery safe.

pub mod actions;
pub mod catalog;
pub mod condition;
pub mod db;
pub mod dispatcher;
pub mod event;
pub mod job;
pub mod log;
pub mod queue;
pub mod registry;
pub mod rule;
pub mod scheduler;
pub mod store;
pub mod template;
pub mod throttle;
pub mod worker;

mod cron;

pub use catalog::{ActionCatalog, ActionCatalogEntry, ActionFailure, ActionHandler};
pub use condition::{Comparator, Condition};
pub use db::Db;
pub use dispatcher::ActionDispatcher;
pub use event::{Event, EventSource, NewEvent, SCHEDULE_TICK};
pub use job::{Job, JobStatus};
pub use log::{ExecutionLog, LogEntry, Outcome};
pub use queue::{JobQueue, QueueStats};
pub use registry::{RuleRegistry, RuleSnapshot};
pub use rule::{ActionSpec, Rule, ScheduleSpec, ThrottleSpec, ThrottleWindow, Trigger};
pub use scheduler::Scheduler;
pub use store::EventStore;
pub use throttle::ThrottleController;
pub use worker::{EngineWorker, RulePreview};
