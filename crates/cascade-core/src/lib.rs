//! # Cascade Core
//!
//! Shared foundation for the Cascade automation engine: the error type,
//! configuration loading, and id helpers. Every other crate in the
//! workspace builds on this one.

pub mod config;
pub mod error;

pub use config::CascadeConfig;
pub use error::{CascadeError, Result};

use chrono::{DateTime, SecondsFormat, Utc};

/// Generate a fresh id with the given prefix, e.g. `evt-3f2a…`.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

/// Render a timestamp the way it is stored in SQLite columns.
pub fn to_db_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp previously written with [`to_db_time`].
pub fn from_db_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}
