//! Cascade error taxonomy.
//!
//! Variants map to the stages of the pipeline: validation errors are
//! rejected at the boundary, condition/template errors skip a single rule,
//! storage errors are retried by the worker loops.

use thiserror::Error;

/// All errors produced by the Cascade engine.
#[derive(Debug, Error)]
pub enum CascadeError {
    /// Configuration file missing, unreadable, or malformed.
    #[error("config error: {0}")]
    Config(String),

    /// SQLite or filesystem problem — transient from the pipeline's
    /// point of view, retried by the worker loop.
    #[error("storage error: {0}")]
    Storage(String),

    /// Malformed input rejected synchronously at the boundary.
    #[error("validation error: {0}")]
    Validation(String),

    /// Condition expression could not be evaluated against a payload.
    #[error("condition error: {0}")]
    Condition(String),

    /// Placeholder in action params referenced a missing field.
    #[error("template error: {0}")]
    Template(String),

    /// Cron expression or recurrence spec could not be interpreted.
    #[error("schedule error: {0}")]
    Schedule(String),

    /// Action handler invocation failed outside the retry protocol.
    #[error("action error: {0}")]
    Action(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CascadeError {
    /// Shorthand for a storage error with context.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Shorthand for a validation error with context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CascadeError>;
