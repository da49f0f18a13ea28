//! Error types for lock and transaction operations.
//!
//! Contention is deliberately not represented here: failing to acquire a
//! lock or losing ownership is a boolean result, never an error.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    /// Redis connection or command error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Lock TTLs must be positive durations.
    #[error("Lock TTL must be a positive duration")]
    InvalidTtl,

    /// Poll intervals must be positive durations.
    #[error("Poll interval must be a positive duration")]
    InvalidPollInterval,

    /// A watched key changed on every attempt.
    #[error("Optimistic transaction conflict after {attempts} attempts (watched keys: {keys:?})")]
    Conflict { keys: Vec<String>, attempts: u32 },

    /// The batch-building callback failed.
    #[error("Batch build failed: {0}")]
    BatchBuild(#[source] anyhow::Error),

    /// The store backend cannot execute a queued command.
    #[error("Unsupported batch command: {0}")]
    UnsupportedCommand(String),
}

pub type LockResult<T> = std::result::Result<T, LockError>;
