//! Error taxonomy for the persistence pipeline
//!
//! Validation failures are rejected before anything is written. Duplicate
//! samples and degraded backups are not errors at all; they surface as
//! outcomes and health counters instead.

use thiserror::Error;

/// Input rejected before any persistence happens
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("rating {0} is out of range (expected 0-5)")]
    RatingOutOfRange(i64),
    #[error("trip duration must be a positive number of days, got {0}")]
    NonPositiveDuration(i64),
    #[error("trip duration of {0} days is too long")]
    DurationTooLong(i64),
    #[error("generation time {0}ms is out of range")]
    GenerationTimeOutOfRange(u64),
    #[error("unknown budget tier '{0}' (expected Budget, Moderate or Luxury)")]
    UnknownBudgetTier(String),
    #[error("destination must not be empty")]
    EmptyDestination,
}

/// Errors surfaced by the storage coordinator and its stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{kind} #{id} not found")]
    NotFound { kind: &'static str, id: i64 },

    #[error("primary store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backup store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("primary store stayed locked after {attempts} attempts")]
    Conflict { attempts: u32 },

    #[error("backup queue is closed")]
    QueueClosed,

    #[error("invalid cycle transition {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("training cycle #{cycle_number} aborted: {reason}")]
    CycleAborted { cycle_number: i64, reason: String },
}

impl StoreError {
    /// Whether the error is a transient lock conflict worth retrying
    pub fn is_busy(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
