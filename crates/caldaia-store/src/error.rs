use caldaia_core::{CoreError, State};
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The stored aggregate could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A rule's target temperature lies outside the boiler bounds.
    #[error("target temperature {temp} out of bounds [{min}, {max}]")]
    TemperatureOutOfBounds { temp: f64, min: f64, max: f64 },

    /// Bounds update would leave `min_temp > max_temp`.
    #[error("invalid temperature bounds: min {min} > max {max}")]
    InvalidBounds { min: f64, max: f64 },

    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// Only `ON` and `OFF` can be requested.
    #[error("invalid state to set: {0}")]
    InvalidState(State),

    #[error("rule not found: {id}")]
    RuleNotFound { id: String },

    /// The change-notification channel has no sender left.
    #[error("change stream closed")]
    Closed,

    /// A thread panicked while holding the connection lock.
    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Short error code string reported to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Database(_) => "DATABASE_ERROR",
            StoreError::Serialization(_) => "SERIALIZATION_ERROR",
            StoreError::TemperatureOutOfBounds { .. } => "TEMPERATURE_OUT_OF_BOUNDS",
            StoreError::InvalidBounds { .. } => "INVALID_BOUNDS",
            StoreError::InvalidRule(_) => "INVALID_RULE",
            StoreError::InvalidState(_) => "INVALID_STATE",
            StoreError::RuleNotFound { .. } => "RULE_NOT_FOUND",
            StoreError::Closed => "STREAM_CLOSED",
            StoreError::Poisoned => "INTERNAL_ERROR",
        }
    }

    /// Rejected input; nothing was written.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            StoreError::TemperatureOutOfBounds { .. }
                | StoreError::InvalidBounds { .. }
                | StoreError::InvalidRule(_)
                | StoreError::InvalidState(_)
        )
    }
}

impl From<CoreError> for StoreError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Serialization(e) => StoreError::Serialization(e),
            other => StoreError::InvalidRule(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
