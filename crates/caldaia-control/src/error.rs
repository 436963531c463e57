use caldaia_store::StoreError;
use thiserror::Error;

/// Errors that end a control loop iteration.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An event source the loop depends on has no sender left.
    #[error("{0} stream closed")]
    StreamClosed(&'static str),

    /// A supervised loop kept failing past its restart budget.
    #[error("{name} gave up after {attempts} restarts")]
    RestartsExhausted { name: String, attempts: u32 },
}

pub type Result<T> = std::result::Result<T, ControlError>;
