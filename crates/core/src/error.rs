use crate::types::Epoch;

/// Rejection reasons produced by the admin guard.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The supplied secret did not match. Counts toward lockout.
    #[error("Invalid credential (retry allowed in {retry_after_secs}s)")]
    Invalid { retry_after_secs: u64 },

    /// The attempt arrived inside the backoff window of a previous failure.
    /// No comparison was performed and the attempt was not counted.
    #[error("Too many attempts, retry in {retry_after_secs}s")]
    Throttled { retry_after_secs: u64 },

    /// The guard is locked out. No comparison was performed.
    #[error("Locked out until epoch {until}")]
    Locked { until: Epoch },
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Capacity exceeded: table already holds {capacity} records")]
    Capacity { capacity: usize },

    #[error("Corrupt index: slot {slot} outside table of {capacity} entries")]
    CorruptIndex { slot: usize, capacity: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Unsupported config schema version {found} (expected {expected})")]
    ConfigVersion { found: u32, expected: u32 },

    #[error("Persistence error: {0}")]
    Persistence(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
