//! Manager error types.
//!
//! Expected race outcomes (lock conflicts, stale transitions, illegal
//! edges) are structured return values, not errors; see
//! `manager::TransitionOutcome`. Only validation failures and store
//! outages surface here.

use thiserror::Error;

use tape_store::StoreError;

pub type ManagerResult<T> = Result<T, ManagerError>;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ManagerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}
