//! Error types for the item pool

use std::sync::Arc;
use thiserror::Error;

/// Boxed error returned by collaborators (factories, checkers).
pub type BoxDynError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    /// No item became available within the borrow budget.
    #[error("Timed out waiting for a pool item")]
    BorrowTimeout,

    /// The item factory failed.
    #[error("Failed to create pool item: {0}")]
    ItemCreationFailed(#[source] Arc<dyn std::error::Error + Send + Sync + 'static>),

    /// The wrapper has been closed.
    #[error("Pool item has been removed")]
    ItemRemoved,

    #[error("Invalid pool configuration: {0}")]
    InvalidConfiguration(String),

    /// An internal invariant broke. Not recoverable.
    #[error("Pool protocol violation: {0}")]
    ProtocolViolation(String),
}

impl PoolError {
    pub(crate) fn creation_failed(cause: BoxDynError) -> Self {
        PoolError::ItemCreationFailed(Arc::from(cause))
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        PoolError::ProtocolViolation(message.into())
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
