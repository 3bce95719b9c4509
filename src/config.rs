//! Pool configuration options

use crate::errors::{PoolError, PoolResult};
use std::time::Duration;

/// Immutable configuration of a [`Pool`](crate::Pool)
///
/// # Examples
///
/// ```
/// use esox_itempool::PoolConfig;
/// use std::time::Duration;
///
/// let config = PoolConfig::new(10)
///     .with_borrow_timeout(Duration::from_millis(250))
///     .with_bind_to_task(true)
///     .with_auto_return(true);
///
/// assert_eq!(config.capacity, 10);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of items the pool keeps alive
    pub capacity: usize,

    /// How long `borrow` may wait for an item
    pub borrow_timeout: Duration,

    /// How long `return_item` may wait to re-queue an item
    pub return_timeout: Duration,

    /// Return the bound item automatically when the owning task scope ends
    pub auto_return: bool,

    /// Repeated borrows from the same task yield the same item
    pub bind_to_task: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            borrow_timeout: Duration::from_millis(100),
            return_timeout: Duration::from_millis(1),
            auto_return: false,
            bind_to_task: false,
        }
    }
}

impl PoolConfig {
    /// Create a configuration for `capacity` items with default timeouts
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    pub fn with_borrow_timeout(mut self, timeout: Duration) -> Self {
        self.borrow_timeout = timeout;
        self
    }

    pub fn with_return_timeout(mut self, timeout: Duration) -> Self {
        self.return_timeout = timeout;
        self
    }

    /// Enable auto-return (requires [`with_bind_to_task`](Self::with_bind_to_task))
    pub fn with_auto_return(mut self, auto_return: bool) -> Self {
        self.auto_return = auto_return;
        self
    }

    pub fn with_bind_to_task(mut self, bind_to_task: bool) -> Self {
        self.bind_to_task = bind_to_task;
        self
    }

    /// Check construction-time invariants
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_itempool::{PoolConfig, PoolError};
    ///
    /// let config = PoolConfig::new(4).with_auto_return(true);
    ///
    /// assert!(matches!(config.validate(), Err(PoolError::InvalidConfiguration(_))));
    /// ```
    pub fn validate(&self) -> PoolResult<()> {
        if self.capacity == 0 {
            return Err(PoolError::InvalidConfiguration(
                "capacity must be positive".to_string(),
            ));
        }

        if self.auto_return && !self.bind_to_task {
            return Err(PoolError::InvalidConfiguration(
                "auto return can only work with task binding".to_string(),
            ));
        }

        Ok(())
    }
}
