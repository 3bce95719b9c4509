//! Background maintenance tasks
//!
//! Pool-level tasks run against a [`Pool`](crate::Pool), per-item tasks
//! against every [`ItemWrapper`](crate::ItemWrapper) through a copy of the
//! item scheduler.

mod item_updater;
mod keepalive;
mod leak_detection;
mod resizer;

pub use item_updater::ItemUpdater;
pub use keepalive::{KeepaliveChecker, KeepaliveTask};
pub use leak_detection::LeakDetector;
pub use resizer::Resizer;

use crate::errors::PoolError;
use crate::item::{ItemState, ItemWrapper};
use tracing::warn;

/// Hand a reserved wrapper back to idle; a concurrently closed wrapper is fine
pub(crate) async fn release<T: Send + Sync + 'static>(wrapper: &ItemWrapper<T>) {
    match wrapper.set_state(ItemState::Idle).await {
        Ok(()) | Err(PoolError::ItemRemoved) => {}
        Err(e) => warn!(item_id = wrapper.id(), error = %e, "Can't release reserved item"),
    }
}
