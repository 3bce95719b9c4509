use super::release;
use crate::item::{ItemState, ItemWrapper};
use crate::scheduler::{Tick, TimerTask};
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Liveness probe for an idle item
#[async_trait]
pub trait KeepaliveChecker<T>: Send + Sync {
    /// `false` when the item is dead and has to be recreated
    async fn check(&self, item: &T) -> bool;

    fn interval(&self) -> Duration;
}

/// Periodically probes idle items and recreates dead ones
pub struct KeepaliveTask<T> {
    checker: Arc<dyn KeepaliveChecker<T>>,
}

impl<T> KeepaliveTask<T> {
    pub fn new(checker: Arc<dyn KeepaliveChecker<T>>) -> Self {
        Self { checker }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> TimerTask<ItemWrapper<T>> for KeepaliveTask<T> {
    async fn run(&self, _tick: &Tick, runner: &Weak<ItemWrapper<T>>) {
        let Some(wrapper) = runner.upgrade() else {
            return;
        };

        if !matches!(
            wrapper.compare_and_set_state(ItemState::Idle, ItemState::Reserved),
            Ok(true)
        ) {
            return;
        }

        let alive = match wrapper.item() {
            Ok(Some(item)) => self.checker.check(item.as_ref()).await,
            _ => false,
        };

        if !alive {
            debug!(item_id = wrapper.id(), "Keepalive check failed, recreating item");
            if let Err(e) = wrapper.recreate_item().await {
                warn!(item_id = wrapper.id(), error = %e, "Can't recreate dead item");
            }
        }

        release(&wrapper).await;
    }

    fn interval(&self) -> Duration {
        self.checker.interval()
    }
}
