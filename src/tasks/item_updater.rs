use super::release;
use crate::item::{ItemState, ItemWrapper};
use crate::scheduler::{Tick, TimerTask};
use async_trait::async_trait;
use std::sync::Weak;
use std::time::Duration;
use tracing::{trace, warn};

/// Recreates items older than `max_lifetime`
///
/// The item is only touched while idle. With a non-zero
/// `max_reserving_wait` the updater waits that long for a busy item to
/// come back instead of skipping it until the next tick.
#[derive(Debug, Clone)]
pub struct ItemUpdater {
    interval: Duration,
    max_lifetime: Duration,
    max_reserving_wait: Duration,
}

impl ItemUpdater {
    pub fn new(interval: Duration, max_lifetime: Duration, max_reserving_wait: Duration) -> Self {
        Self {
            interval,
            max_lifetime,
            max_reserving_wait,
        }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> TimerTask<ItemWrapper<T>> for ItemUpdater {
    async fn run(&self, _tick: &Tick, runner: &Weak<ItemWrapper<T>>) {
        let Some(wrapper) = runner.upgrade() else {
            return;
        };

        let reserved = if self.max_reserving_wait.is_zero() {
            wrapper.compare_and_set_state(ItemState::Idle, ItemState::Reserved)
        } else {
            wrapper
                .wait_for_compare_and_set_state(
                    ItemState::Idle,
                    ItemState::Reserved,
                    self.max_reserving_wait,
                )
                .await
        };

        if !matches!(reserved, Ok(true)) {
            return;
        }

        let lifetime = wrapper.stats().item_lifetime;
        if lifetime > self.max_lifetime {
            match wrapper.recreate_item().await {
                Ok(()) => trace!(item_id = wrapper.id(), lifetime = lifetime.as_secs_f64(), "Expired item recreated"),
                Err(e) => warn!(item_id = wrapper.id(), error = %e, "Can't recreate expired item"),
            }
        }

        release(&wrapper).await;
    }

    fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BoxDynError;
    use crate::factory::factory_fn;
    use crate::scheduler::TimerTaskScheduler;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn wrapper(created: Arc<AtomicUsize>) -> Arc<ItemWrapper<usize>> {
        let factory = factory_fn(move || {
            let created = Arc::clone(&created);
            async move { Ok::<_, BoxDynError>(created.fetch_add(1, Ordering::SeqCst)) }
        });
        ItemWrapper::new(Arc::new(factory), TimerTaskScheduler::new(Vec::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_expired_item_is_recreated() {
        let created = Arc::new(AtomicUsize::new(0));
        let wrapper = wrapper(Arc::clone(&created)).await;
        let updater = ItemUpdater::new(Duration::from_millis(5), Duration::from_millis(10), Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(20)).await;
        updater.run(&Tick::immediate(), &Arc::downgrade(&wrapper)).await;

        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(wrapper.state(), ItemState::Idle);
    }

    #[tokio::test]
    async fn test_fresh_item_is_kept() {
        let created = Arc::new(AtomicUsize::new(0));
        let wrapper = wrapper(Arc::clone(&created)).await;
        let updater = ItemUpdater::new(Duration::from_millis(5), Duration::from_secs(60), Duration::ZERO);

        updater.run(&Tick::immediate(), &Arc::downgrade(&wrapper)).await;

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(wrapper.state(), ItemState::Idle);
    }

    #[tokio::test]
    async fn test_busy_item_is_skipped() {
        let created = Arc::new(AtomicUsize::new(0));
        let wrapper = wrapper(Arc::clone(&created)).await;
        wrapper.compare_and_set_state(ItemState::Idle, ItemState::Reserved).unwrap();
        wrapper.set_state(ItemState::InUse).await.unwrap();
        let updater = ItemUpdater::new(Duration::from_millis(5), Duration::ZERO, Duration::from_millis(5));

        updater.run(&Tick::immediate(), &Arc::downgrade(&wrapper)).await;

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(wrapper.state(), ItemState::InUse);
    }
}
