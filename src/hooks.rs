//! Borrow/return hooks

use crate::item::ItemWrapper;
use async_trait::async_trait;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::warn;

/// Where in the borrow/return cycle a hook runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// After the item was reserved for a borrower, before it is handed out
    BeforeBorrow,

    /// After the borrower gave the item back, before it is re-queued
    AfterReturn,
}

/// Callback invoked while the pool holds the item's reserved slot
///
/// Hooks may read or replace the item through the wrapper. They must not
/// propagate failures; a broken item is the hook's own business.
#[async_trait]
pub trait ItemHook<T>: Send + Sync {
    async fn invoke(&self, wrapper: &ItemWrapper<T>);

    fn point(&self) -> HookPoint;
}

/// Hooks grouped by [`HookPoint`], run in registration order
pub struct HookManager<T> {
    hooks: HashMap<HookPoint, Vec<Arc<dyn ItemHook<T>>>>,
}

impl<T> HookManager<T> {
    pub fn new(hooks: Vec<Arc<dyn ItemHook<T>>>) -> Self {
        let mut grouped: HashMap<HookPoint, Vec<Arc<dyn ItemHook<T>>>> = HashMap::new();

        for hook in hooks {
            grouped.entry(hook.point()).or_default().push(hook);
        }

        Self { hooks: grouped }
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.values().all(Vec::is_empty)
    }

    pub async fn run(&self, point: HookPoint, wrapper: &ItemWrapper<T>) {
        let Some(hooks) = self.hooks.get(&point) else {
            return;
        };

        for hook in hooks {
            hook.invoke(wrapper).await;
        }
    }
}

/// Recreates the item before borrowing when `checker` rejects it
pub struct ValidityCheckHook<T, F> {
    checker: F,
    _item: PhantomData<fn(&T)>,
}

impl<T, F> ValidityCheckHook<T, F>
where
    F: Fn(&T) -> bool + Send + Sync,
{
    pub fn new(checker: F) -> Self {
        Self {
            checker,
            _item: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F> ItemHook<T> for ValidityCheckHook<T, F>
where
    T: Send + Sync + 'static,
    F: Fn(&T) -> bool + Send + Sync,
{
    async fn invoke(&self, wrapper: &ItemWrapper<T>) {
        let valid = match wrapper.item() {
            Ok(Some(item)) => (self.checker)(item.as_ref()),
            Ok(None) => false,
            Err(_) => return,
        };

        if valid {
            return;
        }

        if let Err(e) = wrapper.recreate_item().await {
            warn!(item_id = wrapper.id(), error = %e, "Can't recreate invalid item");
        }
    }

    fn point(&self) -> HookPoint {
        HookPoint::BeforeBorrow
    }
}

/// Resets the item's session state after it was returned
pub struct ResetHook<T, F> {
    resetter: F,
    _item: PhantomData<fn(&T)>,
}

impl<T, F> ResetHook<T, F>
where
    F: Fn(&T) + Send + Sync,
{
    pub fn new(resetter: F) -> Self {
        Self {
            resetter,
            _item: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F> ItemHook<T> for ResetHook<T, F>
where
    T: Send + Sync + 'static,
    F: Fn(&T) + Send + Sync,
{
    async fn invoke(&self, wrapper: &ItemWrapper<T>) {
        if let Ok(Some(item)) = wrapper.item() {
            (self.resetter)(item.as_ref());
        }
    }

    fn point(&self) -> HookPoint {
        HookPoint::AfterReturn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BoxDynError;
    use crate::factory::factory_fn;
    use crate::scheduler::TimerTaskScheduler;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingHook {
        name: &'static str,
        point: HookPoint,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ItemHook<usize> for RecordingHook {
        async fn invoke(&self, _wrapper: &ItemWrapper<usize>) {
            self.log.lock().push(self.name);
        }

        fn point(&self) -> HookPoint {
            self.point
        }
    }

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
    async fn test_hooks_run_grouped_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hook = |name, point| {
            Arc::new(RecordingHook {
                name,
                point,
                log: Arc::clone(&log),
            }) as Arc<dyn ItemHook<usize>>
        };
        let manager = HookManager::new(vec![
            hook("check", HookPoint::BeforeBorrow),
            hook("reset", HookPoint::AfterReturn),
            hook("ping", HookPoint::BeforeBorrow),
        ]);
        let wrapper = wrapper(Arc::new(AtomicUsize::new(0))).await;

        manager.run(HookPoint::BeforeBorrow, &wrapper).await;
        assert_eq!(*log.lock(), vec!["check", "ping"]);

        manager.run(HookPoint::AfterReturn, &wrapper).await;
        assert_eq!(*log.lock(), vec!["check", "ping", "reset"]);
    }

    #[tokio::test]
    async fn test_empty_manager_is_noop() {
        let manager = HookManager::<usize>::new(Vec::new());
        let wrapper = wrapper(Arc::new(AtomicUsize::new(0))).await;

        assert!(manager.is_empty());
        manager.run(HookPoint::BeforeBorrow, &wrapper).await;
    }

    #[tokio::test]
    async fn test_validity_check_recreates_rejected_item() {
        let created = Arc::new(AtomicUsize::new(0));
        let wrapper = wrapper(Arc::clone(&created)).await;
        let hook = ValidityCheckHook::new(|item: &usize| *item > 0);

        hook.invoke(&wrapper).await;
        assert_eq!(*wrapper.item().unwrap().unwrap(), 1);

        hook.invoke(&wrapper).await;
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reset_hook_sees_item() {
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let sink = Arc::clone(&seen);
        let hook = ResetHook::new(move |item: &usize| sink.store(*item, Ordering::SeqCst));
        let wrapper = wrapper(Arc::new(AtomicUsize::new(5))).await;

        assert_eq!(hook.point(), HookPoint::AfterReturn);
        hook.invoke(&wrapper).await;

        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }
}
