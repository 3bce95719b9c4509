//! Item factories

use crate::errors::{BoxDynError, PoolResult};
use crate::item::ItemWrapper;
use crate::scheduler::TimerTaskScheduler;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// Builds raw resources for the pool (e.g. opens a database connection)
#[async_trait]
pub trait ItemFactory<T>: Send + Sync {
    async fn create(&self) -> Result<T, BoxDynError>;
}

/// [`ItemFactory`] backed by an async closure, see [`factory_fn`]
#[derive(Clone)]
pub struct FnFactory<F> {
    f: F,
}

/// Adapt an async closure into an [`ItemFactory`]
///
/// # Examples
///
/// ```
/// use esox_itempool::{factory_fn, BoxDynError, ItemFactory};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let factory = factory_fn(|| async { Ok::<_, BoxDynError>(String::from("conn")) });
///
/// assert_eq!(factory.create().await.unwrap(), "conn");
/// # }
/// ```
pub fn factory_fn<F>(f: F) -> FnFactory<F> {
    FnFactory { f }
}

#[async_trait]
impl<T, E, F, Fut> ItemFactory<T> for FnFactory<F>
where
    T: Send + 'static,
    E: Into<BoxDynError> + 'static,
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    async fn create(&self) -> Result<T, BoxDynError> {
        (self.f)().await.map_err(Into::into)
    }
}

/// Wraps freshly created resources into [`ItemWrapper`]s
///
/// Every wrapper gets its own copy of the per-item scheduler prototype.
pub struct ItemWrapperFactory<T> {
    factory: Arc<dyn ItemFactory<T>>,
    scheduler: TimerTaskScheduler<ItemWrapper<T>>,
}

impl<T: Send + Sync + 'static> ItemWrapperFactory<T> {
    pub fn new(
        factory: Arc<dyn ItemFactory<T>>,
        scheduler: TimerTaskScheduler<ItemWrapper<T>>,
    ) -> Self {
        Self { factory, scheduler }
    }

    /// Wrapper factory whose wrappers run no per-item tasks
    pub fn without_tasks(factory: Arc<dyn ItemFactory<T>>) -> Self {
        Self::new(factory, TimerTaskScheduler::new(Vec::new()))
    }

    pub async fn create(&self) -> PoolResult<Arc<ItemWrapper<T>>> {
        ItemWrapper::new(Arc::clone(&self.factory), self.scheduler.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PoolError;
    use crate::item::ItemState;

    #[tokio::test]
    async fn test_wrapper_factory_creates_idle_wrappers() {
        let factory = ItemWrapperFactory::without_tasks(Arc::new(factory_fn(|| async {
            Ok::<_, BoxDynError>(7u32)
        })));

        let first = factory.create().await.unwrap();
        let second = factory.create().await.unwrap();

        assert_eq!(first.state(), ItemState::Idle);
        assert_eq!(*first.item().unwrap().unwrap(), 7);
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test]
    async fn test_wrapper_factory_propagates_creation_failure() {
        let factory = ItemWrapperFactory::without_tasks(Arc::new(factory_fn(|| async {
            Err::<u32, BoxDynError>("database is down".into())
        })));

        let result = factory.create().await;

        assert!(matches!(result, Err(PoolError::ItemCreationFailed(_))));
    }
}
