//! Pool coordinator: borrow/return, task binding and size control

use crate::bag::ConcurrentBag;
use crate::config::PoolConfig;
use crate::errors::{PoolError, PoolResult};
use crate::factory::ItemWrapperFactory;
use crate::hooks::{HookManager, HookPoint};
use crate::item::{ItemState, ItemWrapper};
use crate::metrics::{MetricsExporter, MetricsTracker, PoolStats};
use crate::scheduler::TimerTaskScheduler;

use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::{Id as TaskId, JoinHandle};
use tracing::{debug, error, trace, warn};

/// Queue operations issued by the pool itself (top-up, shrink, put-back)
const INTERNAL_QUEUE_TIMEOUT: Duration = Duration::from_millis(1);

/// Smallest wait budget handed to the reservation step
const MIN_WAIT_BUDGET: Duration = Duration::from_micros(100);

struct BorrowRecord<T> {
    wrapper: Arc<ItemWrapper<T>>,
    lease: u64,
    task: Option<TaskId>,
}

struct TaskBinding<T> {
    item: Arc<T>,
    lease: u64,
}

fn identity<T>(item: &Arc<T>) -> usize {
    Arc::as_ptr(item) as usize
}

/// Bounded pool of reusable items
///
/// Always used behind an [`Arc`]: background tasks and scoped auto-return
/// hold weak handles to it.
pub struct Pool<T> {
    name: String,
    config: PoolConfig,
    self_ref: Weak<Pool<T>>,
    wrapper_factory: ItemWrapperFactory<T>,
    hooks: Option<HookManager<T>>,
    scheduler: Option<TimerTaskScheduler<Pool<T>>>,
    available: ConcurrentBag<Arc<ItemWrapper<T>>>,
    wrapper_count: AtomicUsize,
    idled: DashMap<String, (Arc<ItemWrapper<T>>, Instant)>,
    borrowed: DashMap<usize, BorrowRecord<T>>,
    bindings: DashMap<TaskId, TaskBinding<T>>,
    next_lease: AtomicU64,
    metrics: MetricsTracker,
}

impl<T: Send + Sync + 'static> Pool<T> {
    /// Create a pool and start its maintenance scheduler
    ///
    /// The scheduler runs every pool task once before it starts ticking, so
    /// a resizer fills the pool up to its idle floor before this returns.
    pub async fn new(
        name: impl Into<String>,
        config: PoolConfig,
        wrapper_factory: ItemWrapperFactory<T>,
        scheduler: Option<TimerTaskScheduler<Pool<T>>>,
        hooks: Option<HookManager<T>>,
    ) -> PoolResult<Arc<Self>> {
        config.validate()?;

        let hooks = hooks.filter(|hooks| !hooks.is_empty());
        let pool = Arc::new_cyclic(|self_ref| Self {
            name: name.into(),
            available: ConcurrentBag::new(config.capacity),
            config,
            self_ref: self_ref.clone(),
            wrapper_factory,
            hooks,
            scheduler,
            wrapper_count: AtomicUsize::new(0),
            idled: DashMap::new(),
            borrowed: DashMap::new(),
            bindings: DashMap::new(),
            next_lease: AtomicU64::new(1),
            metrics: MetricsTracker::new(),
        });

        if let Some(scheduler) = &pool.scheduler {
            scheduler.bind_to(Arc::downgrade(&pool))?;
            scheduler.run().await?;
            scheduler.start()?;
        }

        debug!(pool = %pool.name, capacity = pool.config.capacity, "Pool created");

        Ok(pool)
    }

    /// Borrow an item, waiting at most the configured borrow timeout
    ///
    /// With task binding, repeated borrows from the same tokio task return
    /// the same item until it is returned.
    pub async fn borrow(&self) -> PoolResult<Arc<T>> {
        let task = tokio::task::try_id();

        if self.config.bind_to_task {
            if let Some(binding) = task.and_then(|task| self.bindings.get(&task)) {
                return Ok(Arc::clone(&binding.item));
            }
        }

        let start = Instant::now();
        let wrapper = self
            .reserved_wrapper_with_item(self.config.borrow_timeout)
            .await?;

        if let Some(hooks) = &self.hooks {
            hooks.run(HookPoint::BeforeBorrow, &wrapper).await;
        }

        let item = match Self::take_into_use(&wrapper) {
            Ok(item) => item,
            Err(e) => {
                self.remove_wrapper(&wrapper);
                return match e {
                    PoolError::ItemRemoved => {
                        warn!(pool = %self.name, item_id = wrapper.id(), "Item is gone after borrow hooks");
                        self.metrics.record_timeout();
                        Err(PoolError::BorrowTimeout)
                    }
                    e => Err(e),
                };
            }
        };

        self.idled.remove(wrapper.id());

        let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);
        let task = task.filter(|_| self.config.bind_to_task);
        self.borrowed.insert(
            identity(&item),
            BorrowRecord {
                wrapper: Arc::clone(&wrapper),
                lease,
                task,
            },
        );

        if let Some(task) = task {
            self.bindings.insert(
                task,
                TaskBinding {
                    item: Arc::clone(&item),
                    lease,
                },
            );
        }

        self.metrics.record_borrow(start.elapsed());
        trace!(pool = %self.name, item_id = wrapper.id(), lease, "Item borrowed");

        Ok(item)
    }

    /// Give a borrowed item back and clear the caller's handle
    ///
    /// Unknown items (already returned, or never borrowed from this pool)
    /// are dropped silently.
    pub async fn return_item(&self, item: &mut Option<Arc<T>>) -> PoolResult<()> {
        let Some(item) = item.take() else {
            return Ok(());
        };

        let Some((_, record)) = self.borrowed.remove(&identity(&item)) else {
            return Ok(());
        };
        drop(item);

        self.complete_return(record).await
    }

    /// Run `future`, then release what the current task has bound
    ///
    /// With auto-return the bound item goes back to the pool once `future`
    /// completes or is cancelled, unless it was already returned.
    pub async fn scope<F: Future>(&self, future: F) -> F::Output {
        let mut guard = ScopeGuard {
            pool: self.self_ref.clone(),
            task: tokio::task::try_id(),
            armed: true,
        };

        let output = future.await;

        guard.armed = false;
        if let Some(task) = guard.task {
            self.release_task(task).await;
        }

        output
    }

    /// Spawn `future` as a tokio task running inside [`scope`](Self::scope)
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let pool = self.self_ref.clone();

        tokio::spawn(async move {
            match pool.upgrade() {
                Some(pool) => pool.scope(future).await,
                None => future.await,
            }
        })
    }

    /// Add one idle item if there is room for it
    pub async fn increase_items(&self) -> PoolResult<bool> {
        if self.available.is_full() {
            return Ok(false);
        }

        let capacity = self.config.capacity;
        let reserved = self
            .wrapper_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < capacity).then_some(count + 1)
            });
        if reserved.is_err() {
            return Ok(false);
        }

        let start = Instant::now();
        let wrapper = match self.wrapper_factory.create().await {
            Ok(wrapper) => wrapper,
            Err(e) => {
                self.wrapper_count.fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
        };

        self.metrics.record_created(start.elapsed());
        self.idled
            .insert(wrapper.id().to_string(), (Arc::clone(&wrapper), Instant::now()));

        let pushed = self
            .available
            .push(Arc::clone(&wrapper), INTERNAL_QUEUE_TIMEOUT)
            .await;
        if pushed {
            trace!(pool = %self.name, item_id = wrapper.id(), "Item added");
        } else {
            self.remove_wrapper(&wrapper);
        }

        Ok(pushed)
    }

    /// Close one idle item; `false` if none is available
    pub async fn decrease_items(&self) -> bool {
        if self.available.is_empty() {
            return false;
        }

        let Some(wrapper) = self.available.pop(INTERNAL_QUEUE_TIMEOUT).await else {
            return false;
        };

        self.remove_wrapper(&wrapper);
        true
    }

    async fn release_task(&self, task: TaskId) {
        let Some((_, binding)) = self.bindings.remove(&task) else {
            return;
        };

        if !self.config.auto_return {
            return;
        }

        let record = self
            .borrowed
            .remove_if(&identity(&binding.item), |_, record| record.lease == binding.lease);
        drop(binding);

        if let Some((_, record)) = record {
            if let Err(e) = self.complete_return(record).await {
                error!(pool = %self.name, error = %e, "Can't auto-return item");
            }
        }
    }

    async fn complete_return(&self, record: BorrowRecord<T>) -> PoolResult<()> {
        let BorrowRecord {
            wrapper, lease, task,
        } = record;

        if let Some(task) = task {
            self.bindings.remove_if(&task, |_, binding| binding.lease == lease);
        }

        // Closed and uncounted rather than abandoned, so the count never drifts.
        if self.available.is_full() {
            warn!(pool = %self.name, item_id = wrapper.id(), "Available queue is full, dropping returned item");
            self.remove_wrapper(&wrapper);
            return Ok(());
        }

        match self.requeue(&wrapper).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(pool = %self.name, item_id = wrapper.id(), "Can't re-queue returned item, removing it");
                self.remove_wrapper(&wrapper);
                return Ok(());
            }
            Err(e) => {
                self.remove_wrapper(&wrapper);
                return match e {
                    PoolError::ItemRemoved => Ok(()),
                    e => Err(e),
                };
            }
        }

        trace!(pool = %self.name, item_id = wrapper.id(), lease, "Item returned");

        Ok(())
    }

    /// RESERVED -> IN_USE; `ItemRemoved` when hooks closed the wrapper or lost its item
    fn take_into_use(wrapper: &ItemWrapper<T>) -> PoolResult<Arc<T>> {
        if !wrapper.compare_and_set_state(ItemState::Reserved, ItemState::InUse)? {
            return Err(PoolError::protocol(format!(
                "item {} left reserved state during borrow hooks",
                wrapper.id()
            )));
        }

        wrapper.item()?.ok_or(PoolError::ItemRemoved)
    }

    /// IN_USE -> RESERVED -> IDLE around the return hooks, then back into the queue
    async fn requeue(&self, wrapper: &Arc<ItemWrapper<T>>) -> PoolResult<bool> {
        if wrapper.is_removed() {
            return Err(PoolError::ItemRemoved);
        }

        let state = wrapper.state();
        if state != ItemState::InUse {
            return Err(PoolError::protocol(format!(
                "returned item {} is {state}, expected {}",
                wrapper.id(),
                ItemState::InUse
            )));
        }

        self.metrics
            .record_in_use(wrapper.stats().current_state_duration);

        wrapper.set_state(ItemState::Reserved).await?;

        if let Some(hooks) = &self.hooks {
            hooks.run(HookPoint::AfterReturn, wrapper).await;
        }

        if !wrapper.compare_and_set_state(ItemState::Reserved, ItemState::Idle)? {
            return Err(PoolError::protocol(format!(
                "item {} left reserved state during return hooks",
                wrapper.id()
            )));
        }

        self.idled
            .insert(wrapper.id().to_string(), (Arc::clone(wrapper), Instant::now()));

        Ok(self
            .available
            .push(Arc::clone(wrapper), self.config.return_timeout)
            .await)
    }

    /// Pop a wrapper, asking for a new one in the background if the pool is empty
    async fn pop_wrapper(
        &self,
        timeout: Duration,
        increase_on_empty: bool,
    ) -> PoolResult<Arc<ItemWrapper<T>>> {
        if increase_on_empty
            && self.available.is_empty()
            && self.current_size() < self.config.capacity
        {
            self.spawn_top_up();
        }

        match self.available.pop(timeout).await {
            Some(wrapper) => Ok(wrapper),
            None => {
                self.metrics.record_timeout();
                Err(PoolError::BorrowTimeout)
            }
        }
    }

    fn spawn_top_up(&self) {
        let Some(pool) = self.self_ref.upgrade() else {
            return;
        };

        tokio::spawn(async move {
            if let Err(e) = pool.increase_items().await {
                error!(pool = %pool.name, error = %e, "Can't create new item for empty pool");
            }
        });
    }

    /// Pop a wrapper and move it from idle to reserved within `timeout`
    async fn reserved_wrapper(
        &self,
        timeout: Duration,
        increase_on_empty: bool,
    ) -> PoolResult<Arc<ItemWrapper<T>>> {
        let start = Instant::now();
        let wrapper = self.pop_wrapper(timeout, increase_on_empty).await?;
        let left = timeout.saturating_sub(start.elapsed()).max(MIN_WAIT_BUDGET);

        match wrapper
            .wait_for_compare_and_set_state(ItemState::Idle, ItemState::Reserved, left)
            .await
        {
            Ok(true) => Ok(wrapper),
            Ok(false) => {
                error!(
                    pool = %self.name,
                    item_id = wrapper.id(),
                    item_old_state = %wrapper.state(),
                    item_new_state = %ItemState::Reserved,
                    "Can't reserve item"
                );
                self.metrics.record_timeout();

                if !self
                    .available
                    .push(Arc::clone(&wrapper), INTERNAL_QUEUE_TIMEOUT)
                    .await
                {
                    self.remove_wrapper(&wrapper);
                }

                Err(PoolError::BorrowTimeout)
            }
            Err(e) => {
                self.discard_wrapper(&wrapper);
                Err(e)
            }
        }
    }

    /// Like [`reserved_wrapper`](Self::reserved_wrapper), skipping wrappers without an item
    async fn reserved_wrapper_with_item(&self, timeout: Duration) -> PoolResult<Arc<ItemWrapper<T>>> {
        let start = Instant::now();
        let mut increase_on_empty = true;

        loop {
            let left = timeout.saturating_sub(start.elapsed()).max(MIN_WAIT_BUDGET);

            let wrapper = match self.reserved_wrapper(left, increase_on_empty).await {
                Ok(wrapper) => wrapper,
                Err(PoolError::ItemRemoved) => continue,
                Err(e) => return Err(e),
            };

            match wrapper.item() {
                Ok(Some(_)) => return Ok(wrapper),
                _ => {
                    debug!(pool = %self.name, item_id = wrapper.id(), "Dropping item wrapper without item");
                    self.remove_wrapper(&wrapper);
                    increase_on_empty = false;
                }
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.metrics.snapshot(
            self.current_size(),
            self.idle_count(),
            self.borrowed.len(),
            self.available.pending_consumers(),
        )
    }

    /// Export metrics in Prometheus format
    pub fn export_metrics_prometheus(&self, tags: Option<&HashMap<String, String>>) -> String {
        MetricsExporter::export_prometheus(&self.stats(), &self.name, tags)
    }
}

impl<T> Pool<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Live wrappers, whatever their state
    pub fn current_size(&self) -> usize {
        self.wrapper_count.load(Ordering::Acquire)
    }

    /// Maintenance timers currently scheduled for the pool
    pub fn active_timers(&self) -> usize {
        self.scheduler
            .as_ref()
            .map_or(0, TimerTaskScheduler::active_timers)
    }

    /// Wrappers waiting in the available queue
    pub fn idle_count(&self) -> usize {
        self.available.len()
    }

    /// Idle wrappers with the instant they became idle
    pub fn idled_items(&self) -> Vec<(Arc<ItemWrapper<T>>, Instant)> {
        self.idled
            .iter()
            .map(|entry| (Arc::clone(&entry.value().0), entry.value().1))
            .collect()
    }

    /// Wrappers whose item is currently borrowed
    pub fn borrowed_items(&self) -> Vec<Arc<ItemWrapper<T>>> {
        self.borrowed
            .iter()
            .map(|entry| Arc::clone(&entry.value().wrapper))
            .collect()
    }

    /// Close `wrapper` and stop counting it
    fn remove_wrapper(&self, wrapper: &ItemWrapper<T>) {
        self.idled.remove(wrapper.id());
        wrapper.close();

        self.wrapper_count.fetch_sub(1, Ordering::AcqRel);
        self.metrics.record_deleted();

        trace!(pool = %self.name, item_id = wrapper.id(), "Item removed");
    }

    /// Forget a wrapper that was closed behind the pool's back
    fn discard_wrapper(&self, wrapper: &ItemWrapper<T>) {
        if self.idled.remove(wrapper.id()).is_some() {
            self.wrapper_count.fetch_sub(1, Ordering::AcqRel);
            self.metrics.record_deleted();
        }
    }
}

/// Returns the scope's bound item if the scoped future never completed
struct ScopeGuard<T: Send + Sync + 'static> {
    pool: Weak<Pool<T>>,
    task: Option<TaskId>,
    armed: bool,
}

impl<T: Send + Sync + 'static> Drop for ScopeGuard<T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let (Some(pool), Some(task)) = (self.pool.upgrade(), self.task) else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { pool.release_task(task).await });
            }
            Err(_) => {
                warn!(pool = %pool.name, "Tokio runtime unavailable, bound item not auto-returned");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BoxDynError;
    use crate::factory::factory_fn;

    async fn pool(config: PoolConfig) -> Arc<Pool<u32>> {
        let factory = factory_fn(|| async { Ok::<_, BoxDynError>(1u32) });
        Pool::new(
            "test",
            config,
            ItemWrapperFactory::without_tasks(Arc::new(factory)),
            None,
            None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_borrow_and_return() {
        let pool = pool(PoolConfig::new(2)).await;

        let mut item = Some(pool.borrow().await.unwrap());
        assert_eq!(**item.as_ref().unwrap(), 1);
        assert_eq!(pool.stats().borrowed, 1);
        assert_eq!(pool.borrowed_items().len(), 1);

        pool.return_item(&mut item).await.unwrap();

        assert!(item.is_none());
        let stats = pool.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.borrowed, 0);
        assert_eq!(stats.borrowed_total, 1);
        assert_eq!(stats.created_total, 1);
        assert_eq!(pool.idled_items().len(), 1);
    }

    #[tokio::test]
    async fn test_increase_stops_at_capacity() {
        let pool = pool(PoolConfig::new(2)).await;

        assert!(pool.increase_items().await.unwrap());
        assert!(pool.increase_items().await.unwrap());
        assert!(!pool.increase_items().await.unwrap());

        assert_eq!(pool.stats().total, 2);
    }

    #[tokio::test]
    async fn test_decrease_on_empty_pool() {
        let pool = pool(PoolConfig::new(2)).await;

        assert!(!pool.decrease_items().await);
        assert_eq!(pool.stats().total, 0);

        pool.increase_items().await.unwrap();
        assert!(pool.decrease_items().await);

        let stats = pool.stats();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.deleted_total, 1);
        assert!(pool.idled_items().is_empty());
    }

    #[tokio::test]
    async fn test_reserved_item_is_skipped_until_released() {
        let pool = pool(PoolConfig::new(1).with_borrow_timeout(Duration::from_millis(50))).await;
        pool.increase_items().await.unwrap();

        let (wrapper, _) = pool.idled_items().pop().unwrap();
        assert!(wrapper.compare_and_set_state(ItemState::Idle, ItemState::Reserved).unwrap());

        let result = pool.borrow().await;
        assert!(matches!(result, Err(PoolError::BorrowTimeout)));
        assert_eq!(pool.stats().timeouts_total, 1);
        assert_eq!(pool.stats().idle, 1);

        wrapper.set_state(ItemState::Idle).await.unwrap();
        assert!(pool.borrow().await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_wrapper_is_replaced() {
        let pool = pool(PoolConfig::new(1).with_borrow_timeout(Duration::from_millis(200))).await;
        pool.increase_items().await.unwrap();

        let (wrapper, _) = pool.idled_items().pop().unwrap();
        wrapper.close();

        let item = pool.borrow().await.unwrap();

        assert_eq!(*item, 1);
        let stats = pool.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.deleted_total, 1);
        assert_eq!(stats.created_total, 2);
    }

    #[tokio::test]
    async fn test_returning_closed_item_removes_it_quietly() {
        let pool = pool(PoolConfig::new(2)).await;
        let mut item = Some(pool.borrow().await.unwrap());

        pool.borrowed_items()[0].close();
        let result = pool.return_item(&mut item).await;

        assert!(result.is_ok());
        assert!(item.is_none());
        let stats = pool.stats();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.borrowed, 0);
        assert_eq!(stats.deleted_total, 1);
        assert!(pool.idled_items().is_empty());
    }
}
