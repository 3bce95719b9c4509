//! Pool assembly with production defaults

use crate::config::PoolConfig;
use crate::errors::{PoolError, PoolResult};
use crate::factory::{ItemFactory, ItemWrapperFactory};
use crate::hooks::{HookManager, ItemHook, ResetHook, ValidityCheckHook};
use crate::item::ItemWrapper;
use crate::pool::Pool;
use crate::scheduler::{TimerTask, TimerTaskScheduler};
use crate::tasks::{ItemUpdater, KeepaliveChecker, KeepaliveTask, LeakDetector, Resizer};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const RESIZE_INTERVAL: Duration = Duration::from_millis(100);

static NAME_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Builder wiring a [`Pool`] with its maintenance tasks and hooks
///
/// Defaults: fixed size (`minimum_idle == size`), task binding with
/// auto-return, 100 ms borrow timeout, 1 ms return timeout, items idle for
/// 30 s are closed, items older than 300 s are recreated, and items held
/// longer than 1 s are reported as leaks.
///
/// # Examples
///
/// ```
/// use esox_itempool::{BoxDynError, PoolBuilder, factory_fn};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let factory = factory_fn(|| async { Ok::<_, BoxDynError>(String::from("conn")) });
///
/// let pool = PoolBuilder::new(4, Arc::new(factory))
///     .with_minimum_idle(2)
///     .with_borrow_timeout(Duration::from_millis(250))
///     .with_name("db")
///     .build()
///     .await?;
///
/// assert_eq!(pool.stats().total, 2);
/// # Ok(())
/// # }
/// ```
pub struct PoolBuilder<T> {
    size: usize,
    factory: Arc<dyn ItemFactory<T>>,
    name: Option<String>,
    minimum_idle: usize,
    auto_return: bool,
    bind_to_task: bool,
    idle_timeout: Duration,
    max_lifetime: Duration,
    borrow_timeout: Duration,
    return_timeout: Duration,
    leak_detection_threshold: Duration,
    max_reserving_wait: Duration,
    hooks: Vec<Arc<dyn ItemHook<T>>>,
    item_tasks: Vec<Arc<dyn TimerTask<ItemWrapper<T>>>>,
}

impl<T: Send + Sync + 'static> PoolBuilder<T> {
    pub fn new(size: usize, factory: Arc<dyn ItemFactory<T>>) -> Self {
        Self {
            size,
            factory,
            name: None,
            minimum_idle: size,
            auto_return: true,
            bind_to_task: true,
            idle_timeout: Duration::from_secs(30),
            max_lifetime: Duration::from_secs(300),
            borrow_timeout: Duration::from_millis(100),
            return_timeout: Duration::from_millis(1),
            leak_detection_threshold: Duration::from_secs(1),
            max_reserving_wait: Duration::from_millis(10),
            hooks: Vec::new(),
            item_tasks: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Idle items the resizer keeps around; must not exceed the size
    pub fn with_minimum_idle(mut self, minimum_idle: usize) -> Self {
        self.minimum_idle = minimum_idle;
        self
    }

    pub fn with_auto_return(mut self, auto_return: bool) -> Self {
        self.auto_return = auto_return;
        self
    }

    pub fn with_bind_to_task(mut self, bind_to_task: bool) -> Self {
        self.bind_to_task = bind_to_task;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Item age after which the updater recreates it; also sets the updater interval to a tenth of it
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    pub fn with_borrow_timeout(mut self, timeout: Duration) -> Self {
        self.borrow_timeout = timeout;
        self
    }

    pub fn with_return_timeout(mut self, timeout: Duration) -> Self {
        self.return_timeout = timeout;
        self
    }

    /// Borrow duration reported as a leak; also the leak check interval
    pub fn with_leak_detection_threshold(mut self, threshold: Duration) -> Self {
        self.leak_detection_threshold = threshold;
        self
    }

    pub fn with_max_reserving_wait(mut self, wait: Duration) -> Self {
        self.max_reserving_wait = wait;
        self
    }

    /// Recreate items rejected by `checker` before they are borrowed
    pub fn with_connection_checker<F>(self, checker: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.with_hook(Arc::new(ValidityCheckHook::new(checker)))
    }

    /// Run `resetter` against every returned item
    pub fn with_connection_resetter<F>(self, resetter: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.with_hook(Arc::new(ResetHook::new(resetter)))
    }

    pub fn with_hook(mut self, hook: Arc<dyn ItemHook<T>>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Probe idle items periodically, recreating the dead ones
    pub fn with_keepalive_checker(mut self, checker: Arc<dyn KeepaliveChecker<T>>) -> Self {
        self.item_tasks.push(Arc::new(KeepaliveTask::new(checker)));
        self
    }

    /// Build the pool and fill it up to the idle floor
    pub async fn build(self) -> PoolResult<Arc<Pool<T>>> {
        if self.minimum_idle > self.size {
            return Err(PoolError::InvalidConfiguration(format!(
                "minimum idle ({}) exceeds pool size ({})",
                self.minimum_idle, self.size
            )));
        }

        let config = PoolConfig::new(self.size)
            .with_borrow_timeout(self.borrow_timeout)
            .with_return_timeout(self.return_timeout)
            .with_auto_return(self.auto_return)
            .with_bind_to_task(self.bind_to_task);

        let pool_tasks: Vec<Arc<dyn TimerTask<Pool<T>>>> = vec![
            Arc::new(Resizer::new(RESIZE_INTERVAL, self.minimum_idle, self.idle_timeout)),
            Arc::new(LeakDetector::new(
                self.leak_detection_threshold,
                self.leak_detection_threshold,
            )),
        ];

        let mut item_tasks: Vec<Arc<dyn TimerTask<ItemWrapper<T>>>> = vec![Arc::new(ItemUpdater::new(
            self.max_lifetime / 10,
            self.max_lifetime,
            self.max_reserving_wait,
        ))];
        item_tasks.extend(self.item_tasks);

        let hooks = (!self.hooks.is_empty()).then(|| HookManager::new(self.hooks));
        let name = self.name.unwrap_or_else(generate_name);

        Pool::new(
            name,
            config,
            ItemWrapperFactory::new(self.factory, TimerTaskScheduler::new(item_tasks)),
            Some(TimerTaskScheduler::new(pool_tasks)),
            hooks,
        )
        .await
    }
}

/// `pool-` followed by 8 hex digits derived from the clock
fn generate_name() -> String {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u32)
        .unwrap_or_default();
    let salt = NAME_COUNTER.fetch_add(1, Ordering::Relaxed);

    format!("pool-{:08x}", micros.wrapping_add(salt.wrapping_mul(0x9e37_79b9)))
}
