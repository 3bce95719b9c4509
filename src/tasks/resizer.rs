use crate::pool::Pool;
use crate::scheduler::{Tick, TimerTask};
use async_trait::async_trait;
use std::sync::Weak;
use std::time::Duration;
use tracing::{debug, error};

/// Keeps the number of idle items close to `minimum_idle`
///
/// Grows the pool while it is below the floor, shrinks it by closing items
/// idle for longer than `idle_timeout`. A fixed-size pool (floor equal to
/// capacity) only needs the initial fill, so the task deschedules itself.
#[derive(Debug, Clone)]
pub struct Resizer {
    interval: Duration,
    minimum_idle: usize,
    idle_timeout: Duration,
}

impl Resizer {
    pub fn new(interval: Duration, minimum_idle: usize, idle_timeout: Duration) -> Self {
        Self {
            interval,
            minimum_idle,
            idle_timeout,
        }
    }

    async fn grow<T: Send + Sync + 'static>(&self, pool: &Pool<T>) {
        while pool.current_size() < pool.capacity() && pool.idle_count() < self.minimum_idle {
            match pool.increase_items().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    error!(pool = pool.name(), error = %e, "Can't grow pool");
                    break;
                }
            }
        }
    }

    async fn shrink<T: Send + Sync + 'static>(&self, pool: &Pool<T>) {
        let idle = pool.idle_count();
        if idle <= self.minimum_idle {
            return;
        }

        let expired = pool
            .idled_items()
            .iter()
            .filter(|(_, since)| since.elapsed() > self.idle_timeout)
            .count();
        let excess = expired.min(idle - self.minimum_idle);

        let mut removed = 0;
        for _ in 0..excess {
            if !pool.decrease_items().await {
                break;
            }
            removed += 1;
        }

        if removed > 0 {
            debug!(pool = pool.name(), removed, "Closed expired idle items");
        }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> TimerTask<Pool<T>> for Resizer {
    async fn run(&self, tick: &Tick, runner: &Weak<Pool<T>>) {
        let Some(pool) = runner.upgrade() else {
            return;
        };

        self.grow(&pool).await;
        self.shrink(&pool).await;

        if pool.current_size() > 0 && pool.capacity() == self.minimum_idle && tick.stop() {
            debug!(pool = pool.name(), "Fixed-size pool filled, resizer stopped");
        }
    }

    fn interval(&self) -> Duration {
        self.interval
    }
}
