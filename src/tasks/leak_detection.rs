use crate::item::ItemState;
use crate::pool::Pool;
use crate::scheduler::{Tick, TimerTask};
use async_trait::async_trait;
use std::sync::Weak;
use std::time::Duration;
use tracing::warn;

/// Warns about items held longer than `threshold`
///
/// Only reports; a leaked item stays borrowed.
#[derive(Debug, Clone)]
pub struct LeakDetector {
    interval: Duration,
    threshold: Duration,
}

impl LeakDetector {
    pub fn new(interval: Duration, threshold: Duration) -> Self {
        Self {
            interval,
            threshold,
        }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> TimerTask<Pool<T>> for LeakDetector {
    async fn run(&self, _tick: &Tick, runner: &Weak<Pool<T>>) {
        let Some(pool) = runner.upgrade() else {
            return;
        };

        for wrapper in pool.borrowed_items() {
            if wrapper.state() != ItemState::InUse {
                continue;
            }

            let held = wrapper.stats().current_state_duration;
            if held > self.threshold {
                warn!(
                    pool = pool.name(),
                    item_id = wrapper.id(),
                    duration = held.as_secs_f64(),
                    "Item is borrowed for too long, possible leak"
                );
            }
        }
    }

    fn interval(&self) -> Duration {
        self.interval
    }
}
