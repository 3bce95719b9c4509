//! Recurring background tasks bound to a weakly-held runner
//!
//! Tasks never keep their runner alive: every tick upgrades the [`Weak`]
//! handle and skips the run if the runner is gone.

use crate::errors::{PoolError, PoolResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Identifier of one scheduled repetition
pub type TimerId = u64;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// A recurring task executed against a runner of type `R`
#[async_trait]
pub trait TimerTask<R>: Send + Sync {
    async fn run(&self, tick: &Tick, runner: &Weak<R>);

    fn interval(&self) -> Duration;
}

/// Context of a single task execution
#[derive(Debug, Clone)]
pub struct Tick {
    timer_id: Option<TimerId>,
    timers: Weak<TimerSet>,
}

impl Tick {
    /// Tick of an immediate, non-periodic run
    pub fn immediate() -> Self {
        Self {
            timer_id: None,
            timers: Weak::new(),
        }
    }

    /// Timer of the periodic repetition, `None` for an immediate run
    pub fn timer_id(&self) -> Option<TimerId> {
        self.timer_id
    }

    /// Deschedule the repetition this tick belongs to
    ///
    /// Best effort: returns `false` for immediate runs or when the scheduler
    /// has already gone away.
    pub fn stop(&self) -> bool {
        match (self.timer_id, self.timers.upgrade()) {
            (Some(id), Some(timers)) => timers.cancel(id),
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct TimerSet {
    handles: Mutex<HashMap<TimerId, JoinHandle<()>>>,
}

impl TimerSet {
    fn insert(&self, id: TimerId, handle: JoinHandle<()>) {
        self.handles.lock().insert(id, handle);
    }

    fn cancel(&self, id: TimerId) -> bool {
        match self.handles.lock().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn cancel_all(&self) {
        for (_, handle) in self.handles.lock().drain() {
            handle.abort();
        }
    }

    fn len(&self) -> usize {
        self.handles.lock().len()
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Runs a set of [`TimerTask`]s against a weakly-held runner
///
/// Cloning produces an unbound scheduler sharing the same task objects,
/// which is how every pool item gets its own copy of the per-item tasks.
pub struct TimerTaskScheduler<R> {
    tasks: Vec<Arc<dyn TimerTask<R>>>,
    runner: Mutex<Option<Weak<R>>>,
    timers: Arc<TimerSet>,
}

impl<R> TimerTaskScheduler<R> {
    pub fn new(tasks: Vec<Arc<dyn TimerTask<R>>>) -> Self {
        Self {
            tasks,
            runner: Mutex::new(None),
            timers: Arc::new(TimerSet::default()),
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Number of repetitions currently scheduled
    pub fn active_timers(&self) -> usize {
        self.timers.len()
    }

    /// Cancel one scheduled repetition
    pub fn stop_task(&self, timer_id: TimerId) -> bool {
        self.timers.cancel(timer_id)
    }

    /// Cancel every scheduled repetition
    pub fn stop(&self) {
        self.timers.cancel_all();
    }

    fn bound_runner(&self) -> PoolResult<Weak<R>> {
        self.runner
            .lock()
            .clone()
            .ok_or_else(|| PoolError::protocol("runner hasn't been bound to scheduler yet"))
    }
}

impl<R: Send + Sync + 'static> TimerTaskScheduler<R> {
    /// Bind to `runner`, restarting active timers against the new runner
    pub fn bind_to(&self, runner: Weak<R>) -> PoolResult<()> {
        let was_running = self.active_timers() > 0;
        if was_running {
            self.stop();
        }

        *self.runner.lock() = Some(runner);

        if was_running {
            self.start()?;
        }

        Ok(())
    }

    /// Execute every task once against the bound runner
    pub async fn run(&self) -> PoolResult<()> {
        let runner = self.bound_runner()?;
        let tick = Tick::immediate();

        for task in &self.tasks {
            task.run(&tick, &runner).await;
        }

        Ok(())
    }

    /// Schedule every task at its own interval; the first tick fires after one interval
    pub fn start(&self) -> PoolResult<()> {
        let runner = self.bound_runner()?;

        for task in &self.tasks {
            let timer_id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
            let tick = Tick {
                timer_id: Some(timer_id),
                timers: Arc::downgrade(&self.timers),
            };
            let period = task.interval().max(MIN_INTERVAL);
            let task = Arc::clone(task);
            let runner = runner.clone();

            let handle = tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    interval.tick().await;
                    task.run(&tick, &runner).await;
                }
            });

            self.timers.insert(timer_id, handle);
        }

        Ok(())
    }
}

impl<R> Clone for TimerTaskScheduler<R> {
    fn clone(&self) -> Self {
        Self::new(self.tasks.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Runner {
        hits: AtomicUsize,
    }

    impl Runner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                hits: AtomicUsize::new(0),
            })
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    struct CountingTask {
        interval: Duration,
    }

    #[async_trait]
    impl TimerTask<Runner> for CountingTask {
        async fn run(&self, _tick: &Tick, runner: &Weak<Runner>) {
            if let Some(runner) = runner.upgrade() {
                runner.hits.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn interval(&self) -> Duration {
            self.interval
        }
    }

    struct OneShotTask {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TimerTask<Runner> for OneShotTask {
        async fn run(&self, tick: &Tick, _runner: &Weak<Runner>) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if tick.timer_id().is_some() {
                tick.stop();
            }
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }
    }

    fn counting(interval_ms: u64) -> Arc<dyn TimerTask<Runner>> {
        Arc::new(CountingTask {
            interval: Duration::from_millis(interval_ms),
        })
    }

    #[tokio::test]
    async fn test_unbound_scheduler_fails() {
        let scheduler = TimerTaskScheduler::new(vec![counting(10)]);

        assert!(matches!(scheduler.run().await, Err(PoolError::ProtocolViolation(_))));
        assert!(matches!(scheduler.start(), Err(PoolError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_run_executes_each_task_once() {
        let runner = Runner::new();
        let scheduler = TimerTaskScheduler::new(vec![counting(1000), counting(1000)]);
        scheduler.bind_to(Arc::downgrade(&runner)).unwrap();

        scheduler.run().await.unwrap();

        assert_eq!(runner.hits(), 2);
        assert_eq!(scheduler.active_timers(), 0);
    }

    #[tokio::test]
    async fn test_start_ticks_until_stopped() {
        let runner = Runner::new();
        let scheduler = TimerTaskScheduler::new(vec![counting(10)]);
        scheduler.bind_to(Arc::downgrade(&runner)).unwrap();

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(75)).await;
        scheduler.stop();

        let hits = runner.hits();
        assert!(hits >= 3, "expected at least 3 ticks, got {hits}");
        assert_eq!(scheduler.active_timers(), 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(runner.hits(), hits);
    }

    #[tokio::test]
    async fn test_task_can_deschedule_itself() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runner = Runner::new();
        let scheduler = TimerTaskScheduler::new(vec![
            Arc::new(OneShotTask {
                runs: Arc::clone(&runs),
            }) as Arc<dyn TimerTask<Runner>>,
            counting(10),
        ]);
        scheduler.bind_to(Arc::downgrade(&runner)).unwrap();

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.active_timers(), 1);
        assert!(runner.hits() >= 3);
    }

    #[tokio::test]
    async fn test_dropped_runner_makes_ticks_noop() {
        let runner = Runner::new();
        let observer = Arc::clone(&runner);
        let scheduler = TimerTaskScheduler::new(vec![counting(10)]);
        scheduler.bind_to(Arc::downgrade(&runner)).unwrap();
        scheduler.start().unwrap();

        drop(runner);
        drop(observer);
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(scheduler.active_timers(), 1);
    }

    #[tokio::test]
    async fn test_rebind_moves_running_timers() {
        let first = Runner::new();
        let second = Runner::new();
        let scheduler = TimerTaskScheduler::new(vec![counting(10)]);
        scheduler.bind_to(Arc::downgrade(&first)).unwrap();
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_millis(35)).await;
        scheduler.bind_to(Arc::downgrade(&second)).unwrap();
        let first_hits = first.hits();
        tokio::time::sleep(Duration::from_millis(55)).await;

        assert_eq!(first.hits(), first_hits);
        assert!(second.hits() >= 2);
        assert_eq!(scheduler.active_timers(), 1);
    }

    #[tokio::test]
    async fn test_clone_is_unbound() {
        let runner = Runner::new();
        let scheduler = TimerTaskScheduler::new(vec![counting(10)]);
        scheduler.bind_to(Arc::downgrade(&runner)).unwrap();

        let copy = scheduler.clone();

        assert_eq!(copy.task_count(), 1);
        assert!(copy.start().is_err());
    }

    #[tokio::test]
    async fn test_dropping_scheduler_stops_timers() {
        let runner = Runner::new();
        let scheduler = TimerTaskScheduler::new(vec![counting(10)]);
        scheduler.bind_to(Arc::downgrade(&runner)).unwrap();
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_millis(25)).await;
        drop(scheduler);
        let hits = runner.hits();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(runner.hits(), hits);
    }
}
