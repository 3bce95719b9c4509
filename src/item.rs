//! Per-item state machine
//!
//! Every state owns a single-token slot. Entering a state puts the token into
//! its slot, leaving takes it out again, so "wait until the item is idle and
//! claim it" is a single timed acquire on the idle slot.

use crate::errors::{PoolError, PoolResult};
use crate::factory::ItemFactory;
use crate::scheduler::TimerTaskScheduler;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, TryAcquireError};

/// Upper bound for vacating the current state's slot in [`ItemWrapper::set_state`]
const SLOT_TIMEOUT: Duration = Duration::from_millis(1);

static NEXT_ITEM_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a pool item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemState {
    /// Available for borrowing
    Idle,

    /// Held by exactly one claimant running hooks or maintenance
    Reserved,

    /// Held by a borrower
    InUse,

    /// Closed; terminal
    Removed,
}

impl ItemState {
    const ALL: [ItemState; 4] = [
        ItemState::Idle,
        ItemState::Reserved,
        ItemState::InUse,
        ItemState::Removed,
    ];

    fn slot(self) -> usize {
        match self {
            ItemState::Idle => 0,
            ItemState::Reserved => 1,
            ItemState::InUse => 2,
            ItemState::Removed => 3,
        }
    }

    /// Whether `self -> next` is a legal transition outside of `close`
    pub fn can_transition_to(self, next: ItemState) -> bool {
        matches!(
            (self, next),
            (ItemState::Idle, ItemState::Reserved)
                | (ItemState::Reserved, ItemState::InUse)
                | (ItemState::Reserved, ItemState::Idle)
                | (ItemState::InUse, ItemState::Reserved)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemState::Idle => "idle",
            ItemState::Reserved => "reserved",
            ItemState::InUse => "in_use",
            ItemState::Removed => "removed",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing snapshot of a wrapper
#[derive(Debug, Clone, Copy)]
pub struct ItemStats {
    /// Time since the current item was created
    pub item_lifetime: Duration,

    /// Time spent in the current state
    pub current_state_duration: Duration,
}

struct StateCell {
    state: ItemState,
    updated_at: Instant,
}

struct ItemCell<T> {
    item: Option<Arc<T>>,
    created_at: Instant,
}

/// Lifecycle envelope around one pooled resource
pub struct ItemWrapper<T> {
    id: String,
    factory: Arc<dyn ItemFactory<T>>,
    state: Mutex<StateCell>,
    item: Mutex<ItemCell<T>>,
    slots: [Semaphore; 4],
    scheduler: TimerTaskScheduler<ItemWrapper<T>>,
}

impl<T: Send + Sync + 'static> ItemWrapper<T> {
    /// Create the first item, then bind and start the per-item scheduler
    ///
    /// The scheduler runs every task once before periodic execution starts.
    pub async fn new(
        factory: Arc<dyn ItemFactory<T>>,
        scheduler: TimerTaskScheduler<ItemWrapper<T>>,
    ) -> PoolResult<Arc<Self>> {
        let item = factory
            .create()
            .await
            .map_err(PoolError::creation_failed)?;
        let now = Instant::now();

        let wrapper = Arc::new(Self {
            id: format!("pool_item_{}", NEXT_ITEM_ID.fetch_add(1, Ordering::Relaxed)),
            factory,
            state: Mutex::new(StateCell {
                state: ItemState::Idle,
                updated_at: now,
            }),
            item: Mutex::new(ItemCell {
                item: Some(Arc::new(item)),
                created_at: now,
            }),
            slots: std::array::from_fn(|_| Semaphore::new(0)),
            scheduler,
        });

        wrapper.slots[ItemState::Idle.slot()].add_permits(1);

        wrapper.scheduler.bind_to(Arc::downgrade(&wrapper))?;
        wrapper.scheduler.run().await?;
        wrapper.scheduler.start()?;

        Ok(wrapper)
    }

    /// Current resource, `None` after a failed recreation
    pub fn item(&self) -> PoolResult<Option<Arc<T>>> {
        self.ensure_open()?;

        Ok(self.item.lock().item.clone())
    }

    /// Drop the current resource and build a replacement
    ///
    /// On factory failure the wrapper stays itemless but usable; the caller
    /// decides whether to retry or remove it.
    pub async fn recreate_item(&self) -> PoolResult<()> {
        self.ensure_open()?;

        {
            let mut cell = self.item.lock();
            cell.item = None;
        }

        let item = self
            .factory
            .create()
            .await
            .map_err(PoolError::creation_failed)?;

        let state = self.state.lock();
        if state.state == ItemState::Removed {
            return Err(PoolError::ItemRemoved);
        }

        let mut cell = self.item.lock();
        cell.item = Some(Arc::new(item));
        cell.created_at = Instant::now();

        Ok(())
    }

    /// Unconditional transition out of the current state
    pub async fn set_state(&self, next: ItemState) -> PoolResult<()> {
        Self::reject_removed_target(next)?;
        self.ensure_open()?;

        let current = self.state();
        Self::check_transition(current, next)?;

        if !self.pop_token(current, SLOT_TIMEOUT).await? {
            return Err(PoolError::protocol(format!(
                "item {}: can't leave {current} state (target {next})",
                self.id
            )));
        }

        self.enter(next)
    }

    /// Non-blocking transition `expect -> update`
    pub fn compare_and_set_state(&self, expect: ItemState, update: ItemState) -> PoolResult<bool> {
        Self::reject_removed_target(update)?;
        Self::check_transition(expect, update)?;
        self.ensure_open()?;

        if !self.try_pop_token(expect)? {
            return Ok(false);
        }

        self.enter(update)?;

        Ok(true)
    }

    /// Wait up to `timeout` for `expect`, then move to `update`
    pub async fn wait_for_compare_and_set_state(
        &self,
        expect: ItemState,
        update: ItemState,
        timeout: Duration,
    ) -> PoolResult<bool> {
        Self::reject_removed_target(update)?;
        Self::check_transition(expect, update)?;
        self.ensure_open()?;

        if !self.pop_token(expect, timeout).await? {
            return Ok(false);
        }

        self.enter(update)?;

        Ok(true)
    }

    fn reject_removed_target(next: ItemState) -> PoolResult<()> {
        if next == ItemState::Removed {
            return Err(PoolError::protocol(
                "can't set removed state directly, use close()",
            ));
        }
        Ok(())
    }

    fn check_transition(from: ItemState, to: ItemState) -> PoolResult<()> {
        if !from.can_transition_to(to) {
            return Err(PoolError::protocol(format!(
                "illegal transition {from} -> {to}"
            )));
        }
        Ok(())
    }

    async fn pop_token(&self, state: ItemState, timeout: Duration) -> PoolResult<bool> {
        let slot = &self.slots[state.slot()];

        match tokio::time::timeout(timeout, slot.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                Ok(true)
            }
            Ok(Err(_)) => Err(PoolError::ItemRemoved),
            Err(_) => Ok(false),
        }
    }

    fn try_pop_token(&self, state: ItemState) -> PoolResult<bool> {
        match self.slots[state.slot()].try_acquire() {
            Ok(permit) => {
                permit.forget();
                Ok(true)
            }
            Err(TryAcquireError::NoPermits) => Ok(false),
            Err(TryAcquireError::Closed) => Err(PoolError::ItemRemoved),
        }
    }

    /// Record `next` and put its token into the slot
    ///
    /// Must only be called by the holder of the previous state's token.
    fn enter(&self, next: ItemState) -> PoolResult<()> {
        let mut cell = self.state.lock();
        if cell.state == ItemState::Removed {
            return Err(PoolError::ItemRemoved);
        }

        let slot = &self.slots[next.slot()];
        if slot.available_permits() > 0 {
            return Err(PoolError::protocol(format!(
                "item {}: {next} slot already holds a token",
                self.id
            )));
        }

        cell.state = next;
        cell.updated_at = Instant::now();
        slot.add_permits(1);

        Ok(())
    }
}

impl<T> ItemWrapper<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ItemState {
        self.state.lock().state
    }

    pub fn is_removed(&self) -> bool {
        self.state() == ItemState::Removed
    }

    pub fn stats(&self) -> ItemStats {
        let current_state_duration = self.state.lock().updated_at.elapsed();
        let item_lifetime = self.item.lock().created_at.elapsed();

        ItemStats {
            item_lifetime,
            current_state_duration,
        }
    }

    /// Move to [`ItemState::Removed`], wake all waiters and release the item
    pub fn close(&self) {
        {
            let mut cell = self.state.lock();
            if cell.state == ItemState::Removed {
                return;
            }

            cell.state = ItemState::Removed;
            cell.updated_at = Instant::now();

            for state in ItemState::ALL {
                self.slots[state.slot()].close();
            }
        }

        self.scheduler.stop();

        let mut cell = self.item.lock();
        cell.item = None;
        cell.created_at = Instant::now();
    }

    fn ensure_open(&self) -> PoolResult<()> {
        if self.is_removed() {
            return Err(PoolError::ItemRemoved);
        }
        Ok(())
    }
}

impl<T> Drop for ItemWrapper<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> fmt::Debug for ItemWrapper<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemWrapper")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
