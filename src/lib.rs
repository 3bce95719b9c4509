//! # Esox ItemPool
//!
//! Task-aware async pool of expensive resources, such as database
//! connections, for tokio applications.
//!
//! ## Features
//!
//! - Per-item state machine guaranteeing one owner per item
//! - Bounded waiting: every borrow, return and state change has a timeout
//! - Task binding: repeated borrows from one tokio task share an item
//! - Auto-return of bound items when a task scope ends
//! - Background resizing, leak detection, lifetime expiry and keepalive checks
//! - Borrow/return hooks for validity checks and session resets
//! - Metrics snapshot and Prometheus export
//!
//! ## Quick Start
//!
//! ```rust
//! use esox_itempool::{BoxDynError, PoolBuilder, factory_fn};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = factory_fn(|| async { Ok::<_, BoxDynError>(vec![0u8; 16]) });
//! let pool = PoolBuilder::new(2, Arc::new(factory)).build().await?;
//!
//! let mut buffer = Some(pool.borrow().await?);
//! assert_eq!(buffer.as_ref().map(|b| b.len()), Some(16));
//!
//! pool.return_item(&mut buffer).await?;
//! assert!(buffer.is_none());
//! # Ok(())
//! # }
//! ```

mod bag;
mod builder;
mod config;
mod errors;
mod factory;
mod hooks;
mod item;
mod metrics;
mod pool;
mod scheduler;
pub mod tasks;

pub use builder::PoolBuilder;
pub use config::PoolConfig;
pub use errors::{BoxDynError, PoolError, PoolResult};
pub use factory::{FnFactory, ItemFactory, ItemWrapperFactory, factory_fn};
pub use hooks::{HookManager, HookPoint, ItemHook, ResetHook, ValidityCheckHook};
pub use item::{ItemState, ItemStats, ItemWrapper};
pub use metrics::{MetricsExporter, PoolStats};
pub use pool::Pool;
pub use scheduler::{Tick, TimerId, TimerTask, TimerTaskScheduler};
pub use tasks::{ItemUpdater, KeepaliveChecker, KeepaliveTask, LeakDetector, Resizer};
