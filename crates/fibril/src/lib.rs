//! Fibril: a user-level M:N threading runtime
//!
//! Lightweight work units are multiplexed onto a set of OS threads, the
//! execution streams. Each stream runs a stack of schedulers that pop units
//! from pools and dispatch them:
//! - **Xstream**: an OS thread bound to a main scheduler (`xstream` module)
//! - **Sched**: a scheduling policy over an ordered list of pools (`sched` module)
//! - **Pool**: a container of ready units with access rules (`pool` module)
//! - **Unit**: a stackful thread or a stackless task (`unit` module)
//! - **Sync**: mutex, condition, rwlock, eventual, future and barrier that
//!   block the calling unit instead of its OS thread (`sync` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use fibril::{Access, Pool, PoolKind, SchedConfig, SchedKind, Xstream};
//!
//! fibril::init()?;
//! let pool = Pool::new(PoolKind::Fifo, Access::Mpmc)?;
//! let xstream = Xstream::create_basic(SchedKind::Basic, &[pool.clone()], &SchedConfig::new())?;
//!
//! let unit = fibril::spawn(&pool, || println!("hello from a unit"))?;
//! unit.join()?;
//! unit.free()?;
//!
//! xstream.join()?;
//! xstream.free()?;
//! fibril::finalize()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::new_without_default)]

// ============================================================================
// Core Modules
// ============================================================================

/// Runtime configuration and scheduler config dictionaries
pub mod config;

/// Error type and status codes
pub mod error;

/// Ready-unit containers
pub mod pool;

/// Schedulers and the dispatch loop
pub mod sched;

/// Synchronization primitives that block work units
pub mod sync;

/// Wall-clock timers
pub mod timer;

/// Unit lifecycle event callbacks
pub mod tool;

/// Work units: creation, lifecycle, yield and migration
pub mod unit;

/// Execution streams
pub mod xstream;

mod local;
mod runtime;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{Config, ConfigKey, ConfigValue, SchedConfig};
pub use error::{Error, ErrorCategory, LockStatus, Result, WaitStatus};
pub use pool::{
    snapshot_sizes, Access, FifoPool, FifoWaitPool, Pool, PoolId, PoolKind, PoolOps,
    PriorityPool, StealPool,
};
pub use runtime::{config, finalize, init, init_with, initialized};
pub use sched::{
    Basic, BasicWait, Policy, Prio, RandWs, Sched, SchedContext, SchedId, SchedKind,
    SchedState,
};
pub use sync::{Barrier, Cond, Eventual, Future, Mutex, MutexAttr, MutexGuard, RwLock};
pub use timer::{wtime, Timer};
pub use tool::{
    register_unit_callback, unregister_unit_callback, EventMask, SyncEvent, ToolCaller,
    ToolContext, ToolEvent, UnitEvent,
};
pub use unit::{
    check_cancel, current, current_id, exit, join_many, spawn, spawn_detached, spawn_many,
    spawn_on, spawn_task, suspend, yield_now, yield_to, Builder, Key, Unit, UnitId, UnitKind,
    UnitState,
};
pub use xstream::{Xstream, XstreamBarrier, XstreamState};
