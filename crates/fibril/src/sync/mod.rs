//! Synchronization primitives for work units
//!
//! Every primitive keeps its state and a FIFO wait set under a short
//! `parking_lot` lock. A caller that has to wait enqueues a wait node under
//! that lock, releases it, then blocks on the node: a stackful unit suspends
//! and frees its execution stream, a run-to-completion unit spins, an
//! external thread parks, and the primary thread keeps driving its scheduler.
//! Wakers dequeue under the lock and notify after releasing it.

mod barrier;
mod cond;
mod eventual;
mod future;
mod mutex;
mod rwlock;

pub use barrier::Barrier;
pub use cond::Cond;
pub use eventual::Eventual;
pub use future::Future;
pub use mutex::{Mutex, MutexAttr, MutexGuard};
pub use rwlock::RwLock;
