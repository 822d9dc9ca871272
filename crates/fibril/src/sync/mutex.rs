//! Mutex

use crate::error::{Error, LockStatus, Result};
use crate::local::{self, Caller};
use crate::tool::SyncEvent;
use crate::unit::{self, park::WaitNode};
use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex as ParkingLotMutex;
use std::collections::VecDeque;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Mutex attributes
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct MutexAttr {
    /// Allow the owner to lock again; each lock needs a matching unlock
    pub recursive: bool,
}

/// Lock holder: a unit id, or a thread tag with the top bit set
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(super) struct Owner(NonZeroU64);

const THREAD_BIT: u64 = 1 << 63;

impl Owner {
    pub(super) fn current() -> Owner {
        let raw = match local::current_unit() {
            Some(unit) => unit.id().as_u64(),
            None => local::thread_tag() | THREAD_BIT,
        };
        // Unit ids and thread tags start at 1
        Owner(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }
}

struct Waiter {
    owner: Owner,
    node: Arc<WaitNode>,
}

#[derive(Default)]
struct Queues {
    /// Normal and high-priority waiters
    main: VecDeque<Waiter>,
    /// Served only when `main` is empty
    low: VecDeque<Waiter>,
}

impl Queues {
    fn is_empty(&self) -> bool {
        self.main.is_empty() && self.low.is_empty()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Priority {
    Normal,
    High,
    Low,
}

struct MutexInner {
    attr: MutexAttr,

    /// Current holder; written under `queues` except on the uncontended path
    owner: AtomicCell<Option<Owner>>,

    /// Lock depth of a recursive owner, touched only by the owner
    count: AtomicUsize,

    queues: ParkingLotMutex<Queues>,

    freed: AtomicBool,
}

/// Mutex that blocks work units instead of OS threads
///
/// Unlock hands the mutex directly to the longest-waiting caller, so waiters
/// are served in FIFO order (high-priority waiters go first, low-priority
/// ones last).
#[derive(Clone)]
pub struct Mutex {
    inner: Arc<MutexInner>,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    /// Non-recursive mutex
    pub fn new() -> Self {
        Self::with_attr(MutexAttr::default())
    }

    /// Mutex with the given attributes
    pub fn with_attr(attr: MutexAttr) -> Self {
        Self {
            inner: Arc::new(MutexInner {
                attr,
                owner: AtomicCell::new(None),
                count: AtomicUsize::new(0),
                queues: ParkingLotMutex::new(Queues::default()),
                freed: AtomicBool::new(false),
            }),
        }
    }

    fn check(&self) -> Result<&MutexInner> {
        if self.inner.freed.load(Ordering::Acquire) {
            return Err(Error::InvalidMutex);
        }
        Ok(&self.inner)
    }

    /// Attributes the mutex was created with
    pub fn attr(&self) -> MutexAttr {
        self.inner.attr
    }

    /// Whether some caller holds the mutex
    pub fn is_locked(&self) -> bool {
        self.inner.owner.load().is_some()
    }

    /// Acquire the mutex, blocking the caller until it is available
    pub fn lock(&self) -> Result<()> {
        self.check()?;
        unit::cancellation_point();
        self.acquire(Priority::Normal, 1)
    }

    /// Like `lock`, but queue ahead of ordinary waiters
    pub fn lock_high(&self) -> Result<()> {
        self.check()?;
        unit::cancellation_point();
        self.acquire(Priority::High, 1)
    }

    /// Like `lock`, but only served once no ordinary waiter is queued
    pub fn lock_low(&self) -> Result<()> {
        self.check()?;
        unit::cancellation_point();
        self.acquire(Priority::Low, 1)
    }

    /// Acquire and return a guard that unlocks on drop
    pub fn guard(&self) -> Result<MutexGuard<'_>> {
        self.lock()?;
        Ok(MutexGuard { mutex: self })
    }

    /// Acquire without blocking
    pub fn try_lock(&self) -> Result<LockStatus> {
        let inner = self.check()?;
        let me = Owner::current();
        if inner.owner.load() == Some(me) {
            if !inner.attr.recursive {
                return Ok(LockStatus::Busy);
            }
            inner.count.fetch_add(1, Ordering::Relaxed);
            return Ok(LockStatus::Acquired);
        }
        if inner.owner.compare_exchange(None, Some(me)).is_ok() {
            inner.count.store(1, Ordering::Relaxed);
            return Ok(LockStatus::Acquired);
        }
        Ok(LockStatus::Busy)
    }

    /// Acquire by busy-waiting, without ever suspending the caller
    pub fn spin_lock(&self) -> Result<()> {
        let mut spins = 0u32;
        while !self.try_lock()?.is_acquired() {
            spins += 1;
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }
        Ok(())
    }

    fn acquire(&self, priority: Priority, depth: usize) -> Result<()> {
        let inner = &self.inner;
        let me = Owner::current();
        if inner.owner.load() == Some(me) {
            if !inner.attr.recursive {
                return Err(Error::Mutex("relock of a non-recursive mutex by its owner"));
            }
            inner.count.fetch_add(depth, Ordering::Relaxed);
            return Ok(());
        }
        if inner.owner.compare_exchange(None, Some(me)).is_ok() {
            inner.count.store(depth, Ordering::Relaxed);
            return Ok(());
        }

        let node = {
            let mut queues = inner.queues.lock();
            if inner.owner.compare_exchange(None, Some(me)).is_ok() {
                inner.count.store(depth, Ordering::Relaxed);
                return Ok(());
            }
            let node = WaitNode::for_caller(SyncEvent::Mutex);
            let waiter = Waiter {
                owner: me,
                node: node.clone(),
            };
            match priority {
                Priority::Normal => queues.main.push_back(waiter),
                Priority::High => queues.main.push_front(waiter),
                Priority::Low => queues.low.push_back(waiter),
            }
            node
        };

        // Ownership is handed over by the unlocker
        node.wait();
        inner.count.store(depth, Ordering::Relaxed);
        Ok(())
    }

    /// Release the mutex
    ///
    /// Only the owner may unlock. A recursive mutex is released once every
    /// lock has been matched.
    pub fn unlock(&self) -> Result<()> {
        let inner = self.check()?;
        if inner.owner.load() != Some(Owner::current()) {
            return Err(Error::Mutex("unlock by a caller that does not own the mutex"));
        }
        if inner.count.load(Ordering::Relaxed) > 1 {
            inner.count.fetch_sub(1, Ordering::Relaxed);
            return Ok(());
        }
        self.release();
        Ok(())
    }

    /// Unlock, then yield so a waiter handed the mutex can run
    pub fn unlock_switch(&self) -> Result<()> {
        self.unlock()?;
        if let Caller::Stackful(_) = local::caller() {
            unit::yield_now()?;
        }
        Ok(())
    }

    /// Hand the mutex to the next waiter, or leave it free
    fn release(&self) {
        let inner = &self.inner;
        let next = {
            let mut queues = inner.queues.lock();
            let next = queues.main.pop_front().or_else(|| queues.low.pop_front());
            match &next {
                Some(waiter) => {
                    inner.count.store(1, Ordering::Relaxed);
                    inner.owner.store(Some(waiter.owner));
                }
                None => inner.owner.store(None),
            }
            next
        };
        if let Some(waiter) = next {
            waiter.node.notify();
        }
    }

    /// Fully release the mutex for a condition wait, returning the lock depth
    pub(crate) fn release_for_wait(&self) -> Result<usize> {
        let inner = self.check()?;
        if inner.owner.load() != Some(Owner::current()) {
            return Err(Error::Mutex("condition wait without holding the mutex"));
        }
        let depth = inner.count.load(Ordering::Relaxed).max(1);
        self.release();
        Ok(depth)
    }

    /// Re-acquire after a condition wait, restoring the lock depth
    pub(crate) fn reacquire(&self, depth: usize) -> Result<()> {
        self.check()?;
        self.acquire(Priority::Normal, depth)
    }

    pub(crate) fn is_owned_by_caller(&self) -> bool {
        self.inner.owner.load() == Some(Owner::current())
    }

    /// Free the mutex; fails while it is held or awaited
    pub fn free(self) -> Result<()> {
        let inner = self.check()?;
        let queues = inner.queues.lock();
        if inner.owner.load().is_some() || !queues.is_empty() {
            return Err(Error::Mutex("mutex is locked"));
        }
        if inner.freed.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidMutex);
        }
        Ok(())
    }
}

impl PartialEq for Mutex {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Mutex {}

/// Holds a [`Mutex`] until dropped
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl<'a> MutexGuard<'a> {
    /// The guarded mutex
    pub fn mutex(&self) -> &Mutex {
        self.mutex
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        let _ = self.mutex.unlock();
    }
}
