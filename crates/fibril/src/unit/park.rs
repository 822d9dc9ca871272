//! Blocking and waking of work units and threads
//!
//! A blocking primitive enqueues a [`WaitNode`] for its caller under the
//! primitive's own lock, releases the lock, then waits on the node. A waker
//! dequeues nodes under the lock and notifies them after releasing it.
//!
//! How a node waits depends on who created it:
//! - a stackful unit parks itself, freeing its execution stream;
//! - a run-to-completion unit spins, since it must not suspend;
//! - the primary thread drives the primary scheduler between checks;
//! - any other thread parks the OS thread.
//!
//! Parking a unit is a handshake between the unit, its dispatcher and the
//! waker, so that a wake-up racing with the suspension is never lost and
//! exactly one party makes the unit ready again.

use super::body::Suspend;
use super::{Unit, UnitState};
use crate::error::WaitStatus;
use crate::local::{self, Caller};
use crate::runtime;
use crate::tool::{self, SyncEvent, UnitEvent};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

/// Running or ready, no wake-up pending
pub(crate) const PARK_IDLE: u8 = 0;
/// The unit is about to hand control to its dispatcher
pub(crate) const PARK_BLOCKING: u8 = 1;
/// The dispatcher has recorded the unit as blocked
pub(crate) const PARK_PARKED: u8 = 2;
/// A wake-up arrived before the unit was parked
pub(crate) const PARK_NOTIFIED: u8 = 3;

impl Unit {
    /// Suspend the calling unit until [`Unit::unpark`]
    ///
    /// Must be called by the unit itself. Returns at once if a wake-up is
    /// already pending; callers re-check their condition in a loop.
    pub(crate) fn park(&self) {
        let park = &self.inner.park;
        match park.compare_exchange(PARK_IDLE, PARK_BLOCKING, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => self.suspend_with(Suspend::Block),
            Err(_) => park.store(PARK_IDLE, Ordering::Release),
        }
    }

    /// Wake a parked unit, or leave a pending wake-up for it
    pub(crate) fn unpark(&self) {
        if self.inner.park.swap(PARK_NOTIFIED, Ordering::AcqRel) == PARK_PARKED {
            self.inner.park.store(PARK_IDLE, Ordering::Release);
            self.make_ready();
        }
    }

    /// Dispatcher side of [`Unit::park`], after the unit suspended
    pub(crate) fn finish_parking(&self) {
        let home = self.home_pool();
        self.set_state(UnitState::Blocked);
        if let Some(pool) = &home {
            pool.block_one();
        }
        tool::emit(UnitEvent::Suspend, self, home.as_ref());

        let parked = self.inner.park.compare_exchange(
            PARK_BLOCKING,
            PARK_PARKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if parked.is_err() {
            // Woken while suspending
            self.inner.park.store(PARK_IDLE, Ordering::Release);
            self.make_ready();
        }
    }

    /// BLOCKED -> READY, back into the home pool
    fn make_ready(&self) {
        let home = self.home_pool();
        if let Some(pool) = &home {
            pool.unblock_one();
        }
        self.set_state(UnitState::Ready);
        tool::emit(UnitEvent::Resume, self, home.as_ref());
        if let Some(pool) = home {
            pool.push_unit(self.clone());
        }
    }
}

enum Waiter {
    Unit(Unit),
    Spin,
    Primary(Thread),
    Thread(Thread),
}

/// One waiter enqueued on a blocking primitive
pub(crate) struct WaitNode {
    notified: AtomicBool,
    waiter: Waiter,
}

impl WaitNode {
    /// Node for the calling unit or thread
    pub(crate) fn for_caller(event: SyncEvent) -> Arc<WaitNode> {
        let waiter = match local::caller() {
            Caller::Stackful(unit) => {
                unit.set_sync_event(event);
                Waiter::Unit(unit)
            }
            Caller::Task(_) => Waiter::Spin,
            Caller::Primary => Waiter::Primary(thread::current()),
            Caller::Native => Waiter::Thread(thread::current()),
        };
        Arc::new(WaitNode {
            notified: AtomicBool::new(false),
            waiter,
        })
    }

    /// Whether a waker already notified this node
    pub(crate) fn is_notified(&self) -> bool {
        self.notified.load(Ordering::Acquire)
    }

    /// Wake the waiter
    pub(crate) fn notify(&self) {
        self.notified.store(true, Ordering::Release);
        match &self.waiter {
            Waiter::Unit(unit) => unit.unpark(),
            Waiter::Primary(thread) | Waiter::Thread(thread) => thread.unpark(),
            Waiter::Spin => {}
        }
    }

    /// Wait until notified
    pub(crate) fn wait(&self) {
        let _ = self.wait_until(None);
    }

    /// Wait until notified or until `deadline` passes
    ///
    /// On `TimedOut` the caller still owns the node's queue entry and must
    /// remove it; if it is already gone, a waker raced the timeout and the
    /// wait counts as signaled.
    pub(crate) fn wait_until(&self, deadline: Option<Instant>) -> WaitStatus {
        let mut spins = 0u32;
        loop {
            if self.is_notified() {
                return WaitStatus::Signaled;
            }
            let now = Instant::now();
            if deadline.map_or(false, |d| now >= d) {
                return WaitStatus::TimedOut;
            }
            let remaining = deadline.map(|d| d - now);

            match &self.waiter {
                Waiter::Unit(unit) => match remaining {
                    // Timed waits poll by yielding
                    Some(_) => unit.suspend_with(Suspend::Yield),
                    None => unit.park(),
                },
                Waiter::Spin => {
                    spins += 1;
                    if spins < 64 {
                        std::hint::spin_loop();
                    } else {
                        thread::yield_now();
                    }
                }
                Waiter::Primary(_) => {
                    let idle = runtime::try_get().map_or(Some(Duration::from_micros(100)), |rt| {
                        (!rt.drive_primary()).then(|| rt.config().sched_sleep)
                    });
                    if let Some(sleep) = idle {
                        if !self.is_notified() {
                            thread::park_timeout(remaining.map_or(sleep, |r| r.min(sleep)));
                        }
                    }
                }
                Waiter::Thread(_) => match remaining {
                    Some(r) => thread::park_timeout(r),
                    None => thread::park(),
                },
            }
        }
    }
}

/// FIFO queue of wait nodes
#[derive(Default)]
pub(crate) struct WaitQueue {
    nodes: VecDeque<Arc<WaitNode>>,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_back(&mut self, node: Arc<WaitNode>) {
        self.nodes.push_back(node);
    }

    pub(crate) fn push_front(&mut self, node: Arc<WaitNode>) {
        self.nodes.push_front(node);
    }

    pub(crate) fn pop_front(&mut self) -> Option<Arc<WaitNode>> {
        self.nodes.pop_front()
    }

    /// Remove `node`; `false` if a waker already took it
    pub(crate) fn remove(&mut self, node: &Arc<WaitNode>) -> bool {
        match self.nodes.iter().position(|n| Arc::ptr_eq(n, node)) {
            Some(pos) => {
                self.nodes.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn take_all(&mut self) -> Vec<Arc<WaitNode>> {
        self.nodes.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Notify every node; call after releasing the primitive's lock
pub(crate) fn notify_all(nodes: Vec<Arc<WaitNode>>) {
    for node in nodes {
        node.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_waiter_wakes_on_notify() {
        let node = WaitNode::for_caller(SyncEvent::Other);
        let waker = node.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            waker.notify();
        });
        node.wait();
        assert!(node.is_notified());
        handle.join().unwrap();
    }

    #[test]
    fn test_thread_waiter_times_out() {
        let node = WaitNode::for_caller(SyncEvent::Other);
        let deadline = Instant::now() + Duration::from_millis(10);
        assert_eq!(node.wait_until(Some(deadline)), WaitStatus::TimedOut);
        assert!(Instant::now() >= deadline);
    }

    #[test]
    fn test_wait_queue_remove() {
        let mut queue = WaitQueue::new();
        let a = WaitNode::for_caller(SyncEvent::Other);
        let b = WaitNode::for_caller(SyncEvent::Other);
        queue.push_back(a.clone());
        queue.push_front(b.clone());
        assert_eq!(queue.len(), 2);
        assert!(queue.remove(&a));
        assert!(!queue.remove(&a));
        assert!(Arc::ptr_eq(&queue.pop_front().unwrap(), &b));
        assert!(queue.is_empty());
    }
}
