//! Condition variable

use super::Mutex;
use crate::error::{Error, Result, WaitStatus};
use crate::tool::SyncEvent;
use crate::unit::{
    self,
    park::{self, WaitNode, WaitQueue},
};
use parking_lot::Mutex as ParkingLotMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct CondState {
    waiters: WaitQueue,
    /// Mutex shared by the current waiters
    bound: Option<Mutex>,
}

struct CondInner {
    state: ParkingLotMutex<CondState>,
    freed: AtomicBool,
}

/// Condition variable for work units
///
/// A waiter is queued on the condition before its mutex is released, so a
/// `signal` issued after `wait` started is never missed.
#[derive(Clone)]
pub struct Cond {
    inner: Arc<CondInner>,
}

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

impl Cond {
    /// Create a condition variable
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CondInner {
                state: ParkingLotMutex::new(CondState {
                    waiters: WaitQueue::new(),
                    bound: None,
                }),
                freed: AtomicBool::new(false),
            }),
        }
    }

    fn check(&self) -> Result<&CondInner> {
        if self.inner.freed.load(Ordering::Acquire) {
            return Err(Error::InvalidCond);
        }
        Ok(&self.inner)
    }

    /// Release `mutex`, wait for a signal, then re-acquire `mutex`
    ///
    /// The caller must hold `mutex`. Callers should re-check their predicate
    /// in a loop.
    pub fn wait(&self, mutex: &Mutex) -> Result<()> {
        self.wait_until(mutex, None).map(|_| ())
    }

    /// Like `wait`, giving up at `deadline`
    ///
    /// `mutex` is held again on return in both outcomes.
    pub fn wait_until(&self, mutex: &Mutex, deadline: Option<Instant>) -> Result<WaitStatus> {
        let inner = self.check()?;
        if !mutex.is_owned_by_caller() {
            return Err(Error::Mutex("condition wait without holding the mutex"));
        }
        unit::cancellation_point();

        let node = WaitNode::for_caller(SyncEvent::Cond);
        {
            let mut state = inner.state.lock();
            match &state.bound {
                Some(bound) if bound != mutex && !state.waiters.is_empty() => {
                    return Err(Error::Cond("waiters of one condition must share a mutex"));
                }
                _ => state.bound = Some(mutex.clone()),
            }
            state.waiters.push_back(node.clone());
        }

        let depth = match mutex.release_for_wait() {
            Ok(depth) => depth,
            Err(e) => {
                inner.state.lock().waiters.remove(&node);
                return Err(e);
            }
        };

        let mut status = node.wait_until(deadline);
        if status.timed_out() {
            let mut state = inner.state.lock();
            if !state.waiters.remove(&node) {
                // A signal raced the timeout
                status = WaitStatus::Signaled;
            }
            if state.waiters.is_empty() {
                state.bound = None;
            }
        }

        mutex.reacquire(depth)?;
        Ok(status)
    }

    /// Like `wait`, giving up after `timeout`
    pub fn wait_timeout(&self, mutex: &Mutex, timeout: Duration) -> Result<WaitStatus> {
        self.wait_until(mutex, Some(Instant::now() + timeout))
    }

    /// Wake the longest-waiting caller, if any
    pub fn signal(&self) -> Result<()> {
        let inner = self.check()?;
        let node = {
            let mut state = inner.state.lock();
            let node = state.waiters.pop_front();
            if state.waiters.is_empty() {
                state.bound = None;
            }
            node
        };
        if let Some(node) = node {
            node.notify();
        }
        Ok(())
    }

    /// Wake every waiting caller
    pub fn broadcast(&self) -> Result<()> {
        let inner = self.check()?;
        let nodes = {
            let mut state = inner.state.lock();
            state.bound = None;
            state.waiters.take_all()
        };
        park::notify_all(nodes);
        Ok(())
    }

    /// Free the condition variable; fails while callers wait on it
    pub fn free(self) -> Result<()> {
        let inner = self.check()?;
        if !inner.state.lock().waiters.is_empty() {
            return Err(Error::Cond("condition variable has waiters"));
        }
        if inner.freed.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidCond);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_requires_mutex() {
        let cond = Cond::new();
        let mutex = Mutex::new();
        assert!(matches!(cond.wait(&mutex), Err(Error::Mutex(_))));
    }

    #[test]
    fn test_timed_wait_reacquires_mutex() {
        let cond = Cond::new();
        let mutex = Mutex::new();
        mutex.lock().unwrap();
        let status = cond.wait_timeout(&mutex, Duration::from_millis(5)).unwrap();
        assert_eq!(status, WaitStatus::TimedOut);
        assert!(mutex.is_locked());
        mutex.unlock().unwrap();
        cond.free().unwrap();
    }

    #[test]
    fn test_signal_wakes_thread_waiter() {
        let cond = Cond::new();
        let mutex = Mutex::new();
        let flag = Arc::new(AtomicBool::new(false));

        let (c, m, f) = (cond.clone(), mutex.clone(), flag.clone());
        let waiter = thread::spawn(move || {
            m.lock().unwrap();
            while !f.load(Ordering::Acquire) {
                c.wait(&m).unwrap();
            }
            m.unlock().unwrap();
        });

        // Wait until the waiter is queued
        while cond.inner.state.lock().waiters.is_empty() {
            thread::yield_now();
        }
        mutex.lock().unwrap();
        flag.store(true, Ordering::Release);
        cond.signal().unwrap();
        mutex.unlock().unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn test_waiters_share_one_mutex() {
        let cond = Cond::new();
        let first = Mutex::new();
        let (c, m) = (cond.clone(), first.clone());
        let waiter = thread::spawn(move || {
            m.lock().unwrap();
            c.wait(&m).unwrap();
            m.unlock().unwrap();
        });
        while cond.inner.state.lock().waiters.is_empty() {
            thread::yield_now();
        }

        let second = Mutex::new();
        second.lock().unwrap();
        assert!(matches!(cond.wait(&second), Err(Error::Cond(_))));
        second.unlock().unwrap();

        cond.broadcast().unwrap();
        waiter.join().unwrap();
    }
}
