//! Eventual: a set-once value of fixed size

use crate::error::{Error, Result};
use crate::tool::SyncEvent;
use crate::unit::{
    self,
    park::{self, WaitNode, WaitQueue},
};
use parking_lot::Mutex as ParkingLotMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct EventualState {
    ready: bool,
    value: Vec<u8>,
    waiters: WaitQueue,
}

struct EventualInner {
    nbytes: usize,
    state: ParkingLotMutex<EventualState>,
    freed: AtomicBool,
}

/// Single-slot value of `nbytes` bytes that becomes ready once
#[derive(Clone)]
pub struct Eventual {
    inner: Arc<EventualInner>,
}

impl Eventual {
    /// Eventual holding `nbytes` bytes; zero makes it a pure signal
    pub fn new(nbytes: usize) -> Self {
        Self {
            inner: Arc::new(EventualInner {
                nbytes,
                state: ParkingLotMutex::new(EventualState {
                    ready: false,
                    value: Vec::new(),
                    waiters: WaitQueue::new(),
                }),
                freed: AtomicBool::new(false),
            }),
        }
    }

    fn check(&self) -> Result<&EventualInner> {
        if self.inner.freed.load(Ordering::Acquire) {
            return Err(Error::InvalidEventual);
        }
        Ok(&self.inner)
    }

    /// Size of the value in bytes
    pub fn nbytes(&self) -> usize {
        self.inner.nbytes
    }

    /// Block until the value is set, then return a copy of it
    pub fn wait(&self) -> Result<Vec<u8>> {
        let inner = self.check()?;
        unit::cancellation_point();

        let node = {
            let mut state = inner.state.lock();
            if state.ready {
                return Ok(state.value.clone());
            }
            let node = WaitNode::for_caller(SyncEvent::Eventual);
            state.waiters.push_back(node.clone());
            node
        };
        node.wait();
        Ok(inner.state.lock().value.clone())
    }

    /// The value if it is set, without blocking
    pub fn test(&self) -> Result<Option<Vec<u8>>> {
        let inner = self.check()?;
        let state = inner.state.lock();
        Ok(state.ready.then(|| state.value.clone()))
    }

    /// Set the value and wake every waiter
    pub fn set(&self, value: &[u8]) -> Result<()> {
        let inner = self.check()?;
        if value.len() != inner.nbytes {
            return Err(Error::Eventual("value size does not match the eventual"));
        }
        let waiters = {
            let mut state = inner.state.lock();
            if state.ready {
                return Err(Error::Eventual("eventual is already set"));
            }
            state.value.clear();
            state.value.extend_from_slice(value);
            state.ready = true;
            state.waiters.take_all()
        };
        park::notify_all(waiters);
        Ok(())
    }

    /// Make the eventual not ready again
    pub fn reset(&self) -> Result<()> {
        let inner = self.check()?;
        let mut state = inner.state.lock();
        if !state.waiters.is_empty() {
            return Err(Error::Eventual("reset while callers are waiting"));
        }
        state.ready = false;
        Ok(())
    }

    /// Free the eventual; fails while callers wait on it
    pub fn free(self) -> Result<()> {
        let inner = self.check()?;
        if !inner.state.lock().waiters.is_empty() {
            return Err(Error::Eventual("eventual has waiters"));
        }
        if inner.freed.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidEventual);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_set_test_reset() {
        let ev = Eventual::new(8);
        assert_eq!(ev.test().unwrap(), None);
        let bytes = 0x0102_0304_0506_0708u64.to_le_bytes();
        ev.set(&bytes).unwrap();
        assert_eq!(ev.test().unwrap().as_deref(), Some(&bytes[..]));
        assert!(matches!(ev.set(&bytes), Err(Error::Eventual(_))));
        ev.reset().unwrap();
        assert_eq!(ev.test().unwrap(), None);
        assert!(matches!(ev.set(&[1, 2]), Err(Error::Eventual(_))));
    }

    #[test]
    fn test_wait_from_thread() {
        let ev = Eventual::new(4);
        let waiter = {
            let ev = ev.clone();
            thread::spawn(move || ev.wait().unwrap())
        };
        while ev.inner.state.lock().waiters.is_empty() {
            thread::yield_now();
        }
        assert!(matches!(ev.reset(), Err(Error::Eventual(_))));
        ev.set(&[9, 8, 7, 6]).unwrap();
        assert_eq!(waiter.join().unwrap(), vec![9, 8, 7, 6]);
        assert_eq!(ev.wait().unwrap(), vec![9, 8, 7, 6]);
        ev.free().unwrap();
    }
}
