//! Readers-writer lock

use super::mutex::Owner;
use crate::error::{Error, Result};
use crate::tool::SyncEvent;
use crate::unit::{self, park::WaitNode};
use parking_lot::Mutex as ParkingLotMutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Want {
    Read,
    Write,
}

#[derive(Default)]
struct RwState {
    /// Readers holding the lock, once per held read
    readers: Vec<Owner>,
    writer: Option<Owner>,
    /// Callers waiting in arrival order
    queue: VecDeque<(Want, Owner, Arc<WaitNode>)>,
}

impl RwState {
    /// Grant the lock to the head of the queue, if it is free for it
    fn grant(&mut self) -> Vec<Arc<WaitNode>> {
        let mut granted = Vec::new();
        if self.writer.is_some() {
            return granted;
        }
        while let Some(want) = self.queue.front().map(|(want, _, _)| *want) {
            if want == Want::Write && !(self.readers.is_empty() && granted.is_empty()) {
                break;
            }
            let Some((_, owner, node)) = self.queue.pop_front() else {
                break;
            };
            granted.push(node);
            match want {
                Want::Write => {
                    self.writer = Some(owner);
                    break;
                }
                Want::Read => self.readers.push(owner),
            }
        }
        granted
    }
}

struct RwInner {
    state: ParkingLotMutex<RwState>,
    freed: AtomicBool,
}

/// Readers-writer lock for work units
///
/// Requests are served in arrival order: a queued writer blocks every reader
/// that arrives after it, and consecutive queued readers are admitted
/// together. Neither side can starve.
#[derive(Clone)]
pub struct RwLock {
    inner: Arc<RwInner>,
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RwLock {
    /// Create an unlocked lock
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwInner {
                state: ParkingLotMutex::new(RwState::default()),
                freed: AtomicBool::new(false),
            }),
        }
    }

    fn check(&self) -> Result<&RwInner> {
        if self.inner.freed.load(Ordering::Acquire) {
            return Err(Error::InvalidRwLock);
        }
        Ok(&self.inner)
    }

    /// Acquire shared access
    pub fn read(&self) -> Result<()> {
        self.acquire(Want::Read)
    }

    /// Acquire exclusive access
    pub fn write(&self) -> Result<()> {
        self.acquire(Want::Write)
    }

    fn acquire(&self, want: Want) -> Result<()> {
        let inner = self.check()?;
        unit::cancellation_point();

        let me = Owner::current();
        let node = {
            let mut state = inner.state.lock();
            let free = state.writer.is_none()
                && state.queue.is_empty()
                && (want == Want::Read || state.readers.is_empty());
            if free {
                match want {
                    Want::Read => state.readers.push(me),
                    Want::Write => state.writer = Some(me),
                }
                return Ok(());
            }
            let node = WaitNode::for_caller(SyncEvent::RwLock);
            state.queue.push_back((want, me, node.clone()));
            node
        };
        node.wait();
        Ok(())
    }

    /// Release shared or exclusive access held by the caller
    ///
    /// Fails for a caller that holds neither.
    pub fn unlock(&self) -> Result<()> {
        let inner = self.check()?;
        let me = Owner::current();
        let granted = {
            let mut state = inner.state.lock();
            if state.writer == Some(me) {
                state.writer = None;
            } else if let Some(pos) = state.readers.iter().position(|r| *r == me) {
                state.readers.swap_remove(pos);
            } else {
                return Err(Error::RwLock("unlock by a caller that does not hold the lock"));
            }
            state.grant()
        };
        for node in granted {
            node.notify();
        }
        Ok(())
    }

    /// Number of readers currently holding the lock
    pub fn readers(&self) -> usize {
        self.inner.state.lock().readers.len()
    }

    /// Whether a writer holds the lock
    pub fn is_write_locked(&self) -> bool {
        self.inner.state.lock().writer.is_some()
    }

    /// Free the lock; fails while it is held or awaited
    pub fn free(self) -> Result<()> {
        let inner = self.check()?;
        {
            let state = inner.state.lock();
            if state.writer.is_some() || !state.readers.is_empty() || !state.queue.is_empty() {
                return Err(Error::RwLock("lock is held"));
            }
        }
        if inner.freed.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidRwLock);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn queued(lock: &RwLock) -> usize {
        lock.inner.state.lock().queue.len()
    }

    #[test]
    fn test_readers_share() {
        let lock = RwLock::new();
        lock.read().unwrap();
        lock.read().unwrap();
        assert_eq!(lock.readers(), 2);
        lock.unlock().unwrap();
        lock.unlock().unwrap();
        assert!(matches!(lock.unlock(), Err(Error::RwLock(_))));
        lock.free().unwrap();
    }

    #[test]
    fn test_queued_writer_blocks_later_readers() {
        let lock = RwLock::new();
        lock.read().unwrap();

        let w = lock.clone();
        let writer = thread::spawn(move || {
            w.write().unwrap();
            assert!(w.is_write_locked());
            w.unlock().unwrap();
        });
        while queued(&lock) < 1 {
            thread::yield_now();
        }

        let r = lock.clone();
        let reader = thread::spawn(move || {
            r.read().unwrap();
            r.unlock().unwrap();
        });
        while queued(&lock) < 2 {
            thread::yield_now();
        }
        assert_eq!(lock.readers(), 1);

        lock.unlock().unwrap();
        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(lock.readers(), 0);
        assert!(!lock.is_write_locked());
    }

    #[test]
    fn test_unlock_requires_holder() {
        let lock = RwLock::new();
        lock.read().unwrap();

        let other = lock.clone();
        let stranger = thread::spawn(move || other.unlock());
        assert!(matches!(stranger.join().unwrap(), Err(Error::RwLock(_))));
        assert_eq!(lock.readers(), 1);
        lock.unlock().unwrap();

        let w = lock.clone();
        thread::spawn(move || w.write().unwrap()).join().unwrap();
        assert!(lock.is_write_locked());
        assert!(matches!(lock.unlock(), Err(Error::RwLock(_))));
        assert!(lock.is_write_locked());
    }
}
