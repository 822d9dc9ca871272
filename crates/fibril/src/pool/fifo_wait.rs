//! FIFO pool with blocking pop

use super::PoolOps;
use crate::error::{Error, Result};
use crate::unit::Unit;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// FIFO queue whose consumer can sleep until a unit is pushed
///
/// `pop_wait` parks the calling OS thread, trading wake-up latency for an
/// idle execution stream that does not spin.
#[derive(Default)]
pub struct FifoWaitPool {
    queue: Mutex<VecDeque<Unit>>,
    available: Condvar,
}

impl FifoWaitPool {
    /// Create an empty wait-capable FIFO pool
    pub fn new() -> Self {
        Self::default()
    }
}

impl PoolOps for FifoWaitPool {
    fn push(&self, unit: Unit) {
        self.queue.lock().push_back(unit);
        self.available.notify_one();
    }

    fn pop(&self) -> Option<Unit> {
        self.queue.lock().pop_front()
    }

    fn pop_wait(&self, timeout: Duration) -> Option<Unit> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock();
        loop {
            if let Some(unit) = queue.pop_front() {
                return Some(unit);
            }
            if self.available.wait_until(&mut queue, deadline).timed_out() {
                return queue.pop_front();
            }
        }
    }

    fn remove(&self, unit: &Unit) -> Result<()> {
        let mut queue = self.queue.lock();
        let pos = queue
            .iter()
            .position(|u| u == unit)
            .ok_or(Error::Pool("unit is not in the pool"))?;
        queue.remove(pos);
        Ok(())
    }

    fn size(&self) -> usize {
        self.queue.lock().len()
    }

    fn for_each(&self, f: &mut dyn FnMut(&Unit)) -> Result<()> {
        self.queue.lock().iter().for_each(f);
        Ok(())
    }

    fn free(&self) {
        self.available.notify_all();
    }
}
