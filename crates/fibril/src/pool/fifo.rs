//! FIFO pool

use super::PoolOps;
use crate::error::{Error, Result};
use crate::unit::Unit;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// FIFO queue of ready units under a single lock
#[derive(Default)]
pub struct FifoPool {
    queue: Mutex<VecDeque<Unit>>,
}

impl FifoPool {
    /// Create an empty FIFO pool
    pub fn new() -> Self {
        Self::default()
    }
}

impl PoolOps for FifoPool {
    fn push(&self, unit: Unit) {
        self.queue.lock().push_back(unit);
    }

    fn pop(&self) -> Option<Unit> {
        self.queue.lock().pop_front()
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
}
