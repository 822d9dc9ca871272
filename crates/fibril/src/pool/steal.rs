//! Lock-free stealing pool

use super::PoolOps;
use crate::error::{Error, Result};
use crate::unit::Unit;
use crossbeam_deque::{Injector, Steal};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Lock-free MPMC queue for random work stealing
///
/// Any stream may pop from it concurrently. The queue cannot be searched, so
/// `remove` and `for_each` are unavailable and units in it cannot migrate.
#[derive(Default)]
pub struct StealPool {
    queue: Injector<Unit>,
    len: AtomicUsize,
}

impl StealPool {
    /// Create an empty stealing pool
    pub fn new() -> Self {
        Self::default()
    }
}

impl PoolOps for StealPool {
    fn push(&self, unit: Unit) {
        self.len.fetch_add(1, Ordering::AcqRel);
        self.queue.push(unit);
    }

    fn pop(&self) -> Option<Unit> {
        loop {
            match self.queue.steal() {
                Steal::Success(unit) => {
                    self.len.fetch_sub(1, Ordering::AcqRel);
                    return Some(unit);
                }
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    fn remove(&self, _unit: &Unit) -> Result<()> {
        Err(Error::FeatureUnavailable("stealing pools do not support remove"))
    }

    fn size(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    fn for_each(&self, _f: &mut dyn FnMut(&Unit)) -> Result<()> {
        Err(Error::FeatureUnavailable("stealing pools cannot be traversed"))
    }
}
