//! Barrier for work units

use crate::error::{Error, Result};
use crate::tool::SyncEvent;
use crate::unit::{
    self,
    park::{self, WaitNode, WaitQueue},
};
use parking_lot::Mutex as ParkingLotMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct BarrierState {
    n: usize,
    arrived: usize,
    waiters: WaitQueue,
}

struct BarrierInner {
    state: ParkingLotMutex<BarrierState>,
    freed: AtomicBool,
}

/// Rendezvous of `n` callers
///
/// The `n`th arrival releases the other `n - 1` and starts a fresh round.
#[derive(Clone)]
pub struct Barrier {
    inner: Arc<BarrierInner>,
}

impl Barrier {
    /// Barrier for `n` callers
    pub fn new(n: usize) -> Result<Self> {
        if n == 0 {
            return Err(Error::InvalidArg("barrier needs at least one waiter"));
        }
        Ok(Self {
            inner: Arc::new(BarrierInner {
                state: ParkingLotMutex::new(BarrierState {
                    n,
                    arrived: 0,
                    waiters: WaitQueue::new(),
                }),
                freed: AtomicBool::new(false),
            }),
        })
    }

    fn check(&self) -> Result<&BarrierInner> {
        if self.inner.freed.load(Ordering::Acquire) {
            return Err(Error::InvalidBarrier);
        }
        Ok(&self.inner)
    }

    /// Block until `n` callers have arrived
    pub fn wait(&self) -> Result<()> {
        let inner = self.check()?;
        unit::cancellation_point();

        let node = {
            let mut state = inner.state.lock();
            state.arrived += 1;
            if state.arrived == state.n {
                state.arrived = 0;
                let waiters = state.waiters.take_all();
                drop(state);
                park::notify_all(waiters);
                return Ok(());
            }
            let node = WaitNode::for_caller(SyncEvent::Barrier);
            state.waiters.push_back(node.clone());
            node
        };
        node.wait();
        Ok(())
    }

    /// Change the number of callers per round
    ///
    /// Only allowed between rounds.
    pub fn reinit(&self, n: usize) -> Result<()> {
        let inner = self.check()?;
        if n == 0 {
            return Err(Error::InvalidArg("barrier needs at least one waiter"));
        }
        let mut state = inner.state.lock();
        if state.arrived > 0 {
            return Err(Error::Barrier("a round is in progress"));
        }
        state.n = n;
        Ok(())
    }

    /// Number of callers per round
    pub fn num_waiters(&self) -> Result<usize> {
        Ok(self.check()?.state.lock().n)
    }

    /// Free the barrier; fails during a round
    pub fn free(self) -> Result<()> {
        let inner = self.check()?;
        if inner.state.lock().arrived > 0 {
            return Err(Error::Barrier("a round is in progress"));
        }
        if inner.freed.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidBarrier);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_threads_rendezvous() {
        let barrier = Barrier::new(3).unwrap();
        let passed = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let barrier = barrier.clone();
                let passed = passed.clone();
                thread::spawn(move || {
                    barrier.wait().unwrap();
                    passed.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        while barrier.inner.state.lock().arrived < 2 {
            thread::yield_now();
        }
        assert_eq!(passed.load(Ordering::SeqCst), 0);
        assert!(matches!(barrier.reinit(5), Err(Error::Barrier(_))));

        barrier.wait().unwrap();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(passed.load(Ordering::SeqCst), 2);

        barrier.reinit(1).unwrap();
        barrier.wait().unwrap();
        assert_eq!(barrier.num_waiters().unwrap(), 1);
        barrier.free().unwrap();
    }
}
