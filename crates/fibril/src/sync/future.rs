//! Future: a value assembled from N compartments

use crate::error::{Error, Result};
use crate::tool::SyncEvent;
use crate::unit::{
    self,
    park::{self, WaitNode, WaitQueue},
};
use parking_lot::Mutex as ParkingLotMutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::error;

type Callback<T> = Arc<dyn Fn(&[T]) + Send + Sync>;

struct FutureState<T> {
    slots: Vec<Option<T>>,
    filled: usize,
    /// Every compartment is set and waiters have been released
    ready: bool,
    /// The last compartment is set and the callback is running
    completing: bool,
    waiters: WaitQueue,
}

impl<T: Clone> FutureState<T> {
    fn values(&self) -> Vec<T> {
        self.slots.iter().flatten().cloned().collect()
    }
}

struct FutureInner<T> {
    n: usize,
    callback: Option<Callback<T>>,
    state: ParkingLotMutex<FutureState<T>>,
    freed: AtomicBool,
}

/// Set of `n` compartments that becomes ready once all are set
///
/// Compartments may be set in any order from any unit or thread. When the
/// last one is set, the completion callback runs once with all values, then
/// every waiter is released.
pub struct Future<T> {
    inner: Arc<FutureInner<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    /// Future of `n` compartments without a callback
    pub fn new(n: usize) -> Result<Self> {
        Self::build(n, None)
    }

    /// Future of `n` compartments calling `callback` on completion
    pub fn with_callback(n: usize, callback: impl Fn(&[T]) + Send + Sync + 'static) -> Result<Self> {
        Self::build(n, Some(Arc::new(callback)))
    }

    fn build(n: usize, callback: Option<Callback<T>>) -> Result<Self> {
        if n == 0 {
            return Err(Error::InvalidArg("a future needs at least one compartment"));
        }
        Ok(Self {
            inner: Arc::new(FutureInner {
                n,
                callback,
                state: ParkingLotMutex::new(FutureState {
                    slots: (0..n).map(|_| None).collect(),
                    filled: 0,
                    ready: false,
                    completing: false,
                    waiters: WaitQueue::new(),
                }),
                freed: AtomicBool::new(false),
            }),
        })
    }

    fn check(&self) -> Result<&FutureInner<T>> {
        if self.inner.freed.load(Ordering::Acquire) {
            return Err(Error::InvalidFuture);
        }
        Ok(&self.inner)
    }

    /// Number of compartments
    pub fn num_compartments(&self) -> usize {
        self.inner.n
    }

    /// Set the next free compartment
    pub fn set(&self, value: T) -> Result<()> {
        let inner = self.check()?;
        let state = inner.state.lock();
        let Some(index) = state.slots.iter().position(Option::is_none) else {
            return Err(Error::Future("all compartments are already set"));
        };
        self.fill(state, index, value);
        Ok(())
    }

    /// Set compartment `index`
    pub fn set_at(&self, index: usize, value: T) -> Result<()> {
        let inner = self.check()?;
        if index >= inner.n {
            return Err(Error::InvalidArg("compartment index out of range"));
        }
        let state = inner.state.lock();
        if state.slots[index].is_some() {
            return Err(Error::Future("compartment is already set"));
        }
        self.fill(state, index, value);
        Ok(())
    }

    fn fill(
        &self,
        mut state: parking_lot::MutexGuard<'_, FutureState<T>>,
        index: usize,
        value: T,
    ) {
        state.slots[index] = Some(value);
        state.filled += 1;
        if state.filled < self.inner.n {
            return;
        }
        state.completing = true;
        let values = state.values();
        drop(state);

        // Callers arriving now still queue up and are released below
        if let Some(callback) = &self.inner.callback {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&values))).is_err() {
                error!(compartments = self.inner.n, "future callback panicked");
            }
        }
        let waiters = {
            let mut state = self.inner.state.lock();
            state.completing = false;
            state.ready = true;
            state.waiters.take_all()
        };
        park::notify_all(waiters);
    }

    /// Block until every compartment is set, then return the values in
    /// compartment order
    pub fn wait(&self) -> Result<Vec<T>> {
        let inner = self.check()?;
        unit::cancellation_point();

        let node = {
            let mut state = inner.state.lock();
            if state.ready {
                return Ok(state.values());
            }
            let node = WaitNode::for_caller(SyncEvent::Future);
            state.waiters.push_back(node.clone());
            node
        };
        node.wait();
        Ok(inner.state.lock().values())
    }

    /// The values if the future is ready, without blocking
    pub fn test(&self) -> Result<Option<Vec<T>>> {
        let inner = self.check()?;
        let state = inner.state.lock();
        Ok(state.ready.then(|| state.values()))
    }

    /// Clear every compartment
    ///
    /// Rejected while the completion callback runs, including from inside it.
    pub fn reset(&self) -> Result<()> {
        let inner = self.check()?;
        let mut state = inner.state.lock();
        if state.completing {
            return Err(Error::Future("reset while the future is completing"));
        }
        if !state.waiters.is_empty() {
            return Err(Error::Future("reset while callers are waiting"));
        }
        state.slots.iter_mut().for_each(|slot| *slot = None);
        state.filled = 0;
        state.ready = false;
        Ok(())
    }

    /// Free the future; fails while callers wait on it
    pub fn free(self) -> Result<()> {
        let inner = self.check()?;
        {
            let state = inner.state.lock();
            if state.completing {
                return Err(Error::Future("future is completing"));
            }
            if !state.waiters.is_empty() {
                return Err(Error::Future("future has waiters"));
            }
        }
        if inner.freed.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidFuture);
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
    fn test_callback_fires_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let future = Future::with_callback(3, move |values: &[u32]| {
            assert_eq!(values, &[10, 20, 30]);
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        future.set_at(2, 30).unwrap();
        future.set_at(0, 10).unwrap();
        assert_eq!(future.test().unwrap(), None);
        assert!(matches!(future.set_at(0, 11), Err(Error::Future(_))));
        future.set(20).unwrap();
        assert!(matches!(future.set(40), Err(Error::Future(_))));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(future.wait().unwrap(), vec![10, 20, 30]);

        future.reset().unwrap();
        assert_eq!(future.test().unwrap(), None);
    }

    #[test]
    fn test_thread_waiter_released() {
        let future: Future<String> = Future::new(2).unwrap();
        let waiter = {
            let future = future.clone();
            thread::spawn(move || future.wait().unwrap())
        };
        future.set("a".to_string()).unwrap();
        future.set("b".to_string()).unwrap();
        assert_eq!(waiter.join().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_panicking_callback_still_releases_waiters() {
        let future = Future::with_callback(1, |_: &[u32]| panic!("callback failure")).unwrap();
        let waiter = {
            let future = future.clone();
            thread::spawn(move || future.wait().unwrap())
        };
        while future.inner.state.lock().waiters.is_empty() {
            thread::yield_now();
        }

        future.set(7).unwrap();
        assert_eq!(waiter.join().unwrap(), vec![7]);
        assert_eq!(future.test().unwrap(), Some(vec![7]));
        assert!(matches!(future.set(8), Err(Error::Future(_))));
    }

    #[test]
    fn test_reset_from_callback_rejected() {
        let handle: Arc<ParkingLotMutex<Option<Future<u32>>>> = Arc::default();
        let rejected = Arc::new(AtomicBool::new(false));

        let (h, r) = (handle.clone(), rejected.clone());
        let future = Future::with_callback(1, move |_: &[u32]| {
            if let Some(future) = h.lock().as_ref() {
                r.store(
                    matches!(future.reset(), Err(Error::Future(_))),
                    Ordering::SeqCst,
                );
            }
        })
        .unwrap();
        *handle.lock() = Some(future.clone());

        future.set(5).unwrap();
        assert!(rejected.load(Ordering::SeqCst));
        assert_eq!(future.test().unwrap(), Some(vec![5]));

        // Completed futures reset normally
        handle.lock().take();
        future.reset().unwrap();
        assert_eq!(future.test().unwrap(), None);
    }

    #[test]
    fn test_zero_compartments_rejected() {
        assert!(matches!(Future::<u8>::new(0), Err(Error::InvalidArg(_))));
    }
}
