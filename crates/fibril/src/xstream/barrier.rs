//! OS-level barrier for execution streams

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};

struct State {
    /// Threads still expected in the current round
    remaining: usize,
    /// Incremented every time a round completes
    generation: u64,
}

/// Barrier that blocks OS threads rather than work units
///
/// Useful before any unit scheduling exists, e.g. to line up freshly created
/// execution streams.
pub struct XstreamBarrier {
    n: usize,
    state: Mutex<State>,
    cond: Condvar,
}

impl XstreamBarrier {
    /// Barrier for `n` threads
    pub fn new(n: usize) -> Result<Self> {
        if n == 0 {
            return Err(Error::InvalidArg("barrier needs at least one waiter"));
        }
        Ok(Self {
            n,
            state: Mutex::new(State {
                remaining: n,
                generation: 0,
            }),
            cond: Condvar::new(),
        })
    }

    /// Number of threads per round
    pub fn num_waiters(&self) -> usize {
        self.n
    }

    /// Block until `n` threads have called `wait`
    ///
    /// Returns `true` for exactly one thread per round, the last to arrive.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        state.remaining -= 1;
        if state.remaining == 0 {
            state.remaining = self.n;
            state.generation = state.generation.wrapping_add(1);
            self.cond.notify_all();
            return true;
        }
        let generation = state.generation;
        while state.generation == generation {
            self.cond.wait(&mut state);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_xstream_barrier_releases_all() {
        let barrier = Arc::new(XstreamBarrier::new(4).unwrap());
        let leaders = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let barrier = barrier.clone();
                let leaders = leaders.clone();
                thread::spawn(move || {
                    for _ in 0..3 {
                        if barrier.wait() {
                            leaders.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(leaders.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_xstream_barrier_rejects_zero() {
        assert!(matches!(XstreamBarrier::new(0), Err(Error::InvalidArg(_))));
    }
}
