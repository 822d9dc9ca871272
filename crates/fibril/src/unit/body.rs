//! Execution contexts of work units
//!
//! A stackful unit runs its entry function inside a `corosensei` coroutine on
//! a private stack. A run-to-completion unit keeps only the entry function,
//! which the dispatcher calls on its own stack.

use super::UnitInner;
use crate::error::{Error, Result};
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Weak;
use tracing::error;

/// Entry function of a unit
pub(crate) type Entry = Box<dyn FnOnce() + Send + 'static>;

/// Why a stackful unit handed control back to its dispatcher
pub(crate) enum Suspend {
    /// Back to the end of the home pool
    Yield,
    /// Back to the home pool, and run this unit next
    YieldTo(super::Unit),
    /// Parked; some waker will make it ready again
    Block,
}

/// How a unit's entry function ended
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed = 1,
    Exited = 2,
    Cancelled = 3,
    Panicked = 4,
}

impl Outcome {
    pub(crate) fn from_u8(v: u8) -> Option<Outcome> {
        match v {
            1 => Some(Outcome::Completed),
            2 => Some(Outcome::Exited),
            3 => Some(Outcome::Cancelled),
            4 => Some(Outcome::Panicked),
            _ => None,
        }
    }
}

/// Unwind payload of `unit::exit`
pub(crate) struct ExitToken;

/// Unwind payload of a cancellation point
pub(crate) struct CancelToken;

type Context = Coroutine<(), Suspend, Outcome, DefaultStack>;

/// Coroutine of a stackful unit
///
/// `Coroutine` is `!Send` because code on its stack may hold thread-bound
/// state across a suspension. Units are resumed on whichever stream pops
/// them, so the runtime carries the coroutine between threads itself.
pub(crate) struct Coro(Option<Context>);

// SAFETY: the coroutine is only resumed under the unit's body lock, by one
// stream at a time. The entry closure is `Send`. The runtime's own
// thread-locals go through the `#[inline(never)]` accessors in `local`, so
// no TLS address is cached across a suspension. User code holding
// thread-bound state across a yield is ruled out in the docs of `spawn`.
unsafe impl Send for Coro {}

impl Coro {
    /// Build the coroutine that runs `entry` on `stack`
    pub(crate) fn new(stack: DefaultStack, unit: Weak<UnitInner>, entry: Entry) -> Coro {
        let context = Coroutine::with_stack(stack, move |yielder: &Yielder<(), Suspend>, ()| {
            if let Some(inner) = unit.upgrade() {
                inner.set_yielder(yielder);
            }
            run_entry(entry)
        });
        Coro(Some(context))
    }

    pub(crate) fn started(&self) -> bool {
        self.0.as_ref().map_or(true, |c| c.started())
    }

    pub(crate) fn resume(&mut self) -> CoroutineResult<Suspend, Outcome> {
        match self.0.as_mut() {
            Some(context) => context.resume(()),
            None => CoroutineResult::Return(Outcome::Completed),
        }
    }

    /// Recover the stack of a finished coroutine
    pub(crate) fn take_stack(&mut self) -> Option<DefaultStack> {
        match self.0.take() {
            Some(context) if context.done() => Some(context.into_stack()),
            Some(context) => {
                self.0 = Some(context);
                None
            }
            None => None,
        }
    }
}

impl Drop for Coro {
    fn drop(&mut self) {
        // A coroutine still suspended mid-body is never resumed again. Its
        // stack is leaked instead of being force-unwound on a foreign thread.
        if let Some(context) = self.0.take() {
            if context.started() && !context.done() {
                std::mem::forget(context);
            }
        }
    }
}

/// Execution state held by a unit
pub(crate) enum Body {
    Stackful(Coro),
    Task(Option<Entry>),
    Empty,
}

/// Run an entry function, turning unwinds into an [`Outcome`]
pub(crate) fn run_entry(entry: Entry) -> Outcome {
    match panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(()) => Outcome::Completed,
        Err(payload) if payload.is::<ExitToken>() => Outcome::Exited,
        Err(payload) if payload.is::<CancelToken>() => Outcome::Cancelled,
        Err(payload) => {
            error!(message = panic_message(payload.as_ref()), "work unit panicked");
            Outcome::Panicked
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

struct CachedStack(DefaultStack);

unsafe impl Send for CachedStack {}

/// Pool of reusable unit stacks
///
/// Only stacks of the default size are kept. A terminated unit returns its
/// stack here, and the next unit created with the default size takes it
/// instead of mapping a new one.
pub(crate) struct StackPool {
    stacks: Mutex<Vec<CachedStack>>,
    max_size: usize,
    stack_size: usize,
}

impl StackPool {
    /// Create a pool that holds up to `max_size` stacks of `stack_size` bytes
    pub(crate) fn new(max_size: usize, stack_size: usize) -> Self {
        Self {
            stacks: Mutex::new(Vec::with_capacity(max_size.min(64))),
            max_size,
            stack_size,
        }
    }

    /// Get a stack of `size` bytes, recycled when possible
    pub(crate) fn acquire(&self, size: usize) -> Result<DefaultStack> {
        if size == self.stack_size {
            if let Some(CachedStack(stack)) = self.stacks.lock().pop() {
                return Ok(stack);
            }
        }
        DefaultStack::new(size).map_err(|e| {
            Error::OutOfMemory(format!("cannot allocate a {size}-byte unit stack: {e}"))
        })
    }

    /// Return a stack of `size` bytes for reuse
    pub(crate) fn release(&self, stack: DefaultStack, size: usize) {
        if size != self.stack_size {
            return;
        }
        let mut pool = self.stacks.lock();
        if pool.len() < self.max_size {
            pool.push(CachedStack(stack));
        }
    }

    /// Number of cached stacks
    pub(crate) fn len(&self) -> usize {
        self.stacks.lock().len()
    }

    /// Drop every cached stack
    pub(crate) fn clear(&self) {
        self.stacks.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: usize = 64 * 1024;

    #[test]
    fn test_stack_pool_recycles_default_size() {
        let pool = StackPool::new(4, SIZE);
        let stack = pool.acquire(SIZE).unwrap();
        pool.release(stack, SIZE);
        assert_eq!(pool.len(), 1);

        let _recycled = pool.acquire(SIZE).unwrap();
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_stack_pool_max_size() {
        let pool = StackPool::new(2, SIZE);
        let stacks: Vec<_> = (0..3).map(|_| pool.acquire(SIZE).unwrap()).collect();
        for stack in stacks {
            pool.release(stack, SIZE);
        }
        assert_eq!(pool.len(), 2);

        // Other sizes are never cached
        let odd = pool.acquire(2 * SIZE).unwrap();
        pool.release(odd, 2 * SIZE);
        assert_eq!(pool.len(), 2);

        pool.clear();
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_run_entry_outcomes() {
        assert_eq!(run_entry(Box::new(|| {})), Outcome::Completed);
        assert_eq!(
            run_entry(Box::new(|| panic::resume_unwind(Box::new(ExitToken)))),
            Outcome::Exited
        );
        assert_eq!(
            run_entry(Box::new(|| panic::resume_unwind(Box::new(CancelToken)))),
            Outcome::Cancelled
        );
        assert_eq!(
            run_entry(Box::new(|| panic::resume_unwind(Box::new("boom")))),
            Outcome::Panicked
        );
    }
}
