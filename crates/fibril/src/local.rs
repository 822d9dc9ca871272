//! Per-OS-thread execution context
//!
//! Each OS thread knows which execution stream it hosts, the chain of work
//! units it is currently resuming (innermost last), and the top-level
//! scheduler running directly on its native stack.
//!
//! A stackful unit may be suspended on one stream and resumed on another, so
//! thread-local accesses made from unit code must not be cached across a
//! suspension. Every accessor here is `#[inline(never)]` for that reason.

use crate::runtime;
use crate::sched::Sched;
use crate::unit::{Unit, UnitKind};
use crate::xstream::Xstream;
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD_TAG: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static XSTREAM: RefCell<Option<Xstream>> = const { RefCell::new(None) };
    static CHAIN: RefCell<Vec<Unit>> = const { RefCell::new(Vec::new()) };
    static BASE_SCHED: RefCell<Option<Sched>> = const { RefCell::new(None) };
    static THREAD_TAG: Cell<u64> = const { Cell::new(0) };
}

/// What kind of caller is executing on this OS thread right now
pub(crate) enum Caller {
    /// A stackful unit; it can suspend
    Stackful(Unit),
    /// A run-to-completion unit; it must not suspend
    Task(Unit),
    /// The primary thread outside of any unit
    Primary,
    /// Scheduler code on a secondary stream's native stack, or a thread
    /// unknown to the runtime
    Native,
}

/// Stable small id of the calling OS thread
#[inline(never)]
pub(crate) fn thread_tag() -> u64 {
    THREAD_TAG.with(|tag| {
        if tag.get() == 0 {
            tag.set(NEXT_THREAD_TAG.fetch_add(1, Ordering::Relaxed));
        }
        tag.get()
    })
}

/// Execution stream hosting the calling thread
#[inline(never)]
pub(crate) fn current_xstream() -> Option<Xstream> {
    if let Some(xstream) = XSTREAM.with(|x| x.borrow().clone()) {
        return Some(xstream);
    }
    runtime::primary_of_current_thread()
}

/// Bind the calling thread to `xstream`, returning the previous binding
#[inline(never)]
pub(crate) fn set_xstream(xstream: Option<Xstream>) -> Option<Xstream> {
    XSTREAM.with(|x| std::mem::replace(&mut *x.borrow_mut(), xstream))
}

/// Innermost unit being resumed on this thread
#[inline(never)]
pub(crate) fn current_unit() -> Option<Unit> {
    CHAIN.with(|c| c.borrow().last().cloned())
}

#[inline(never)]
pub(crate) fn push_unit(unit: Unit) {
    CHAIN.with(|c| c.borrow_mut().push(unit));
}

#[inline(never)]
pub(crate) fn pop_unit() -> Option<Unit> {
    CHAIN.with(|c| c.borrow_mut().pop())
}

/// Replace the top-level scheduler of this thread, returning the previous one
#[inline(never)]
pub(crate) fn set_base_sched(sched: Option<Sched>) -> Option<Sched> {
    BASE_SCHED.with(|b| std::mem::replace(&mut *b.borrow_mut(), sched))
}

/// Schedulers active on this thread, outermost first
#[inline(never)]
pub(crate) fn sched_stack() -> Vec<Sched> {
    let mut stack: Vec<Sched> = BASE_SCHED.with(|b| b.borrow().iter().cloned().collect());
    CHAIN.with(|c| {
        stack.extend(c.borrow().iter().filter_map(|unit| unit.sched()));
    });
    stack
}

/// Innermost scheduler running on this thread
pub(crate) fn current_sched() -> Option<Sched> {
    sched_stack().pop()
}

/// Scheduler that runs `sched` on this thread, if `sched` is nested
pub(crate) fn parent_sched(sched: &Sched) -> Option<Sched> {
    let stack = sched_stack();
    let pos = stack.iter().rposition(|s| s == sched)?;
    pos.checked_sub(1).map(|p| stack[p].clone())
}

/// Number of schedulers stacked on this thread
pub(crate) fn sched_depth() -> usize {
    sched_stack().len()
}

/// Classify the caller for blocking decisions
pub(crate) fn caller() -> Caller {
    match current_unit() {
        Some(unit) if unit.kind() == UnitKind::Stackful => Caller::Stackful(unit),
        Some(unit) => Caller::Task(unit),
        None if runtime::is_primary_thread() => Caller::Primary,
        None => Caller::Native,
    }
}
