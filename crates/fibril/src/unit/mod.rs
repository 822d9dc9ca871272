//! Work units
//!
//! A unit is the schedulable entity. A stackful unit owns a private stack and
//! may yield, block and resume mid-execution. A run-to-completion unit has no
//! stack of its own and runs start to finish once dispatched.
//!
//! State machine: READY -> RUNNING -> {READY, BLOCKED, TERMINATED}, with
//! BLOCKED -> READY only through an explicit wake and TERMINATED left only by
//! [`Unit::revive`].

mod body;
mod key;
mod migrate;
pub(crate) mod park;

pub use key::Key;

pub(crate) use body::{Outcome, StackPool, Suspend};

use crate::config::MIN_STACKSIZE;
use crate::error::{Error, Result};
use crate::local::{self, Caller};
use crate::pool::Pool;
use crate::runtime::{self, Runtime};
use crate::sched::Sched;
use crate::tool::{self, SyncEvent, UnitEvent};
use crate::xstream::Xstream;
use body::{Body, CancelToken, Coro, Entry, ExitToken};
use corosensei::{CoroutineResult, Yielder};
use park::{WaitNode, WaitQueue};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Unique identifier for a Unit
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(u64);

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

impl UnitId {
    /// Generate a new unique UnitId
    pub fn new() -> Self {
        UnitId(NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self::new()
    }
}

/// Kind of a work unit
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnitKind {
    /// Owns a stack; can yield and block
    Stackful,
    /// Runs start to finish on the dispatcher's stack
    RunToCompletion,
}

/// State of a work unit
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum UnitState {
    /// In a pool, or popped and about to run
    Ready = 0,
    /// Executing on exactly one execution stream
    Running = 1,
    /// Waiting on a primitive, a join, or a suspend
    Blocked = 2,
    /// Finished; awaiting join, free or revive
    Terminated = 3,
}

impl UnitState {
    fn from_u8(v: u8) -> UnitState {
        match v {
            0 => UnitState::Ready,
            1 => UnitState::Running,
            2 => UnitState::Blocked,
            _ => UnitState::Terminated,
        }
    }
}

type TerminateHook = Arc<dyn Fn(&Unit) + Send + Sync>;

pub(crate) struct UnitInner {
    /// Unique identifier
    id: UnitId,

    /// Stackful or run-to-completion
    kind: UnitKind,

    /// Current [`UnitState`]
    state: AtomicU8,

    /// Pool the unit returns to after yielding or blocking
    home: Mutex<Option<Pool>>,

    migratable: AtomicBool,

    /// Ordering key of priority pools
    priority: AtomicI32,

    /// Stack size in bytes (0 for run-to-completion units)
    stack_size: usize,

    /// Coroutine or entry function; locked by the dispatcher while running
    body: Mutex<Body>,

    /// Yielder of the running coroutine, set at coroutine entry
    yielder: AtomicPtr<Yielder<(), Suspend>>,

    /// Park handshake state (see `park`)
    park: AtomicU8,

    /// Set by `suspend`, cleared by `resume`
    suspended: AtomicBool,

    /// Whether the entry function has been entered
    started: AtomicBool,

    cancel_requested: AtomicBool,

    /// [`Outcome`] of the last run, 0 while not terminated
    outcome: AtomicU8,

    /// Joiners waiting for termination
    joiners: Mutex<WaitQueue>,

    /// Work-unit-specific values by key id
    specific: Mutex<FxHashMap<u64, Box<dyn Any + Send>>>,

    /// Invoked every time the unit terminates
    on_terminate: Option<TerminateHook>,

    /// Stream that last ran the unit
    last_xstream: Mutex<Option<Xstream>>,

    /// What the unit last blocked on
    sync_event: AtomicU8,

    /// Released by the runtime after termination
    unnamed: bool,

    /// Scheduler this unit runs, for stacked schedulers
    sched: Option<Sched>,

    freed: AtomicBool,
}

impl UnitInner {
    pub(super) fn set_yielder(&self, yielder: &Yielder<(), Suspend>) {
        self.yielder
            .store(yielder as *const Yielder<(), Suspend> as *mut _, Ordering::Release);
    }
}

/// Handle to a work unit
///
/// Cloning the handle shares the unit. After [`Unit::free`] every clone
/// reports `Error::InvalidUnit`.
#[derive(Clone)]
pub struct Unit {
    inner: Arc<UnitInner>,
}

/// Attributes of a unit under construction
struct Spec {
    kind: UnitKind,
    stack_size: usize,
    migratable: bool,
    priority: i32,
    on_terminate: Option<TerminateHook>,
    unnamed: bool,
    sched: Option<Sched>,
    home: Option<Pool>,
}

/// Result of resuming a unit's body once
pub(crate) enum Step {
    Suspended(Suspend),
    Done(Outcome),
}

impl Unit {
    fn build(spec: Spec, entry: Entry, rt: &Runtime) -> Result<Unit> {
        let stack = match spec.kind {
            UnitKind::Stackful => Some(rt.stacks().acquire(spec.stack_size)?),
            UnitKind::RunToCompletion => None,
        };

        let inner = Arc::new_cyclic(|weak| {
            let body = match stack {
                Some(stack) => Body::Stackful(Coro::new(stack, weak.clone(), entry)),
                None => Body::Task(Some(entry)),
            };
            UnitInner {
                id: UnitId::new(),
                kind: spec.kind,
                state: AtomicU8::new(UnitState::Ready as u8),
                home: Mutex::new(spec.home),
                migratable: AtomicBool::new(spec.migratable),
                priority: AtomicI32::new(spec.priority),
                stack_size: match spec.kind {
                    UnitKind::Stackful => spec.stack_size,
                    UnitKind::RunToCompletion => 0,
                },
                body: Mutex::new(body),
                yielder: AtomicPtr::new(std::ptr::null_mut()),
                park: AtomicU8::new(park::PARK_IDLE),
                suspended: AtomicBool::new(false),
                started: AtomicBool::new(false),
                cancel_requested: AtomicBool::new(false),
                outcome: AtomicU8::new(0),
                joiners: Mutex::new(WaitQueue::new()),
                specific: Mutex::new(FxHashMap::default()),
                on_terminate: spec.on_terminate,
                last_xstream: Mutex::new(None),
                sync_event: AtomicU8::new(SyncEvent::Other as u8),
                unnamed: spec.unnamed,
                sched: spec.sched,
                freed: AtomicBool::new(false),
            }
        });
        Ok(Unit { inner })
    }

    /// Stackful unit running `sched`'s loop, without a home pool
    pub(crate) fn for_sched(sched: &Sched, rt: &Runtime) -> Result<Unit> {
        let runner = sched.clone();
        Unit::build(
            Spec {
                kind: UnitKind::Stackful,
                stack_size: rt.config().sched_stacksize,
                migratable: false,
                priority: 0,
                on_terminate: None,
                unnamed: false,
                sched: Some(sched.clone()),
                home: None,
            },
            Box::new(move || runner.run_stacked()),
            rt,
        )
    }

    pub(crate) fn check(&self) -> Result<&UnitInner> {
        if self.inner.freed.load(Ordering::Acquire) {
            return Err(Error::InvalidUnit);
        }
        Ok(&self.inner)
    }

    /// Get the unit ID
    pub fn id(&self) -> UnitId {
        self.inner.id
    }

    /// Stackful or run-to-completion
    pub fn kind(&self) -> UnitKind {
        self.inner.kind
    }

    /// Current state
    pub fn state(&self) -> UnitState {
        UnitState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: UnitState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    /// Pool the unit belongs to
    pub fn home_pool(&self) -> Option<Pool> {
        self.inner.home.lock().clone()
    }

    pub(crate) fn set_home(&self, pool: Option<Pool>) {
        *self.inner.home.lock() = pool;
    }

    /// Change the pool the unit returns to
    ///
    /// Not allowed while the unit waits in a pool; use migration for that.
    pub fn set_home_pool(&self, pool: &Pool) -> Result<()> {
        self.check()?;
        pool.validate()?;
        if self.state() == UnitState::Ready {
            return Err(Error::UnitState("a READY unit changes pools by migrating"));
        }
        self.set_home(Some(pool.clone()));
        Ok(())
    }

    /// Ordering key used by priority pools
    pub fn priority(&self) -> i32 {
        self.inner.priority.load(Ordering::Relaxed)
    }

    /// Whether the unit may be migrated
    pub fn is_migratable(&self) -> bool {
        self.inner.migratable.load(Ordering::Acquire)
    }

    /// Allow or forbid migration
    pub fn set_migratable(&self, migratable: bool) -> Result<()> {
        self.check()?;
        if self.inner.sched.is_some() && migratable {
            return Err(Error::UnitState("scheduler units cannot migrate"));
        }
        self.inner.migratable.store(migratable, Ordering::Release);
        Ok(())
    }

    /// Execution stream that last ran the unit
    pub fn last_xstream(&self) -> Option<Xstream> {
        self.inner.last_xstream.lock().clone()
    }

    pub(crate) fn set_last_xstream(&self, xstream: Option<Xstream>) {
        *self.inner.last_xstream.lock() = xstream;
    }

    /// Stack size in bytes, 0 for run-to-completion units
    pub fn stack_size(&self) -> usize {
        self.inner.stack_size
    }

    /// Whether the runtime releases the unit after termination
    pub fn is_unnamed(&self) -> bool {
        self.inner.unnamed
    }

    /// Whether the last run ended through cancellation
    pub fn was_cancelled(&self) -> bool {
        self.outcome() == Some(Outcome::Cancelled)
    }

    /// Whether the last run ended with a panic
    pub fn panicked(&self) -> bool {
        self.outcome() == Some(Outcome::Panicked)
    }

    fn outcome(&self) -> Option<Outcome> {
        Outcome::from_u8(self.inner.outcome.load(Ordering::Acquire))
    }

    pub(crate) fn sched(&self) -> Option<Sched> {
        self.inner.sched.clone()
    }

    pub(crate) fn set_sync_event(&self, event: SyncEvent) {
        self.inner.sync_event.store(event as u8, Ordering::Relaxed);
    }

    pub(crate) fn sync_event(&self) -> SyncEvent {
        SyncEvent::from_u8(self.inner.sync_event.load(Ordering::Relaxed))
    }

    pub(crate) fn started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::Acquire)
    }

    /// Hand control back to the dispatcher
    ///
    /// Must be called by the unit itself, from inside its own coroutine.
    pub(crate) fn suspend_with(&self, why: Suspend) {
        let yielder = self.inner.yielder.load(Ordering::Acquire);
        assert!(
            !yielder.is_null(),
            "unit {} suspended outside of its own context",
            self.id().as_u64()
        );
        // SAFETY: the yielder lives on this unit's stack for as long as the
        // coroutine runs, and only the running unit reaches this call.
        unsafe { (*yielder).suspend(why) };
    }

    /// READY -> RUNNING; a unit dispatched in any other state is a fatal
    /// bookkeeping error
    pub(crate) fn begin_running(&self) {
        let swapped = self.inner.state.compare_exchange(
            UnitState::Ready as u8,
            UnitState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if let Err(state) = swapped {
            error!(unit = self.id().as_u64(), ?state, "unit dispatched while not READY");
            panic!(
                "unit {} dispatched in state {:?}",
                self.id().as_u64(),
                UnitState::from_u8(state)
            );
        }
    }

    /// Resume the body once
    pub(crate) fn run_body(&self) -> Step {
        let Some(mut body) = self.inner.body.try_lock() else {
            panic!("unit {} is already running on another execution stream", self.id().as_u64());
        };
        self.inner.started.store(true, Ordering::Release);

        if let Body::Stackful(coro) = &mut *body {
            return match coro.resume() {
                CoroutineResult::Yield(why) => Step::Suspended(why),
                CoroutineResult::Return(outcome) => {
                    if let (Some(stack), Some(rt)) = (coro.take_stack(), runtime::try_get()) {
                        rt.stacks().release(stack, self.inner.stack_size);
                    }
                    *body = Body::Empty;
                    Step::Done(outcome)
                }
            };
        }

        let entry = match std::mem::replace(&mut *body, Body::Empty) {
            Body::Task(entry) => entry,
            _ => None,
        };
        drop(body);
        match entry {
            Some(entry) => Step::Done(body::run_entry(entry)),
            None => panic!("unit {} has nothing to run", self.id().as_u64()),
        }
    }

    /// Drop a body that never ran
    pub(crate) fn discard_body(&self) {
        *self.inner.body.lock() = Body::Empty;
    }

    /// RUNNING -> TERMINATED: release per-unit data, run the termination
    /// callback and wake joiners
    pub(crate) fn terminate(&self, outcome: Outcome) {
        let values: Vec<_> = self.inner.specific.lock().drain().collect();
        drop(values);

        if let Some(hook) = &self.inner.on_terminate {
            if panic::catch_unwind(AssertUnwindSafe(|| hook(self))).is_err() {
                error!(unit = self.id().as_u64(), "termination callback panicked");
            }
        }

        self.inner.outcome.store(outcome as u8, Ordering::Release);
        if outcome == Outcome::Cancelled {
            debug!(unit = self.id().as_u64(), "unit cancelled");
        }

        let waiters = {
            let mut joiners = self.inner.joiners.lock();
            self.set_state(UnitState::Terminated);
            joiners.take_all()
        };
        tool::emit(UnitEvent::Finish, self, None);
        park::notify_all(waiters);

        if let Some(sched) = &self.inner.sched {
            sched.release_pool_use();
        }
        if self.inner.unnamed {
            self.inner.freed.store(true, Ordering::Release);
        }
        trace!(unit = self.id().as_u64(), ?outcome, "unit terminated");
    }

    /// Block until the unit terminates
    ///
    /// Returns at once if it already has. Any number of callers may join the
    /// same unit.
    pub fn join(&self) -> Result<()> {
        self.check()?;
        if self.inner.unnamed {
            return Err(Error::InvalidUnit);
        }
        if local::current_unit().as_ref() == Some(self) {
            return Err(Error::UnitState("a unit cannot join itself"));
        }
        cancellation_point();

        let node = {
            let mut joiners = self.inner.joiners.lock();
            if self.state() == UnitState::Terminated {
                None
            } else {
                let node = WaitNode::for_caller(SyncEvent::UnitJoin);
                joiners.push_back(node.clone());
                Some(node)
            }
        };
        if let Some(node) = node {
            node.wait();
        }
        tool::emit(UnitEvent::Join, self, None);
        Ok(())
    }

    /// Join the unit if needed, then release it
    pub fn free(self) -> Result<()> {
        self.check()?;
        if self.inner.sched.is_some() {
            return Err(Error::UnitState("scheduler units are released with their scheduler"));
        }
        if local::current_unit().as_ref() == Some(&self) {
            return Err(Error::UnitState("a unit cannot free itself"));
        }
        if self.state() != UnitState::Terminated {
            self.join()?;
        }
        if self.inner.freed.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidUnit);
        }
        tool::emit(UnitEvent::Free, &self, None);
        *self.inner.home.lock() = None;
        *self.inner.last_xstream.lock() = None;
        Ok(())
    }

    /// Re-arm a terminated unit with a new entry function and push it to
    /// `pool`, reusing its storage
    pub fn revive<F>(&self, pool: &Pool, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.check()?;
        pool.validate()?;
        if self.inner.unnamed || self.inner.sched.is_some() {
            return Err(Error::UnitState("unit cannot be revived"));
        }
        let rt = runtime::get()?;

        {
            let mut body = self.inner.body.lock();
            if self.state() != UnitState::Terminated {
                return Err(Error::UnitState("only terminated units can be revived"));
            }
            let entry: Entry = Box::new(f);
            *body = match self.inner.kind {
                UnitKind::Stackful => {
                    let stack = rt.stacks().acquire(self.inner.stack_size)?;
                    Body::Stackful(Coro::new(stack, Arc::downgrade(&self.inner), entry))
                }
                UnitKind::RunToCompletion => Body::Task(Some(entry)),
            };
            self.inner.yielder.store(std::ptr::null_mut(), Ordering::Release);
            self.inner.park.store(park::PARK_IDLE, Ordering::Release);
            self.inner.suspended.store(false, Ordering::Release);
            self.inner.started.store(false, Ordering::Release);
            self.inner.cancel_requested.store(false, Ordering::Release);
            self.inner.outcome.store(0, Ordering::Release);
            self.set_home(Some(pool.clone()));
            self.set_state(UnitState::Ready);
        }

        tool::emit(UnitEvent::Revive, self, Some(pool));
        pool.push_unit(self.clone());
        Ok(())
    }

    /// Request cooperative cancellation
    ///
    /// A unit that has not started yet terminates without running. A running
    /// stackful unit terminates at its next cancellation point: yield,
    /// suspend, the start of any blocking wait, or [`check_cancel`].
    pub fn cancel(&self) -> Result<()> {
        self.check()?;
        if self.inner.sched.is_some() {
            return Err(Error::UnitState("cancel a scheduler through Sched::exit"));
        }
        if self.state() == UnitState::Terminated {
            return Ok(());
        }
        self.inner.cancel_requested.store(true, Ordering::Release);
        tool::emit(UnitEvent::Cancel, self, None);
        debug!(unit = self.id().as_u64(), "cancellation requested");
        Ok(())
    }

    /// Make a unit blocked in [`suspend`] ready again
    pub fn resume(&self) -> Result<()> {
        self.check()?;
        if self
            .inner
            .suspended
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::UnitState("unit is not suspended"));
        }
        self.unpark();
        Ok(())
    }
}

impl PartialEq for Unit {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Unit {}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

/// Builder for work units
pub struct Builder {
    kind: UnitKind,
    stack_size: Option<usize>,
    migratable: bool,
    priority: i32,
    on_terminate: Option<TerminateHook>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            kind: UnitKind::Stackful,
            stack_size: None,
            migratable: true,
            priority: 0,
            on_terminate: None,
        }
    }
}

impl Builder {
    /// Stackful, migratable, default stack size
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the unit kind
    pub fn kind(mut self, kind: UnitKind) -> Self {
        self.kind = kind;
        self
    }

    /// Build a run-to-completion unit
    pub fn run_to_completion(self) -> Self {
        self.kind(UnitKind::RunToCompletion)
    }

    /// Stack size of a stackful unit
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Whether the unit may migrate
    pub fn migratable(mut self, migratable: bool) -> Self {
        self.migratable = migratable;
        self
    }

    /// Ordering key for priority pools; higher runs first
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Callback invoked each time the unit terminates
    pub fn on_terminate(mut self, f: impl Fn(&Unit) + Send + Sync + 'static) -> Self {
        self.on_terminate = Some(Arc::new(f));
        self
    }

    /// Create the unit READY in `pool`
    pub fn spawn<F>(self, pool: &Pool, f: F) -> Result<Unit>
    where
        F: FnOnce() + Send + 'static,
    {
        self.create(pool, Box::new(f), false)
    }

    /// Create the unit in the first main pool of `xstream`
    pub fn spawn_on<F>(self, xstream: &Xstream, f: F) -> Result<Unit>
    where
        F: FnOnce() + Send + 'static,
    {
        let pool = xstream.first_pool()?;
        self.spawn(&pool, f)
    }

    /// Create an unnamed unit, released by the runtime once it terminates
    pub fn spawn_detached<F>(self, pool: &Pool, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.create(pool, Box::new(f), true).map(|_| ())
    }

    fn create(self, pool: &Pool, entry: Entry, unnamed: bool) -> Result<Unit> {
        let rt = runtime::get()?;
        pool.validate()?;
        let stack_size = self.stack_size.unwrap_or(rt.config().thread_stacksize);
        if self.kind == UnitKind::Stackful && stack_size < MIN_STACKSIZE {
            return Err(Error::InvalidArg("stack size below minimum"));
        }

        let unit = Unit::build(
            Spec {
                kind: self.kind,
                stack_size,
                migratable: self.migratable,
                priority: self.priority,
                on_terminate: self.on_terminate,
                unnamed,
                sched: None,
                home: Some(pool.clone()),
            },
            entry,
            &rt,
        )?;

        tool::emit(UnitEvent::Create, &unit, Some(pool));
        trace!(unit = unit.id().as_u64(), pool = pool.id().as_u64(), "unit created");
        pool.push_unit(unit.clone());
        Ok(unit)
    }
}

/// Create a stackful unit in `pool`
///
/// # Thread-locals
///
/// A stackful unit may resume on a different execution stream after any
/// yield, blocking call or migration. A reference into a `thread_local!` (or
/// anything else tied to the OS thread, such as a `MutexGuard` of
/// `std::sync`) must not be held across those points: it would then refer
/// to the previous thread's slot. Re-enter `LocalKey::with` after each
/// resumption instead.
pub fn spawn<F>(pool: &Pool, f: F) -> Result<Unit>
where
    F: FnOnce() + Send + 'static,
{
    Builder::new().spawn(pool, f)
}

/// Create a run-to-completion unit in `pool`
pub fn spawn_task<F>(pool: &Pool, f: F) -> Result<Unit>
where
    F: FnOnce() + Send + 'static,
{
    Builder::new().run_to_completion().spawn(pool, f)
}

/// Create a stackful unit in the first main pool of `xstream`
pub fn spawn_on<F>(xstream: &Xstream, f: F) -> Result<Unit>
where
    F: FnOnce() + Send + 'static,
{
    Builder::new().spawn_on(xstream, f)
}

/// Create an unnamed stackful unit in `pool`
pub fn spawn_detached<F>(pool: &Pool, f: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    Builder::new().spawn_detached(pool, f)
}

/// Create one stackful unit per `(pool, body)` pair
pub fn spawn_many<F>(pools: &[Pool], bodies: Vec<F>) -> Result<Vec<Unit>>
where
    F: FnOnce() + Send + 'static,
{
    if pools.len() != bodies.len() {
        return Err(Error::InvalidArg("one pool per unit body is required"));
    }
    pools
        .iter()
        .zip(bodies)
        .map(|(pool, body)| spawn(pool, body))
        .collect()
}

/// Join every unit in order
pub fn join_many(units: &[Unit]) -> Result<()> {
    units.iter().try_for_each(Unit::join)
}

/// The calling unit
pub fn current() -> Result<Unit> {
    local::current_unit().ok_or(Error::InvalidUnit)
}

/// ID of the calling unit
pub fn current_id() -> Result<UnitId> {
    current().map(|u| u.id())
}

fn current_stackful() -> Result<Unit> {
    match local::caller() {
        Caller::Stackful(unit) => Ok(unit),
        Caller::Task(_) => Err(Error::NotStackful),
        Caller::Primary | Caller::Native => Err(Error::InvalidUnit),
    }
}

/// Terminate the calling stackful unit at a cancellation point if it has
/// been cancelled
pub(crate) fn cancellation_point() {
    if let Some(unit) = local::current_unit() {
        if unit.kind() == UnitKind::Stackful && unit.cancel_requested() {
            panic::resume_unwind(Box::new(CancelToken));
        }
    }
}

/// Explicit cancellation point
///
/// Does not return if the calling unit has been cancelled.
pub fn check_cancel() -> Result<()> {
    current_stackful()?;
    cancellation_point();
    Ok(())
}

/// Yield to the scheduler; the unit goes to the back of its pool
///
/// On the primary thread this runs the primary scheduler for one slice.
pub fn yield_now() -> Result<()> {
    match local::caller() {
        Caller::Stackful(unit) => {
            cancellation_point();
            unit.suspend_with(Suspend::Yield);
            cancellation_point();
            Ok(())
        }
        Caller::Task(_) => Err(Error::NotStackful),
        Caller::Primary => {
            runtime::get()?.drive_primary();
            Ok(())
        }
        Caller::Native => Err(Error::InvalidUnit),
    }
}

/// Yield and run `target` next on this execution stream
///
/// Falls back to a plain yield if `target` cannot be taken out of its pool.
pub fn yield_to(target: &Unit) -> Result<()> {
    let me = current_stackful()?;
    target.check()?;
    if &me == target {
        return Err(Error::InvalidArg("a unit cannot yield to itself"));
    }
    if target.state() != UnitState::Ready {
        return Err(Error::UnitState("yield target is not READY"));
    }
    cancellation_point();

    let taken = target
        .home_pool()
        .map_or(false, |pool| pool.remove(target).is_ok());
    if taken {
        me.suspend_with(Suspend::YieldTo(target.clone()));
    } else {
        me.suspend_with(Suspend::Yield);
    }
    cancellation_point();
    Ok(())
}

/// Block the calling unit until another party calls [`Unit::resume`]
pub fn suspend() -> Result<()> {
    let me = current_stackful()?;
    if me.sched().is_some() {
        return Err(Error::UnitState("schedulers cannot suspend"));
    }
    cancellation_point();

    me.set_sync_event(SyncEvent::Suspend);
    me.inner.suspended.store(true, Ordering::Release);
    while me.inner.suspended.load(Ordering::Acquire) {
        me.park();
    }
    cancellation_point();
    Ok(())
}

/// Terminate the calling stackful unit
///
/// Does not return on success. Destructors of live values on the unit's
/// stack run as it unwinds.
pub fn exit() -> Result<()> {
    current_stackful()?;
    panic::resume_unwind(Box::new(ExitToken))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_id_unique() {
        let a = UnitId::new();
        let b = UnitId::new();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_outside_unit_calls_fail() {
        assert!(matches!(current(), Err(Error::InvalidUnit)));
        assert!(matches!(suspend(), Err(Error::InvalidUnit)));
        assert!(matches!(exit(), Err(Error::InvalidUnit)));
        assert!(matches!(check_cancel(), Err(Error::InvalidUnit)));
    }

    #[test]
    fn test_spawn_requires_runtime_or_valid_pool() {
        crate::init().unwrap();
        let pool = Pool::new(crate::PoolKind::Fifo, crate::Access::Mpmc).unwrap();
        let unit = Builder::new()
            .stack_size(MIN_STACKSIZE)
            .priority(7)
            .migratable(false)
            .spawn(&pool, || {})
            .unwrap();
        assert_eq!(unit.state(), UnitState::Ready);
        assert_eq!(unit.priority(), 7);
        assert!(!unit.is_migratable());
        assert_eq!(unit.stack_size(), MIN_STACKSIZE);
        assert_eq!(unit.home_pool(), Some(pool.clone()));

        let small = Builder::new().stack_size(1024).spawn(&pool, || {});
        assert!(matches!(small, Err(Error::InvalidArg(_))));

        let task = spawn_task(&pool, || {}).unwrap();
        assert_eq!(task.kind(), UnitKind::RunToCompletion);
        assert_eq!(task.stack_size(), 0);

        while pool.pop().unwrap().is_some() {}
        crate::finalize().unwrap();
    }

    #[test]
    fn test_spawn_many_checks_lengths() {
        crate::init().unwrap();
        let pool = Pool::new(crate::PoolKind::Fifo, crate::Access::Mpmc).unwrap();
        let bodies: Vec<fn()> = vec![|| {}, || {}];
        assert!(matches!(
            spawn_many(&[pool.clone()], bodies),
            Err(Error::InvalidArg(_))
        ));
        crate::finalize().unwrap();
    }
}
