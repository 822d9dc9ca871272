//! Execution streams
//!
//! An execution stream is an OS thread running one top-level scheduler at a
//! time. Rank 0 is the primary stream: the thread that initialized the runtime.
//! It is never created or freed by the user, and its scheduler runs in a
//! stackful unit driven whenever the primary thread blocks on the runtime.

mod affinity;
mod barrier;

pub use barrier::XstreamBarrier;

use crate::config::SchedConfig;
use crate::error::{Error, Result};
use crate::local::{self, Caller};
use crate::pool::Pool;
use crate::runtime::{self, Runtime};
use crate::sched::{dispatch, Sched, SchedKind};
use crate::tool::SyncEvent;
use crate::unit::park::{self, WaitNode, WaitQueue};
use crate::unit::{self, Unit, UnitState};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// State of an execution stream
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum XstreamState {
    /// Its thread runs the main scheduler
    Running = 0,
    /// Its main scheduler returned; join, free or revive it
    Terminated = 1,
}

/// Handle to an execution stream
#[derive(Clone)]
pub struct Xstream {
    inner: Arc<XstreamInner>,
}

struct XstreamInner {
    /// Rank, unique among live streams
    rank: usize,

    primary: bool,

    state: AtomicU8,

    /// Top-level scheduler
    main_sched: Mutex<Option<Sched>>,

    /// Scheduler replacing `main_sched` once it stops
    pending: Mutex<Option<Sched>>,

    /// OS thread of a secondary stream
    thread: Mutex<Option<JoinHandle<()>>>,

    /// Native thread handle while the thread is joinable
    native: Mutex<Option<affinity::NativeThread>>,

    /// Threads and units waiting for termination
    joiners: Mutex<WaitQueue>,

    freed: AtomicBool,
}

impl Xstream {
    fn build(rank: usize, primary: bool, sched: Option<Sched>) -> Xstream {
        Xstream {
            inner: Arc::new(XstreamInner {
                rank,
                primary,
                state: AtomicU8::new(XstreamState::Running as u8),
                main_sched: Mutex::new(sched),
                pending: Mutex::new(None),
                thread: Mutex::new(None),
                native: Mutex::new(None),
                joiners: Mutex::new(WaitQueue::new()),
                freed: AtomicBool::new(false),
            }),
        }
    }

    /// Primary stream bound to the calling thread
    pub(crate) fn new_primary(sched: Sched) -> Result<Xstream> {
        sched.claim_for_main(0)?;
        let xstream = Xstream::build(0, true, Some(sched));
        *xstream.inner.native.lock() = Some(affinity::current());
        Ok(xstream)
    }

    fn check(&self) -> Result<&XstreamInner> {
        if self.inner.freed.load(Ordering::Acquire) {
            return Err(Error::InvalidXstream);
        }
        Ok(&self.inner)
    }

    fn check_secondary(&self) -> Result<&XstreamInner> {
        let inner = self.check()?;
        if inner.primary {
            return Err(Error::InvalidXstream);
        }
        Ok(inner)
    }

    /// Start a stream running `sched` at the smallest free rank
    pub fn create(sched: &Sched) -> Result<Xstream> {
        let rt = runtime::get()?;
        Self::spawn(&rt, sched, None)
    }

    /// Start a stream running `sched` at `rank`
    pub fn create_with_rank(sched: &Sched, rank: usize) -> Result<Xstream> {
        let rt = runtime::get()?;
        Self::spawn(&rt, sched, Some(rank))
    }

    /// Start a stream running a predefined scheduler
    ///
    /// The scheduler is automatic: it is freed together with the stream.
    pub fn create_basic(kind: SchedKind, pools: &[Pool], config: &SchedConfig) -> Result<Xstream> {
        let rt = runtime::get()?;
        let sched = Sched::build_predefined(kind, pools, config, rt.config(), true)?;
        Self::spawn(&rt, &sched, None).map_err(|e| {
            let _ = sched.free();
            e
        })
    }

    fn spawn(rt: &Runtime, sched: &Sched, rank: Option<usize>) -> Result<Xstream> {
        sched.pools()?;
        let xstream = rt.register_xstream(rank, |rank| Xstream::build(rank, false, None))?;
        let rank = xstream.rank();

        if let Err(e) = sched.claim_for_main(rank) {
            rt.unregister_xstream(rank);
            return Err(e);
        }
        *xstream.inner.main_sched.lock() = Some(sched.clone());

        if let Err(e) = xstream.start() {
            xstream.inner.main_sched.lock().take();
            sched.release_use();
            rt.unregister_xstream(rank);
            return Err(e);
        }
        Ok(xstream)
    }

    fn start(&self) -> Result<()> {
        self.inner
            .state
            .store(XstreamState::Running as u8, Ordering::Release);
        let xstream = self.clone();
        let handle = thread::Builder::new()
            .name(format!("fibril-xstream-{}", self.rank()))
            .spawn(move || xstream.main_loop())
            .map_err(|e| {
                self.inner
                    .state
                    .store(XstreamState::Terminated as u8, Ordering::Release);
                Error::sys("spawn execution stream", e)
            })?;
        *self.inner.native.lock() = Some(affinity::of(&handle));
        *self.inner.thread.lock() = Some(handle);
        Ok(())
    }

    /// Body of a secondary stream's thread
    fn main_loop(self) {
        local::set_xstream(Some(self.clone()));
        debug!(rank = self.rank(), "execution stream started");

        if let Some(rt) = runtime::try_get() {
            if rt.config().set_affinity {
                let cpu = self.rank() % rt.config().num_cores;
                if let Err(e) = affinity::set(affinity::current(), &[cpu]) {
                    warn!(rank = self.rank(), cpu, error = %e, "cannot pin execution stream");
                }
            }
        }

        while let Some(sched) = self.main_sched() {
            local::set_base_sched(Some(sched.clone()));
            sched.run_top();
            local::set_base_sched(None);
            if !(sched.take_replace() && self.take_pending_sched().is_some()) {
                break;
            }
            debug!(rank = self.rank(), "main scheduler replaced");
        }

        let waiters = {
            let mut joiners = self.inner.joiners.lock();
            self.inner
                .state
                .store(XstreamState::Terminated as u8, Ordering::Release);
            joiners.take_all()
        };
        park::notify_all(waiters);
        local::set_xstream(None);
        debug!(rank = self.rank(), "execution stream stopped");
    }

    /// Install the scheduler queued by `set_main_sched`, retiring the old one
    pub(crate) fn take_pending_sched(&self) -> Option<Sched> {
        let new = self.inner.pending.lock().take()?;
        let old = self.inner.main_sched.lock().replace(new.clone());
        if let Some(old) = old {
            old.retire_main();
        }
        Some(new)
    }

    pub(crate) fn has_pending_sched(&self) -> bool {
        self.inner.pending.lock().is_some()
    }

    /// Release the primary stream's schedulers at finalize
    pub(crate) fn retire(&self) {
        if let Some(sched) = self.inner.pending.lock().take() {
            sched.release_use();
        }
        if let Some(sched) = self.inner.main_sched.lock().take() {
            sched.retire_main();
        }
        self.inner.native.lock().take();
        self.inner
            .state
            .store(XstreamState::Terminated as u8, Ordering::Release);
        self.inner.freed.store(true, Ordering::Release);
    }

    /// Wait until the stream's main scheduler has stopped and its thread
    /// has exited
    ///
    /// The main scheduler is asked to finish first, so the stream stops once
    /// its pools are drained.
    pub fn join(&self) -> Result<()> {
        self.check_secondary()?;
        if local::current_xstream().as_ref() == Some(self) {
            return Err(Error::XstreamState("an execution stream cannot join itself"));
        }
        unit::cancellation_point();

        for sched in [self.main_sched(), self.inner.pending.lock().clone()]
            .into_iter()
            .flatten()
        {
            let _ = sched.finish();
        }

        let node = {
            let mut joiners = self.inner.joiners.lock();
            if self.state() == XstreamState::Terminated {
                None
            } else {
                let node = WaitNode::for_caller(SyncEvent::XstreamJoin);
                joiners.push_back(node.clone());
                Some(node)
            }
        };
        if let Some(node) = node {
            node.wait();
        }
        self.reap();
        Ok(())
    }

    /// Join the OS thread of a terminated stream
    fn reap(&self) {
        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            self.inner.native.lock().take();
            if handle.join().is_err() {
                warn!(rank = self.rank(), "execution stream thread panicked");
            }
        }
    }

    /// Join the stream if needed, then release it and its rank
    pub fn free(self) -> Result<()> {
        self.check_secondary()?;
        self.join()?;
        if self.inner.freed.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidXstream);
        }
        if let Some(sched) = self.inner.pending.lock().take() {
            sched.release_use();
        }
        if let Some(sched) = self.inner.main_sched.lock().take() {
            sched.retire_main();
        }
        if let Some(rt) = runtime::try_get() {
            rt.unregister_xstream(self.rank());
        }
        debug!(rank = self.rank(), "execution stream freed");
        Ok(())
    }

    /// Restart a joined stream, optionally with a new main scheduler
    pub fn revive(&self, sched: Option<&Sched>) -> Result<()> {
        self.check_secondary()?;
        if self.state() != XstreamState::Terminated {
            return Err(Error::XstreamState("only a terminated stream can be revived"));
        }
        self.reap();

        match sched {
            Some(sched) => {
                sched.claim_for_main(self.rank())?;
                let old = self.inner.main_sched.lock().replace(sched.clone());
                if let Some(old) = old {
                    old.retire_main();
                }
            }
            None => match self.main_sched() {
                Some(sched) => sched.rearm(),
                None => return Err(Error::InvalidSched),
            },
        }

        self.start()?;
        debug!(rank = self.rank(), "execution stream revived");
        Ok(())
    }

    /// Ask the main scheduler to stop at its next event check, leaving any
    /// pending units in place
    pub fn cancel(&self) -> Result<()> {
        self.check_secondary()?;
        if let Some(sched) = self.main_sched() {
            sched.exit()?;
        }
        Ok(())
    }

    /// Stop the calling execution stream once the calling unit yields
    pub fn exit() -> Result<()> {
        let xstream = Self::current()?;
        if xstream.is_primary() {
            return Err(Error::InvalidXstream);
        }
        if let Some(sched) = xstream.main_sched() {
            sched.exit()?;
        }
        if let Caller::Stackful(_) = local::caller() {
            unit::yield_now()?;
        }
        Ok(())
    }

    /// Execution stream of the calling thread
    pub fn current() -> Result<Xstream> {
        runtime::get()?;
        local::current_xstream().ok_or(Error::InvalidXstream)
    }

    /// Rank of the calling thread's execution stream
    pub fn current_rank() -> Result<usize> {
        Self::current().map(|x| x.rank())
    }

    /// Number of live execution streams, primary included
    pub fn num_xstreams() -> Result<usize> {
        Ok(runtime::get()?.num_xstreams())
    }

    /// Rank of the stream
    pub fn rank(&self) -> usize {
        self.inner.rank
    }

    /// Whether this is the primary stream
    pub fn is_primary(&self) -> bool {
        self.inner.primary
    }

    /// Current state
    pub fn state(&self) -> XstreamState {
        match self.inner.state.load(Ordering::Acquire) {
            0 => XstreamState::Running,
            _ => XstreamState::Terminated,
        }
    }

    /// Top-level scheduler
    pub fn main_sched(&self) -> Option<Sched> {
        self.inner.main_sched.lock().clone()
    }

    /// Replace the top-level scheduler
    ///
    /// On a running stream the current scheduler stops at its next event
    /// check and the stream switches over. Units left in pools owned only by
    /// an automatic old scheduler are dropped with them.
    pub fn set_main_sched(&self, sched: &Sched) -> Result<()> {
        self.check()?;
        sched.claim_for_main(self.rank())?;

        if self.state() == XstreamState::Terminated {
            let old = self.inner.main_sched.lock().replace(sched.clone());
            if let Some(old) = old {
                old.retire_main();
            }
            return Ok(());
        }

        let previous = self.inner.pending.lock().replace(sched.clone());
        if let Some(previous) = previous {
            previous.release_use();
        }
        if let Some(current) = self.main_sched() {
            current.request_replace();
        }
        Ok(())
    }

    /// Replace the top-level scheduler with an automatic predefined one
    pub fn set_main_sched_basic(&self, kind: SchedKind, pools: &[Pool]) -> Result<()> {
        let rt = runtime::get()?;
        let sched = Sched::build_predefined(kind, pools, &SchedConfig::new(), rt.config(), true)?;
        self.set_main_sched(&sched).map_err(|e| {
            let _ = sched.clone().free();
            e
        })
    }

    /// Pools of the main scheduler
    pub fn main_pools(&self) -> Result<Vec<Pool>> {
        self.check()?;
        self.main_sched().ok_or(Error::InvalidSched)?.pools()
    }

    /// First pool of the main scheduler
    pub(crate) fn first_pool(&self) -> Result<Pool> {
        self.main_pools()?
            .into_iter()
            .next()
            .ok_or(Error::InvalidPool)
    }

    fn native(&self) -> Result<affinity::NativeThread> {
        self.check()?;
        (*self.inner.native.lock()).ok_or(Error::XstreamState("execution stream is not running"))
    }

    /// Bind the stream's thread to one CPU
    pub fn set_cpubind(&self, cpu: usize) -> Result<()> {
        self.set_affinity(&[cpu])
    }

    /// First CPU the stream's thread may run on
    pub fn cpubind(&self) -> Result<usize> {
        self.affinity()?
            .first()
            .copied()
            .ok_or(Error::XstreamState("execution stream has an empty cpu set"))
    }

    /// Restrict the stream's thread to `cpus`
    pub fn set_affinity(&self, cpus: &[usize]) -> Result<()> {
        let native = self.native()?;
        affinity::set(native, cpus).map_err(|e| {
            warn!(rank = self.rank(), ?cpus, error = %e, "cannot set execution stream affinity");
            e
        })
    }

    /// CPUs the stream's thread may run on
    pub fn affinity(&self) -> Result<Vec<usize>> {
        affinity::get(self.native()?)
    }

    /// Let pending runtime events take effect for `sched`, which must be
    /// running on the calling stream
    pub fn check_events(sched: &Sched) -> Result<()> {
        Self::current()?;
        dispatch::check_events(sched);
        Ok(())
    }

    /// Run a READY unit taken out of a pool on the calling stream
    pub fn run_unit(unit: &Unit) -> Result<()> {
        Self::current()?;
        unit.check()?;
        if unit.state() != UnitState::Ready {
            return Err(Error::UnitState("only READY units can be run"));
        }
        dispatch::run(unit.clone());
        Ok(())
    }
}

impl PartialEq for Xstream {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Xstream {}

impl fmt::Debug for Xstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Xstream")
            .field("rank", &self.inner.rank)
            .field("primary", &self.inner.primary)
            .field("state", &self.state())
            .finish()
    }
}
