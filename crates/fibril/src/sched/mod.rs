//! Schedulers
//!
//! A scheduler is a policy loop over an ordered list of pools. The loop pops
//! units and hands them to the dispatcher, polls [`SchedContext::has_to_stop`]
//! and calls [`SchedContext::check_events`] at a bounded cadence.
//!
//! A scheduler runs either directly on a secondary execution stream's native
//! stack, or stacked inside a stackful unit: the primary scheduler and any
//! scheduler pushed into a pool with [`Pool::add_sched`]. A stacked scheduler
//! yields to whatever resumed it at every event check.

mod basic;
pub(crate) mod dispatch;
mod randws;

pub use basic::{Basic, BasicWait, Prio};
pub use randws::RandWs;

use crate::config::{Config, SchedConfig};
use crate::error::{Error, Result};
use crate::local;
use crate::pool::{Access, Pool, PoolKind};
use crate::runtime;
use crate::unit::Unit;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Unique identifier for a Sched
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchedId(u64);

static NEXT_SCHED_ID: AtomicU64 = AtomicU64::new(1);

impl SchedId {
    /// Generate a new unique SchedId
    pub fn new() -> Self {
        SchedId(NEXT_SCHED_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for SchedId {
    fn default() -> Self {
        Self::new()
    }
}

/// Predefined scheduling policies
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchedKind {
    /// Round-robin over the pools
    Basic,
    /// Always the first non-empty pool in order
    Prio,
    /// Like `Basic`, but sleeps on a wait-capable pool when idle
    BasicWait,
    /// Own pool first, then a random victim pool
    RandWs,
}

impl SchedKind {
    /// Pool created for the scheduler when none is given
    fn default_pool(self) -> (PoolKind, Access) {
        match self {
            SchedKind::Basic | SchedKind::Prio => (PoolKind::Fifo, Access::Mpsc),
            SchedKind::BasicWait => (PoolKind::FifoWait, Access::Mpsc),
            SchedKind::RandWs => (PoolKind::Steal, Access::Mpmc),
        }
    }
}

/// Lifecycle state of a scheduler
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedState {
    /// Not yet run
    Ready = 0,
    /// Its loop is executing
    Running = 1,
    /// Its loop returned
    Stopped = 2,
}

impl SchedState {
    fn from_u8(v: u8) -> SchedState {
        match v {
            0 => SchedState::Ready,
            1 => SchedState::Running,
            _ => SchedState::Stopped,
        }
    }
}

/// Stop once all pools are empty
const REQ_FINISH: u32 = 1 << 0;
/// Stop at the next check
const REQ_EXIT: u32 = 1 << 1;
/// Stop so the stream can switch to a new main scheduler
const REQ_REPLACE: u32 = 1 << 2;

/// Scheduling policy
///
/// Only `run` is required. It must pop units from `ctx.pools()` and hand them
/// to `ctx.run_unit`, and at most every `ctx.event_freq()` iterations (and
/// whenever no unit was found) poll `ctx.has_to_stop()` and call
/// `ctx.check_events()`. It returns once `has_to_stop` is true.
pub trait Policy: Send + Sync + 'static {
    /// Called once when the scheduler is created
    fn init(&self, _pools: &[Pool], _config: &SchedConfig) -> Result<()> {
        Ok(())
    }

    /// The scheduling loop
    fn run(&self, ctx: &SchedContext<'_>);

    /// Called once when the scheduler is freed
    fn free(&self) {}

    /// Pool that receives units migrated to this scheduler
    ///
    /// Defaults to the first pool.
    fn migration_pool(&self, _pools: &[Pool]) -> Option<Pool> {
        None
    }
}

/// Where a scheduler is currently used
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Usage {
    Unused,
    /// Main scheduler of the stream with this rank
    Main(usize),
    /// Waiting or running as a unit of some pool
    InPool,
}

/// Handle to a scheduler
#[derive(Clone)]
pub struct Sched {
    inner: Arc<SchedInner>,
}

struct SchedInner {
    id: SchedId,

    /// Predefined kind, `None` for user policies
    kind: Option<SchedKind>,

    policy: Box<dyn Policy>,

    /// Pools in priority order
    pools: Vec<Pool>,

    /// Iterations between event checks
    event_freq: u32,

    /// Idle sleep on a native stack
    sleep: Duration,

    /// Freed by the runtime together with its owner
    automatic: bool,

    /// Pending stop requests (`REQ_*`)
    requests: AtomicU32,

    state: AtomicU8,

    usage: Mutex<Usage>,

    /// Units dispatched so far
    dispatched: AtomicU64,

    freed: AtomicBool,
}

impl Sched {
    /// Create a scheduler from a user policy
    ///
    /// Recognized `config` keys: [`SchedConfig::EVENT_FREQ`],
    /// [`SchedConfig::SLEEP_NSEC`], [`SchedConfig::AUTOMATIC`].
    pub fn new(policy: impl Policy, pools: &[Pool], config: &SchedConfig) -> Result<Sched> {
        let defaults = runtime_config();
        Self::build(Box::new(policy), None, pools.to_vec(), config, &defaults, false)
    }

    /// Create a predefined scheduler
    ///
    /// With no pools, one pool suited to `kind` is created and freed together
    /// with the scheduler.
    pub fn basic(kind: SchedKind, pools: &[Pool], config: &SchedConfig) -> Result<Sched> {
        Self::build_predefined(kind, pools, config, &runtime_config(), false)
    }

    pub(crate) fn build_predefined(
        kind: SchedKind,
        pools: &[Pool],
        config: &SchedConfig,
        defaults: &Config,
        automatic: bool,
    ) -> Result<Sched> {
        let pools = if pools.is_empty() {
            let (pool_kind, access) = kind.default_pool();
            vec![Pool::automatic(pool_kind, access)?]
        } else {
            pools.to_vec()
        };
        let policy: Box<dyn Policy> = match kind {
            SchedKind::Basic => Box::new(Basic),
            SchedKind::Prio => Box::new(Prio),
            SchedKind::BasicWait => Box::new(BasicWait),
            SchedKind::RandWs => Box::new(RandWs),
        };
        Self::build(policy, Some(kind), pools, config, defaults, automatic)
    }

    fn build(
        policy: Box<dyn Policy>,
        kind: Option<SchedKind>,
        pools: Vec<Pool>,
        config: &SchedConfig,
        defaults: &Config,
        automatic: bool,
    ) -> Result<Sched> {
        if pools.is_empty() {
            return Err(Error::InvalidArg("a scheduler needs at least one pool"));
        }
        let event_freq = config.event_freq(defaults.sched_event_freq)?;
        let sleep = config.sleep(defaults.sched_sleep)?;
        let automatic = config.automatic(automatic)?;

        for (i, pool) in pools.iter().enumerate() {
            if let Err(e) = pool.attach_sched() {
                pools[..i].iter().for_each(Pool::detach_sched);
                return Err(e);
            }
        }
        if let Err(e) = policy.init(&pools, config) {
            pools.iter().for_each(Pool::detach_sched);
            return Err(e);
        }

        let sched = Sched {
            inner: Arc::new(SchedInner {
                id: SchedId::new(),
                kind,
                policy,
                pools,
                event_freq,
                sleep,
                automatic,
                requests: AtomicU32::new(0),
                state: AtomicU8::new(SchedState::Ready as u8),
                usage: Mutex::new(Usage::Unused),
                dispatched: AtomicU64::new(0),
                freed: AtomicBool::new(false),
            }),
        };
        debug!(sched = sched.id().as_u64(), ?kind, event_freq, "scheduler created");
        Ok(sched)
    }

    fn check(&self) -> Result<&SchedInner> {
        if self.inner.freed.load(Ordering::Acquire) {
            return Err(Error::InvalidSched);
        }
        Ok(&self.inner)
    }

    /// Get the scheduler ID
    pub fn id(&self) -> SchedId {
        self.inner.id
    }

    /// Predefined kind, `None` for user policies
    pub fn kind(&self) -> Option<SchedKind> {
        self.inner.kind
    }

    /// Lifecycle state
    pub fn state(&self) -> SchedState {
        SchedState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Whether the scheduler is freed with the stream or pool that runs it
    pub fn is_automatic(&self) -> bool {
        self.inner.automatic
    }

    /// Number of pools
    pub fn num_pools(&self) -> Result<usize> {
        Ok(self.check()?.pools.len())
    }

    /// Pools in priority order
    pub fn pools(&self) -> Result<Vec<Pool>> {
        Ok(self.check()?.pools.clone())
    }

    /// Units waiting in all pools
    pub fn size(&self) -> Result<usize> {
        self.check()?
            .pools
            .iter()
            .try_fold(0, |n, p| Ok(n + p.size()?))
    }

    /// Units waiting in or blocked on behalf of all pools
    pub fn total_size(&self) -> Result<usize> {
        self.check()?
            .pools
            .iter()
            .try_fold(0, |n, p| Ok(n + p.total_size()?))
    }

    /// Request a stop once every pool is empty and no unit is blocked
    pub fn finish(&self) -> Result<()> {
        self.check()?.requests.fetch_or(REQ_FINISH, Ordering::AcqRel);
        debug!(sched = self.id().as_u64(), "finish requested");
        Ok(())
    }

    /// Request a stop at the next event check, regardless of pending units
    pub fn exit(&self) -> Result<()> {
        self.check()?.requests.fetch_or(REQ_EXIT, Ordering::AcqRel);
        debug!(sched = self.id().as_u64(), "exit requested");
        Ok(())
    }

    pub(crate) fn request_replace(&self) {
        self.inner.requests.fetch_or(REQ_REPLACE, Ordering::AcqRel);
    }

    fn finishing(&self) -> bool {
        self.inner.requests.load(Ordering::Acquire) & (REQ_FINISH | REQ_EXIT) != 0
    }

    /// Whether the scheduling loop must return now
    pub fn has_to_stop(&self) -> bool {
        let requests = self.inner.requests.load(Ordering::Acquire);
        if requests & (REQ_EXIT | REQ_REPLACE) != 0 {
            return true;
        }
        let drained = || self.total_size().map_or(true, |n| n == 0);
        if requests & REQ_FINISH != 0 && drained() {
            return true;
        }
        match local::parent_sched(self) {
            Some(parent) => parent.finishing() && drained(),
            None => false,
        }
    }

    /// Pool that receives units migrated to this scheduler
    pub fn migration_pool(&self) -> Result<Pool> {
        let inner = self.check()?;
        inner
            .policy
            .migration_pool(&inner.pools)
            .or_else(|| inner.pools.first().cloned())
            .ok_or(Error::MigrationTarget)
    }

    /// Free the scheduler
    ///
    /// Fails while it is the main scheduler of a stream or sits in a pool.
    /// Automatic pools it created are freed too.
    pub fn free(self) -> Result<()> {
        self.check()?;
        if *self.inner.usage.lock() != Usage::Unused {
            return Err(Error::Sched("scheduler is in use"));
        }
        self.release();
        Ok(())
    }

    fn release(&self) {
        if self.inner.freed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.policy.free();
        for pool in &self.inner.pools {
            pool.detach_sched();
            pool.release_automatic();
        }
        debug!(sched = self.id().as_u64(), "scheduler freed");
    }

    pub(crate) fn dispatched(&self) -> u64 {
        self.inner.dispatched.load(Ordering::Acquire)
    }

    /// Mark the scheduler as the main scheduler of stream `rank`
    pub(crate) fn claim_for_main(&self, rank: usize) -> Result<()> {
        self.claim(Usage::Main(rank))
    }

    pub(crate) fn claim_for_pool(&self) -> Result<()> {
        self.claim(Usage::InPool)
    }

    fn claim(&self, usage: Usage) -> Result<()> {
        self.check()?;
        let mut current = self.inner.usage.lock();
        if *current != Usage::Unused {
            return Err(Error::Sched("scheduler is already in use"));
        }
        *current = usage;
        Ok(())
    }

    /// Undo a claim
    pub(crate) fn release_use(&self) {
        *self.inner.usage.lock() = Usage::Unused;
        self.inner.requests.store(0, Ordering::Release);
    }

    /// Give up the scheduler once it stopped as a stream's main scheduler;
    /// automatic schedulers are freed
    pub(crate) fn retire_main(&self) {
        self.release_use();
        if self.inner.automatic {
            self.release();
        }
    }

    /// Its unit terminated; leave the pool it was in
    pub(crate) fn release_pool_use(&self) {
        let mut usage = self.inner.usage.lock();
        if *usage != Usage::InPool {
            return;
        }
        *usage = Usage::Unused;
        drop(usage);
        self.inner.requests.store(0, Ordering::Release);
        if self.inner.automatic {
            self.release();
        }
    }

    /// Clear requests left over from a previous run
    pub(crate) fn rearm(&self) {
        self.inner.requests.store(0, Ordering::Release);
        self.inner.state.store(SchedState::Ready as u8, Ordering::Release);
    }

    /// Loop of a scheduler hosted by a stackful unit
    pub(crate) fn run_stacked(&self) {
        self.run_loop(true);
    }

    /// Loop of a scheduler on a stream's native stack
    pub(crate) fn run_top(&self) {
        for pool in &self.inner.pools {
            pool.rebind_consumer();
        }
        self.run_loop(false);
    }

    fn run_loop(&self, stacked: bool) {
        self.inner.state.store(SchedState::Running as u8, Ordering::Release);
        debug!(sched = self.id().as_u64(), stacked, "scheduler started");

        let ctx = SchedContext { sched: self, stacked };
        self.inner.policy.run(&ctx);

        self.inner.requests.fetch_and(!(REQ_FINISH | REQ_EXIT), Ordering::AcqRel);
        self.inner.state.store(SchedState::Stopped as u8, Ordering::Release);
        debug!(
            sched = self.id().as_u64(),
            dispatched = self.dispatched(),
            "scheduler stopped"
        );
    }

    /// Stop request that ended the loop was a replacement
    pub(crate) fn take_replace(&self) -> bool {
        self.inner.requests.fetch_and(!REQ_REPLACE, Ordering::AcqRel) & REQ_REPLACE != 0
    }
}

fn runtime_config() -> Config {
    runtime::try_get().map_or_else(Config::default, |rt| rt.config().clone())
}

impl PartialEq for Sched {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Sched {}

impl fmt::Debug for Sched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sched")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

/// View of a scheduler handed to [`Policy::run`]
pub struct SchedContext<'a> {
    sched: &'a Sched,
    stacked: bool,
}

impl<'a> SchedContext<'a> {
    /// The running scheduler
    pub fn sched(&self) -> &Sched {
        self.sched
    }

    /// Pools in priority order
    pub fn pools(&self) -> &[Pool] {
        &self.sched.inner.pools
    }

    /// Iterations allowed between two event checks
    pub fn event_freq(&self) -> u32 {
        self.sched.inner.event_freq
    }

    /// Idle sleep configured for the scheduler
    pub fn sleep(&self) -> Duration {
        self.sched.inner.sleep
    }

    /// Whether the scheduler runs inside a unit
    pub fn is_stacked(&self) -> bool {
        self.stacked
    }

    /// Run a unit popped from one of the pools
    pub fn run_unit(&self, unit: Unit) {
        self.sched.inner.dispatched.fetch_add(1, Ordering::AcqRel);
        dispatch::run(unit);
    }

    /// Whether the loop must return now
    pub fn has_to_stop(&self) -> bool {
        self.sched.has_to_stop()
    }

    /// Let pending runtime events take effect
    ///
    /// A stacked scheduler yields to the scheduler or thread that resumed it.
    pub fn check_events(&self) {
        dispatch::check_events(self.sched);
    }

    /// Nothing was found to run
    ///
    /// On a native stack this sleeps for [`SchedContext::sleep`]; a stacked
    /// scheduler has already yielded in `check_events`.
    pub fn idle(&self) {
        if !self.stacked {
            std::thread::sleep(self.sched.inner.sleep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle;

    impl Policy for Idle {
        fn run(&self, ctx: &SchedContext<'_>) {
            while !ctx.has_to_stop() {
                ctx.idle();
            }
        }
    }

    #[test]
    fn test_sched_requires_a_pool() {
        assert!(matches!(
            Sched::new(Idle, &[], &SchedConfig::new()),
            Err(Error::InvalidArg(_))
        ));
    }

    #[test]
    fn test_sched_config_is_read() {
        let pool = Pool::new(PoolKind::Fifo, Access::Mpmc).unwrap();
        let config = SchedConfig::new()
            .with(SchedConfig::EVENT_FREQ, crate::ConfigValue::Int(7))
            .with(SchedConfig::AUTOMATIC, crate::ConfigValue::Int(1));
        let sched = Sched::new(Idle, &[pool.clone()], &config).unwrap();
        assert!(sched.is_automatic());
        assert_eq!(sched.inner.event_freq, 7);
        assert_eq!(sched.state(), SchedState::Ready);
        assert_eq!(sched.num_pools().unwrap(), 1);

        let bad = SchedConfig::new().with(SchedConfig::EVENT_FREQ, crate::ConfigValue::Double(1.0));
        assert!(matches!(
            Sched::new(Idle, &[pool], &bad),
            Err(Error::InvalidSchedConfig(_))
        ));
    }

    #[test]
    fn test_single_consumer_pool_in_two_scheds() {
        let pool = Pool::new(PoolKind::Fifo, Access::Mpsc).unwrap();
        let first = Sched::new(Idle, &[pool.clone()], &SchedConfig::new()).unwrap();
        assert!(matches!(
            Sched::new(Idle, &[pool.clone()], &SchedConfig::new()),
            Err(Error::InvalidPoolAccess(_))
        ));
        first.free().unwrap();
        let second = Sched::new(Idle, &[pool.clone()], &SchedConfig::new()).unwrap();
        second.free().unwrap();
        pool.free().unwrap();
    }

    #[test]
    fn test_stop_requests() {
        let sched = Sched::basic(SchedKind::Basic, &[], &SchedConfig::new()).unwrap();
        let pool = sched.pools().unwrap().remove(0);
        assert!(pool.is_automatic());
        assert!(!sched.has_to_stop());
        sched.finish().unwrap();
        assert!(sched.has_to_stop());
        sched.rearm();
        assert!(!sched.has_to_stop());
        sched.exit().unwrap();
        assert!(sched.has_to_stop());

        assert_eq!(sched.migration_pool().unwrap(), pool);
        sched.clone().free().unwrap();
        assert!(matches!(sched.pools(), Err(Error::InvalidSched)));
        assert!(matches!(pool.size(), Err(Error::InvalidPool)));
    }

    #[test]
    fn test_sched_used_in_one_place() {
        let sched = Sched::basic(SchedKind::Prio, &[], &SchedConfig::new()).unwrap();
        sched.claim_for_pool().unwrap();
        assert!(matches!(sched.claim_for_main(1), Err(Error::Sched(_))));
        assert!(matches!(sched.clone().free(), Err(Error::Sched(_))));
        sched.release_use();
        sched.free().unwrap();
    }
}
