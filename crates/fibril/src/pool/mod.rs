//! Pools of ready work units
//!
//! A pool is a concurrent container of READY units. Its storage is pluggable
//! through [`PoolOps`]; the predefined kinds cover FIFO, wait-capable FIFO,
//! priority and lock-free stealing queues.
//!
//! Every pool declares an [`Access`] discipline. The runtime relies on it when
//! associating pools with schedulers, and debug builds additionally check at
//! run time that single-producer and single-consumer pools are only used from
//! one execution stream (or one external thread) on that side.

mod fifo;
mod fifo_wait;
mod priority;
mod steal;

pub use fifo::FifoPool;
pub use fifo_wait::FifoWaitPool;
pub use priority::PriorityPool;
pub use steal::StealPool;

use crate::error::{Error, Result};
use crate::sched::Sched;
use crate::unit::{Unit, UnitState};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Unique identifier for a Pool
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(u64);

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

impl PoolId {
    /// Generate a new unique PoolId
    pub fn new() -> Self {
        PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for PoolId {
    fn default() -> Self {
        Self::new()
    }
}

/// Predefined pool implementations
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PoolKind {
    /// FIFO queue
    Fifo,
    /// FIFO queue whose consumers can sleep until a unit arrives
    FifoWait,
    /// Highest unit priority first, FIFO among equals
    Priority,
    /// Lock-free MPMC queue without `remove`
    Steal,
}

/// Producer/consumer access discipline of a pool
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    /// One execution stream both pushes and pops
    Private,
    /// Single producer, single consumer
    Spsc,
    /// Multiple producers, single consumer
    Mpsc,
    /// Single producer, multiple consumers
    Spmc,
    /// Multiple producers, multiple consumers
    Mpmc,
}

impl Access {
    /// Whether only one producer may push
    pub fn single_producer(self) -> bool {
        matches!(self, Access::Private | Access::Spsc | Access::Spmc)
    }

    /// Whether only one consumer may pop
    pub fn single_consumer(self) -> bool {
        matches!(self, Access::Private | Access::Spsc | Access::Mpsc)
    }
}

/// Storage operations of a pool
///
/// Implementations only need to be a correct concurrent container for the
/// access discipline they are used with; bookkeeping of blocked units, access
/// checks and migration atomicity are handled by [`Pool`].
pub trait PoolOps: Send + Sync + 'static {
    /// Called once when the pool is created
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Append a ready unit
    fn push(&self, unit: Unit);

    /// Take the next unit to run, if any
    fn pop(&self) -> Option<Unit>;

    /// Like `pop`, but wait up to `timeout` for a unit to arrive
    fn pop_wait(&self, timeout: Duration) -> Option<Unit> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(unit) = self.pop() {
                return Some(unit);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            std::thread::sleep((deadline - now).min(Duration::from_micros(50)));
        }
    }

    /// Remove `unit` from the pool
    fn remove(&self, unit: &Unit) -> Result<()>;

    /// Number of units in the pool
    fn size(&self) -> usize;

    /// Visit every unit without changing the pool
    fn for_each(&self, f: &mut dyn FnMut(&Unit)) -> Result<()>;

    /// Called once when the pool is freed
    fn free(&self) {}
}

/// Handle to a pool
///
/// Cloning the handle shares the pool. After [`Pool::free`] every clone
/// reports `Error::InvalidPool`.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    id: PoolId,
    access: Access,
    kind: Option<PoolKind>,
    ops: Box<dyn PoolOps>,

    /// Units whose home is this pool and that are currently blocked
    blocked: AtomicUsize,

    /// Shared by ordinary operations, exclusive while a unit migrates
    gate: RwLock<()>,

    /// Number of schedulers using this pool
    scheds: AtomicUsize,

    /// Freed together with the scheduler that created it
    automatic: AtomicBool,

    freed: AtomicBool,

    #[cfg(debug_assertions)]
    roles: roles::Roles,
}

impl Pool {
    /// Create a pool of a predefined kind
    pub fn new(kind: PoolKind, access: Access) -> Result<Pool> {
        let ops: Box<dyn PoolOps> = match kind {
            PoolKind::Fifo => Box::new(FifoPool::new()),
            PoolKind::FifoWait => Box::new(FifoWaitPool::new()),
            PoolKind::Priority => Box::new(PriorityPool::new()),
            PoolKind::Steal => Box::new(StealPool::new()),
        };
        Self::build(ops, Some(kind), access)
    }

    /// Create a pool backed by user-provided storage
    pub fn with_ops(ops: impl PoolOps, access: Access) -> Result<Pool> {
        Self::build(Box::new(ops), None, access)
    }

    /// Pool created implicitly for a predefined scheduler
    pub(crate) fn automatic(kind: PoolKind, access: Access) -> Result<Pool> {
        let pool = Self::new(kind, access)?;
        pool.inner.automatic.store(true, Ordering::Relaxed);
        Ok(pool)
    }

    fn build(ops: Box<dyn PoolOps>, kind: Option<PoolKind>, access: Access) -> Result<Pool> {
        ops.init()?;
        Ok(Pool {
            inner: Arc::new(PoolInner {
                id: PoolId::new(),
                access,
                kind,
                ops,
                blocked: AtomicUsize::new(0),
                gate: RwLock::new(()),
                scheds: AtomicUsize::new(0),
                automatic: AtomicBool::new(false),
                freed: AtomicBool::new(false),
                #[cfg(debug_assertions)]
                roles: roles::Roles::default(),
            }),
        })
    }

    fn check(&self) -> Result<&PoolInner> {
        if self.inner.freed.load(Ordering::Acquire) {
            return Err(Error::InvalidPool);
        }
        Ok(&self.inner)
    }

    /// `Error::InvalidPool` once the pool has been freed
    pub(crate) fn validate(&self) -> Result<()> {
        self.check().map(|_| ())
    }

    /// Get the pool ID
    pub fn id(&self) -> PoolId {
        self.inner.id
    }

    /// Declared access discipline
    pub fn access(&self) -> Access {
        self.inner.access
    }

    /// Predefined kind, `None` for user storage
    pub fn kind(&self) -> Option<PoolKind> {
        self.inner.kind
    }

    /// Whether the pool is freed with the scheduler that created it
    pub fn is_automatic(&self) -> bool {
        self.inner.automatic.load(Ordering::Relaxed)
    }

    /// Push a READY unit and make this pool its home
    pub fn push(&self, unit: &Unit) -> Result<()> {
        self.check()?;
        if unit.state() != UnitState::Ready {
            return Err(Error::UnitState("only READY units can be pushed"));
        }
        unit.set_home(Some(self.clone()));
        self.push_unit(unit.clone());
        Ok(())
    }

    /// Pop the next unit; the caller must run it or push it back
    pub fn pop(&self) -> Result<Option<Unit>> {
        self.check()?;
        Ok(self.pop_unit())
    }

    /// Pop, waiting up to `timeout` for a unit if the pool is empty
    pub fn pop_wait(&self, timeout: Duration) -> Result<Option<Unit>> {
        self.check()?;
        #[cfg(debug_assertions)]
        self.inner.roles.consumer(self.inner.access);
        Ok(self.inner.ops.pop_wait(timeout))
    }

    /// Remove a unit that is waiting in this pool
    pub fn remove(&self, unit: &Unit) -> Result<()> {
        self.check()?;
        let _gate = self.inner.gate.read();
        self.inner.ops.remove(unit)
    }

    /// Number of units waiting in the pool
    pub fn size(&self) -> Result<usize> {
        self.check()?;
        let _gate = self.inner.gate.read();
        Ok(self.inner.ops.size())
    }

    /// Size plus the blocked units whose home is this pool
    pub fn total_size(&self) -> Result<usize> {
        self.check()?;
        let _gate = self.inner.gate.read();
        Ok(self.inner.ops.size() + self.inner.blocked.load(Ordering::Acquire))
    }

    /// Visit every unit in the pool
    pub fn for_each(&self, mut f: impl FnMut(&Unit)) -> Result<()> {
        self.check()?;
        let _gate = self.inner.gate.read();
        self.inner.ops.for_each(&mut f)
    }

    /// Push a scheduler into the pool as a stackful unit
    ///
    /// The scheduler then runs nested inside whichever scheduler pops it.
    pub fn add_sched(&self, sched: &Sched) -> Result<()> {
        self.check()?;
        let rt = crate::runtime::get()?;
        sched.claim_for_pool()?;
        match Unit::for_sched(sched, &rt) {
            Ok(unit) => {
                unit.set_home(Some(self.clone()));
                self.push_unit(unit);
                Ok(())
            }
            Err(e) => {
                sched.release_use();
                Err(e)
            }
        }
    }

    /// Free the pool
    ///
    /// Fails while a scheduler still uses it.
    pub fn free(self) -> Result<()> {
        self.check()?;
        if self.inner.scheds.load(Ordering::Acquire) > 0 {
            return Err(Error::Pool("pool is used by a scheduler"));
        }
        if self.inner.freed.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidPool);
        }
        self.inner.ops.free();
        Ok(())
    }

    /// Push without state checks; used by the dispatcher and by wakers
    pub(crate) fn push_unit(&self, unit: Unit) {
        #[cfg(debug_assertions)]
        self.inner.roles.producer(self.inner.access);
        self.requeue(unit);
    }

    /// Push back a unit this pool's consumer just ran
    pub(crate) fn requeue(&self, unit: Unit) {
        let _gate = self.inner.gate.read();
        self.inner.ops.push(unit);
    }

    pub(crate) fn pop_unit(&self) -> Option<Unit> {
        #[cfg(debug_assertions)]
        self.inner.roles.consumer(self.inner.access);
        let _gate = self.inner.gate.read();
        self.inner.ops.pop()
    }

    /// Remove without taking the gate; the caller holds it exclusively
    pub(crate) fn remove_locked(&self, unit: &Unit) -> Result<()> {
        self.inner.ops.remove(unit)
    }

    /// Push without taking the gate; the caller holds it exclusively
    pub(crate) fn push_locked(&self, unit: Unit) {
        #[cfg(debug_assertions)]
        self.inner.roles.producer(self.inner.access);
        self.inner.ops.push(unit);
    }

    pub(crate) fn gate_write(&self) -> RwLockWriteGuard<'_, ()> {
        self.inner.gate.write()
    }

    fn gate_read(&self) -> RwLockReadGuard<'_, ()> {
        self.inner.gate.read()
    }

    pub(crate) fn block_one(&self) {
        self.inner.blocked.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unblock_one(&self) {
        self.inner.blocked.fetch_sub(1, Ordering::AcqRel);
    }

    /// Register a scheduler as a user of this pool
    pub(crate) fn attach_sched(&self) -> Result<()> {
        self.check()?;
        let prev = self.inner.scheds.fetch_add(1, Ordering::AcqRel);
        if prev > 0 && self.inner.access.single_consumer() {
            self.inner.scheds.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::InvalidPoolAccess(
                "single-consumer pool is already used by a scheduler",
            ));
        }
        Ok(())
    }

    pub(crate) fn detach_sched(&self) {
        self.inner.scheds.fetch_sub(1, Ordering::AcqRel);
    }

    /// Forget the recorded consumer, e.g. when its scheduler moves to
    /// another execution stream
    pub(crate) fn rebind_consumer(&self) {
        #[cfg(debug_assertions)]
        self.inner.roles.reset_consumer();
    }

    /// Free an automatic pool once its scheduler is gone
    pub(crate) fn release_automatic(&self) {
        if self.is_automatic() && self.inner.scheds.load(Ordering::Acquire) == 0 {
            let _ = self.clone().free();
        }
    }
}

/// Sizes of several pools read in one consistent snapshot
///
/// No unit migration between the given pools can be observed half-done.
pub fn snapshot_sizes(pools: &[&Pool]) -> Result<Vec<usize>> {
    let mut order: Vec<usize> = (0..pools.len()).collect();
    order.sort_by_key(|&i| pools[i].id());
    order.dedup_by_key(|i| pools[*i].id());

    let mut gates = Vec::with_capacity(order.len());
    for &i in &order {
        pools[i].check()?;
        gates.push(pools[i].gate_read());
    }
    let sizes = pools.iter().map(|p| p.inner.ops.size()).collect();
    drop(gates);
    Ok(sizes)
}

impl PartialEq for Pool {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Pool {}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("access", &self.inner.access)
            .finish()
    }
}

#[cfg(debug_assertions)]
mod roles {
    //! Run-time check of the declared access discipline

    use super::Access;
    use crate::local;
    use parking_lot::Mutex;

    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    enum Role {
        Xstream(usize),
        Thread(u64),
    }

    impl Role {
        fn current() -> Role {
            match local::current_xstream() {
                Some(xstream) => Role::Xstream(xstream.rank()),
                None => Role::Thread(local::thread_tag()),
            }
        }
    }

    #[derive(Default)]
    pub(super) struct Roles {
        producer: Mutex<Option<Role>>,
        consumer: Mutex<Option<Role>>,
    }

    impl Roles {
        pub(super) fn producer(&self, access: Access) {
            if access == Access::Private {
                return self.claim(&self.consumer, "private", "access");
            }
            if access.single_producer() {
                self.claim(&self.producer, "single-producer", "push");
            }
        }

        pub(super) fn consumer(&self, access: Access) {
            if access.single_consumer() {
                let what = if access == Access::Private { "private" } else { "single-consumer" };
                self.claim(&self.consumer, what, "pop");
            }
        }

        pub(super) fn reset_consumer(&self) {
            *self.consumer.lock() = None;
        }

        fn claim(&self, slot: &Mutex<Option<Role>>, what: &str, op: &str) {
            let me = Role::current();
            let mut slot = slot.lock();
            match *slot {
                None => *slot = Some(me),
                Some(owner) if owner == me => {}
                Some(owner) => panic!(
                    "{} pool: {} from {:?} but the pool belongs to {:?}",
                    what, op, me, owner
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::Builder;

    fn with_runtime(f: impl FnOnce()) {
        crate::init().unwrap();
        f();
        crate::finalize().unwrap();
    }

    #[test]
    fn test_pool_access_roles() {
        assert!(Access::Private.single_producer() && Access::Private.single_consumer());
        assert!(!Access::Mpsc.single_producer() && Access::Mpsc.single_consumer());
        assert!(Access::Spmc.single_producer() && !Access::Spmc.single_consumer());
        assert!(!Access::Mpmc.single_producer() && !Access::Mpmc.single_consumer());
    }

    #[test]
    fn test_pool_size_tracks_push_pop_remove() {
        with_runtime(|| {
            for kind in [PoolKind::Fifo, PoolKind::FifoWait, PoolKind::Priority] {
                let pool = Pool::new(kind, Access::Mpmc).unwrap();
                let park = Pool::new(PoolKind::Fifo, Access::Mpmc).unwrap();
                let units: Vec<Unit> = (0..5)
                    .map(|_| Builder::new().spawn(&park, || {}).unwrap())
                    .collect();
                for unit in &units {
                    park.remove(unit).unwrap();
                }

                for (i, unit) in units.iter().enumerate() {
                    pool.push(unit).unwrap();
                    assert_eq!(pool.size().unwrap(), i + 1);
                }
                pool.remove(&units[2]).unwrap();
                assert_eq!(pool.size().unwrap(), 4);
                assert!(pool.remove(&units[2]).is_err());

                let mut popped = 0;
                while pool.pop().unwrap().is_some() {
                    popped += 1;
                }
                assert_eq!(popped, 4);
                assert_eq!(pool.size().unwrap(), 0);
                assert_eq!(pool.total_size().unwrap(), 0);
            }
        });
    }

    #[test]
    fn test_pool_for_each_visits_units() {
        with_runtime(|| {
            let pool = Pool::new(PoolKind::Fifo, Access::Mpmc).unwrap();
            let a = Builder::new().spawn(&pool, || {}).unwrap();
            let b = Builder::new().spawn(&pool, || {}).unwrap();

            let mut seen = Vec::new();
            pool.for_each(|u| seen.push(u.id())).unwrap();
            assert_eq!(seen, vec![a.id(), b.id()]);
            while pool.pop().unwrap().is_some() {}
        });
    }

    #[test]
    fn test_pool_free_invalidates_handles() {
        let pool = Pool::new(PoolKind::Fifo, Access::Mpsc).unwrap();
        let clone = pool.clone();
        pool.free().unwrap();
        assert!(matches!(clone.size(), Err(Error::InvalidPool)));
        assert!(matches!(clone.pop(), Err(Error::InvalidPool)));
        assert!(matches!(clone.free(), Err(Error::InvalidPool)));
    }

    #[test]
    fn test_single_consumer_pool_has_one_scheduler() {
        let pool = Pool::new(PoolKind::Fifo, Access::Mpsc).unwrap();
        pool.attach_sched().unwrap();
        assert!(matches!(pool.attach_sched(), Err(Error::InvalidPoolAccess(_))));
        pool.detach_sched();

        let shared = Pool::new(PoolKind::Fifo, Access::Mpmc).unwrap();
        shared.attach_sched().unwrap();
        shared.attach_sched().unwrap();
        assert!(matches!(shared.free(), Err(Error::Pool(_))));
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_debug_build_rejects_second_producer() {
        with_runtime(|| {
            let pool = Pool::new(PoolKind::Fifo, Access::Spsc).unwrap();
            let unit = Builder::new().spawn(&pool, || {}).unwrap();
            let popped = pool.pop().unwrap().unwrap();
            assert_eq!(popped, unit);

            let other = pool.clone();
            let result = std::thread::spawn(move || {
                let _ = other.push(&popped);
            })
            .join();
            assert!(result.is_err());
        });
    }

    #[test]
    fn test_snapshot_sizes() {
        with_runtime(|| {
            let a = Pool::new(PoolKind::Fifo, Access::Mpmc).unwrap();
            let b = Pool::new(PoolKind::Priority, Access::Mpmc).unwrap();
            Builder::new().spawn(&a, || {}).unwrap();
            Builder::new().spawn(&b, || {}).unwrap();
            Builder::new().spawn(&b, || {}).unwrap();
            assert_eq!(snapshot_sizes(&[&a, &b, &a]).unwrap(), vec![1, 2, 1]);
            while a.pop().unwrap().is_some() {}
            while b.pop().unwrap().is_some() {}
        });
    }
}
