//! Process-wide runtime state and lifecycle
//!
//! Initialization is reference counted. The first `init` binds the calling OS
//! thread as the primary execution stream (rank 0) and gives it a basic
//! scheduler over one pool. The primary scheduler runs inside a stackful unit
//! that the primary thread resumes whenever it blocks on the runtime, so units
//! pushed to primary pools make progress while the primary thread waits.

use crate::config::{Config, SchedConfig};
use crate::error::{Error, Result};
use crate::local;
use crate::sched::{dispatch, Sched, SchedKind};
use crate::unit::{StackPool, Unit, UnitState};
use crate::xstream::Xstream;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, info, warn};

static RUNTIME: Lazy<RwLock<Option<Arc<Runtime>>>> = Lazy::new(|| RwLock::new(None));

/// Init reference count; also serializes init and finalize
static REFS: Mutex<usize> = Mutex::new(0);

static GENERATION: AtomicU64 = AtomicU64::new(0);

/// Global runtime state
pub(crate) struct Runtime {
    /// Distinguishes successive init/finalize cycles
    generation: u64,

    /// Active configuration
    config: Config,

    /// OS thread bound as the primary execution stream
    primary_thread: ThreadId,

    /// Primary execution stream (rank 0)
    primary: Xstream,

    /// Live execution streams indexed by rank
    xstreams: Mutex<Vec<Option<Xstream>>>,

    /// Recycled unit stacks of the default size
    stacks: StackPool,

    /// Unit hosting the primary scheduler
    driver: Mutex<Option<Unit>>,
}

impl Runtime {
    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn primary(&self) -> &Xstream {
        &self.primary
    }

    pub(crate) fn stacks(&self) -> &StackPool {
        &self.stacks
    }

    /// Register a new execution stream built by `build` for the chosen rank
    ///
    /// With `requested` set, that exact rank is used; otherwise the smallest
    /// free one.
    pub(crate) fn register_xstream(
        &self,
        requested: Option<usize>,
        build: impl FnOnce(usize) -> Xstream,
    ) -> Result<Xstream> {
        let mut xstreams = self.xstreams.lock();
        let live = xstreams.iter().filter(|x| x.is_some()).count();
        if live >= self.config.max_xstreams {
            return Err(Error::XstreamState("maximum number of execution streams reached"));
        }

        let rank = match requested {
            Some(rank) => {
                if rank >= self.config.max_xstreams
                    || xstreams.get(rank).map_or(false, |x| x.is_some())
                {
                    return Err(Error::InvalidXstreamRank(rank));
                }
                rank
            }
            None => xstreams
                .iter()
                .position(|x| x.is_none())
                .unwrap_or(xstreams.len()),
        };

        if rank >= xstreams.len() {
            xstreams.resize(rank + 1, None);
        }
        let xstream = build(rank);
        xstreams[rank] = Some(xstream.clone());
        Ok(xstream)
    }

    /// Release `rank` after its stream was freed
    pub(crate) fn unregister_xstream(&self, rank: usize) {
        if let Some(slot) = self.xstreams.lock().get_mut(rank) {
            *slot = None;
        }
    }

    /// Number of live execution streams, primary included
    pub(crate) fn num_xstreams(&self) -> usize {
        self.xstreams.lock().iter().filter(|x| x.is_some()).count()
    }

    /// Resume the primary scheduler for one slice
    ///
    /// Returns whether any unit was dispatched during the slice. Returns
    /// `false` without doing anything if another thread is driving.
    pub(crate) fn drive_primary(&self) -> bool {
        let Some(mut driver) = self.driver.try_lock() else {
            return false;
        };

        let unit = match driver.as_ref() {
            Some(unit) if unit.state() != UnitState::Terminated => unit.clone(),
            _ => {
                // The previous primary scheduler stopped; pick up a replacement
                let Some(sched) = self.primary.take_pending_sched() else {
                    return false;
                };
                match Unit::for_sched(&sched, self) {
                    Ok(unit) => {
                        *driver = Some(unit.clone());
                        unit
                    }
                    Err(e) => {
                        warn!(error = %e, "cannot start replacement primary scheduler");
                        return false;
                    }
                }
            }
        };

        if unit.state() != UnitState::Ready {
            return false;
        }

        let Some(sched) = unit.sched() else {
            return false;
        };
        let before = sched.dispatched();
        let previous = local::set_xstream(Some(self.primary.clone()));
        dispatch::run(unit);
        local::set_xstream(previous);
        sched.dispatched() != before
    }

    /// Whether the primary scheduler has stopped and has no replacement
    fn primary_stopped(&self) -> bool {
        let driver = self.driver.lock();
        driver.as_ref().map_or(true, |u| u.state() == UnitState::Terminated)
            && !self.primary.has_pending_sched()
    }
}

/// Runtime handle, or `Error::Uninitialized`
pub(crate) fn get() -> Result<Arc<Runtime>> {
    try_get().ok_or(Error::Uninitialized)
}

pub(crate) fn try_get() -> Option<Arc<Runtime>> {
    RUNTIME.read().clone()
}

/// Whether the calling OS thread is bound as the primary execution stream
pub(crate) fn is_primary_thread() -> bool {
    try_get().map_or(false, |rt| rt.primary_thread == thread::current().id())
}

/// The primary stream, if the calling OS thread is the primary thread
pub(crate) fn primary_of_current_thread() -> Option<Xstream> {
    let rt = try_get()?;
    (rt.primary_thread == thread::current().id()).then(|| rt.primary.clone())
}

/// Initialize the runtime with `Config::from_env()`
///
/// Nested calls only increment the reference count.
pub fn init() -> Result<()> {
    if bump_refs() {
        return Ok(());
    }
    init_with(Config::from_env()?)
}

/// Initialize the runtime with an explicit configuration
///
/// The configuration is ignored if the runtime is already initialized.
pub fn init_with(config: Config) -> Result<()> {
    let mut refs = REFS.lock();
    if *refs > 0 {
        *refs += 1;
        return Ok(());
    }
    config.validate()?;

    let generation = GENERATION.fetch_add(1, Ordering::Relaxed) + 1;
    let sched = Sched::build_predefined(SchedKind::Basic, &[], &SchedConfig::new(), &config, true)?;
    let primary = Xstream::new_primary(sched.clone())?;

    let rt = Arc::new(Runtime {
        generation,
        stacks: StackPool::new(config.stack_cache, config.thread_stacksize),
        config,
        primary_thread: thread::current().id(),
        primary: primary.clone(),
        xstreams: Mutex::new(vec![Some(primary)]),
        driver: Mutex::new(None),
    });

    let unit = Unit::for_sched(&sched, &rt)?;
    *rt.driver.lock() = Some(unit);
    *RUNTIME.write() = Some(rt.clone());
    *refs = 1;

    info!(
        generation,
        thread_stacksize = rt.config.thread_stacksize,
        event_freq = rt.config.sched_event_freq,
        "runtime initialized"
    );
    Ok(())
}

fn bump_refs() -> bool {
    let mut refs = REFS.lock();
    if *refs > 0 {
        *refs += 1;
        true
    } else {
        false
    }
}

/// Release one reference to the runtime
///
/// The last call drains the primary stream's pools, joins and frees every
/// secondary execution stream, and tears down global state.
pub fn finalize() -> Result<()> {
    let mut refs = REFS.lock();
    if *refs == 0 {
        return Err(Error::Uninitialized);
    }
    if local::current_unit().is_some() {
        return Err(Error::UnitState("finalize called from a work unit"));
    }
    if *refs > 1 {
        *refs -= 1;
        return Ok(());
    }

    let rt = get()?;

    // Run whatever is left in the primary pools
    if let Some(sched) = rt.primary.main_sched() {
        sched.finish()?;
    }
    while !rt.primary_stopped() {
        if !rt.drive_primary() {
            thread::sleep(rt.config.sched_sleep);
        }
    }

    let secondaries: Vec<Xstream> = rt
        .xstreams
        .lock()
        .iter()
        .flatten()
        .filter(|x| !x.is_primary())
        .cloned()
        .collect();
    for xstream in secondaries {
        let rank = xstream.rank();
        debug!(rank, "finalize joins execution stream");
        if let Err(e) = xstream.free() {
            warn!(rank, error = %e, "cannot free execution stream");
        }
    }

    rt.primary.retire();
    rt.driver.lock().take();
    rt.stacks.clear();
    *RUNTIME.write() = None;
    *refs = 0;

    info!(generation = rt.generation, "runtime finalized");
    Ok(())
}

/// Whether the runtime is initialized
pub fn initialized() -> bool {
    *REFS.lock() > 0
}

/// Active runtime configuration
pub fn config() -> Result<Config> {
    Ok(get()?.config.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_reference_counted() {
        init().unwrap();
        init().unwrap();
        assert!(initialized());
        assert!(config().is_ok());
        finalize().unwrap();
        assert!(initialized());
        finalize().unwrap();
    }

    #[test]
    fn test_config_reports_active_values() {
        init().unwrap();
        let config = config().unwrap();
        assert!(config.validate().is_ok());
        finalize().unwrap();
    }
}
