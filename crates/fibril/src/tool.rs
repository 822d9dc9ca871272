//! Instrumentation callbacks
//!
//! A single process-wide callback may subscribe to work-unit lifecycle events
//! through an [`EventMask`]. The runtime calls it synchronously at the point
//! the event happens, with no runtime lock held, so the callback may call back
//! into the runtime.

use crate::error::{Error, Result};
use crate::local::{self, Caller};
use crate::pool::Pool;
use crate::runtime;
use crate::unit::{Unit, UnitId};
use crate::xstream::Xstream;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::ops::{BitOr, BitOrAssign};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

/// Set of subscribed [`UnitEvent`]s
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct EventMask(u64);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const CREATE: EventMask = EventMask(1 << 0);
    pub const JOIN: EventMask = EventMask(1 << 1);
    pub const FREE: EventMask = EventMask(1 << 2);
    pub const REVIVE: EventMask = EventMask(1 << 3);
    pub const RUN: EventMask = EventMask(1 << 4);
    pub const FINISH: EventMask = EventMask(1 << 5);
    pub const CANCEL: EventMask = EventMask(1 << 6);
    pub const YIELD: EventMask = EventMask(1 << 7);
    pub const SUSPEND: EventMask = EventMask(1 << 8);
    pub const RESUME: EventMask = EventMask(1 << 9);
    pub const ALL: EventMask = EventMask((1 << 10) - 1);

    /// Raw bits
    pub fn bits(self) -> u64 {
        self.0
    }

    /// Whether every event of `other` is in `self`
    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

/// Work-unit lifecycle event
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnitEvent {
    /// Created and pushed to a pool
    Create,
    /// Joined by some caller
    Join,
    /// Freed
    Free,
    /// Revived into a pool
    Revive,
    /// Dispatched by a scheduler
    Run,
    /// Terminated
    Finish,
    /// Cancellation requested
    Cancel,
    /// Yielded back to its pool
    Yield,
    /// Blocked
    Suspend,
    /// Made ready after blocking
    Resume,
}

impl UnitEvent {
    /// Mask bit of this event
    pub fn mask(self) -> EventMask {
        match self {
            UnitEvent::Create => EventMask::CREATE,
            UnitEvent::Join => EventMask::JOIN,
            UnitEvent::Free => EventMask::FREE,
            UnitEvent::Revive => EventMask::REVIVE,
            UnitEvent::Run => EventMask::RUN,
            UnitEvent::Finish => EventMask::FINISH,
            UnitEvent::Cancel => EventMask::CANCEL,
            UnitEvent::Yield => EventMask::YIELD,
            UnitEvent::Suspend => EventMask::SUSPEND,
            UnitEvent::Resume => EventMask::RESUME,
        }
    }
}

/// What a blocked unit is waiting on
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncEvent {
    Other = 0,
    /// `unit::suspend`
    Suspend = 1,
    XstreamJoin = 2,
    UnitJoin = 3,
    Mutex = 4,
    Cond = 5,
    RwLock = 6,
    Eventual = 7,
    Future = 8,
    Barrier = 9,
}

impl SyncEvent {
    pub(crate) fn from_u8(v: u8) -> SyncEvent {
        match v {
            1 => SyncEvent::Suspend,
            2 => SyncEvent::XstreamJoin,
            3 => SyncEvent::UnitJoin,
            4 => SyncEvent::Mutex,
            5 => SyncEvent::Cond,
            6 => SyncEvent::RwLock,
            7 => SyncEvent::Eventual,
            8 => SyncEvent::Future,
            9 => SyncEvent::Barrier,
            _ => SyncEvent::Other,
        }
    }
}

/// Entity that triggered an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCaller {
    /// A work unit
    Unit(UnitId),
    /// The primary thread or a thread outside the runtime
    External,
}

/// Event delivered to the callback
#[derive(Debug, Clone)]
pub struct ToolEvent {
    /// Unit the event is about
    pub unit: Unit,
    /// Stream on which the event happened, if any
    pub xstream: Option<Xstream>,
    /// What happened
    pub event: UnitEvent,
}

/// Query context of one event
///
/// Each query only applies to some events; asking for the others fails with
/// `Error::InvalidToolContext`.
pub struct ToolContext {
    event: UnitEvent,
    pool: Option<Pool>,
    stack_depth: usize,
    caller: ToolCaller,
    sync_object: SyncEvent,
}

impl ToolContext {
    /// Pool the unit is pushed to or leaves
    ///
    /// Applies to create, revive, yield, suspend and resume.
    pub fn pool(&self) -> Result<Option<Pool>> {
        match self.event {
            UnitEvent::Create
            | UnitEvent::Revive
            | UnitEvent::Yield
            | UnitEvent::Suspend
            | UnitEvent::Resume => Ok(self.pool.clone()),
            _ => Err(Error::InvalidToolContext),
        }
    }

    /// Number of schedulers stacked on the acting stream
    ///
    /// Applies to run, finish, yield and suspend.
    pub fn stack_depth(&self) -> Result<usize> {
        match self.event {
            UnitEvent::Run | UnitEvent::Finish | UnitEvent::Yield | UnitEvent::Suspend => {
                Ok(self.stack_depth)
            }
            _ => Err(Error::InvalidToolContext),
        }
    }

    /// Who performed the operation
    ///
    /// Applies to create, join, free, revive, cancel and resume.
    pub fn caller(&self) -> Result<ToolCaller> {
        match self.event {
            UnitEvent::Create
            | UnitEvent::Join
            | UnitEvent::Free
            | UnitEvent::Revive
            | UnitEvent::Cancel
            | UnitEvent::Resume => Ok(self.caller.clone()),
            _ => Err(Error::InvalidToolContext),
        }
    }

    /// What a suspending unit blocks on
    pub fn sync_object(&self) -> Result<SyncEvent> {
        match self.event {
            UnitEvent::Suspend => Ok(self.sync_object),
            _ => Err(Error::InvalidToolContext),
        }
    }
}

type Callback = Arc<dyn Fn(&ToolEvent, &ToolContext) + Send + Sync>;

static MASK: AtomicU64 = AtomicU64::new(0);
static CALLBACK: Lazy<RwLock<Option<Callback>>> = Lazy::new(|| RwLock::new(None));

/// Install `callback` for the events in `mask`, replacing any previous one
pub fn register_unit_callback<F>(mask: EventMask, callback: F) -> Result<()>
where
    F: Fn(&ToolEvent, &ToolContext) + Send + Sync + 'static,
{
    if let Some(rt) = runtime::try_get() {
        if !rt.config().tool {
            return Err(Error::FeatureUnavailable("tool callbacks are disabled"));
        }
    }
    *CALLBACK.write() = Some(Arc::new(callback));
    MASK.store(mask.bits(), Ordering::Release);
    Ok(())
}

/// Remove the installed callback
pub fn unregister_unit_callback() {
    MASK.store(0, Ordering::Release);
    *CALLBACK.write() = None;
}

/// Report `event` about `unit`
pub(crate) fn emit(event: UnitEvent, unit: &Unit, pool: Option<&Pool>) {
    if MASK.load(Ordering::Acquire) & event.mask().bits() == 0 {
        return;
    }
    let Some(callback) = CALLBACK.read().clone() else {
        return;
    };
    if !runtime::try_get().map_or(false, |rt| rt.config().tool) {
        return;
    }

    let caller = match local::caller() {
        Caller::Stackful(u) | Caller::Task(u) => ToolCaller::Unit(u.id()),
        Caller::Primary | Caller::Native => ToolCaller::External,
    };
    let context = ToolContext {
        event,
        pool: pool.cloned(),
        stack_depth: local::sched_depth(),
        caller,
        sync_object: unit.sync_event(),
    };
    let event = ToolEvent {
        unit: unit.clone(),
        xstream: local::current_xstream(),
        event,
    };
    if panic::catch_unwind(AssertUnwindSafe(|| callback(&event, &context))).is_err() {
        error!(
            unit = event.unit.id().as_u64(),
            event = ?event.event,
            "tool callback panicked"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_mask_bits() {
        let mask = EventMask::CREATE | EventMask::FINISH;
        assert!(mask.contains(EventMask::CREATE));
        assert!(!mask.contains(EventMask::RUN));
        assert!(EventMask::ALL.contains(mask));
        assert_eq!(UnitEvent::Resume.mask(), EventMask::RESUME);
    }

    #[test]
    fn test_query_kinds_per_event() {
        let context = ToolContext {
            event: UnitEvent::Run,
            pool: None,
            stack_depth: 2,
            caller: ToolCaller::External,
            sync_object: SyncEvent::Other,
        };
        assert_eq!(context.stack_depth().unwrap(), 2);
        assert!(matches!(context.pool(), Err(Error::InvalidToolContext)));
        assert!(matches!(context.caller(), Err(Error::InvalidToolContext)));
        assert!(matches!(context.sync_object(), Err(Error::InvalidToolContext)));
    }

    #[test]
    fn test_sync_event_from_u8() {
        for event in [SyncEvent::Mutex, SyncEvent::Barrier, SyncEvent::UnitJoin] {
            assert_eq!(SyncEvent::from_u8(event as u8), event);
        }
        assert_eq!(SyncEvent::from_u8(200), SyncEvent::Other);
    }
}
