//! Dispatcher: runs one unit on the calling execution stream
//!
//! The dispatcher resumes a unit until it yields, blocks or terminates, then
//! performs the matching state transition. It is the only place a unit moves
//! out of RUNNING.

use super::Sched;
use crate::local;
use crate::tool::{self, UnitEvent};
use crate::unit::{Outcome, Step, Suspend, Unit, UnitState};
use tracing::trace;

/// Run `unit`, then any unit it yielded to
pub(crate) fn run(unit: Unit) {
    let mut next = Some(unit);
    while let Some(unit) = next.take() {
        next = run_once(unit);
    }
}

fn run_once(unit: Unit) -> Option<Unit> {
    unit.begin_running();

    if unit.cancel_requested() && !unit.started() {
        unit.discard_body();
        unit.terminate(Outcome::Cancelled);
        return None;
    }

    unit.set_last_xstream(local::current_xstream());
    tool::emit(UnitEvent::Run, &unit, None);
    trace!(unit = unit.id().as_u64(), "dispatch");

    local::push_unit(unit.clone());
    let step = unit.run_body();
    local::pop_unit();

    match step {
        Step::Done(outcome) => {
            unit.terminate(outcome);
            None
        }
        Step::Suspended(Suspend::Yield) => {
            requeue(&unit);
            None
        }
        Step::Suspended(Suspend::YieldTo(target)) => {
            requeue(&unit);
            Some(target)
        }
        Step::Suspended(Suspend::Block) => {
            unit.finish_parking();
            None
        }
    }
}

/// RUNNING -> READY, back to the end of the home pool
fn requeue(unit: &Unit) {
    let home = unit.home_pool();
    unit.set_state(UnitState::Ready);
    tool::emit(UnitEvent::Yield, unit, home.as_ref());
    if let Some(pool) = home {
        pool.requeue(unit.clone());
    }
}

/// Event check of `sched`: a stacked scheduler yields to its resumer
pub(crate) fn check_events(sched: &Sched) {
    if let Some(unit) = local::current_unit() {
        if unit.sched().as_ref() == Some(sched) {
            unit.suspend_with(Suspend::Yield);
        }
    }
}
