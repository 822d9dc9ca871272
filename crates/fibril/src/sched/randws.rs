//! Random work-stealing policy

use super::{Policy, SchedContext};
use rand::Rng;

/// Pops from its own pool (the first) and, when that is empty, from one
/// randomly chosen other pool
///
/// Meant for sets of streams that each own one pool of a shared list, with
/// the list rotated so each stream's own pool comes first.
#[derive(Debug, Default)]
pub struct RandWs;

impl Policy for RandWs {
    fn run(&self, ctx: &SchedContext<'_>) {
        let pools = ctx.pools();
        let freq = ctx.event_freq().max(1);
        let mut work = 0u32;

        loop {
            let mut unit = pools[0].pop().ok().flatten();
            if unit.is_none() && pools.len() > 1 {
                // Not held across a dispatch: the loop may resume on another thread
                let victim = rand::thread_rng().gen_range(1..pools.len());
                unit = pools[victim].pop().ok().flatten();
            }
            let ran = unit.is_some();
            if let Some(unit) = unit {
                ctx.run_unit(unit);
            }

            work += 1;
            if ran && work < freq {
                continue;
            }
            work = 0;
            if ctx.has_to_stop() {
                break;
            }
            ctx.check_events();
            if !ran {
                ctx.idle();
            }
        }
    }
}
