//! Predefined pool-order policies

use super::{Policy, SchedContext};
use crate::pool::Pool;

/// Pop from the first non-empty pool, scanning from `start`
fn pop_from(pools: &[Pool], start: usize) -> Option<(usize, crate::unit::Unit)> {
    let n = pools.len();
    (0..n).find_map(|i| {
        let idx = (start + i) % n;
        match pools[idx].pop() {
            Ok(Some(unit)) => Some((idx, unit)),
            _ => None,
        }
    })
}

/// Shared loop of the predefined policies
///
/// `next_start` picks where the next scan begins given the pool that just
/// produced a unit. `on_idle` runs after the event check when nothing was
/// found.
fn run_loop(
    ctx: &SchedContext<'_>,
    next_start: impl Fn(usize, usize) -> usize,
    mut on_idle: impl FnMut(&SchedContext<'_>),
) {
    let pools = ctx.pools();
    let freq = ctx.event_freq().max(1);
    let mut start = 0;
    let mut work = 0u32;

    loop {
        let found = pop_from(pools, start);
        let ran = found.is_some();
        if let Some((idx, unit)) = found {
            start = next_start(idx, pools.len());
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
            on_idle(ctx);
        }
    }
}

/// Round-robin over the pools
#[derive(Debug, Default)]
pub struct Basic;

impl Policy for Basic {
    fn run(&self, ctx: &SchedContext<'_>) {
        run_loop(ctx, |idx, n| (idx + 1) % n, |ctx| ctx.idle());
    }
}

/// Strict pool order: a unit of pool `i` only runs when pools `0..i` are empty
#[derive(Debug, Default)]
pub struct Prio;

impl Policy for Prio {
    fn run(&self, ctx: &SchedContext<'_>) {
        run_loop(ctx, |_, _| 0, |ctx| ctx.idle());
    }
}

/// Round-robin; when idle on a native stack, sleeps on the first pool until a
/// unit arrives or the configured sleep elapses
#[derive(Debug, Default)]
pub struct BasicWait;

impl Policy for BasicWait {
    fn run(&self, ctx: &SchedContext<'_>) {
        run_loop(
            ctx,
            |idx, n| (idx + 1) % n,
            |ctx| {
                if ctx.is_stacked() {
                    return;
                }
                if let Ok(Some(unit)) = ctx.pools()[0].pop_wait(ctx.sleep()) {
                    ctx.run_unit(unit);
                }
            },
        );
    }
}
