//! Integration tests for schedulers, pools and execution streams

use fibril::{
    Access, Error, Policy, Pool, PoolKind, Sched, SchedConfig, SchedContext, SchedKind,
    SchedState, Unit, UnitState, Xstream, XstreamState,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread;
use std::time::{Duration, Instant};

fn fifo() -> Pool {
    Pool::new(PoolKind::Fifo, Access::Mpmc).unwrap()
}

fn basic_stream(pools: &[Pool]) -> Xstream {
    Xstream::create_basic(SchedKind::Basic, pools, &SchedConfig::new()).unwrap()
}

fn stop(xstream: Xstream) {
    xstream.join().unwrap();
    xstream.free().unwrap();
}

fn join_free(units: Vec<Unit>) {
    fibril::join_many(&units).unwrap();
    for unit in units {
        unit.free().unwrap();
    }
}

#[test]
fn test_pool_sizes_and_access() {
    fibril::init().unwrap();
    let pool = fifo();
    assert_eq!(pool.access(), Access::Mpmc);
    assert_eq!(pool.kind(), Some(PoolKind::Fifo));

    let units: Vec<Unit> = (0..5).map(|_| fibril::spawn(&pool, || {}).unwrap()).collect();
    assert_eq!(pool.size().unwrap(), 5);
    assert_eq!(pool.total_size().unwrap(), 5);
    let mut visited = 0;
    pool.for_each(|u| {
        assert_eq!(u.state(), UnitState::Ready);
        visited += 1;
    })
    .unwrap();
    assert_eq!(visited, 5);

    let xstream = basic_stream(&[pool.clone()]);
    assert!(matches!(pool.clone().free(), Err(Error::Pool(_))));
    join_free(units);
    assert_eq!(pool.size().unwrap(), 0);
    stop(xstream);
    pool.free().unwrap();
    fibril::finalize().unwrap();
}

#[test]
fn test_migration_never_observed_half_done() {
    fibril::init().unwrap();
    let left = fifo();
    let right = fifo();
    let units: Vec<Unit> = (0..64).map(|_| fibril::spawn(&left, || {}).unwrap()).collect();

    let done = Arc::new(AtomicBool::new(false));
    let observer = {
        let (l, r, d) = (left.clone(), right.clone(), done.clone());
        thread::spawn(move || {
            let mut snapshots = 0;
            while !d.load(Ordering::Acquire) {
                let sizes = fibril::snapshot_sizes(&[&l, &r]).unwrap();
                assert_eq!(sizes.iter().sum::<usize>(), 64);
                snapshots += 1;
            }
            snapshots
        })
    };

    for round in 0..20 {
        for unit in &units {
            let target = if round % 2 == 0 { &right } else { &left };
            unit.migrate_to_pool(target).unwrap();
        }
    }
    done.store(true, Ordering::Release);
    assert!(observer.join().unwrap() > 0);
    assert_eq!(fibril::snapshot_sizes(&[&left, &right]).unwrap(), vec![64, 0]);

    let xstream = basic_stream(&[left.clone(), right.clone()]);
    join_free(units);
    stop(xstream);
    fibril::finalize().unwrap();
}

#[test]
fn test_exit_request_stops_busy_stream() {
    fibril::init().unwrap();
    let pool = fifo();
    let xstream = basic_stream(&[pool.clone()]);
    let release = Arc::new(AtomicBool::new(false));
    let spins = Arc::new(AtomicUsize::new(0));

    let (r, s) = (release.clone(), spins.clone());
    let unit = fibril::spawn(&pool, move || {
        while !r.load(Ordering::Acquire) {
            s.fetch_add(1, Ordering::Relaxed);
            fibril::yield_now().unwrap();
        }
    })
    .unwrap();
    while spins.load(Ordering::Relaxed) == 0 {
        thread::yield_now();
    }

    let asked = Instant::now();
    xstream.cancel().unwrap();
    xstream.join().unwrap();
    assert!(asked.elapsed() < Duration::from_secs(5));
    assert_eq!(xstream.state(), XstreamState::Terminated);
    assert_eq!(unit.state(), UnitState::Ready);

    // The stream picks the pending unit up again once revived
    xstream.revive(None).unwrap();
    release.store(true, Ordering::Release);
    unit.join().unwrap();
    unit.free().unwrap();
    stop(xstream);
    fibril::finalize().unwrap();
}

#[test]
fn test_unit_stops_its_own_stream() {
    fibril::init().unwrap();
    let pool = fifo();
    let xstream = basic_stream(&[pool.clone()]);
    let rank = xstream.rank();

    let exited = Arc::new(AtomicBool::new(false));
    let e = exited.clone();
    let unit = fibril::spawn(&pool, move || {
        assert_eq!(Xstream::current_rank().unwrap(), rank);
        if !e.swap(true, Ordering::SeqCst) {
            Xstream::exit().unwrap();
        }
    })
    .unwrap();
    while !exited.load(Ordering::SeqCst) {
        thread::yield_now();
    }
    xstream.join().unwrap();
    assert_eq!(xstream.state(), XstreamState::Terminated);

    // The unit may still be waiting in the pool after the yield in exit
    xstream.revive(None).unwrap();
    unit.join().unwrap();
    unit.free().unwrap();
    stop(xstream);
    fibril::finalize().unwrap();
}

#[test]
fn test_nested_scheduler_runs_inner_pool() {
    fibril::init().unwrap();
    let outer = fifo();
    let inner = fifo();
    let sched = Sched::basic(SchedKind::Basic, &[inner.clone()], &SchedConfig::new()).unwrap();
    outer.add_sched(&sched).unwrap();
    assert!(matches!(outer.add_sched(&sched), Err(Error::Sched(_))));

    let ran = Arc::new(AtomicUsize::new(0));
    let units: Vec<Unit> = (0..8)
        .map(|_| {
            let r = ran.clone();
            fibril::spawn(&inner, move || {
                fibril::yield_now().unwrap();
                r.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        })
        .collect();
    let direct = fibril::spawn(&outer, || {}).unwrap();

    let xstream = basic_stream(&[outer.clone()]);
    join_free(units);
    direct.join().unwrap();
    direct.free().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 8);

    stop(xstream);
    assert_eq!(sched.state(), SchedState::Stopped);
    sched.free().unwrap();
    fibril::finalize().unwrap();
}

#[test]
fn test_main_sched_replacement() {
    fibril::init().unwrap();
    let first = fifo();
    let second = fifo();
    let xstream = basic_stream(&[first.clone()]);

    let sched = Sched::basic(SchedKind::Basic, &[second.clone()], &SchedConfig::new()).unwrap();
    xstream.set_main_sched(&sched).unwrap();
    assert!(matches!(Xstream::create(&sched), Err(Error::Sched(_))));

    let rank = xstream.rank();
    let unit = fibril::spawn(&second, move || {
        assert_eq!(Xstream::current_rank().unwrap(), rank);
    })
    .unwrap();
    unit.join().unwrap();
    assert_eq!(xstream.main_sched(), Some(sched.clone()));
    assert_eq!(xstream.main_pools().unwrap(), vec![second.clone()]);

    unit.free().unwrap();
    stop(xstream);
    sched.free().unwrap();
    fibril::finalize().unwrap();
}

#[test]
fn test_prio_drains_first_pool_first() {
    fibril::init().unwrap();
    let high = fifo();
    let low = fifo();
    let order = Arc::new(StdMutex::new(Vec::new()));

    let mut units = Vec::new();
    for (tag, pool) in [(1, &low), (0, &high), (1, &low), (0, &high)] {
        let o = order.clone();
        units.push(fibril::spawn_task(pool, move || o.lock().unwrap().push(tag)).unwrap());
    }

    let sched = Sched::basic(SchedKind::Prio, &[high.clone(), low.clone()], &SchedConfig::new())
        .unwrap();
    let xstream = Xstream::create(&sched).unwrap();
    join_free(units);
    assert_eq!(*order.lock().unwrap(), vec![0, 0, 1, 1]);

    stop(xstream);
    sched.free().unwrap();
    fibril::finalize().unwrap();
}

#[test]
fn test_random_work_stealing_spreads_work() {
    fibril::init().unwrap();
    let a = Pool::new(PoolKind::Steal, Access::Mpmc).unwrap();
    let b = Pool::new(PoolKind::Steal, Access::Mpmc).unwrap();
    let config = SchedConfig::new();
    let xstreams = [
        Xstream::create_basic(SchedKind::RandWs, &[a.clone(), b.clone()], &config).unwrap(),
        Xstream::create_basic(SchedKind::RandWs, &[b.clone(), a.clone()], &config).unwrap(),
    ];

    let ran = Arc::new(AtomicUsize::new(0));
    let units: Vec<Unit> = (0..64)
        .map(|_| {
            let r = ran.clone();
            fibril::spawn(&a, move || {
                fibril::yield_now().unwrap();
                r.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        })
        .collect();
    join_free(units);
    assert_eq!(ran.load(Ordering::SeqCst), 64);

    for xstream in xstreams {
        stop(xstream);
    }
    fibril::finalize().unwrap();
}

/// Runs units from the last pool first
struct Reversed {
    runs: Arc<AtomicUsize>,
}

impl Policy for Reversed {
    fn run(&self, ctx: &SchedContext<'_>) {
        let mut iterations = 0u32;
        loop {
            let popped = ctx.pools().iter().rev().find_map(|p| p.pop().ok().flatten());
            let found = popped.is_some();
            if let Some(unit) = popped {
                self.runs.fetch_add(1, Ordering::SeqCst);
                ctx.run_unit(unit);
            }
            iterations += 1;
            if !found || iterations >= ctx.event_freq() {
                iterations = 0;
                if ctx.has_to_stop() {
                    break;
                }
                ctx.check_events();
                if !found {
                    ctx.idle();
                }
            }
        }
    }
}

#[test]
fn test_user_policy() {
    fibril::init().unwrap();
    let first = fifo();
    let last = fifo();
    let runs = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(StdMutex::new(Vec::new()));

    let mut units = Vec::new();
    for (tag, pool) in [(0, &first), (1, &last)] {
        let o = order.clone();
        units.push(fibril::spawn(pool, move || o.lock().unwrap().push(tag)).unwrap());
    }

    let policy = Reversed { runs: runs.clone() };
    let sched = Sched::new(policy, &[first.clone(), last.clone()], &SchedConfig::new()).unwrap();
    assert_eq!(sched.kind(), None);
    assert_eq!(sched.num_pools().unwrap(), 2);
    assert_eq!(sched.size().unwrap(), 2);

    let xstream = Xstream::create(&sched).unwrap();
    join_free(units);
    assert_eq!(*order.lock().unwrap(), vec![1, 0]);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    stop(xstream);
    sched.free().unwrap();
    fibril::finalize().unwrap();
}

#[test]
fn test_rank_allocation() {
    fibril::init().unwrap();
    let pool = fifo();
    let xstream = basic_stream(&[pool.clone()]);
    let taken = xstream.rank();
    assert!(taken > 0);

    let sched = Sched::basic(SchedKind::Basic, &[], &SchedConfig::new()).unwrap();
    assert!(matches!(
        Xstream::create_with_rank(&sched, taken),
        Err(Error::InvalidXstreamRank(r)) if r == taken
    ));
    assert!(Xstream::num_xstreams().unwrap() >= 2);

    stop(xstream);
    sched.free().unwrap();
    fibril::finalize().unwrap();
}
