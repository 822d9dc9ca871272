//! A panicking tool callback must not take down the stream that reported
//! the event
//!
//! The callback is process-wide, so this binary holds a single test.

use fibril::{
    Access, EventMask, Pool, PoolKind, SchedConfig, SchedKind, UnitEvent, UnitState, Xstream,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_panicking_callback_keeps_stream_alive() {
    fibril::init().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    fibril::register_unit_callback(EventMask::RUN | EventMask::FINISH, move |event, _| {
        c.fetch_add(1, Ordering::SeqCst);
        if event.event == UnitEvent::Run {
            panic!("callback failure");
        }
    })
    .unwrap();

    let pool = Pool::new(PoolKind::Fifo, Access::Mpmc).unwrap();
    let xstream =
        Xstream::create_basic(SchedKind::Basic, &[pool.clone()], &SchedConfig::new()).unwrap();

    let ran = Arc::new(AtomicUsize::new(0));
    let units: Vec<_> = (0..3)
        .map(|_| {
            let r = ran.clone();
            fibril::spawn(&pool, move || {
                r.fetch_add(1, Ordering::SeqCst);
                fibril::yield_now().unwrap();
            })
            .unwrap()
        })
        .collect();

    fibril::join_many(&units).unwrap();
    fibril::unregister_unit_callback();
    assert_eq!(ran.load(Ordering::SeqCst), 3);
    // One RUN per dispatch and one FINISH per unit
    assert!(calls.load(Ordering::SeqCst) >= 9);
    for unit in units {
        assert_eq!(unit.state(), UnitState::Terminated);
        assert!(!unit.panicked());
        unit.free().unwrap();
    }

    xstream.join().unwrap();
    xstream.free().unwrap();
    fibril::finalize().unwrap();
}
