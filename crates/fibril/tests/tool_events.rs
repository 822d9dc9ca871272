//! Integration test for unit lifecycle callbacks
//!
//! The callback is process-wide, so this binary holds a single test.

use fibril::{
    Access, Config, Error, Eventual, EventMask, Pool, PoolKind, SchedConfig, SchedKind,
    SyncEvent, ToolCaller, UnitEvent, Xstream,
};
use std::sync::{Arc, Mutex as StdMutex};

#[derive(Debug, Clone, PartialEq)]
struct Seen {
    unit: u64,
    event: UnitEvent,
    caller: Option<ToolCaller>,
    sync: Option<SyncEvent>,
    has_pool: Option<bool>,
}

#[test]
fn test_unit_callbacks() {
    fibril::init_with(Config::default()).unwrap();
    let log = Arc::new(StdMutex::new(Vec::<Seen>::new()));

    let l = log.clone();
    fibril::register_unit_callback(
        EventMask::CREATE | EventMask::FINISH | EventMask::SUSPEND | EventMask::JOIN,
        move |event, ctx| {
            let seen = Seen {
                unit: event.unit.id().as_u64(),
                event: event.event,
                caller: ctx.caller().ok(),
                sync: ctx.sync_object().ok(),
                has_pool: ctx.pool().ok().map(|p| p.is_some()),
            };
            // Queries outside an event's context are rejected
            if event.event == UnitEvent::Finish {
                assert!(matches!(ctx.caller(), Err(Error::InvalidToolContext)));
                assert!(ctx.stack_depth().is_ok());
            }
            l.lock().unwrap().push(seen);
        },
    )
    .unwrap();

    let pool = Pool::new(PoolKind::Fifo, Access::Mpmc).unwrap();
    let xstream =
        Xstream::create_basic(SchedKind::Basic, &[pool.clone()], &SchedConfig::new()).unwrap();

    let ev = Eventual::new(0);
    let e = ev.clone();
    let unit = fibril::spawn(&pool, move || {
        e.wait().unwrap();
    })
    .unwrap();
    let id = unit.id().as_u64();

    while !log
        .lock()
        .unwrap()
        .iter()
        .any(|s| s.unit == id && s.event == UnitEvent::Suspend)
    {
        std::thread::yield_now();
    }
    ev.set(&[]).unwrap();
    unit.join().unwrap();
    fibril::unregister_unit_callback();
    unit.free().unwrap();

    let events: Vec<Seen> = log
        .lock()
        .unwrap()
        .iter()
        .filter(|s| s.unit == id)
        .cloned()
        .collect();
    let kinds: Vec<UnitEvent> = events.iter().map(|s| s.event).collect();
    assert_eq!(
        kinds,
        vec![
            UnitEvent::Create,
            UnitEvent::Suspend,
            UnitEvent::Finish,
            UnitEvent::Join
        ]
    );
    assert_eq!(events[0].caller, Some(ToolCaller::External));
    assert_eq!(events[0].has_pool, Some(true));
    assert_eq!(events[1].sync, Some(SyncEvent::Eventual));
    assert_eq!(events[2].caller, None);

    xstream.join().unwrap();
    xstream.free().unwrap();
    fibril::finalize().unwrap();
}
