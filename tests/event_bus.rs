// SPDX-License-Identifier: MPL-2.0

//! End-to-end scenarios for the event bus.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use spindle::events::{DispatchMode, Event, EventBus, EventId, EventListener};
use spindle::sync::{Signal, WAIT_INFINITE};
use spindle::Error;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct TestEvent {
    id: EventId,
}

impl Event for TestEvent {
    fn event_id(&self) -> EventId {
        self.id
    }
}

fn event(id: EventId) -> Arc<dyn Event> {
    Arc::new(TestEvent { id })
}

/// Appends its tag to a shared log on every delivery.
struct TaggedListener {
    tag: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
    hits: AtomicUsize,
}

impl TaggedListener {
    fn new(tag: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
        Arc::new(Self {
            tag,
            log,
            hits: AtomicUsize::new(0),
        })
    }
}

impl EventListener for TaggedListener {
    fn on_event(&self, _event: &Arc<dyn Event>, _bus: &EventBus) {
        self.log.lock().unwrap().push(self.tag);
        self.hits.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn sync_dispatch_follows_registration_order() {
    init_logging();
    let log = Arc::new(Mutex::new(Vec::new()));
    let bus = EventBus::new().unwrap();

    let first = TaggedListener::new("first", log.clone());
    let second = TaggedListener::new("second", log.clone());
    let first_id = bus.register_listener(first.clone()).unwrap();
    let _second_id = bus.register_listener(second.clone()).unwrap();

    bus.dispatch(event(1), DispatchMode::Sync).unwrap();
    assert_eq!(*log.lock().unwrap(), ["first", "second"]);

    bus.unregister_listener(first_id).unwrap();
    bus.dispatch(event(1), DispatchMode::Sync).unwrap();
    assert_eq!(*log.lock().unwrap(), ["first", "second", "second"]);

    assert_eq!(first.hits.load(Ordering::SeqCst), 1);
    assert_eq!(second.hits.load(Ordering::SeqCst), 2);
}

#[test]
fn auto_mode_delivers_inline_on_hosted_platforms() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let bus = EventBus::new().unwrap();
    let listener = TaggedListener::new("only", log.clone());
    bus.register_listener(listener).unwrap();

    bus.dispatch(event(7), DispatchMode::Auto).unwrap();
    // Inline delivery completes before dispatch returns.
    assert_eq!(*log.lock().unwrap(), ["only"]);
}

#[test]
fn async_dispatch_reaches_listeners() {
    init_logging();
    let log = Arc::new(Mutex::new(Vec::new()));
    let bus = EventBus::new().unwrap();
    let listener = TaggedListener::new("async", log.clone());
    bus.register_listener(listener.clone()).unwrap();

    for _ in 0..16 {
        bus.dispatch(event(2), DispatchMode::Async).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while listener.hits.load(Ordering::SeqCst) < 16 {
        assert!(Instant::now() < deadline, "async deliveries did not arrive");
        thread::yield_now();
    }
}

#[test]
fn unknown_listener_is_reported() {
    let bus = EventBus::new().unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let id = bus
        .register_listener(TaggedListener::new("x", log))
        .unwrap();
    bus.unregister_listener(id).unwrap();
    assert_eq!(bus.unregister_listener(id), Err(Error::NotFound));
}

/// Blocks inside `on_event` until released, recording both edges.
struct BlockingListener {
    started: Signal,
    release: Signal,
    completed: AtomicBool,
}

impl BlockingListener {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Signal::new(true).unwrap(),
            release: Signal::new(true).unwrap(),
            completed: AtomicBool::new(false),
        })
    }
}

impl EventListener for BlockingListener {
    fn on_event(&self, _event: &Arc<dyn Event>, _bus: &EventBus) {
        self.started.set();
        self.release.wait(WAIT_INFINITE);
        self.completed.store(true, Ordering::SeqCst);
    }
}

#[test]
fn unregister_waits_for_in_flight_deliveries() {
    init_logging();
    let bus = EventBus::new().unwrap();
    let blocker = BlockingListener::new();
    let id = bus.register_listener(blocker.clone()).unwrap();

    bus.dispatch(event(3), DispatchMode::Async).unwrap();
    assert!(blocker.started.wait(5_000), "delivery never started");

    let unregistered = Arc::new(AtomicBool::new(false));
    let unregister_thread = {
        let bus = bus.clone();
        let blocker = blocker.clone();
        let unregistered = unregistered.clone();
        thread::spawn(move || {
            bus.unregister_listener(id).unwrap();
            // The delivery must have fully completed by now.
            assert!(blocker.completed.load(Ordering::SeqCst));
            unregistered.store(true, Ordering::SeqCst);
        })
    };

    // Unregister cannot finish while the listener is still inside
    // on_event.
    thread::sleep(Duration::from_millis(100));
    assert!(!unregistered.load(Ordering::SeqCst));

    blocker.release.set();
    unregister_thread.join().unwrap();

    // The listener is gone: further dispatches never reach it.
    blocker.completed.store(false, Ordering::SeqCst);
    bus.dispatch(event(3), DispatchMode::Sync).unwrap();
    assert!(!blocker.completed.load(Ordering::SeqCst));
}

/// Registers another listener the first time it sees an event.
struct ChainingListener {
    bus_log: Arc<Mutex<Vec<&'static str>>>,
    registered: AtomicBool,
}

impl EventListener for ChainingListener {
    fn on_event(&self, _event: &Arc<dyn Event>, bus: &EventBus) {
        self.bus_log.lock().unwrap().push("chainer");
        if !self.registered.swap(true, Ordering::SeqCst) {
            let late = TaggedListener::new("late", self.bus_log.clone());
            bus.register_listener(late).unwrap();
        }
    }
}

#[test]
fn dispatch_iterates_the_snapshot_it_started_with() {
    init_logging();
    let log = Arc::new(Mutex::new(Vec::new()));
    let bus = EventBus::new().unwrap();
    bus.register_listener(Arc::new(ChainingListener {
        bus_log: log.clone(),
        registered: AtomicBool::new(false),
    }))
    .unwrap();

    // The listener registered during this dispatch is not part of the
    // snapshot being iterated.
    bus.dispatch(event(4), DispatchMode::Sync).unwrap();
    assert_eq!(*log.lock().unwrap(), ["chainer"]);

    // It is part of the next one.
    bus.dispatch(event(4), DispatchMode::Sync).unwrap();
    assert_eq!(*log.lock().unwrap(), ["chainer", "chainer", "late"]);
}

#[test]
fn rundown_blocks_every_operation() {
    init_logging();
    let log = Arc::new(Mutex::new(Vec::new()));
    let bus = EventBus::new().unwrap();
    let listener = TaggedListener::new("l", log.clone());
    let id = bus.register_listener(listener).unwrap();

    bus.rundown();

    assert_eq!(
        bus.register_listener(TaggedListener::new("m", log.clone())),
        Err(Error::RundownInProgress)
    );
    assert_eq!(bus.unregister_listener(id), Err(Error::RundownInProgress));
    assert_eq!(
        bus.dispatch(event(5), DispatchMode::Sync),
        Err(Error::RundownInProgress)
    );
    // Nothing was delivered after the drain.
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn rundown_settles_queued_events() {
    init_logging();
    let log = Arc::new(Mutex::new(Vec::new()));
    let bus = EventBus::new().unwrap();
    let listener = TaggedListener::new("burst", log.clone());
    bus.register_listener(listener.clone()).unwrap();

    for _ in 0..64 {
        bus.dispatch(event(6), DispatchMode::Async).unwrap();
    }
    // Some deliveries may still be queued; rundown either delivers or
    // cancels each envelope, then returns with the pool quiet.
    bus.rundown();
    assert!(listener.hits.load(Ordering::SeqCst) <= 64);

    // Dropping the bus afterwards is a no-op second rundown.
    drop(bus);
}
