use std::thread;
use std::time::{Duration, Instant};

use pio::Event;

mod util;

use util::{drain_batch, drain_until, init_with_proactor};

#[test]
fn interrupt_returns_batch() {
    let proactor = init_with_proactor();

    proactor.interrupt();
    let events = drain_batch(&proactor);
    assert_eq!(events, vec![Event::Interrupt]);
}

#[test]
fn interrupts_are_never_coalesced() {
    let proactor = init_with_proactor();

    for _ in 0..5 {
        proactor.interrupt();
    }
    let events = drain_until(&proactor, Event::Inactive);
    let interrupts = events
        .iter()
        .filter(|event| **event == Event::Interrupt)
        .count();
    assert_eq!(interrupts, 5);
}

#[test]
fn concurrent_interrupts_all_arrive() {
    let proactor = init_with_proactor();

    thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..4 {
                    proactor.interrupt();
                }
            });
        }
    });
    let events = drain_until(&proactor, Event::Inactive);
    let interrupts = events
        .iter()
        .filter(|event| **event == Event::Interrupt)
        .count();
    assert_eq!(interrupts, 32);
}

#[test]
fn timeout_fires_once() {
    let proactor = init_with_proactor();

    proactor.set_timeout(10);
    let events = drain_until(&proactor, Event::Timeout);
    let timeouts = events
        .iter()
        .filter(|event| **event == Event::Timeout)
        .count();
    assert_eq!(timeouts, 1);

    // One event per arming; nothing further than the inactive transition
    // shows up.
    thread::sleep(Duration::from_millis(50));
    while let Some(mut batch) = proactor.get() {
        while let Some(event) = batch.next_event() {
            assert_ne!(event, Event::Timeout);
        }
        proactor.done(batch);
    }
}

#[test]
fn timeout_rearm_coalesces_to_latest() {
    let proactor = init_with_proactor();

    let start = Instant::now();
    proactor.set_timeout(5_000);
    proactor.set_timeout(10);
    let events = drain_until(&proactor, Event::Timeout);
    assert!(start.elapsed() < Duration::from_secs(5));
    let timeouts = events
        .iter()
        .filter(|event| **event == Event::Timeout)
        .count();
    assert_eq!(timeouts, 1);
}

#[test]
fn timeout_cancel_suppresses_expiry() {
    let proactor = init_with_proactor();

    proactor.set_timeout(50);
    thread::sleep(Duration::from_millis(10));
    proactor.cancel_timeout();
    thread::sleep(Duration::from_millis(100));

    // Anything delivered now must not be a timeout.
    while let Some(mut batch) = proactor.get() {
        while let Some(event) = batch.next_event() {
            assert_ne!(event, Event::Timeout);
        }
        proactor.done(batch);
    }
}

#[test]
fn timeout_cancel_after_fire_but_before_delivery() {
    let proactor = init_with_proactor();

    proactor.set_timeout(5);
    // Let the expiry reach the kernel before anyone polls, then cancel.
    thread::sleep(Duration::from_millis(30));
    proactor.cancel_timeout();

    while let Some(mut batch) = proactor.get() {
        while let Some(event) = batch.next_event() {
            assert_ne!(event, Event::Timeout);
        }
        proactor.done(batch);
    }
}

#[test]
fn zero_timeout_fires_immediately() {
    let proactor = init_with_proactor();

    proactor.set_timeout(0);
    let events = drain_batch(&proactor);
    assert!(events.contains(&Event::Timeout), "got {:?}", events);
}

#[test]
fn inactive_fires_once_after_interrupt_drain() {
    let proactor = init_with_proactor();

    proactor.interrupt();
    let events = drain_until(&proactor, Event::Inactive);
    let inactives = events
        .iter()
        .filter(|event| **event == Event::Inactive)
        .count();
    assert_eq!(inactives, 1);

    // Still inactive; no second event without a new transition.
    assert!(proactor.get().is_none());
}

#[test]
fn get_returns_none_when_idle() {
    let proactor = init_with_proactor();

    assert!(proactor.get().is_none());
}
