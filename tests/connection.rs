use std::thread;
use std::time::{Duration, Instant};

use pio::{Batch, Connection, Event, Proactor};
use rand::RngCore;

mod util;

use util::{drain_until, init_with_proactor, DriverBuilder, DriverHandle, DEADLINE};

/// Opens an echo listener and returns it with its bound address string.
fn echo_listener(proactor: &Proactor) -> (pio::Listener, String) {
    let listener = proactor.listen("127.0.0.1:0", 16);
    let addr = listener
        .local_addr()
        .expect("listener has no bound address")
        .to_string();
    (listener, addr)
}

/// Drives the proactor, accepting every inbound connection with an echo
/// driver, until `predicate` holds. Returns the handles of the accepted
/// transports and the events observed on `watched`.
fn drive_echo_server(
    proactor: &Proactor,
    watched: Option<&Connection>,
    accepted: &mut Vec<DriverHandle>,
    mut predicate: impl FnMut(&[DriverHandle]) -> bool,
) -> Vec<Event> {
    let deadline = Instant::now() + DEADLINE;
    let mut watched_events = Vec::new();
    while !predicate(accepted) {
        assert!(Instant::now() < deadline, "test deadline passed");
        let Some(mut batch) = proactor.get() else {
            thread::sleep(Duration::from_millis(1));
            continue;
        };
        let watch = watched.is_some() && batch.connection() == watched;
        while let Some(event) = batch.next_event() {
            if watch {
                watched_events.push(event);
            }
            if event == Event::ListenerAccept {
                let listener = batch.listener().expect("accept event without listener");
                let (driver, handle) = DriverBuilder::new().echo().close_on_eof().build();
                listener.accept(driver).expect("accept failed");
                accepted.push(handle);
            }
        }
        proactor.done(batch);
    }
    watched_events
}

#[test]
fn echo_round_trip() {
    let proactor = init_with_proactor();
    let (listener, addr) = echo_listener(&proactor);

    let (driver, client) = DriverBuilder::new().send(b"hello").close_on_eof().build();
    let conn = proactor.connect(driver, &addr);

    let mut accepted = Vec::new();
    let mut client_events = drive_echo_server(&proactor, Some(&conn), &mut accepted, |_| {
        client.received() == b"hello".to_vec()
    });

    // Echo received; close our side and run both teardowns.
    client.close_write();
    conn.wake();
    client_events.extend(drive_echo_server(
        &proactor,
        Some(&conn),
        &mut accepted,
        |accepted| client.closed() && accepted.iter().all(|handle| handle.closed()),
    ));

    assert_eq!(client_events.first(), Some(&Event::TransportConnected));
    assert!(client_events.contains(&Event::Delivery));
    assert_eq!(client_events.last(), Some(&Event::TransportClosed));
    let connected_at = client_events
        .iter()
        .position(|event| *event == Event::TransportConnected)
        .unwrap();
    let delivery_at = client_events
        .iter()
        .position(|event| *event == Event::Delivery)
        .unwrap();
    assert!(connected_at < delivery_at);

    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].received(), b"hello".to_vec());

    listener.close();
    drain_until(&proactor, Event::Inactive);
}

#[test]
fn connect_refused_reports_condition() {
    let proactor = init_with_proactor();

    // Nothing listens on port 1.
    let (driver, handle) = DriverBuilder::new().build();
    let _conn = proactor.connect(driver, "127.0.0.1:1");

    let events = drain_until(&proactor, Event::TransportClosed);
    assert!(events.contains(&Event::TransportError), "got {:?}", events);

    let condition = handle.condition().expect("no condition recorded");
    assert!(
        condition.description().to_lowercase().contains("refused"),
        "unexpected condition: {}",
        condition
    );

    drain_until(&proactor, Event::Inactive);
}

#[test]
fn wake_is_delivered() {
    let proactor = init_with_proactor();
    let (listener, addr) = echo_listener(&proactor);

    let (driver, client) = DriverBuilder::new().build();
    let conn = proactor.connect(driver, &addr);
    let mut accepted = Vec::new();
    drive_echo_server(&proactor, None, &mut accepted, |_| client.connected());

    conn.wake();
    let events = drain_until(&proactor, Event::ConnectionWake);
    let wakes = events
        .iter()
        .filter(|event| **event == Event::ConnectionWake)
        .count();
    assert_eq!(wakes, 1);

    listener.close();
}

#[test]
fn hundred_wakes_coalesce_to_one_event() {
    let proactor = init_with_proactor();
    let (listener, addr) = echo_listener(&proactor);

    let (driver, client) = DriverBuilder::new().build();
    let conn = proactor.connect(driver, &addr);
    let mut accepted = Vec::new();
    drive_echo_server(&proactor, None, &mut accepted, |_| client.connected());

    // The connection is idle; no thread is draining while these run.
    thread::scope(|scope| {
        for _ in 0..100 {
            let conn = conn.clone();
            scope.spawn(move || conn.wake());
        }
    });

    let mut events = drain_until(&proactor, Event::ConnectionWake);
    // Settle, then sweep anything left over.
    thread::sleep(Duration::from_millis(50));
    while let Some(mut batch) = proactor.get() {
        while let Some(event) = batch.next_event() {
            events.push(event);
        }
        proactor.done(batch);
    }
    let wakes = events
        .iter()
        .filter(|event| **event == Event::ConnectionWake)
        .count();
    assert_eq!(wakes, 1);

    listener.close();
}

#[test]
fn wakes_while_batch_held_are_not_lost_and_do_not_double_own() {
    let proactor = init_with_proactor();
    let (listener, addr) = echo_listener(&proactor);

    let (driver, client) = DriverBuilder::new().build();
    let conn = proactor.connect(driver, &addr);
    let mut accepted = Vec::new();
    drive_echo_server(&proactor, None, &mut accepted, |_| client.connected());

    // Claim a batch for the connection and hold it.
    conn.wake();
    let held: Batch = {
        let deadline = Instant::now() + DEADLINE;
        loop {
            assert!(Instant::now() < deadline);
            let Some(batch) = proactor.get() else {
                thread::sleep(Duration::from_millis(1));
                continue;
            };
            if batch.connection() == Some(&conn) {
                break batch;
            }
            proactor.done(batch);
        }
    };

    // While held, new wakes must neither produce a second batch for the
    // same connection nor be dropped.
    conn.wake();
    conn.wake();
    thread::sleep(Duration::from_millis(50));
    while let Some(mut batch) = proactor.get() {
        assert_ne!(batch.connection(), Some(&conn), "endpoint double-owned");
        while batch.next_event().is_some() {}
        proactor.done(batch);
    }

    proactor.done(held);
    let events = drain_until(&proactor, Event::ConnectionWake);
    assert!(events.contains(&Event::ConnectionWake));

    listener.close();
}

#[test]
fn ticks_follow_the_driver_deadline() {
    let proactor = init_with_proactor();
    let (listener, addr) = echo_listener(&proactor);

    let (driver, client) = DriverBuilder::new()
        .send(b"ping")
        .tick_interval(10)
        .build();
    let _conn = proactor.connect(driver, &addr);
    let mut accepted = Vec::new();

    // The first tick rides the echo read; the rest come off the
    // per-connection timer chain.
    drive_echo_server(&proactor, None, &mut accepted, |_| {
        client.received() == b"ping".to_vec()
    });
    drive_echo_server(&proactor, None, &mut accepted, |_| client.ticks() >= 3);

    listener.close();
}

#[test]
fn release_closes_the_transport() {
    let proactor = init_with_proactor();
    let (listener, addr) = echo_listener(&proactor);

    let (driver, client) = DriverBuilder::new().build();
    let conn = proactor.connect(driver, &addr);
    let mut accepted = Vec::new();
    drive_echo_server(&proactor, None, &mut accepted, |_| client.connected());

    conn.release();
    let events = drain_until(&proactor, Event::TransportClosed);
    assert!(events.contains(&Event::TransportClosed));
    assert!(client.closed());

    listener.close();
    drain_until(&proactor, Event::Inactive);
}

#[test]
fn bulk_transfer_does_not_starve_the_small_one() {
    let proactor = init_with_proactor();
    let (listener, addr) = echo_listener(&proactor);

    let mut payload = vec![0u8; 1 << 20];
    rand::rng().fill_bytes(&mut payload);

    let (bulk_driver, bulk) = DriverBuilder::new().send(&payload).build();
    let _bulk_conn = proactor.connect(bulk_driver, &addr);
    let (small_driver, small) = DriverBuilder::new().send(b"ping").build();
    let _small_conn = proactor.connect(small_driver, &addr);

    let mut accepted = Vec::new();
    // The small echo must complete while the bulk stream may still be in
    // flight; the hog bound keeps one connection from monopolizing.
    drive_echo_server(&proactor, None, &mut accepted, |_| {
        small.received() == b"ping".to_vec()
    });
    drive_echo_server(&proactor, None, &mut accepted, |_| {
        bulk.received().len() == payload.len()
    });
    assert_eq!(bulk.received(), payload);

    listener.close();
}
