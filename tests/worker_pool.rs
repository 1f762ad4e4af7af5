use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use pio::{Event, Proactor};
use rand::RngCore;

mod util;

use util::{init_with_proactor, DriverBuilder, DriverHandle, DEADLINE};

const WORKERS: usize = 4;
const CLIENTS: usize = 8;

/// A worker drains batches until it sees an interrupt. Inbound
/// connections are accepted with an echo driver.
fn worker(proactor: &Proactor, accepted: &Mutex<Vec<DriverHandle>>, inactive: &AtomicBool) {
    loop {
        let mut batch = proactor.wait();
        let mut stop = false;
        while let Some(event) = batch.next_event() {
            match event {
                Event::ListenerAccept => {
                    let listener = batch.listener().expect("accept without listener");
                    let (driver, handle) = DriverBuilder::new().echo().close_on_eof().build();
                    listener.accept(driver).expect("accept failed");
                    accepted.lock().unwrap().push(handle);
                }
                Event::Interrupt => stop = true,
                Event::Inactive => inactive.store(true, Ordering::SeqCst),
                _ => {}
            }
        }
        proactor.done(batch);
        if stop {
            return;
        }
    }
}

fn await_with_deadline(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + DEADLINE;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn echo_under_a_worker_pool() {
    let proactor = init_with_proactor();
    let listener = proactor.listen("127.0.0.1:0", 32);
    let addr = listener
        .local_addr()
        .expect("no bound address")
        .to_string();

    let accepted = Mutex::new(Vec::new());
    let inactive = AtomicBool::new(false);

    let mut payloads = Vec::new();
    let mut clients = Vec::new();
    for _ in 0..CLIENTS {
        let mut payload = vec![0u8; 2048];
        rand::rng().fill_bytes(&mut payload);
        let (driver, handle) = DriverBuilder::new().send(&payload).close_on_eof().build();
        let conn = proactor.connect(driver, &addr);
        payloads.push(payload);
        clients.push((conn, handle));
    }

    thread::scope(|scope| {
        for _ in 0..WORKERS {
            scope.spawn(|| worker(&proactor, &accepted, &inactive));
        }

        // Every client gets its payload echoed back intact.
        await_with_deadline(
            || {
                clients
                    .iter()
                    .zip(&payloads)
                    .all(|((_, handle), payload)| handle.received() == *payload)
            },
            "all echoes",
        );

        // Orderly teardown: close every client, then the listener, and
        // let the pool drive everything down to inactive.
        for (conn, handle) in &clients {
            handle.close_write();
            conn.wake();
        }
        await_with_deadline(
            || clients.iter().all(|(_, handle)| handle.closed()),
            "client teardown",
        );
        await_with_deadline(
            || accepted.lock().unwrap().iter().all(|handle| handle.closed()),
            "server teardown",
        );
        listener.close();
        await_with_deadline(|| inactive.load(Ordering::SeqCst), "inactive");

        // Release the pool: one interrupt per worker, one batch each.
        for _ in 0..WORKERS {
            proactor.interrupt();
        }
    });

    assert_eq!(accepted.lock().unwrap().len(), CLIENTS);
}
