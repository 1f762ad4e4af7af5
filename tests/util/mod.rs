// Not all helpers are used by all test files.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use pio::{Batch, Condition, Driver, Event, Proactor};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    });
}

pub fn init_with_proactor() -> Proactor {
    init();
    Proactor::new().expect("unable to create proactor")
}

pub const DEADLINE: Duration = Duration::from_secs(10);

/// Polls `get` until a batch shows up; panics when the deadline passes,
/// so a lost notification fails the test instead of hanging it.
pub fn wait_batch(proactor: &Proactor) -> Batch {
    let start = Instant::now();
    loop {
        if let Some(batch) = proactor.get() {
            return batch;
        }
        if start.elapsed() > DEADLINE {
            panic!("no batch within {:?}", DEADLINE);
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Drains one batch into a vec of events and returns it.
pub fn drain_batch(proactor: &Proactor) -> Vec<Event> {
    let mut batch = wait_batch(proactor);
    let mut events = Vec::new();
    while let Some(event) = batch.next_event() {
        events.push(event);
    }
    proactor.done(batch);
    events
}

/// Keeps draining batches until `event` shows up, collecting everything
/// seen along the way (the matching event included).
pub fn drain_until(proactor: &Proactor, event: Event) -> Vec<Event> {
    let mut seen = Vec::new();
    let start = Instant::now();
    while !seen.contains(&event) {
        if start.elapsed() > DEADLINE {
            panic!("no {:?} within {:?}; saw {:?}", event, DEADLINE, seen);
        }
        seen.extend(drain_batch(proactor));
    }
    seen
}

/// Spins until `predicate` holds, driving the proactor with `get` along
/// the way. Returns the events drained while spinning.
pub fn drive_until(proactor: &Proactor, mut predicate: impl FnMut() -> bool) -> Vec<Event> {
    let mut seen = Vec::new();
    let start = Instant::now();
    while !predicate() {
        if start.elapsed() > DEADLINE {
            panic!("condition not reached within {:?}; saw {:?}", DEADLINE, seen);
        }
        if let Some(mut batch) = proactor.get() {
            while let Some(event) = batch.next_event() {
                seen.push(event);
            }
            proactor.done(batch);
        } else {
            thread::sleep(Duration::from_millis(1));
        }
    }
    seen
}

#[derive(Default)]
struct Shared {
    received: Vec<u8>,
    to_send: Vec<u8>,
    events: VecDeque<Event>,
    condition: Option<Condition>,
    connected: bool,
    read_closed: bool,
    write_closed: bool,
    closed_emitted: bool,
    echo: bool,
    close_on_eof: bool,
    tick_interval: Option<u64>,
    ticks: u32,
}

impl Shared {
    fn maybe_emit_closed(&mut self) {
        if self.read_closed && self.write_closed && !self.closed_emitted {
            self.closed_emitted = true;
            self.events.push_back(Event::TransportClosed);
        }
    }
}

/// Test-side view of a [`TestDriver`]: the application half of the
/// transport black box.
#[derive(Clone)]
pub struct DriverHandle {
    shared: Arc<Mutex<Shared>>,
}

impl DriverHandle {
    pub fn received(&self) -> Vec<u8> {
        self.shared.lock().unwrap().received.clone()
    }

    pub fn condition(&self) -> Option<Condition> {
        self.shared.lock().unwrap().condition.clone()
    }

    pub fn connected(&self) -> bool {
        self.shared.lock().unwrap().connected
    }

    pub fn closed(&self) -> bool {
        let shared = self.shared.lock().unwrap();
        shared.read_closed && shared.write_closed
    }

    pub fn ticks(&self) -> u32 {
        self.shared.lock().unwrap().ticks
    }

    /// Queues bytes for the engine to write. Follow with
    /// `Connection::wake` so an idle engine notices.
    pub fn enqueue(&self, bytes: &[u8]) {
        self.shared.lock().unwrap().to_send.extend_from_slice(bytes);
    }

    /// Closes the outbound direction. Follow with `Connection::wake`.
    pub fn close_write(&self) {
        let mut shared = self.shared.lock().unwrap();
        shared.write_closed = true;
        shared.maybe_emit_closed();
    }
}

/// A scripted byte-stream transport: enough of a driver to exercise the
/// engine's read/tick/write cycle, event delivery and teardown, with a
/// [`DriverHandle`] for the test to observe and steer it.
pub struct TestDriver {
    shared: Arc<Mutex<Shared>>,
    scratch: Box<[u8]>,
    out: Vec<u8>,
    out_pos: usize,
}

pub struct DriverBuilder {
    echo: bool,
    close_on_eof: bool,
    to_send: Vec<u8>,
    tick_interval: Option<u64>,
}

impl DriverBuilder {
    pub fn new() -> DriverBuilder {
        DriverBuilder {
            echo: false,
            close_on_eof: false,
            to_send: Vec::new(),
            tick_interval: None,
        }
    }

    /// Copy every received byte back into the send buffer.
    pub fn echo(mut self) -> DriverBuilder {
        self.echo = true;
        self
    }

    /// Close the write side as soon as the peer closes its own.
    pub fn close_on_eof(mut self) -> DriverBuilder {
        self.close_on_eof = true;
        self
    }

    /// Bytes to send as soon as the transport connects.
    pub fn send(mut self, bytes: &[u8]) -> DriverBuilder {
        self.to_send.extend_from_slice(bytes);
        self
    }

    /// Request a tick every `millis` once traffic starts flowing.
    pub fn tick_interval(mut self, millis: u64) -> DriverBuilder {
        self.tick_interval = Some(millis);
        self
    }

    pub fn build(self) -> (Box<TestDriver>, DriverHandle) {
        let shared = Arc::new(Mutex::new(Shared {
            echo: self.echo,
            close_on_eof: self.close_on_eof,
            to_send: self.to_send,
            tick_interval: self.tick_interval,
            ..Shared::default()
        }));
        let driver = Box::new(TestDriver {
            shared: shared.clone(),
            scratch: vec![0u8; 4096].into_boxed_slice(),
            out: Vec::new(),
            out_pos: 0,
        });
        (driver, DriverHandle { shared })
    }
}

impl Driver for TestDriver {
    fn read_buffer(&mut self) -> &mut [u8] {
        if self.shared.lock().unwrap().read_closed {
            &mut []
        } else {
            &mut self.scratch
        }
    }

    fn read_done(&mut self, n: usize) {
        let mut shared = self.shared.lock().unwrap();
        shared.received.extend_from_slice(&self.scratch[..n]);
        if shared.echo {
            let echoed = self.scratch[..n].to_vec();
            shared.to_send.extend_from_slice(&echoed);
        }
        shared.events.push_back(Event::Delivery);
    }

    fn read_close(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        shared.read_closed = true;
        if shared.close_on_eof {
            shared.write_closed = true;
        }
        shared.maybe_emit_closed();
    }

    fn read_closed(&self) -> bool {
        self.shared.lock().unwrap().read_closed
    }

    fn write_buffer(&mut self) -> &[u8] {
        if self.out_pos >= self.out.len() {
            let mut shared = self.shared.lock().unwrap();
            self.out = mem::take(&mut shared.to_send);
            self.out_pos = 0;
        }
        &self.out[self.out_pos..]
    }

    fn write_done(&mut self, n: usize) {
        self.out_pos += n;
    }

    fn write_close(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        shared.write_closed = true;
        shared.maybe_emit_closed();
    }

    // Closed only once every queued byte has been flushed, so the engine
    // never shuts the socket's write side on top of pending output.
    fn write_closed(&self) -> bool {
        let shared = self.shared.lock().unwrap();
        shared.write_closed && shared.to_send.is_empty() && self.out_pos >= self.out.len()
    }

    fn next_event(&mut self) -> Option<Event> {
        self.shared.lock().unwrap().events.pop_front()
    }

    fn has_event(&self) -> bool {
        !self.shared.lock().unwrap().events.is_empty()
    }

    fn finished(&self) -> bool {
        let shared = self.shared.lock().unwrap();
        shared.read_closed
            && shared.write_closed
            && shared.to_send.is_empty()
            && self.out_pos >= self.out.len()
            && shared.events.is_empty()
    }

    fn connected(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        shared.connected = true;
        shared.events.push_back(Event::TransportConnected);
    }

    fn tick(&mut self, now_millis: u64) -> Option<u64> {
        let mut shared = self.shared.lock().unwrap();
        shared.ticks += 1;
        shared.tick_interval.map(|interval| now_millis + interval)
    }

    fn wake(&mut self) {
        self.shared
            .lock()
            .unwrap()
            .events
            .push_back(Event::ConnectionWake);
    }

    fn set_error(&mut self, condition: Condition) {
        self.out.clear();
        self.out_pos = 0;
        let mut shared = self.shared.lock().unwrap();
        shared.to_send.clear();
        if shared.condition.is_none() {
            shared.condition = Some(condition);
        }
        shared.read_closed = true;
        shared.write_closed = true;
        shared.events.push_back(Event::TransportError);
        shared.maybe_emit_closed();
    }

    fn close(&mut self, condition: Option<Condition>) {
        self.out.clear();
        self.out_pos = 0;
        let mut shared = self.shared.lock().unwrap();
        shared.to_send.clear();
        if let Some(condition) = condition {
            if shared.condition.is_none() {
                shared.condition = Some(condition);
            }
            shared.events.push_back(Event::TransportError);
        }
        shared.read_closed = true;
        shared.write_closed = true;
        shared.maybe_emit_closed();
    }
}
