use crate::{Condition, Event};

/// The per-connection transport engine, seen from the proactor's side.
///
/// The proactor knows nothing about the wire protocol. It moves bytes
/// between the socket and the driver's two buffers, forwards timed ticks,
/// injects wake events, and drains the driver's event stream into the
/// connection's batch. Everything else is the driver's business.
///
/// One driver instance belongs to exactly one connection and is only ever
/// called by the connection's current working thread, so implementations
/// need no internal synchronization of their own (shared observation from
/// application threads is the implementation's choice).
///
/// `close` and `set_error` must be idempotent: the engine may close a
/// driver that already closed itself.
pub trait Driver: Send {
    /// Writable space for inbound bytes. An empty slice means the driver
    /// has no capacity and the engine stops reading until capacity
    /// returns.
    fn read_buffer(&mut self) -> &mut [u8];

    /// `n` bytes of the last [`read_buffer`](Driver::read_buffer) slice
    /// were filled.
    fn read_done(&mut self, n: usize);

    /// The peer closed its write side; no more bytes will arrive.
    fn read_close(&mut self);

    fn read_closed(&self) -> bool;

    /// Pending outbound bytes. The engine writes as much as the socket
    /// accepts and reports progress through
    /// [`write_done`](Driver::write_done).
    fn write_buffer(&mut self) -> &[u8];

    fn write_done(&mut self, n: usize);

    /// The driver will produce no more outbound bytes. Once the pending
    /// buffer is flushed the engine shuts down the socket's write side.
    fn write_close(&mut self);

    fn write_closed(&self) -> bool;

    /// Drains the next application-visible event.
    fn next_event(&mut self) -> Option<Event>;

    /// Peeks whether [`next_event`](Driver::next_event) would yield
    /// something.
    fn has_event(&self) -> bool;

    /// Both directions closed and every event drained; the connection
    /// endpoint can be torn down.
    fn finished(&self) -> bool;

    /// The transport connection is established (outbound connect
    /// completed, or an accepted socket was attached).
    fn connected(&mut self);

    /// Timed hook. Returns the next absolute deadline in monotonic
    /// milliseconds, if the driver wants one; the engine programs the
    /// per-connection timer accordingly.
    fn tick(&mut self, now_millis: u64) -> Option<u64>;

    /// Injects a [`ConnectionWake`](Event::ConnectionWake) into the
    /// driver's event stream, preserving event order.
    fn wake(&mut self);

    /// Records a transport error and closes both directions; the driver's
    /// terminal events follow.
    fn set_error(&mut self, condition: Condition);

    /// Orderly local close, optionally carrying a condition (as used by
    /// [`Proactor::disconnect`]).
    ///
    /// [`Proactor::disconnect`]: crate::Proactor::disconnect
    fn close(&mut self, condition: Option<Condition>);
}
