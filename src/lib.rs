//! A multithreaded proactor for non-blocking TCP I/O.
//!
//! Pio multiplexes any number of TCP connections and listening sockets
//! onto one kernel readiness set and hands application threads serialized
//! event [`Batch`]es. Any number of threads may drive the engine through
//! [`Proactor::wait`], [`Proactor::get`] and [`Proactor::done`]; the
//! engine guarantees that at most one of them works on a given endpoint
//! at a time, while readiness events, wakes, timer expirations and
//! disconnect sweeps keep flowing for everyone else.
//!
//! The wire protocol is not pio's business: each connection is driven by
//! a [`Driver`], the transport engine supplied by the application. The
//! proactor moves bytes between the socket and the driver's buffers,
//! forwards timed ticks and wakes, and delivers the driver's events in
//! order.
//!
//! # Example
//!
//! ```
//! use pio::{Event, Proactor};
//!
//! # fn main() -> std::io::Result<()> {
//! let proactor = Proactor::new()?;
//! proactor.interrupt();
//!
//! let mut batch = proactor.wait();
//! assert_eq!(batch.next_event(), Some(Event::Interrupt));
//! assert_eq!(batch.next_event(), None);
//! proactor.done(batch);
//! # Ok(())
//! # }
//! ```
//!
//! # Threading model
//!
//! There is no internal thread pool. Worker threads call [`Proactor::wait`]
//! (blocking) or [`Proactor::get`] (non-blocking); each call performs at
//! most one readiness system call per loop iteration, dispatches the
//! result to the owning endpoint and either returns a non-empty batch or
//! keeps looping. Draining a batch and calling [`Proactor::done`] is what
//! releases the endpoint to other threads.
//!
//! Only `wait` ever blocks. `get`, `done`, [`Proactor::interrupt`],
//! [`Connection::wake`], the timeout calls and
//! [`Proactor::disconnect`] never block on I/O; they may briefly contend
//! on small locks.

mod batch;
mod condition;
mod connection;
mod context;
mod driver;
mod event;
mod interest;
mod listener;
mod proactor;
mod sys;
mod timer;
mod token;
mod wake;

pub use crate::batch::Batch;
pub use crate::condition::Condition;
pub use crate::connection::Connection;
pub use crate::driver::Driver;
pub use crate::event::Event;
pub use crate::listener::Listener;
pub use crate::proactor::Proactor;
