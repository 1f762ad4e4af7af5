use std::fmt;
use std::sync::Arc;

use crate::connection::{Connection, ConnectionInner};
use crate::event::Event;
use crate::listener::Listener;
use crate::proactor::Core;

/// A serialized batch of events for one endpoint, or for the proactor
/// itself.
///
/// Exactly one thread holds a given endpoint's batch at a time; while it
/// does, no other thread touches that endpoint. Drain it with
/// [`next_event`] and hand it back through [`Proactor::done`], which
/// releases the endpoint and rearms its descriptors as needed.
///
/// [`next_event`]: Batch::next_event
/// [`Proactor::done`]: crate::Proactor::done
pub struct Batch {
    pub(crate) inner: BatchInner,
}

pub(crate) enum BatchInner {
    Proactor {
        core: Arc<Core>,
        /// A batch carries at most one interrupt, so that N interrupts
        /// release N blocked threads.
        interrupted: bool,
    },
    Connection(Connection),
    Listener(Listener),
}

impl Batch {
    /// Returns the next event, or `None` once the batch is drained.
    ///
    /// For a connection batch this may invoke the transport engine to top
    /// up the batch, bounded by the hog limit.
    pub fn next_event(&mut self) -> Option<Event> {
        match &mut self.inner {
            BatchInner::Proactor { core, interrupted } => core.next_batch_event(interrupted),
            BatchInner::Connection(connection) => ConnectionInner::batch_next(&connection.inner),
            BatchInner::Listener(listener) => listener.inner.batch_next(),
        }
    }

    /// The connection this batch belongs to, if it is a connection batch.
    pub fn connection(&self) -> Option<&Connection> {
        match &self.inner {
            BatchInner::Connection(connection) => Some(connection),
            _ => None,
        }
    }

    /// The listener this batch belongs to, if it is a listener batch.
    pub fn listener(&self) -> Option<&Listener> {
        match &self.inner {
            BatchInner::Listener(listener) => Some(listener),
            _ => None,
        }
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.inner {
            BatchInner::Proactor { .. } => "proactor",
            BatchInner::Connection(..) => "connection",
            BatchInner::Listener(..) => "listener",
        };
        f.debug_tuple("Batch").field(&kind).finish()
    }
}
