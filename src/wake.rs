use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::connection::ConnectionInner;
use crate::listener::ListenerInner;
use crate::sys::{self, EventFd};

/// A context with pending work, queued for any polling thread to claim.
///
/// Entries hold strong references, so a context can never be freed while
/// it is on the queue; the freeing path runs only once `wake_ops` drops
/// back to zero.
#[derive(Clone)]
pub(crate) enum Wakeable {
    Proactor,
    Connection(Arc<ConnectionInner>),
    Listener(Arc<ListenerInner>),
}

/// FIFO of contexts with pending work.
///
/// The subsystem works in two halves: enqueuing happens while the waking
/// thread still holds the endpoint's lock (that is what makes the
/// coalescing check against `wake_ops` race free), while the eventfd
/// write happens after every lock is released. One signal unit unblocks
/// one polling thread no matter how many contexts are queued; the
/// one-shot registration keeps re-firing through the multiplexer until
/// the queue drains.
#[derive(Debug, Default)]
pub(crate) struct WakeQueue {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<Wakeable>,
    /// True while at least one signal unit is outstanding on the eventfd.
    signalled: bool,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("queued", &self.queue.len())
            .field("signalled", &self.signalled)
            .finish()
    }
}

impl WakeQueue {
    pub(crate) fn new() -> WakeQueue {
        WakeQueue::default()
    }

    /// Appends a context. Returns true when the caller must write the
    /// signal fd once all locks are released.
    pub(crate) fn push(&self, wakeable: Wakeable) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(wakeable);
        if !inner.signalled {
            inner.signalled = true;
            true
        } else {
            false
        }
    }

    /// Pops the next queued context. Drains the signal fd when the queue
    /// empties, so an idle proactor does not spin on the rearmed
    /// registration.
    pub(crate) fn pop(&self, signal: &EventFd) -> Option<Wakeable> {
        let mut inner = self.inner.lock().unwrap();
        let popped = inner.queue.pop_front();
        if inner.queue.is_empty() && inner.signalled {
            if let Err(err) = signal.drain() {
                sys::fatal("eventfd read", err);
            }
            inner.signalled = false;
        }
        popped
    }

    /// Drops every queued entry. Only used on proactor teardown, when no
    /// polling threads remain.
    pub(crate) fn clear(&self) {
        self.inner.lock().unwrap().queue.clear();
    }
}
