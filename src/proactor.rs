use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::trace;

use crate::batch::{Batch, BatchInner};
use crate::condition::Condition;
use crate::connection::{Connection, ConnectionInner};
use crate::context::Context;
use crate::driver::Driver;
use crate::event::Event;
use crate::interest::Interest;
use crate::listener::{Listener, ListenerInner};
use crate::sys::{self, EventFd, Poller, Readiness};
use crate::timer::OneshotTimer;
use crate::token::Token;
use crate::wake::{WakeQueue, Wakeable};

const WAKE_TOKEN: Token = Token(0);
const TIMER_TOKEN: Token = Token(1);
const FIRST_DYNAMIC_TOKEN: usize = 2;

/// A multithreaded proactor.
///
/// The proactor multiplexes any number of TCP connections and listeners
/// onto one readiness set and hands out serialized event [`Batch`]es:
/// while one thread drains an endpoint's batch, no other thread touches
/// that endpoint, even though every thread drives the same engine through
/// [`wait`]/[`get`]/[`done`].
///
/// There is no internal thread pool; the engine runs entirely on the
/// threads that call into it.
///
/// [`wait`]: Proactor::wait
/// [`get`]: Proactor::get
/// [`done`]: Proactor::done
pub struct Proactor {
    core: Arc<Core>,
}

impl Proactor {
    pub fn new() -> io::Result<Proactor> {
        Ok(Proactor {
            core: Arc::new(Core::new()?),
        })
    }

    /// Blocks until an event batch is available.
    pub fn wait(&self) -> Batch {
        loop {
            match Core::poll_step(&self.core, true) {
                PollStep::Ready(batch) => return batch,
                PollStep::Empty | PollStep::Again => {}
            }
        }
    }

    /// Returns an event batch if one is ready without blocking.
    pub fn get(&self) -> Option<Batch> {
        loop {
            match Core::poll_step(&self.core, false) {
                PollStep::Ready(batch) => return Some(batch),
                PollStep::Empty => return None,
                PollStep::Again => {}
            }
        }
    }

    /// Returns a drained batch, releasing its endpoint to other threads
    /// and rearming descriptors as needed.
    pub fn done(&self, batch: Batch) {
        match batch.inner {
            BatchInner::Proactor { .. } => Core::proactor_done(&self.core),
            BatchInner::Connection(connection) => ConnectionInner::done(&connection.inner),
            BatchInner::Listener(listener) => ListenerInner::done(&listener.inner),
        }
    }

    /// Queues one [`Event::Interrupt`]. K calls produce exactly K events
    /// across subsequent batches; interrupts are never coalesced.
    pub fn interrupt(&self) {
        Core::interrupt(&self.core);
    }

    /// Arms the shared timeout. Re-arming before expiry supersedes the
    /// previous deadline; zero means "already due" and fires at once.
    pub fn set_timeout(&self, millis: u64) {
        Core::set_timeout(&self.core, millis);
    }

    /// Cancels the shared timeout; a pending but undelivered expiry is
    /// suppressed.
    pub fn cancel_timeout(&self) {
        Core::cancel_timeout(&self.core);
    }

    /// Begins an orderly close of every endpoint, optionally applying
    /// `condition` to each. Safe to call while worker threads are
    /// draining batches; endpoints owned by a worker pick the disconnect
    /// up when their current batch completes.
    pub fn disconnect(&self, condition: Option<Condition>) {
        Core::disconnect(&self.core, condition);
    }

    /// Opens an outbound connection to `addr` (`host:port`) driven by
    /// `driver`. Resolution and connection setup run on a polling thread;
    /// failures are delivered through the driver's event stream.
    pub fn connect(&self, driver: Box<dyn Driver>, addr: &str) -> Connection {
        let conn = ConnectionInner::open(self.core.clone(), driver, addr);
        self.core
            .add_endpoint(EndpointRef::Connection(conn.clone()));
        ConnectionInner::kick(&conn);
        Connection { inner: conn }
    }

    /// Opens a listener on `addr` (`host:port`, empty host for any
    /// interface), binding one socket per resolved address. Setup
    /// failures are delivered as [`Event::ListenerClose`] with a
    /// condition.
    pub fn listen(&self, addr: &str, backlog: u32) -> Listener {
        let inner = ListenerInner::open(&self.core, addr, backlog);
        self.core
            .add_endpoint(EndpointRef::Listener(inner.clone()));
        ListenerInner::kick(&inner);
        Listener { inner }
    }

    /// Monotonic milliseconds, the time base for [`set_timeout`] and
    /// driver ticks.
    ///
    /// [`set_timeout`]: Proactor::set_timeout
    pub fn now(&self) -> u64 {
        sys::now_millis()
    }
}

impl Drop for Proactor {
    fn drop(&mut self) {
        Core::shutdown(&self.core);
    }
}

impl std::fmt::Debug for Proactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proactor").finish_non_exhaustive()
    }
}

enum PollStep {
    /// A batch is ready for the caller.
    Ready(Batch),
    /// The multiplexer had nothing (timeout, EINTR or spurious return).
    Empty,
    /// An event was dispatched but produced no batch; poll again.
    Again,
}

/// What a registration token resolves to. `Weak` references keep the
/// registry from prolonging endpoint lifetimes; an upgrade failure means
/// the endpoint is already gone and the event is stale.
#[derive(Clone)]
pub(crate) enum Attachment {
    ConnectionIo(Weak<ConnectionInner>),
    ConnectionTimer(Weak<ConnectionInner>),
    ListenerIo(Weak<ListenerInner>, usize),
}

#[derive(Clone)]
pub(crate) enum EndpointRef {
    Connection(Arc<ConnectionInner>),
    Listener(Arc<ListenerInner>),
}

pub(crate) struct Core {
    pub(crate) poller: Poller,
    pub(crate) wake_queue: WakeQueue,
    wake_fd: EventFd,
    timer: OneshotTimer,
    registry: Mutex<HashMap<Token, Attachment>>,
    tokens: AtomicUsize,
    sched: Mutex<Sched>,
}

/// Proactor-scoped scheduling state, guarded by the proactor's context
/// lock.
struct Sched {
    ctx: Context,
    endpoints: Vec<EndpointRef>,
    /// Interrupts not yet attached to any batch.
    interrupts_pending: u32,
    /// Interrupts deferred into currently- or future-drained batches.
    interrupts_deferred: u32,
    /// Endpoints still being swept by `disconnect`.
    disconnects_pending: u32,
    inactive: bool,
    need_inactive: bool,
    timer_armed: bool,
    timer_expired: bool,
    timer_cancelled: bool,
    shutting_down: bool,
}

impl Core {
    fn new() -> io::Result<Core> {
        let poller = Poller::new()?;
        let wake_fd = EventFd::new()?;
        let timer = OneshotTimer::new()?;
        poller.register(wake_fd.as_raw_fd(), WAKE_TOKEN, Interest::READABLE)?;
        poller.register(timer.raw_fd(), TIMER_TOKEN, Interest::READABLE)?;
        Ok(Core {
            poller,
            wake_queue: WakeQueue::new(),
            wake_fd,
            timer,
            registry: Mutex::new(HashMap::new()),
            tokens: AtomicUsize::new(FIRST_DYNAMIC_TOKEN),
            sched: Mutex::new(Sched {
                ctx: Context::default(),
                endpoints: Vec::new(),
                interrupts_pending: 0,
                interrupts_deferred: 0,
                disconnects_pending: 0,
                inactive: false,
                need_inactive: false,
                timer_armed: false,
                timer_expired: false,
                timer_cancelled: false,
                shutting_down: false,
            }),
        })
    }

    /// One multiplexer call, one classification, one dispatch.
    fn poll_step(this: &Arc<Core>, block: bool) -> PollStep {
        let timeout = if block { -1 } else { 0 };
        let (token, readiness) = match this.poller.wait(timeout) {
            Ok(Some(event)) => event,
            Ok(None) => return PollStep::Empty,
            Err(err) => sys::fatal("epoll_wait", err),
        };
        trace!("dispatching token={:?} readiness={:?}", token, readiness);
        let batch = match token {
            WAKE_TOKEN => {
                let popped = this.wake_queue.pop(&this.wake_fd);
                // The one-shot signal registration re-fires until the
                // queue drains.
                if let Err(err) =
                    this.poller
                        .rearm(this.wake_fd.as_raw_fd(), WAKE_TOKEN, Interest::READABLE)
                {
                    sys::fatal("epoll_ctl mod", err);
                }
                match popped {
                    Some(Wakeable::Proactor) => Self::process(this, false, true),
                    Some(Wakeable::Connection(conn)) => {
                        ConnectionInner::process(&conn, Readiness::EMPTY, false, true, false)
                    }
                    Some(Wakeable::Listener(listener)) => {
                        ListenerInner::process(&listener, None, Readiness::EMPTY, true)
                    }
                    None => None,
                }
            }
            TIMER_TOKEN => {
                let honored = this.timer.expire();
                if let Err(err) =
                    this.poller
                        .rearm(this.timer.raw_fd(), TIMER_TOKEN, Interest::READABLE)
                {
                    sys::fatal("epoll_ctl mod", err);
                }
                Self::process(this, honored > 0, false)
            }
            token => match this.lookup(token) {
                Some(Attachment::ConnectionIo(conn)) => conn
                    .upgrade()
                    .and_then(|conn| ConnectionInner::process(&conn, readiness, false, false, false)),
                Some(Attachment::ConnectionTimer(conn)) => conn.upgrade().and_then(|conn| {
                    ConnectionInner::process(&conn, Readiness::EMPTY, true, false, false)
                }),
                Some(Attachment::ListenerIo(listener, index)) => {
                    listener.upgrade().and_then(|listener| {
                        ListenerInner::process(&listener, Some(index), readiness, false)
                    })
                }
                // Deregistered while the event was in flight.
                None => None,
            },
        };
        match batch {
            Some(batch) => PollStep::Ready(batch),
            None => PollStep::Again,
        }
    }

    /// The proactor's own process routine: fold the timer signal, then
    /// claim ownership if a proactor batch is due.
    fn process(this: &Arc<Core>, timeout_fired: bool, from_wake: bool) -> Option<Batch> {
        let mut sched = this.sched.lock().unwrap();
        if from_wake {
            sched.ctx.wake_done();
        }
        if timeout_fired && sched.timer_armed && !sched.timer_cancelled {
            sched.timer_armed = false;
            sched.timer_expired = true;
        }
        if !sched.ctx.working && Self::batch_pending(&sched) {
            sched.ctx.working = true;
            return Some(Batch {
                inner: BatchInner::Proactor {
                    core: this.clone(),
                    interrupted: false,
                },
            });
        }
        None
    }

    fn batch_pending(sched: &Sched) -> bool {
        sched.interrupts_deferred > 0
            || (sched.timer_expired && !sched.timer_cancelled)
            || sched.interrupts_pending > 0
            || sched.need_inactive
    }

    /// Emits the next proactor-scoped event for the open batch.
    /// Interrupts keep their count-N-in, N-out property and arrive at
    /// most one per batch, so each one releases a separate thread;
    /// timeouts are coalesced; inactive fires once per transition.
    pub(crate) fn next_batch_event(&self, interrupted: &mut bool) -> Option<Event> {
        let mut sched = self.sched.lock().unwrap();
        debug_assert!(sched.ctx.working);
        if !*interrupted {
            if sched.interrupts_deferred > 0 {
                sched.interrupts_deferred -= 1;
                *interrupted = true;
                return Some(Event::Interrupt);
            }
            if sched.interrupts_pending > 0 {
                // One goes out with this batch; the rest are deferred to
                // their own batches, never coalesced.
                sched.interrupts_deferred += sched.interrupts_pending - 1;
                sched.interrupts_pending = 0;
                *interrupted = true;
                return Some(Event::Interrupt);
            }
        }
        if sched.timer_expired && !sched.timer_cancelled {
            sched.timer_expired = false;
            return Some(Event::Timeout);
        }
        if sched.need_inactive {
            sched.need_inactive = false;
            return Some(Event::Inactive);
        }
        None
    }

    fn proactor_done(this: &Arc<Core>) {
        let must_signal = {
            let mut sched = this.sched.lock().unwrap();
            sched.ctx.working = false;
            Self::check_inactive(&mut sched);
            if Self::batch_pending(&sched) && sched.ctx.request_wake() {
                this.wake_queue.push(Wakeable::Proactor)
            } else {
                false
            }
        };
        this.wake_notify(must_signal);
    }

    /// Marks the inactive transition once nothing keeps the proactor
    /// busy: no endpoints, no sweep in progress, no armed or undelivered
    /// timeout, not shutting down.
    fn check_inactive(sched: &mut Sched) {
        if !sched.inactive
            && sched.endpoints.is_empty()
            && sched.disconnects_pending == 0
            && !sched.timer_armed
            && !sched.timer_expired
            && !sched.shutting_down
        {
            sched.inactive = true;
            sched.need_inactive = true;
        }
    }

    fn interrupt(this: &Arc<Core>) {
        let must_signal = {
            let mut sched = this.sched.lock().unwrap();
            sched.interrupts_pending += 1;
            if sched.ctx.request_wake() {
                this.wake_queue.push(Wakeable::Proactor)
            } else {
                false
            }
        };
        this.wake_notify(must_signal);
    }

    fn set_timeout(this: &Arc<Core>, millis: u64) {
        let must_signal = {
            let mut sched = this.sched.lock().unwrap();
            sched.timer_cancelled = false;
            sched.inactive = false;
            if millis == 0 {
                // Already due.
                sched.timer_armed = false;
                sched.timer_expired = true;
                if sched.ctx.request_wake() {
                    this.wake_queue.push(Wakeable::Proactor)
                } else {
                    false
                }
            } else {
                sched.timer_armed = true;
                sched.timer_expired = false;
                this.timer.set(millis);
                false
            }
        };
        this.wake_notify(must_signal);
    }

    fn cancel_timeout(this: &Arc<Core>) {
        let must_signal = {
            let mut sched = this.sched.lock().unwrap();
            sched.timer_cancelled = true;
            sched.timer_armed = false;
            sched.timer_expired = false;
            this.timer.set(0);
            Self::check_inactive(&mut sched);
            if sched.need_inactive && sched.ctx.request_wake() {
                this.wake_queue.push(Wakeable::Proactor)
            } else {
                false
            }
        };
        this.wake_notify(must_signal);
    }

    /// Takes the endpoint list and sweeps every endpoint with a deferred
    /// or immediate close. Endpoints currently owned by a worker get the
    /// disconnect queued; the rest begin closing right here.
    fn disconnect(this: &Arc<Core>, condition: Option<Condition>) {
        let snapshot: Vec<EndpointRef> = {
            let mut sched = this.sched.lock().unwrap();
            if sched.endpoints.is_empty() {
                return;
            }
            sched.disconnects_pending += sched.endpoints.len() as u32;
            sched.endpoints.clone()
        };
        for endpoint in snapshot {
            match endpoint {
                EndpointRef::Connection(conn) => ConnectionInner::sweep(&conn, condition.clone()),
                EndpointRef::Listener(listener) => {
                    ListenerInner::sweep(&listener, condition.clone())
                }
            }
        }
    }

    /// Forced shutdown; the caller guarantees no threads remain in
    /// `wait`/`get`.
    fn shutdown(this: &Arc<Core>) {
        let endpoints = {
            let mut sched = this.sched.lock().unwrap();
            sched.shutting_down = true;
            mem::take(&mut sched.endpoints)
        };
        for endpoint in endpoints {
            match endpoint {
                EndpointRef::Connection(conn) => ConnectionInner::force_shutdown(&conn),
                EndpointRef::Listener(listener) => ListenerInner::force_shutdown(&listener),
            }
        }
        // Break the remaining reference cycles through the core.
        this.wake_queue.clear();
        this.registry.lock().unwrap().clear();
    }

    pub(crate) fn next_token(&self) -> Token {
        Token(self.tokens.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn attach(&self, token: Token, attachment: Attachment) {
        self.registry.lock().unwrap().insert(token, attachment);
    }

    fn lookup(&self, token: Token) -> Option<Attachment> {
        self.registry.lock().unwrap().get(&token).cloned()
    }

    /// Removes a descriptor from the multiplexer and drops its registry
    /// entry; in-flight events for the token become harmless misses.
    pub(crate) fn deregister(&self, fd: RawFd, token: Token) {
        if let Err(err) = self.poller.deregister(fd) {
            sys::fatal("epoll_ctl del", err);
        }
        self.registry.lock().unwrap().remove(&token);
    }

    /// Second half of the wake protocol: writes the signal fd, with no
    /// locks required.
    pub(crate) fn wake_notify(&self, must_signal: bool) {
        if must_signal {
            if let Err(err) = self.wake_fd.signal() {
                sys::fatal("eventfd write", err);
            }
        }
    }

    pub(crate) fn add_endpoint(&self, endpoint: EndpointRef) {
        let mut sched = self.sched.lock().unwrap();
        sched.inactive = false;
        sched.endpoints.push(endpoint);
    }

    pub(crate) fn remove_connection(&self, conn: &Arc<ConnectionInner>, sweep_done: bool) {
        let must_signal = {
            let mut sched = self.sched.lock().unwrap();
            sched.endpoints.retain(|endpoint| match endpoint {
                EndpointRef::Connection(other) => !Arc::ptr_eq(other, conn),
                EndpointRef::Listener(..) => true,
            });
            Self::endpoint_removed(&mut sched, sweep_done)
                && sched.ctx.request_wake()
                && self.wake_queue.push(Wakeable::Proactor)
        };
        self.wake_notify(must_signal);
    }

    pub(crate) fn remove_listener(&self, listener: &Arc<ListenerInner>, sweep_done: bool) {
        let must_signal = {
            let mut sched = self.sched.lock().unwrap();
            sched.endpoints.retain(|endpoint| match endpoint {
                EndpointRef::Listener(other) => !Arc::ptr_eq(other, listener),
                EndpointRef::Connection(..) => true,
            });
            Self::endpoint_removed(&mut sched, sweep_done)
                && sched.ctx.request_wake()
                && self.wake_queue.push(Wakeable::Proactor)
        };
        self.wake_notify(must_signal);
    }

    /// A sweep reached an endpoint that already finalized; account for
    /// both refcount halves at once.
    pub(crate) fn sweep_skipped(&self) {
        let must_signal = {
            let mut sched = self.sched.lock().unwrap();
            Self::endpoint_removed(&mut sched, true)
                && sched.ctx.request_wake()
                && self.wake_queue.push(Wakeable::Proactor)
        };
        self.wake_notify(must_signal);
    }

    /// Common tail of endpoint removal; returns whether the inactive
    /// transition needs a wake.
    fn endpoint_removed(sched: &mut Sched, sweep_done: bool) -> bool {
        if sweep_done {
            debug_assert!(sched.disconnects_pending > 0);
            sched.disconnects_pending = sched.disconnects_pending.saturating_sub(1);
        }
        Self::check_inactive(sched);
        sched.need_inactive
    }
}
