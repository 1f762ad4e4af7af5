use std::fmt;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::batch::{Batch, BatchInner};
use crate::condition::Condition;
use crate::context::Context;
use crate::driver::Driver;
use crate::event::Event;
use crate::interest::Interest;
use crate::proactor::{Attachment, Core};
use crate::sys::{self, Readiness};
use crate::timer::OneshotTimer;
use crate::token::Token;
use crate::wake::Wakeable;

/// How many times a batch-draining thread may top up the same connection
/// before it is forced back through the multiplexer.
pub(crate) const HOG_MAX: u32 = 3;

/// Handle to a connection endpoint.
///
/// Handles are cheap to clone and may be used from any thread. The
/// endpoint itself lives until its transport finishes (or the proactor is
/// dropped), independent of how many handles remain.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Schedules a [`ConnectionWake`] event on this connection. Any
    /// number of calls coalesce into one event until it is delivered.
    ///
    /// [`ConnectionWake`]: crate::Event::ConnectionWake
    pub fn wake(&self) {
        ConnectionInner::wake(&self.inner);
    }

    /// Begins an orderly local close and lets teardown run; the
    /// transport's terminal events are still delivered.
    pub fn release(&self) {
        ConnectionInner::release(&self.inner);
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Connection")
            .field(&Arc::as_ptr(&self.inner))
            .finish()
    }
}

pub(crate) struct ConnectionInner {
    core: Arc<Core>,
    timer: OneshotTimer,
    state: Mutex<State>,
}

struct State {
    ctx: Context,
    driver: Box<dyn Driver>,
    sock: Option<OwnedFd>,
    io_token: Token,
    timer_token: Token,
    timer_registered: bool,
    /// Peer address string as given to `connect`, kept for conditions.
    addr: String,
    addrs: Vec<SocketAddr>,
    addr_index: usize,
    /// Address resolution already ran (or was never needed).
    resolved: bool,
    connected: bool,
    read_blocked: bool,
    write_blocked: bool,
    wrote_shutdown: bool,
    /// Raw readiness harvested from the multiplexer, awaiting processing.
    new_events: Readiness,
    /// User wake calls not yet surfaced as an event.
    wake_count: u32,
    tick_pending: bool,
    timer_armed: bool,
    queued_disconnect: bool,
    disconnect_condition: Option<Condition>,
    /// What we most recently asked the multiplexer to watch; `None` after
    /// a one-shot delivery disarmed the socket.
    current_arm: Option<Interest>,
    hog_count: u32,
    finalized: bool,
}

impl ConnectionInner {
    fn new(core: Arc<Core>, driver: Box<dyn Driver>, addr: String) -> Arc<ConnectionInner> {
        let timer = match OneshotTimer::new() {
            Ok(timer) => timer,
            Err(err) => sys::fatal("timerfd_create", err),
        };
        let timer_token = core.next_token();
        Arc::new(ConnectionInner {
            core,
            timer,
            state: Mutex::new(State {
                ctx: Context::default(),
                driver,
                sock: None,
                io_token: Token(0),
                timer_token,
                timer_registered: false,
                addr,
                addrs: Vec::new(),
                addr_index: 0,
                resolved: false,
                connected: false,
                read_blocked: false,
                write_blocked: false,
                wrote_shutdown: false,
                new_events: Readiness::EMPTY,
                wake_count: 0,
                tick_pending: false,
                timer_armed: false,
                queued_disconnect: false,
                disconnect_condition: None,
                current_arm: None,
                hog_count: 0,
                finalized: false,
            }),
        })
    }

    fn register_timer(this: &Arc<ConnectionInner>, st: &mut State) {
        this.core.attach(
            st.timer_token,
            Attachment::ConnectionTimer(Arc::downgrade(this)),
        );
        if let Err(err) =
            this.core
                .poller
                .register(this.timer.raw_fd(), st.timer_token, Interest::READABLE)
        {
            sys::fatal("epoll_ctl add", err);
        }
        st.timer_registered = true;
    }

    /// Builds a dialing endpoint. Resolution and the first connect run on
    /// the first process pass, driven by the wake `Core::connect` enqueues.
    pub(crate) fn open(
        core: Arc<Core>,
        driver: Box<dyn Driver>,
        addr: &str,
    ) -> Arc<ConnectionInner> {
        let this = Self::new(core, driver, addr.to_owned());
        {
            let mut st = this.state.lock().unwrap();
            Self::register_timer(&this, &mut st);
        }
        this
    }

    /// Builds an endpoint around an accepted, already-connected socket.
    pub(crate) fn open_accepted(
        core: Arc<Core>,
        driver: Box<dyn Driver>,
        sock: OwnedFd,
        peer: SocketAddr,
    ) -> Arc<ConnectionInner> {
        let this = Self::new(core, driver, peer.to_string());
        {
            let mut st = this.state.lock().unwrap();
            Self::register_timer(&this, &mut st);
            st.resolved = true;
            st.connected = true;
            st.driver.connected();
            let token = this.core.next_token();
            st.io_token = token;
            this.core
                .attach(token, Attachment::ConnectionIo(Arc::downgrade(&this)));
            let interest = Interest::READABLE | Interest::WRITABLE;
            if let Err(err) = this.core.poller.register(sock.as_raw_fd(), token, interest) {
                sys::fatal("epoll_ctl add", err);
            }
            st.current_arm = Some(interest);
            st.sock = Some(sock);
        }
        this
    }

    /// Enqueues this endpoint on the wake queue so some polling thread
    /// processes it. Must run with the state lock held; the returned flag
    /// is for `Core::wake_notify` after unlocking.
    fn wake_self(this: &Arc<ConnectionInner>, st: &mut State) -> bool {
        if st.ctx.request_wake() {
            this.core.wake_queue.push(Wakeable::Connection(this.clone()))
        } else {
            false
        }
    }

    /// Schedules the first process pass without a user-visible wake event.
    pub(crate) fn kick(this: &Arc<ConnectionInner>) {
        let must_signal = {
            let mut st = this.state.lock().unwrap();
            Self::wake_self(this, &mut st)
        };
        this.core.wake_notify(must_signal);
    }

    pub(crate) fn wake(this: &Arc<ConnectionInner>) {
        let must_signal = {
            let mut st = this.state.lock().unwrap();
            st.wake_count += 1;
            Self::wake_self(this, &mut st)
        };
        this.core.wake_notify(must_signal);
    }

    pub(crate) fn release(this: &Arc<ConnectionInner>) {
        let must_signal = {
            let mut st = this.state.lock().unwrap();
            Self::begin_close(this, &mut st, None);
            Self::wake_self(this, &mut st)
        };
        this.core.wake_notify(must_signal);
    }

    /// Disconnect-sweep pass over this endpoint (one of two refcount
    /// halves; the other is taken by `finalize`).
    pub(crate) fn sweep(this: &Arc<ConnectionInner>, condition: Option<Condition>) {
        let must_signal = {
            let mut st = this.state.lock().unwrap();
            if st.finalized || st.ctx.disconnecting {
                // Already gone, or a previous sweep still owns the
                // refcount; settle both halves at once.
                this.core.sweep_skipped();
                return;
            }
            st.ctx.disconnecting = true;
            st.ctx.disconnect_ops = 2;
            if st.ctx.working {
                st.queued_disconnect = true;
                st.disconnect_condition = condition;
            } else {
                Self::begin_close(this, &mut st, condition);
            }
            st.ctx.disconnect_ops -= 1;
            Self::wake_self(this, &mut st)
        };
        this.core.wake_notify(must_signal);
    }

    /// The single entry point for readiness, timer, wake and top-up
    /// dispatch. Returns a batch when the driver has events to deliver;
    /// the caller then owns the endpoint until `done`.
    pub(crate) fn process(
        this: &Arc<ConnectionInner>,
        events: Readiness,
        timeout: bool,
        from_wake: bool,
        topup: bool,
    ) -> Option<Batch> {
        let mut st = this.state.lock().unwrap();

        // Fold the incoming signal into state before the ownership check,
        // so nothing is lost when another thread is working.
        if !events.is_empty() {
            st.new_events |= events;
        }
        if timeout {
            if this.timer.expire() > 0 {
                st.tick_pending = true;
            }
            st.timer_armed = false;
            if st.timer_registered {
                // The one-shot delivery disarmed the timer registration.
                if let Err(err) = this.core.poller.rearm(
                    this.timer.raw_fd(),
                    st.timer_token,
                    Interest::READABLE,
                ) {
                    sys::fatal("epoll_ctl mod", err);
                }
            }
        }
        if from_wake {
            st.ctx.wake_done();
        }

        if topup {
            debug_assert!(st.ctx.working);
            st.hog_count += 1;
            if st.hog_count > HOG_MAX {
                // Force the drain thread back through `done` and the
                // multiplexer before it starves everyone else.
                return None;
            }
        } else {
            if st.ctx.working {
                return None;
            }
            st.ctx.working = true;
        }

        if st.finalized {
            st.ctx.working = false;
            return None;
        }

        if !st.resolved && !st.ctx.closing {
            Self::maybe_connect(this, &mut st);
        }

        loop {
            if st.ctx.closing && Self::is_final(&st) {
                Self::finalize(this, &mut st);
                return None;
            }
            if st.driver.has_event() {
                // Hand the batch over; `working` stays set until done().
                return Some(Batch {
                    inner: BatchInner::Connection(Connection {
                        inner: this.clone(),
                    }),
                });
            }
            if st.ctx.closing || !Self::work_pending(&mut st) {
                break;
            }
            Self::do_work(this, &mut st);
        }

        if topup {
            // Still the working thread; release runs in done().
            return None;
        }

        st.ctx.working = false;
        st.hog_count = 0;
        if st.driver.finished() && !st.ctx.closing {
            Self::begin_close(this, &mut st, None);
        }
        if st.ctx.closing {
            if Self::is_final(&st) {
                Self::finalize(this, &mut st);
            }
        } else {
            Self::rearm_if_needed(this, &mut st);
        }
        None
    }

    /// Drains the next driver event for a batch, topping up from the
    /// engine when the driver runs dry.
    pub(crate) fn batch_next(this: &Arc<ConnectionInner>) -> Option<Event> {
        loop {
            {
                let mut st = this.state.lock().unwrap();
                debug_assert!(st.ctx.working);
                if let Some(event) = st.driver.next_event() {
                    return Some(event);
                }
            }
            Self::process(this, Readiness::EMPTY, false, false, true)?;
        }
    }

    /// Releases the endpoint after a batch drain: clears `working`,
    /// self-wakes if work accumulated while draining, rearms or finishes
    /// teardown.
    pub(crate) fn done(this: &Arc<ConnectionInner>) {
        let must_signal = {
            let mut st = this.state.lock().unwrap();
            st.ctx.working = false;
            st.hog_count = 0;
            let mut must_signal = false;
            if Self::work_pending(&mut st) || st.driver.has_event() {
                must_signal = Self::wake_self(this, &mut st);
            } else if st.driver.finished() && !st.ctx.closing {
                Self::begin_close(this, &mut st, None);
            }
            if st.ctx.closing {
                if Self::is_final(&st) {
                    Self::finalize(this, &mut st);
                }
            } else {
                Self::rearm_if_needed(this, &mut st);
            }
            must_signal
        };
        this.core.wake_notify(must_signal);
    }

    /// Anything left that the working thread could make progress on?
    fn work_pending(st: &mut State) -> bool {
        if st.ctx.closing {
            return false;
        }
        if !st.new_events.is_empty()
            || st.wake_count > 0
            || st.tick_pending
            || st.queued_disconnect
        {
            return true;
        }
        if !st.connected || st.sock.is_none() {
            return false;
        }
        let readable =
            !st.read_blocked && !st.driver.read_closed() && !st.driver.read_buffer().is_empty();
        let writable = !st.write_blocked && !st.driver.write_buffer().is_empty();
        readable || writable
    }

    /// One pass of the read/tick/write cycle plus connect transitions.
    fn do_work(this: &Arc<ConnectionInner>, st: &mut State) {
        let events = mem::take(&mut st.new_events);
        let wakes = mem::take(&mut st.wake_count);
        let tick_requested = mem::take(&mut st.tick_pending);

        if !events.is_empty() {
            // The one-shot delivery disarmed the socket.
            st.current_arm = None;
            if !st.connected {
                if events.is_hup() || events.is_error() {
                    Self::connect_failed(this, st);
                    return;
                } else if events.is_writable() {
                    Self::connect_done(st);
                }
            } else {
                // HUP/ERR on a connected socket only unblocks both
                // directions; the next read or write surfaces the errno.
                if events.is_readable() || events.is_hup() || events.is_error() {
                    st.read_blocked = false;
                }
                if events.is_writable() || events.is_hup() || events.is_error() {
                    st.write_blocked = false;
                }
            }
        }

        if wakes > 0 {
            st.driver.wake();
        }

        if st.queued_disconnect {
            st.queued_disconnect = false;
            let condition = st.disconnect_condition.take();
            Self::begin_close(this, st, condition);
            return;
        }

        if !st.connected || st.ctx.closing {
            return;
        }
        let fd = match &st.sock {
            Some(sock) => sock.as_raw_fd(),
            None => return,
        };

        // Read: one read per pass; the process loop keeps passing while
        // the connection stays runnable.
        let mut ticked = false;
        if !st.read_blocked && !st.driver.read_closed() {
            let buf = st.driver.read_buffer();
            if !buf.is_empty() {
                match sys::read(fd, buf) {
                    Ok(0) => st.driver.read_close(),
                    Ok(n) => {
                        st.driver.read_done(n);
                        let now = sys::now_millis();
                        if let Some(deadline) = st.driver.tick(now) {
                            Self::arm_tick(this, st, now, deadline);
                        }
                        ticked = true;
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        st.read_blocked = true;
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        Self::transport_error(this, st, &err, "reading from");
                        return;
                    }
                }
            }
        }

        if tick_requested && !ticked {
            let now = sys::now_millis();
            if let Some(deadline) = st.driver.tick(now) {
                Self::arm_tick(this, st, now, deadline);
            }
        }

        while !st.write_blocked {
            let (result, len) = {
                let buf = st.driver.write_buffer();
                if buf.is_empty() {
                    break;
                }
                (sys::write(fd, buf), buf.len())
            };
            match result {
                Ok(n) => {
                    st.driver.write_done(n);
                    if n < len {
                        st.write_blocked = true;
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    st.write_blocked = true;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    Self::transport_error(this, st, &err, "writing to");
                    return;
                }
            }
        }

        if !st.wrote_shutdown
            && st.driver.write_closed()
            && st.driver.write_buffer().is_empty()
        {
            st.wrote_shutdown = true;
            if let Err(err) = sys::shutdown_write(fd) {
                if err.kind() != io::ErrorKind::NotConnected {
                    Self::transport_error(this, st, &err, "shutting down");
                }
            }
        }
    }

    /// First-pass bootstrap for a dialing endpoint.
    fn maybe_connect(this: &Arc<ConnectionInner>, st: &mut State) {
        st.resolved = true;
        let (host, port) = sys::parse_addr(&st.addr);
        match sys::resolve(&host, &port, false) {
            Ok(addrs) => {
                st.addrs = addrs;
                st.addr_index = 0;
                Self::dial(this, st);
            }
            Err(err) => Self::transport_error(this, st, &err, "resolving"),
        }
    }

    /// Starts a non-blocking connect to the current resolved address,
    /// falling through the remaining addresses on immediate failure.
    fn dial(this: &Arc<ConnectionInner>, st: &mut State) {
        while st.addr_index < st.addrs.len() {
            let addr = st.addrs[st.addr_index];
            match sys::start_connect(&addr) {
                Ok((sock, _immediate)) => {
                    let token = this.core.next_token();
                    st.io_token = token;
                    this.core
                        .attach(token, Attachment::ConnectionIo(Arc::downgrade(this)));
                    // Connect completion arrives as writability; an
                    // immediately-connected socket reports writable too.
                    let interest = Interest::WRITABLE;
                    if let Err(err) = this.core.poller.register(sock.as_raw_fd(), token, interest)
                    {
                        sys::fatal("epoll_ctl add", err);
                    }
                    st.current_arm = Some(interest);
                    st.sock = Some(sock);
                    debug!("connecting to {} ({})", st.addr, addr);
                    return;
                }
                Err(err) => {
                    debug!("connect to {} ({}) failed: {}", st.addr, addr, err);
                    st.addr_index += 1;
                    if st.addr_index >= st.addrs.len() {
                        Self::transport_error(this, st, &err, "connecting to");
                        return;
                    }
                }
            }
        }
    }

    /// HUP/ERR before the socket connected: harvest `SO_ERROR`, drop the
    /// socket and try the next resolved address.
    fn connect_failed(this: &Arc<ConnectionInner>, st: &mut State) {
        let err = match &st.sock {
            Some(sock) => match sys::take_socket_error(sock.as_raw_fd()) {
                Ok(Some(err)) => err,
                Ok(None) => io::Error::new(io::ErrorKind::Other, "connection failed"),
                Err(err) => err,
            },
            None => return,
        };
        if let Some(sock) = st.sock.take() {
            this.core.deregister(sock.as_raw_fd(), st.io_token);
        }
        st.current_arm = None;
        st.addr_index += 1;
        if st.addr_index < st.addrs.len() {
            debug!("connect to {} failed ({}), trying next address", st.addr, err);
            Self::dial(this, st);
        } else {
            Self::transport_error(this, st, &err, "connecting to");
        }
    }

    fn connect_done(st: &mut State) {
        st.connected = true;
        st.read_blocked = false;
        st.write_blocked = false;
        st.driver.connected();
        debug!("connected to {}", st.addr);
    }

    fn arm_tick(this: &Arc<ConnectionInner>, st: &mut State, now: u64, deadline: u64) {
        let delay = deadline.saturating_sub(now).max(1);
        this.timer.set(delay);
        st.timer_armed = true;
    }

    /// Formats a per-connection fatal error onto the driver and begins
    /// teardown.
    fn transport_error(this: &Arc<ConnectionInner>, st: &mut State, err: &io::Error, doing: &str) {
        let condition = Condition::from_io(err, &format!("{} {}", doing, st.addr));
        debug!("transport error on {}: {}", st.addr, condition);
        st.driver.set_error(condition);
        Self::begin_close(this, st, None);
    }

    /// Stops polling, cancels the timer and closes the driver. Events
    /// already inside the driver are still delivered before the endpoint
    /// becomes final.
    fn begin_close(this: &Arc<ConnectionInner>, st: &mut State, condition: Option<Condition>) {
        if st.ctx.closing {
            return;
        }
        st.ctx.closing = true;
        st.driver.close(condition);
        if let Some(sock) = st.sock.take() {
            this.core.deregister(sock.as_raw_fd(), st.io_token);
        }
        st.current_arm = None;
        if st.timer_registered {
            st.timer_registered = false;
            this.core.deregister(this.timer.raw_fd(), st.timer_token);
        }
        if st.timer_armed {
            st.timer_armed = false;
            this.timer.set(0);
        }
    }

    /// No multiplexer arm, no pending events, no outstanding wake ops:
    /// safe to tear down.
    fn is_final(st: &State) -> bool {
        st.ctx.closing && st.ctx.wake_ops == 0 && st.sock.is_none() && !st.driver.has_event()
    }

    fn finalize(this: &Arc<ConnectionInner>, st: &mut State) {
        if st.finalized {
            return;
        }
        st.finalized = true;
        st.ctx.working = false;
        let sweep_done = if st.ctx.disconnecting && st.ctx.disconnect_ops > 0 {
            st.ctx.disconnect_ops -= 1;
            st.ctx.disconnect_ops == 0
        } else {
            false
        };
        debug!("connection to {} finalized", st.addr);
        this.core.remove_connection(this, sweep_done);
    }

    /// Forced teardown from `Proactor` drop; no polling threads remain.
    pub(crate) fn force_shutdown(this: &Arc<ConnectionInner>) {
        let mut st = this.state.lock().unwrap();
        st.ctx.closing = true;
        st.ctx.wake_ops = 0;
        st.finalized = true;
        if let Some(sock) = st.sock.take() {
            this.core.deregister(sock.as_raw_fd(), st.io_token);
        }
        if st.timer_registered {
            st.timer_registered = false;
            this.core.deregister(this.timer.raw_fd(), st.timer_token);
        }
        st.driver.close(None);
    }

    /// Computes the rearm mask for an idle connection: read interest iff
    /// reading is blocked and the read side is open, write interest iff
    /// writing is blocked with the write side open, or there are bytes to
    /// write. An empty mask is never armed.
    fn rearm_if_needed(this: &Arc<ConnectionInner>, st: &mut State) {
        let fd = match &st.sock {
            Some(sock) => sock.as_raw_fd(),
            None => return,
        };
        if !st.connected {
            // The connect arm is already in place.
            return;
        }
        let mut interest = None;
        if st.read_blocked && !st.driver.read_closed() {
            interest = Some(Interest::READABLE);
        }
        let write_wanted = (st.write_blocked && !st.driver.write_closed())
            || (!st.write_blocked && !st.driver.write_buffer().is_empty());
        if write_wanted {
            interest = Some(match interest {
                Some(interest) => interest | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        if let Some(interest) = interest {
            if st.current_arm != Some(interest) {
                st.current_arm = Some(interest);
                if let Err(err) = this.core.poller.rearm(fd, st.io_token, interest) {
                    sys::fatal("epoll_ctl mod", err);
                }
            }
        }
    }
}
