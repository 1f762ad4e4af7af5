use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::batch::{Batch, BatchInner};
use crate::condition::Condition;
use crate::connection::{Connection, ConnectionInner};
use crate::context::Context;
use crate::driver::Driver;
use crate::event::Event;
use crate::interest::Interest;
use crate::proactor::{Attachment, Core, EndpointRef};
use crate::sys::{self, Readiness};
use crate::token::Token;
use crate::wake::Wakeable;

/// Handle to a listener endpoint.
///
/// A listener binds one socket per resolved address and surfaces
/// [`ListenerAccept`] events through its batches. It does not re-fire for
/// a pending connection until [`accept`] consumes it.
///
/// [`ListenerAccept`]: crate::Event::ListenerAccept
/// [`accept`]: Listener::accept
#[derive(Clone)]
pub struct Listener {
    pub(crate) inner: Arc<ListenerInner>,
}

impl Listener {
    /// Accepts the pending connection, attaching `driver` as its
    /// transport. Call once per [`ListenerAccept`](crate::Event::ListenerAccept)
    /// event.
    pub fn accept(&self, driver: Box<dyn Driver>) -> io::Result<Connection> {
        ListenerInner::accept(&self.inner, driver)
    }

    /// Begins closing the listener; a [`ListenerClose`](crate::Event::ListenerClose)
    /// event follows.
    pub fn close(&self) {
        ListenerInner::close(&self.inner);
    }

    /// The listener's error condition, if any step of setup or accepting
    /// failed.
    pub fn condition(&self) -> Option<Condition> {
        self.inner.state.lock().unwrap().condition.clone()
    }

    /// The first bound address, useful after listening on port 0. `None`
    /// once the listener closed or if binding failed.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let st = self.inner.state.lock().unwrap();
        st.sockets.first().map(|socket| socket.addr)
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Listener) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Listener {}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Listener")
            .field(&Arc::as_ptr(&self.inner))
            .finish()
    }
}

pub(crate) struct ListenerInner {
    core: Arc<Core>,
    state: Mutex<State>,
}

struct ListenSocket {
    fd: OwnedFd,
    token: Token,
    addr: SocketAddr,
}

struct State {
    ctx: Context,
    sockets: Vec<ListenSocket>,
    queue: VecDeque<Event>,
    condition: Option<Condition>,
    /// Socket index flagged ready-to-accept; cleared by `accept`.
    acceptable: Option<usize>,
    /// Socket index last accepted from; `done` rearms it.
    accepted: Option<usize>,
    armed: bool,
    queued_disconnect: bool,
    disconnect_condition: Option<Condition>,
    close_dispatched: bool,
    finalized: bool,
}

impl ListenerInner {
    /// Resolves and binds synchronously (so port 0 addresses can be
    /// queried right away); failures still arrive through the event
    /// stream as `ListenerClose` plus a condition, not as a return value.
    /// The caller links the endpoint and kicks the first delivery.
    pub(crate) fn open(core: &Arc<Core>, addr: &str, backlog: u32) -> Arc<ListenerInner> {
        let this = Arc::new(ListenerInner {
            core: core.clone(),
            state: Mutex::new(State {
                ctx: Context::default(),
                sockets: Vec::new(),
                queue: VecDeque::new(),
                condition: None,
                acceptable: None,
                accepted: None,
                armed: false,
                queued_disconnect: false,
                disconnect_condition: None,
                close_dispatched: false,
                finalized: false,
            }),
        });
        {
            let mut st = this.state.lock().unwrap();
            st.queue.push_back(Event::ListenerOpen);
            match Self::bind_all(&this, &mut st, addr, backlog) {
                Ok(()) => {
                    st.armed = true;
                    debug!("listening on {}", addr);
                }
                Err(err) => {
                    debug!("listen on {} failed: {}", addr, err);
                    st.condition =
                        Some(Condition::from_io(&err, &format!("listening on {}", addr)));
                    Self::begin_close(&this, &mut st);
                }
            }
        }
        this
    }

    fn bind_all(
        this: &Arc<ListenerInner>,
        st: &mut State,
        addr: &str,
        backlog: u32,
    ) -> io::Result<()> {
        let (host, port) = sys::parse_addr(addr);
        let addrs = sys::resolve(&host, &port, true)?;
        for addr in addrs {
            let sock = sys::bind_listen(&addr, backlog)?;
            let local = sys::local_addr(sock.as_raw_fd())?;
            let token = this.core.next_token();
            this.core.attach(
                token,
                Attachment::ListenerIo(Arc::downgrade(this), st.sockets.len()),
            );
            this.core
                .poller
                .register(sock.as_raw_fd(), token, Interest::READABLE)?;
            st.sockets.push(ListenSocket {
                fd: sock,
                token,
                addr: local,
            });
        }
        Ok(())
    }

    fn wake_self(this: &Arc<ListenerInner>, st: &mut State) -> bool {
        if st.ctx.request_wake() {
            this.core.wake_queue.push(Wakeable::Listener(this.clone()))
        } else {
            false
        }
    }

    /// Schedules delivery of whatever is queued (the open event, or the
    /// close after a failed bind).
    pub(crate) fn kick(this: &Arc<ListenerInner>) {
        let must_signal = {
            let mut st = this.state.lock().unwrap();
            Self::wake_self(this, &mut st)
        };
        this.core.wake_notify(must_signal);
    }

    /// Readiness or wake dispatch. Returns a batch when events are queued
    /// and no thread is working the listener.
    pub(crate) fn process(
        this: &Arc<ListenerInner>,
        socket_index: Option<usize>,
        events: Readiness,
        from_wake: bool,
    ) -> Option<Batch> {
        let mut st = this.state.lock().unwrap();
        if from_wake {
            st.ctx.wake_done();
        }
        if let Some(index) = socket_index {
            if !st.ctx.closing && index < st.sockets.len() {
                st.armed = false;
                if events.is_error() || events.is_hup() {
                    let err = match sys::take_socket_error(st.sockets[index].fd.as_raw_fd()) {
                        Ok(Some(err)) => err,
                        _ => io::Error::new(io::ErrorKind::Other, "listener socket failed"),
                    };
                    if st.condition.is_none() {
                        st.condition = Some(Condition::from_io(&err, "listening"));
                    }
                    Self::begin_close(this, &mut st);
                } else if events.is_readable() {
                    st.acceptable = Some(index);
                    st.queue.push_back(Event::ListenerAccept);
                }
            }
        }
        if !st.ctx.working && !st.queue.is_empty() {
            st.ctx.working = true;
            return Some(Batch {
                inner: BatchInner::Listener(Listener {
                    inner: this.clone(),
                }),
            });
        }
        if st.ctx.closing && Self::is_final(&st) {
            Self::finalize(this, &mut st);
        }
        None
    }

    pub(crate) fn batch_next(&self) -> Option<Event> {
        let mut st = self.state.lock().unwrap();
        let event = st.queue.pop_front();
        if event == Some(Event::ListenerClose) {
            st.close_dispatched = true;
        }
        event
    }

    pub(crate) fn accept(
        this: &Arc<ListenerInner>,
        driver: Box<dyn Driver>,
    ) -> io::Result<Connection> {
        let conn = {
            let mut st = this.state.lock().unwrap();
            if st.ctx.closing {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "listener is closed",
                ));
            }
            let index = match st.acceptable.take() {
                Some(index) => index,
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::WouldBlock,
                        "no connection pending",
                    ))
                }
            };
            // A pending accept only exists while the socket is disarmed.
            debug_assert!(!st.armed && st.accepted.is_none());
            match sys::accept(st.sockets[index].fd.as_raw_fd()) {
                Ok((sock, peer)) => {
                    debug!("accepted connection from {}", peer);
                    st.accepted = Some(index);
                    let conn =
                        ConnectionInner::open_accepted(this.core.clone(), driver, sock, peer);
                    if !st.ctx.working {
                        // No batch is open, so done() will not run; rearm
                        // here instead.
                        Self::rearm_accepted(this, &mut st);
                    }
                    conn
                }
                Err(err) => {
                    if err.kind() == io::ErrorKind::WouldBlock {
                        // The peer went away between readiness and accept;
                        // let done() rearm and move on.
                        st.accepted = Some(index);
                        return Err(err);
                    }
                    st.condition = Some(Condition::from_io(&err, "accepting"));
                    Self::begin_close(this, &mut st);
                    let must_signal = Self::wake_self(this, &mut st);
                    drop(st);
                    this.core.wake_notify(must_signal);
                    return Err(err);
                }
            }
        };
        this.core.add_endpoint(EndpointRef::Connection(conn.clone()));
        ConnectionInner::kick(&conn);
        Ok(Connection { inner: conn })
    }

    /// Rearms the socket we last accepted from. Deferred until `accept`
    /// has been invoked, so a pending-accept notification cannot re-fire
    /// before the application consumed it.
    fn rearm_accepted(this: &Arc<ListenerInner>, st: &mut State) {
        if st.ctx.closing {
            st.accepted = None;
            return;
        }
        if let Some(index) = st.accepted.take() {
            let socket = &st.sockets[index];
            if let Err(err) =
                this.core
                    .poller
                    .rearm(socket.fd.as_raw_fd(), socket.token, Interest::READABLE)
            {
                st.condition = Some(Condition::from_io(&err, "rearming listener"));
                Self::begin_close(this, st);
                return;
            }
            st.armed = true;
        }
    }

    pub(crate) fn done(this: &Arc<ListenerInner>) {
        let must_signal = {
            let mut st = this.state.lock().unwrap();
            st.ctx.working = false;
            if st.queued_disconnect {
                st.queued_disconnect = false;
                let condition = st.disconnect_condition.take();
                if condition.is_some() && st.condition.is_none() {
                    st.condition = condition;
                }
                Self::begin_close(this, &mut st);
            }
            Self::rearm_accepted(this, &mut st);
            let must_signal = if !st.queue.is_empty() {
                Self::wake_self(this, &mut st)
            } else {
                false
            };
            if st.ctx.closing && Self::is_final(&st) {
                Self::finalize(this, &mut st);
            }
            must_signal
        };
        this.core.wake_notify(must_signal);
    }

    pub(crate) fn close(this: &Arc<ListenerInner>) {
        let must_signal = {
            let mut st = this.state.lock().unwrap();
            Self::begin_close(this, &mut st);
            Self::wake_self(this, &mut st)
        };
        this.core.wake_notify(must_signal);
    }

    /// Disconnect-sweep pass over this endpoint.
    pub(crate) fn sweep(this: &Arc<ListenerInner>, condition: Option<Condition>) {
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
                if condition.is_some() && st.condition.is_none() {
                    st.condition = condition;
                }
                Self::begin_close(this, &mut st);
            }
            st.ctx.disconnect_ops -= 1;
            Self::wake_self(this, &mut st)
        };
        this.core.wake_notify(must_signal);
    }

    /// Stops polling on every bound socket, closes their fds and queues
    /// the close event. The listener becomes freeable once that event is
    /// dispatched and no wake ops remain.
    fn begin_close(this: &Arc<ListenerInner>, st: &mut State) {
        if st.ctx.closing {
            return;
        }
        st.ctx.closing = true;
        st.armed = false;
        st.acceptable = None;
        st.accepted = None;
        for socket in st.sockets.drain(..) {
            this.core.deregister(socket.fd.as_raw_fd(), socket.token);
        }
        st.queue.push_back(Event::ListenerClose);
    }

    fn is_final(st: &State) -> bool {
        st.ctx.closing && st.close_dispatched && st.ctx.wake_ops == 0 && !st.ctx.working
    }

    fn finalize(this: &Arc<ListenerInner>, st: &mut State) {
        if st.finalized {
            return;
        }
        st.finalized = true;
        let sweep_done = if st.ctx.disconnecting && st.ctx.disconnect_ops > 0 {
            st.ctx.disconnect_ops -= 1;
            st.ctx.disconnect_ops == 0
        } else {
            false
        };
        debug!("listener finalized");
        this.core.remove_listener(this, sweep_done);
    }

    /// Forced teardown from `Proactor` drop; no polling threads remain.
    pub(crate) fn force_shutdown(this: &Arc<ListenerInner>) {
        let mut st = this.state.lock().unwrap();
        st.ctx.wake_ops = 0;
        st.finalized = true;
        if !st.ctx.closing {
            st.ctx.closing = true;
            for socket in st.sockets.drain(..) {
                this.core.deregister(socket.fd.as_raw_fd(), socket.token);
            }
        }
    }
}
