/// An application-visible event, drained from a [`Batch`].
///
/// The proactor core emits the first seven kinds; the remaining kinds are
/// emitted by a connection's [`Driver`] and pass through the batch in the
/// driver's own order.
///
/// [`Batch`]: crate::Batch
/// [`Driver`]: crate::Driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// One per [`Proactor::interrupt`] call, never coalesced.
    ///
    /// [`Proactor::interrupt`]: crate::Proactor::interrupt
    Interrupt,
    /// The shared proactor timeout elapsed. Re-arming before expiry
    /// coalesces to the latest deadline; cancelling suppresses it.
    Timeout,
    /// The proactor has no endpoints left and no pending timeout or
    /// disconnect sweep. Fires once per transition to that state.
    Inactive,
    /// A listener finished binding and is accepting connections. Also
    /// the first event of a listener that failed to set up; the failure
    /// arrives as the following [`ListenerClose`](Event::ListenerClose).
    ListenerOpen,
    /// An inbound connection is ready to be accepted. Not re-issued
    /// until [`Listener::accept`] consumes the pending connection.
    ///
    /// [`Listener::accept`]: crate::Listener::accept
    ListenerAccept,
    /// The listener closed. Its condition reports what failed, if
    /// anything did.
    ListenerClose,
    /// [`Connection::wake`] was called. Coalesced until delivered.
    ///
    /// [`Connection::wake`]: crate::Connection::wake
    ConnectionWake,
    /// The transport established its connection.
    TransportConnected,
    /// The transport received bytes.
    Delivery,
    /// The transport recorded an error condition.
    TransportError,
    /// Both transport directions are closed; this is the transport's
    /// terminal event.
    TransportClosed,
}
