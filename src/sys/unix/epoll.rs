use std::io;
use std::ops;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP};
use log::trace;

use crate::interest::Interest;
use crate::token::Token;

/// One-shot readiness multiplexer over an epoll set.
///
/// Every registration carries `EPOLLONESHOT`: delivery of any event for a
/// descriptor atomically disarms it until `rearm` re-supplies the interest
/// set. That is what lets many threads block on the same set while at most
/// one of them observes a given descriptor's readiness.
#[derive(Debug)]
pub(crate) struct Poller {
    ep: OwnedFd,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Poller { ep })
    }

    /// Waits for at most one event. `Ok(None)` covers timeouts, `EINTR`
    /// and spurious zero-event returns; the caller decides whether to
    /// loop or report idleness.
    pub(crate) fn wait(
        &self,
        timeout_millis: libc::c_int,
    ) -> io::Result<Option<(Token, Readiness)>> {
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        let n = match syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            &mut event,
            1,
            timeout_millis,
        )) {
            Ok(n) => n,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(err) => return Err(err),
        };
        if n == 0 {
            return Ok(None);
        }
        Ok(Some((Token(event.u64 as usize), Readiness(event.events))))
    }

    pub(crate) fn register(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        trace!(
            "registering with poller: fd={}, token={:?}, interests={:?}",
            fd,
            token,
            interests
        );
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: token.0 as u64,
        };
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            fd,
            &mut event,
        ))
        .map(|_| ())
    }

    /// Re-supplies the interest set after a one-shot delivery disarmed the
    /// registration.
    pub(crate) fn rearm(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        trace!(
            "rearming with poller: fd={}, token={:?}, interests={:?}",
            fd,
            token,
            interests
        );
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: token.0 as u64,
        };
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_MOD,
            fd,
            &mut event,
        ))
        .map(|_| ())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        trace!("deregistering from poller: fd={}", fd);
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            ptr::null_mut(),
        ))
        .map(|_| ())
    }
}

fn interests_to_epoll(interests: Interest) -> u32 {
    let mut kind = EPOLLONESHOT;

    if interests.is_readable() {
        kind = kind | EPOLLIN | EPOLLRDHUP;
    }

    if interests.is_writable() {
        kind |= EPOLLOUT;
    }

    kind as u32
}

/// Raw readiness bits as delivered by the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Readiness(u32);

impl Readiness {
    pub(crate) const EMPTY: Readiness = Readiness(0);

    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn is_readable(self) -> bool {
        (self.0 as libc::c_int & (EPOLLIN | EPOLLRDHUP)) != 0
    }

    pub(crate) fn is_writable(self) -> bool {
        (self.0 as libc::c_int & EPOLLOUT) != 0
    }

    pub(crate) fn is_error(self) -> bool {
        (self.0 as libc::c_int & EPOLLERR) != 0
    }

    pub(crate) fn is_hup(self) -> bool {
        (self.0 as libc::c_int & EPOLLHUP) != 0
    }
}

impl ops::BitOrAssign for Readiness {
    fn bitor_assign(&mut self, other: Readiness) {
        self.0 |= other.0;
    }
}
