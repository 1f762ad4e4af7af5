use std::io;

use log::error;

/// Helper macro to execute a system call that returns an `io::Result`.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

mod epoll;
mod eventfd;
mod net;
mod timerfd;

pub(crate) use self::epoll::{Poller, Readiness};
pub(crate) use self::eventfd::EventFd;
pub(crate) use self::net::{
    accept, bind_listen, local_addr, parse_addr, read, resolve, shutdown_write, start_connect,
    take_socket_error, write,
};
pub(crate) use self::timerfd::TimerFd;

/// Last resort for multiplexer, timer and signal-fd failures. The design
/// assumes kernel resource limits are enforced elsewhere; once one of
/// these calls fails there is no state left worth preserving.
pub(crate) fn fatal(what: &str, err: io::Error) -> ! {
    error!("unrecoverable proactor failure in {}: {}", what, err);
    std::process::abort();
}

/// Monotonic milliseconds, the time base for every timeout in the crate.
pub(crate) fn now_millis() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if let Err(err) = syscall!(clock_gettime(libc::CLOCK_MONOTONIC, &mut ts)) {
        fatal("clock_gettime", err);
    }
    (ts.tv_sec as u64) * 1_000 + (ts.tv_nsec as u64) / 1_000_000
}
