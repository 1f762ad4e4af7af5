use std::io::{self, Read};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

use std::fs::File;

/// Monotonic one-shot countdown backed by `timerfd`.
///
/// The descriptor becomes readable on expiry; reading it yields the
/// number of expiries since the last read (for a one-shot arming, zero or
/// one).
#[derive(Debug)]
pub(crate) struct TimerFd {
    fd: File,
}

impl TimerFd {
    pub(crate) fn new() -> io::Result<TimerFd> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        ))?;
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(TimerFd { fd: file })
    }

    /// Arms the countdown for `millis`; zero disarms. Returns whether the
    /// previous setting was still armed (had not yet expired).
    pub(crate) fn set(&self, millis: u64) -> io::Result<bool> {
        let new = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: (millis / 1_000) as libc::time_t,
                tv_nsec: ((millis % 1_000) * 1_000_000) as libc::c_long,
            },
        };
        let mut old: libc::itimerspec = unsafe { mem::zeroed() };
        syscall!(timerfd_settime(self.fd.as_raw_fd(), 0, &new, &mut old))?;
        Ok(old.it_value.tv_sec != 0 || old.it_value.tv_nsec != 0)
    }

    /// Number of expiries since the last read; zero when nothing fired.
    pub(crate) fn expirations(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        match (&self.fd).read(&mut buf) {
            Ok(8) => Ok(u64::from_ne_bytes(buf)),
            Ok(_) => Ok(0),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err),
        }
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
