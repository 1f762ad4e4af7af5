use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Mutex;

use crate::sys::{self, TimerFd};

/// One-shot countdown with enough bookkeeping to absorb the race between
/// a kernel expiry and a concurrent cancel or re-arm.
///
/// `pending` counts armings whose expiry the owner still wants to
/// observe. `skip` counts expiries that already reached the descriptor
/// (or are in flight through the multiplexer) but were cancelled or
/// superseded before being consumed; [`expire`] discards those.
///
/// [`expire`]: OneshotTimer::expire
#[derive(Debug)]
pub(crate) struct OneshotTimer {
    fd: TimerFd,
    counts: Mutex<Counts>,
}

#[derive(Debug, Default)]
struct Counts {
    pending: u64,
    skip: u64,
}

impl OneshotTimer {
    pub(crate) fn new() -> io::Result<OneshotTimer> {
        Ok(OneshotTimer {
            fd: TimerFd::new()?,
            counts: Mutex::new(Counts::default()),
        })
    }

    /// Arms the countdown for `millis`; zero cancels. An earlier arming
    /// that already fired but was not yet consumed is marked to be
    /// skipped, an earlier arming that had not fired simply never will.
    pub(crate) fn set(&self, millis: u64) {
        let mut counts = self.counts.lock().unwrap();
        let was_armed = match self.fd.set(millis) {
            Ok(was_armed) => was_armed,
            Err(err) => sys::fatal("timerfd_settime", err),
        };
        if !was_armed {
            // Whatever was pending has already reached the descriptor.
            counts.skip += counts.pending;
        }
        counts.pending = u64::from(millis > 0);
    }

    /// Consumes expiries after the descriptor signalled readable.
    /// Returns the number of honored expiries; zero when a cancel or
    /// re-arm won the race.
    pub(crate) fn expire(&self) -> u64 {
        let mut counts = self.counts.lock().unwrap();
        let mut fired = match self.fd.expirations() {
            Ok(fired) => fired,
            Err(err) => sys::fatal("timerfd read", err),
        };
        let skipped = counts.skip.min(fired);
        counts.skip -= skipped;
        fired -= skipped;
        let honored = counts.pending.min(fired);
        counts.pending -= honored;
        honored
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
