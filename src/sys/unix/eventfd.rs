use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// Wake signal backed by `eventfd`.
///
/// `eventfd` is effectively a 64 bit counter. All writes must be of 8
/// bytes (64 bits) and are converted (native endian) into a 64 bit
/// unsigned integer and added to the count. Reads must also be 8 bytes
/// and reset the count to 0, returning the count.
#[derive(Debug)]
pub(crate) struct EventFd {
    fd: File,
}

impl EventFd {
    pub(crate) fn new() -> io::Result<EventFd> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(EventFd { fd: file })
    }

    /// Adds one to the counter, unblocking one thread waiting on it.
    #[allow(clippy::unused_io_amount)] // Don't care about partial writes.
    pub(crate) fn signal(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match (&self.fd).write(&buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Writing only blocks if the counter is going to overflow.
                // So we'll reset the counter to 0 and signal again.
                self.drain()?;
                self.signal()
            }
            Err(err) => Err(err),
        }
    }

    /// Resets the counter to zero.
    #[allow(clippy::unused_io_amount)] // Don't care about partial reads.
    pub(crate) fn drain(&self) -> io::Result<()> {
        let mut buf: [u8; 8] = 0u64.to_ne_bytes();
        match (&self.fd).read(&mut buf) {
            Ok(_) => Ok(()),
            // Not signalled since the last drain.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
