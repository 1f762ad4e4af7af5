use std::ffi::{CStr, CString};
use std::io;
use std::mem::{self, size_of, MaybeUninit};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

/// Port assumed when the address string does not name one.
pub(crate) const DEFAULT_PORT: &str = "5672";

/// Splits a `host:port` string on the last colon, so a bracketed IPv6
/// host keeps its internal colons. An empty host means any-interface, an
/// empty port means [`DEFAULT_PORT`].
pub(crate) fn parse_addr(addr: &str) -> (String, String) {
    let split = match addr.rfind(':') {
        Some(colon) => match addr.rfind(']') {
            // Colon inside a bracketed host, no port part.
            Some(bracket) if colon < bracket => None,
            _ => Some(colon),
        },
        None => None,
    };
    let (host, port) = match split {
        Some(colon) => (&addr[..colon], &addr[colon + 1..]),
        None => (addr, ""),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = if port.is_empty() { DEFAULT_PORT } else { port };
    (host.to_owned(), port.to_owned())
}

/// Resolves a parsed address to socket addresses. Passive resolution is
/// used for listeners (`AI_PASSIVE | AI_ALL`, one socket per address),
/// active for connectors (`AI_V4MAPPED | AI_ADDRCONFIG`).
pub(crate) fn resolve(host: &str, port: &str, passive: bool) -> io::Result<Vec<SocketAddr>> {
    let invalid = || io::Error::from(io::ErrorKind::InvalidInput);
    let host = if host.is_empty() {
        None
    } else {
        Some(CString::new(host).map_err(|_| invalid())?)
    };
    let port = CString::new(port).map_err(|_| invalid())?;

    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = libc::AF_UNSPEC;
    hints.ai_socktype = libc::SOCK_STREAM;
    hints.ai_protocol = libc::IPPROTO_TCP;
    hints.ai_flags = if passive {
        libc::AI_PASSIVE | libc::AI_ALL
    } else {
        libc::AI_V4MAPPED | libc::AI_ADDRCONFIG
    };

    let host_ptr = host.as_ref().map_or(ptr::null(), |h| h.as_ptr());
    let mut result: *mut libc::addrinfo = ptr::null_mut();
    let rc = unsafe { libc::getaddrinfo(host_ptr, port.as_ptr(), &hints, &mut result) };
    if rc != 0 {
        return Err(gai_error(rc));
    }

    let mut addrs = Vec::new();
    let mut next = result;
    while !next.is_null() {
        let ai = unsafe { &*next };
        if !ai.ai_addr.is_null() {
            if let Ok(addr) = unsafe { to_socket_addr(ai.ai_addr as *const libc::sockaddr_storage) }
            {
                addrs.push(addr);
            }
        }
        next = ai.ai_next;
    }
    unsafe { libc::freeaddrinfo(result) };

    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "address resolved to no usable socket addresses",
        ));
    }
    Ok(addrs)
}

fn gai_error(rc: libc::c_int) -> io::Error {
    if rc == libc::EAI_SYSTEM {
        return io::Error::last_os_error();
    }
    let msg = unsafe { CStr::from_ptr(libc::gai_strerror(rc)) };
    io::Error::new(io::ErrorKind::Other, msg.to_string_lossy().into_owned())
}

#[repr(C)]
union SocketAddrCRepr {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

impl SocketAddrCRepr {
    fn as_ptr(&self) -> *const libc::sockaddr {
        self as *const SocketAddrCRepr as *const libc::sockaddr
    }
}

/// Converts a standard socket address into its C representation.
fn socket_addr(addr: &SocketAddr) -> (SocketAddrCRepr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(ref addr) => {
            let sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(addr.ip().octets()),
            };
            let sockaddr_in = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                sin_addr,
                sin_zero: [0; 8],
            };
            (
                SocketAddrCRepr { v4: sockaddr_in },
                size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(ref addr) => {
            let sockaddr_in6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_flowinfo: addr.flowinfo(),
                sin6_scope_id: addr.scope_id(),
            };
            (
                SocketAddrCRepr { v6: sockaddr_in6 },
                size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

/// # Safety
///
/// `storage` must hold an initialised `sockaddr_in` or `sockaddr_in6`.
unsafe fn to_socket_addr(storage: *const libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match (*storage).ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: &libc::sockaddr_in = &*(storage as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let addr: &libc::sockaddr_in6 = &*(storage as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

fn new_socket(domain: libc::c_int) -> io::Result<OwnedFd> {
    let fd = syscall!(socket(
        domain,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0,
    ))?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn domain_for(addr: &SocketAddr) -> libc::c_int {
    match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    }
}

/// Begins a non-blocking connect. `Ok((_, false))` means the connect is
/// in progress and completion arrives as writability (or `HUP`/`ERR` on
/// failure).
pub(crate) fn start_connect(addr: &SocketAddr) -> io::Result<(OwnedFd, bool)> {
    let socket = new_socket(domain_for(addr))?;
    set_nodelay(socket.as_raw_fd())?;
    let (raw, len) = socket_addr(addr);
    match syscall!(connect(socket.as_raw_fd(), raw.as_ptr(), len)) {
        Ok(_) => Ok((socket, true)),
        Err(ref err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok((socket, false)),
        Err(err) => Err(err),
    }
}

/// Creates a bound, listening, non-blocking socket for one resolved
/// address. IPv6 sockets are made v6-only so an IPv4 peer reaches the
/// separately bound IPv4 socket.
pub(crate) fn bind_listen(addr: &SocketAddr, backlog: u32) -> io::Result<OwnedFd> {
    let socket = new_socket(domain_for(addr))?;
    set_reuseaddr(socket.as_raw_fd())?;
    if addr.is_ipv6() {
        set_v6only(socket.as_raw_fd())?;
    }
    let (raw, len) = socket_addr(addr);
    syscall!(bind(socket.as_raw_fd(), raw.as_ptr(), len))?;
    syscall!(listen(socket.as_raw_fd(), backlog as libc::c_int))?;
    Ok(socket)
}

/// Accepts one connection, non-blocking and `TCP_NODELAY` from the start.
pub(crate) fn accept(listener: RawFd) -> io::Result<(OwnedFd, SocketAddr)> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let fd = syscall!(accept4(
        listener,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))?;
    let socket = unsafe { OwnedFd::from_raw_fd(fd) };
    set_nodelay(socket.as_raw_fd())?;
    let addr = unsafe { to_socket_addr(storage.as_ptr())? };
    Ok((socket, addr))
}

fn set_opt(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    syscall!(setsockopt(
        fd,
        level,
        name,
        &value as *const libc::c_int as *const libc::c_void,
        size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

fn set_nodelay(fd: RawFd) -> io::Result<()> {
    set_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
}

fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
}

fn set_v6only(fd: RawFd) -> io::Result<()> {
    set_opt(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 1)
}

/// Takes the pending `SO_ERROR`, the outcome of an asynchronous connect.
pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut value: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut value as *mut libc::c_int as *mut libc::c_void,
        &mut len,
    ))?;
    if value == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(value)))
    }
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(
        fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len,
    ))?;
    unsafe { to_socket_addr(storage.as_ptr()) }
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    syscall!(read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())).map(|n| n as usize)
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len())).map(|n| n as usize)
}

pub(crate) fn shutdown_write(fd: RawFd) -> io::Result<()> {
    syscall!(shutdown(fd, libc::SHUT_WR)).map(|_| ())
}
