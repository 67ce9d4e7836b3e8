//! Transport driven directly by socket syscalls.
//!
//! No readiness polling: every accept, read and write is one blocking
//! syscall. Connections cannot enforce timeouts (see [`Deadlines::Ignored`]).
//!
//! [`Deadlines::Ignored`]: crate::transport::Deadlines::Ignored

mod conn;
mod listener;

pub use conn::RawConn;
pub use listener::RawListener;

use crate::transport::closed_error;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

/// A socket descriptor shared between blocking I/O and `close`.
///
/// I/O runs under the read lock so the descriptor cannot be released (and its
/// number reused) mid-syscall. `close` first shuts the socket down, which
/// wakes any thread blocked on it, then takes the write lock to release it.
#[derive(Debug)]
pub(crate) struct RawSocket {
    fd: RwLock<Option<OwnedFd>>,
    /// Copy of the descriptor number for the shutdown that precedes the
    /// exclusive lock. Only valid while `fd` is `Some`.
    raw: RawFd,
    closing: AtomicBool,
}

impl RawSocket {
    pub(crate) fn new(fd: OwnedFd) -> Self {
        let raw = fd.as_raw_fd();
        Self {
            fd: RwLock::new(Some(fd)),
            raw,
            closing: AtomicBool::new(false),
        }
    }

    /// Run `op` against the open descriptor.
    pub(crate) fn with_fd<T>(&self, op: impl FnOnce(RawFd) -> io::Result<T>) -> io::Result<T> {
        let guard = self.fd.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(fd) => op(fd.as_raw_fd()),
            None => Err(closed_error()),
        }
    }

    /// Whether `close` has started.
    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Whether the socket is closed or closing, checked under the read lock.
    pub(crate) fn is_closed(&self) -> bool {
        let guard = self.fd.read().unwrap_or_else(PoisonError::into_inner);
        guard.is_none() || self.is_closing()
    }

    /// Mark closing and shut the socket down. Returns `false` if another
    /// caller got here first.
    pub(crate) fn begin_close(&self) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        // SAFETY: only the caller that won the swap reaches this point, and
        // the descriptor is released after it, in `finish_close`.
        unsafe { libc::shutdown(self.raw, libc::SHUT_RDWR) };
        true
    }

    /// Release the descriptor once in-flight syscalls have returned.
    pub(crate) fn finish_close(&self) -> io::Result<()> {
        let fd = self
            .fd
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match fd {
            // SAFETY: ownership is moved out of the `OwnedFd`, so this is the
            // only close of the descriptor.
            Some(fd) => cvt(unsafe { libc::close(fd.into_raw_fd()) }).map(drop),
            None => Ok(()),
        }
    }

    /// Idempotent close.
    pub(crate) fn close(&self) -> io::Result<()> {
        if !self.begin_close() {
            return Ok(());
        }
        self.finish_close()
    }
}

/// Convert a `-1` syscall return into the current OS error.
pub(crate) fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Like [`cvt`] for byte-count returns.
pub(crate) fn cvt_size(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Parse a textual bind address into IPv4.
///
/// Accepts dotted quads, IPv4-mapped IPv6 literals and `localhost`.
pub(crate) fn parse_ipv4(addr: &str) -> Option<Ipv4Addr> {
    if addr.eq_ignore_ascii_case("localhost") {
        return Some(Ipv4Addr::LOCALHOST);
    }
    match addr.parse::<IpAddr>().ok()? {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(ip) => ip.to_ipv4_mapped(),
    }
}

/// Build a `sockaddr_in` for `ip:port`.
pub(crate) fn sockaddr_in(ip: Ipv4Addr, port: u16) -> libc::sockaddr_in {
    // SAFETY: all-zero is a valid `sockaddr_in`.
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = port.to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(ip.octets()),
    };
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    {
        sin.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
    }
    sin
}

/// Widen a `sockaddr_in` into generic storage.
pub(crate) fn storage_from(sin: &libc::sockaddr_in) -> libc::sockaddr_storage {
    // SAFETY: all-zero is a valid `sockaddr_storage`, and it is large enough
    // and suitably aligned to hold any socket address.
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        std::ptr::copy_nonoverlapping(
            sin,
            (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in>(),
            1,
        );
        storage
    }
}

/// Read an IPv4 address back out of socket address storage.
///
/// Returns `None` for any other address family.
pub(crate) fn to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    if libc::c_int::from(storage.ss_family) != libc::AF_INET {
        return None;
    }
    // SAFETY: the family says this storage holds a `sockaddr_in`.
    let sin = unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
    let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
    Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
}

/// `getsockname` on a descriptor.
pub(crate) fn local_sockaddr(fd: RawFd) -> io::Result<libc::sockaddr_storage> {
    // SAFETY: all-zero is a valid `sockaddr_storage`.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: `storage` and `len` describe a writable buffer of `len` bytes.
    cvt(unsafe {
        libc::getsockname(
            fd,
            (&mut storage as *mut libc::sockaddr_storage).cast(),
            &mut len,
        )
    })?;
    Ok(storage)
}
