//! Interchangeable transports for the echo server.
//!
//! - `standard`: `std::net` listener and streams
//! - `raw`: listener and connections driven directly by socket syscalls
//!
//! Both expose blocking operations through [`Listener`] and [`Connection`],
//! so the server's accept loop and line handler are written once.

pub mod raw;
pub mod standard;

pub use raw::RawListener;
pub use standard::StdListener;

use crate::error::ListenerError;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Whether a connection honours its timeout setters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadlines {
    /// Timeouts are applied to the underlying socket.
    Enforced,
    /// Timeout setters succeed but have no effect; reads and writes block
    /// until the peer acts or the connection is closed.
    Ignored,
}

/// A single accepted byte-stream connection.
///
/// All methods take `&self` so a connection can be shared between its
/// handler task and the shutdown path, which closes it out from under a
/// blocked read.
pub trait Connection: Send + Sync + 'static {
    /// One read into `buf`. `Ok(0)` means the peer closed the stream.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// One write from `buf`. May be short.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Close the connection. Repeat calls return `Ok(())`.
    fn close(&self) -> io::Result<()>;

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;

    /// Timeout capability of this transport.
    fn deadlines(&self) -> Deadlines;

    /// Per-operation read timeout; `None` blocks indefinitely.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Per-operation write timeout; `None` blocks indefinitely.
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Set both read and write timeouts.
    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }

    /// Enable TCP keep-alive probes after `period` of idleness.
    fn set_keepalive(&self, _period: Duration) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "keep-alive not supported by this connection",
        ))
    }
}

/// A bound, listening socket producing [`Connection`]s.
pub trait Listener: Send + Sync + Sized + 'static {
    type Conn: Connection;

    /// Human-readable transport name for logs.
    const NAME: &'static str;

    /// Keep-alive period the server applies to every accepted connection.
    const KEEPALIVE: Option<Duration>;

    /// Bind and start listening on `addr:port`.
    fn bind(addr: &str, port: u16) -> Result<Self, ListenerError>;

    /// Block until the next connection is available.
    fn accept(&self) -> io::Result<Self::Conn>;

    /// Stop listening. Unblocks a pending `accept`. Repeat calls return `Ok(())`.
    fn close(&self) -> io::Result<()>;

    /// Address actually bound, if known.
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Whether an I/O error is an expired read or write timeout.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Whether an accept failure is worth retrying.
///
/// Covers aborted handshakes, signals, and resource exhaustion that may clear
/// once other connections close.
pub fn is_transient_accept_error(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::EPROTO)
    )
}

/// Connect to a listener so that a thread blocked in its `accept` returns.
///
/// Shutting down a listening socket wakes `accept` only on Linux.
#[cfg(not(target_os = "linux"))]
pub(crate) fn wake_acceptor(addr: Option<SocketAddr>) {
    if let Some(mut addr) = addr {
        if addr.ip().is_unspecified() {
            addr.set_ip(match addr {
                SocketAddr::V4(_) => std::net::Ipv4Addr::LOCALHOST.into(),
                SocketAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
            });
        }
        let _ = std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(100));
    }
}

/// The error reported by operations on a connection or listener after `close`.
pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "use of closed connection")
}
