//! Transport built on `std::net`.

use crate::error::ListenerError;
use crate::transport::{closed_error, Connection, Deadlines, Listener};
use socket2::{SockRef, TcpKeepalive};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Listener backed by [`std::net::TcpListener`].
#[derive(Debug)]
pub struct StdListener {
    listener: TcpListener,
    closed: AtomicBool,
}

impl Listener for StdListener {
    type Conn = StdConn;

    const NAME: &'static str = "standard";
    const KEEPALIVE: Option<Duration> = None;

    fn bind(addr: &str, port: u16) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind((addr, port)).map_err(ListenerError::Bind)?;
        Ok(Self {
            listener,
            closed: AtomicBool::new(false),
        })
    }

    fn accept(&self) -> io::Result<StdConn> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        let (stream, remote) = self.listener.accept()?;
        // A connection that raced `close`, or the wake-up connection itself.
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        StdConn::new(stream, remote)
    }

    /// Shuts the listening socket down, which makes a blocked `accept` return
    /// an error. Elsewhere than Linux that shutdown fails with `ENOTCONN` and
    /// leaves `accept` blocked, so the listener is also connected to once.
    /// The descriptor itself is released when the listener drops.
    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = ignore_not_connected(SockRef::from(&self.listener).shutdown(Shutdown::Both));
        #[cfg(not(target_os = "linux"))]
        crate::transport::wake_acceptor(self.local_addr());
        result
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

/// Connection backed by [`std::net::TcpStream`]. Timeouts are enforced by
/// the socket.
#[derive(Debug)]
pub struct StdConn {
    stream: TcpStream,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    closed: AtomicBool,
}

impl StdConn {
    pub fn new(stream: TcpStream, remote_addr: SocketAddr) -> io::Result<Self> {
        let local_addr = stream.local_addr()?;
        Ok(Self {
            stream,
            local_addr,
            remote_addr,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(closed_error())
        } else {
            Ok(())
        }
    }
}

impl Connection for StdConn {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_open()?;
        (&self.stream).read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_open()?;
        (&self.stream).write(buf)
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        ignore_not_connected(self.stream.shutdown(Shutdown::Both))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn deadlines(&self) -> Deadlines {
        Deadlines::Enforced
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout.filter(|t| !t.is_zero()))
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_write_timeout(timeout.filter(|t| !t.is_zero()))
    }

    fn set_keepalive(&self, period: Duration) -> io::Result<()> {
        SockRef::from(&self.stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(period))
    }
}

/// A peer that already went away leaves nothing to shut down.
fn ignore_not_connected(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;

    fn connected_pair() -> (StdListener, StdConn, TcpStream) {
        let listener = StdListener::bind("127.0.0.1", 0).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let conn = listener.accept().unwrap();
        (listener, conn, client)
    }

    #[test]
    fn test_accept_and_echo_bytes() {
        let (_listener, conn, mut client) = connected_pair();
        assert_eq!(conn.remote_addr(), client.local_addr().unwrap());
        assert_eq!(conn.local_addr(), client.peer_addr().unwrap());

        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");

        assert_eq!(conn.write(b"pong").unwrap(), 4);
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"pong");
    }

    #[test]
    fn test_read_timeout_is_enforced() {
        let (_listener, conn, _client) = connected_pair();
        assert_eq!(conn.deadlines(), Deadlines::Enforced);
        conn.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).unwrap_err();
        assert!(crate::transport::is_timeout(&err), "unexpected error: {err}");
    }

    #[test]
    fn test_close_is_idempotent() {
        let (_listener, conn, mut client) = connected_pair();
        conn.close().unwrap();
        conn.close().unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
        assert_eq!(
            conn.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
    }

    #[test]
    fn test_close_unblocks_accept() {
        let listener = Arc::new(StdListener::bind("127.0.0.1", 0).unwrap());
        let (tx, rx) = mpsc::channel();
        let accepting = Arc::clone(&listener);
        thread::spawn(move || {
            let _ = tx.send(accepting.accept().is_err());
        });

        thread::sleep(Duration::from_millis(50));
        listener.close().unwrap();
        listener.close().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(true));
        assert!(listener.accept().is_err());
    }

    #[test]
    fn test_close_rejects_pending_connection() {
        let listener = StdListener::bind("127.0.0.1", 0).unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();

        listener.close().unwrap();
        assert_eq!(
            listener.accept().unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
    }

    #[test]
    fn test_close_unblocks_accept_on_wildcard_address() {
        let listener = Arc::new(StdListener::bind("0.0.0.0", 0).unwrap());
        let (tx, rx) = mpsc::channel();
        let accepting = Arc::clone(&listener);
        thread::spawn(move || {
            let _ = tx.send(accepting.accept().map(|_| ()).map_err(|e| e.kind()));
        });

        thread::sleep(Duration::from_millis(50));
        listener.close().unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_err());
    }

    #[test]
    fn test_keepalive() {
        let (_listener, conn, _client) = connected_pair();
        conn.set_keepalive(Duration::from_secs(60)).unwrap();
        assert!(SockRef::from(&conn.stream).keepalive().unwrap());
    }
}
