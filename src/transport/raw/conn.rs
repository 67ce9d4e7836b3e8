//! Connection over a raw accepted socket descriptor.

use super::{cvt_size, RawSocket};
use crate::transport::{Connection, Deadlines};
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::time::Duration;

/// A TCP connection accepted by [`RawListener`](super::RawListener).
///
/// Reads and writes are single `read(2)`/`write(2)` calls with no buffering
/// and no retry of short transfers. Timeout setters are accepted and ignored.
#[derive(Debug)]
pub struct RawConn {
    socket: RawSocket,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl RawConn {
    pub(crate) fn new(fd: OwnedFd, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            socket: RawSocket::new(fd),
            local_addr,
            remote_addr,
        }
    }

    /// Whether `close` has been called.
    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.socket.is_closed()
    }
}

impl Connection for RawConn {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.with_fd(|fd| {
            // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
            cvt_size(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) })
        })
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket.with_fd(|fd| {
            // SAFETY: `buf` is valid for reads of `buf.len()` bytes.
            cvt_size(unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) })
        })
    }

    fn close(&self) -> io::Result<()> {
        self.socket.close()
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn deadlines(&self) -> Deadlines {
        Deadlines::Ignored
    }

    /// No-op: the raw transport has no timer support.
    fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    /// No-op: the raw transport has no timer support.
    fn set_write_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn set_keepalive(&self, period: Duration) -> io::Result<()> {
        self.socket.with_fd(|fd| {
            // SAFETY: the descriptor stays open while the read lock is held.
            let fd = unsafe { BorrowedFd::borrow_raw(fd) };
            SockRef::from(&fd).set_tcp_keepalive(&TcpKeepalive::new().with_time(period))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Listener, RawListener};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::{mpsc, Arc};
    use std::thread;

    fn connected_pair() -> (RawListener, Arc<RawConn>, TcpStream) {
        let listener = RawListener::bind("127.0.0.1", 0).unwrap();
        let client = TcpStream::connect(listener.addr().unwrap()).unwrap();
        let conn = listener.accept().unwrap();
        (listener, Arc::new(conn), client)
    }

    #[test]
    fn test_read_write() {
        let (_listener, conn, mut client) = connected_pair();
        assert_eq!(conn.remote_addr(), client.local_addr().unwrap());
        assert_eq!(conn.local_addr(), client.peer_addr().unwrap());

        client.write_all(b"hello").unwrap();
        let mut buf = [0u8; 32];
        let n = conn.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        assert_eq!(conn.write(b"world").unwrap(), 5);
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"world");
    }

    #[test]
    fn test_peer_close_reads_zero() {
        let (_listener, conn, client) = connected_pair();
        drop(client);
        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_timeouts_are_ignored() {
        let (_listener, conn, mut client) = connected_pair();
        assert_eq!(conn.deadlines(), Deadlines::Ignored);
        conn.set_timeout(Some(Duration::from_millis(1))).unwrap();
        conn.set_read_timeout(Some(Duration::from_millis(1))).unwrap();
        conn.set_write_timeout(None).unwrap();

        let (tx, rx) = mpsc::channel();
        let reader = Arc::clone(&conn);
        thread::spawn(move || {
            let mut buf = [0u8; 8];
            let _ = tx.send(reader.read(&mut buf).map_err(|e| e.kind()));
        });

        // Still blocked well past the "timeout".
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        client.write_all(b"x").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(1));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (_listener, conn, mut client) = connected_pair();
        conn.close().unwrap();
        conn.close().unwrap();
        assert!(conn.is_closed());

        let mut buf = [0u8; 8];
        assert_eq!(
            conn.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
        assert_eq!(
            conn.write(b"late").unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_close_unblocks_reader() {
        let (_listener, conn, _client) = connected_pair();
        let (tx, rx) = mpsc::channel();
        let reader = Arc::clone(&conn);
        thread::spawn(move || {
            let mut buf = [0u8; 8];
            let _ = tx.send(reader.read(&mut buf).unwrap_or(0));
        });

        thread::sleep(Duration::from_millis(50));
        conn.close().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(0));
    }

    #[test]
    fn test_keepalive() {
        let (_listener, conn, _client) = connected_pair();
        conn.set_keepalive(Duration::from_secs(60)).unwrap();
        conn.close().unwrap();
        assert!(conn.set_keepalive(Duration::from_secs(60)).is_err());
    }
}
