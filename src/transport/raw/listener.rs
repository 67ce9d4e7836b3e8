//! Listener over a raw IPv4 socket with a background accept loop.
//!
//! The loop hands each accepted connection to [`RawListener::accept`] through
//! a zero-capacity channel, so it blocks until a consumer takes the
//! connection. At most one accepted-but-undelivered connection exists.

use super::{
    cvt, local_sockaddr, parse_ipv4, sockaddr_in, storage_from, to_socket_addr, RawConn,
    RawSocket,
};
use crate::error::ListenerError;
use crate::transport::{closed_error, Listener};
use std::fmt;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// TCP keep-alive period applied to raw connections by the server.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(60);

/// A listening socket created with `socket`/`bind`/`listen` syscalls.
pub struct RawListener {
    socket: Arc<RawSocket>,
    /// Address reported by the kernel after bind
    sockaddr: libc::sockaddr_storage,
    incoming: Mutex<Receiver<RawConn>>,
}

impl RawListener {
    /// Address the listener is bound to, or `None` if it is not IPv4.
    pub fn addr(&self) -> Option<SocketAddr> {
        to_socket_addr(&self.sockaddr)
    }
}

impl Listener for RawListener {
    type Conn = RawConn;

    const NAME: &'static str = "raw";
    const KEEPALIVE: Option<Duration> = Some(KEEPALIVE_PERIOD);

    fn bind(addr: &str, port: u16) -> Result<Self, ListenerError> {
        // SAFETY: plain syscall; the result is checked before use.
        let fd = cvt(unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) })
            .map_err(ListenerError::SocketCreate)?;
        // SAFETY: `fd` was just returned by `socket` and is owned by nobody
        // else. Dropping it on any error path below closes the socket.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        set_reuse_address(fd.as_raw_fd()).map_err(ListenerError::SocketOption)?;

        let ip = parse_ipv4(addr).ok_or_else(|| ListenerError::InvalidAddress(addr.to_string()))?;
        if addr.parse::<std::net::IpAddr>().is_err() {
            info!(addr, resolved = %ip, "Resolved bind address by name");
        }
        let sin = sockaddr_in(ip, port);

        // SAFETY: `sin` is a fully initialised `sockaddr_in` of the given size.
        cvt(unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&sin as *const libc::sockaddr_in).cast(),
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        })
        .map_err(ListenerError::Bind)?;

        // SAFETY: plain syscall on an owned descriptor.
        cvt(unsafe { libc::listen(fd.as_raw_fd(), libc::SOMAXCONN) })
            .map_err(ListenerError::Listen)?;

        // Port 0 binds are only resolved by asking the kernel.
        let sockaddr = local_sockaddr(fd.as_raw_fd()).unwrap_or_else(|_| storage_from(&sin));
        let local_addr = to_socket_addr(&sockaddr);

        let socket = Arc::new(RawSocket::new(fd));
        let (handoff, incoming) = mpsc::sync_channel(0);
        let loop_socket = Arc::clone(&socket);
        let thread_name = match local_addr {
            Some(addr) => format!("raw-accept-{}", addr.port()),
            None => "raw-accept".to_string(),
        };
        thread::Builder::new()
            .name(thread_name)
            .spawn(move || accept_loop(&loop_socket, local_addr, &handoff))
            .map_err(ListenerError::AcceptLoop)?;

        Ok(Self {
            socket,
            sockaddr,
            incoming: Mutex::new(incoming),
        })
    }

    /// Receive the next connection from the accept loop.
    ///
    /// Fails once the loop has exited after `close`.
    fn accept(&self) -> io::Result<RawConn> {
        let incoming = self.incoming.lock().unwrap_or_else(PoisonError::into_inner);
        incoming.recv().map_err(|_| closed_error())
    }

    fn close(&self) -> io::Result<()> {
        if !self.socket.begin_close() {
            return Ok(());
        }
        #[cfg(not(target_os = "linux"))]
        crate::transport::wake_acceptor(self.addr());
        self.socket.finish_close()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.addr()
    }
}

impl Drop for RawListener {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl fmt::Debug for RawListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawListener")
            .field("addr", &self.addr())
            .field("closed", &self.socket.is_closed())
            .finish()
    }
}

fn set_reuse_address(fd: RawFd) -> io::Result<()> {
    let enable: libc::c_int = 1;
    // SAFETY: `enable` is a live `c_int` of the size passed.
    cvt(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&enable as *const libc::c_int).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })
    .map(drop)
}

/// One blocking `accept(2)`.
fn accept_raw(fd: RawFd) -> io::Result<(OwnedFd, libc::sockaddr_storage)> {
    // SAFETY: all-zero is a valid `sockaddr_storage`.
    let mut peer: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: `peer` and `len` describe a writable buffer of `len` bytes.
    let nfd = cvt(unsafe {
        libc::accept(
            fd,
            (&mut peer as *mut libc::sockaddr_storage).cast(),
            &mut len,
        )
    })?;
    // SAFETY: `accept` returned a new descriptor that nothing else owns.
    Ok((unsafe { OwnedFd::from_raw_fd(nfd) }, peer))
}

/// Runs on its own thread from bind until the listener closes.
///
/// Accept failures on an open listener are retried immediately.
fn accept_loop(socket: &RawSocket, listener_addr: Option<SocketAddr>, handoff: &SyncSender<RawConn>) {
    let fallback_local =
        listener_addr.unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));

    loop {
        if socket.is_closed() {
            break;
        }

        let (fd, peer) = match socket.with_fd(accept_raw) {
            Ok(accepted) => accepted,
            Err(_) if socket.is_closing() => break,
            Err(e) => {
                warn!(error = %e, "Raw accept failed, retrying");
                continue;
            }
        };

        if socket.is_closing() {
            break;
        }

        let Some(remote_addr) = to_socket_addr(&peer) else {
            warn!("Dropping connection from non-IPv4 peer");
            continue;
        };
        let local_addr = local_sockaddr(fd.as_raw_fd())
            .ok()
            .and_then(|s| to_socket_addr(&s))
            .unwrap_or(fallback_local);

        debug!(peer = %remote_addr, fd = fd.as_raw_fd(), "Raw accept");

        // Blocks until `accept` is called; fails only if the listener is gone.
        if handoff
            .send(RawConn::new(fd, local_addr, remote_addr))
            .is_err()
        {
            break;
        }
    }

    debug!("Raw accept loop exited");
}
