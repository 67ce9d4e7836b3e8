//! Line-echo TCP server, generic over its transport.
//!
//! Accepts connections, registers each one, and serves it on its own thread
//! until the client quits, disconnects, or the server stops. There is no cap
//! on concurrent connections.

use crate::config::Config;
use crate::error::ServerError;
use crate::protocol::{self, LineBuffer};
use crate::runtime::{self, ConnectionRegistry, Registration};
use crate::transport::{self, Connection, Deadlines, Listener};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info};

/// Size of each read from a connection
const READ_CHUNK_SIZE: usize = 4096;

/// Bind address and per-operation timeouts.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: String,
    pub port: u16,
    /// Zero disables the timeout
    pub read_timeout: Duration,
    /// Zero disables the timeout
    pub write_timeout: Duration,
}

impl From<&Config> for ServerSettings {
    fn from(config: &Config) -> Self {
        Self {
            addr: config.addr.clone(),
            port: config.port,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
        }
    }
}

/// Lifecycle of a server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed, not yet listening
    Created,
    /// Listening and serving
    Running,
    /// `stop` called, handlers still winding down
    Stopping,
    /// `stop` called and every handler has exited
    Stopped,
}

#[derive(Debug, Clone, Copy)]
struct Timeouts {
    read: Option<Duration>,
    write: Option<Duration>,
}

impl Timeouts {
    fn from_settings(settings: &ServerSettings) -> Self {
        let enabled = |d: Duration| (!d.is_zero()).then_some(d);
        Self {
            read: enabled(settings.read_timeout),
            write: enabled(settings.write_timeout),
        }
    }
}

/// Server instance
pub struct Server<L: Listener> {
    settings: ServerSettings,
    timeouts: Timeouts,
    /// Set once by `start`
    listener: Mutex<Option<Arc<L>>>,
    registry: Arc<ConnectionRegistry<L::Conn>>,
}

impl<L: Listener> Server<L> {
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            timeouts: Timeouts::from_settings(&settings),
            settings,
            listener: Mutex::new(None),
            registry: Arc::new(ConnectionRegistry::new()),
        }
    }

    fn listener(&self) -> MutexGuard<'_, Option<Arc<L>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind the listener and serve until `stop`.
    ///
    /// Blocks the calling thread. Returns `Ok(())` after a clean shutdown.
    pub fn start(&self) -> Result<(), ServerError> {
        let listener = Arc::new(L::bind(&self.settings.addr, self.settings.port)?);

        {
            let mut slot = self.listener();
            if slot.is_some() {
                let _ = listener.close();
                return Err(ServerError::AlreadyStarted);
            }
            if !self.registry.is_running() {
                // `stop` already ran; nothing will close this listener later.
                let _ = listener.close();
                return Ok(());
            }
            *slot = Some(Arc::clone(&listener));
        }

        info!(
            transport = L::NAME,
            addr = %self.settings.addr,
            port = self.local_addr().map_or(self.settings.port, |a| a.port()),
            "Server listening"
        );

        self.accept_connections(listener.as_ref())
    }

    /// Stop accepting, close every connection, and close the listener.
    ///
    /// Does not wait for handlers to exit. Safe to call more than once and
    /// before or without `start`.
    pub fn stop(&self) -> Result<(), ServerError> {
        let closed = self.registry.close_all();
        let listener = self.listener().clone();
        match listener {
            Some(listener) => {
                info!(transport = L::NAME, connections = closed, "Shutting down server");
                listener.close().map_err(ServerError::Close)
            }
            None => Ok(()),
        }
    }

    pub fn state(&self) -> ServerState {
        let started = self.listener().is_some();
        match (self.registry.is_running(), started) {
            (true, false) => ServerState::Created,
            (true, true) => ServerState::Running,
            (false, _) if !self.registry.is_empty() => ServerState::Stopping,
            (false, _) => ServerState::Stopped,
        }
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener().as_ref().and_then(|l| l.local_addr())
    }

    /// Number of connections currently registered.
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    fn accept_connections(&self, listener: &L) -> Result<(), ServerError> {
        while self.registry.is_running() {
            let conn = match listener.accept() {
                Ok(conn) => conn,
                Err(e) => {
                    if !self.registry.is_running() {
                        return Ok(());
                    }
                    if transport::is_transient_accept_error(&e) {
                        error!(error = %e, "Temporary error accepting connection");
                        continue;
                    }
                    return Err(ServerError::Accept(e));
                }
            };
            self.dispatch(conn);
        }
        Ok(())
    }

    /// Register the connection and hand it to its own supervised task.
    fn dispatch(&self, conn: L::Conn) {
        let Some(registration) = Registration::register(&self.registry, Arc::new(conn)) else {
            debug!("Dropped connection accepted during shutdown");
            return;
        };

        let timeouts = self.timeouts;
        let spawned = runtime::spawn_supervised("echo-conn", move || {
            let disconnect = handle_connection(registration.conn().as_ref(), timeouts, L::KEEPALIVE);
            log_disconnect(registration.key(), &disconnect);
        });
        // On failure the task, and with it the registration, is dropped,
        // which closes and unregisters the connection.
        if let Err(e) = spawned {
            error!(error = %e, "Failed to spawn connection handler");
        }
    }
}

/// Why a connection's handler returned.
#[derive(Debug)]
pub enum Disconnect {
    /// Client sent `quit`
    Quit,
    /// Client closed its end
    Eof,
    /// Reading failed for a reason other than a timeout
    ReadFailed(io::Error),
    /// Writing the response timed out
    WriteTimedOut(io::Error),
    /// Writing the response failed
    WriteFailed(io::Error),
    /// A timeout could not be armed
    TimeoutSetup(io::Error),
}

/// Serve the line-echo protocol on one connection.
fn handle_connection<C: Connection + ?Sized>(
    conn: &C,
    timeouts: Timeouts,
    keepalive: Option<Duration>,
) -> Disconnect {
    let peer = conn.remote_addr();
    info!(%peer, local = %conn.local_addr(), "New connection");

    if let Some(period) = keepalive {
        if let Err(e) = conn.set_keepalive(period) {
            error!(%peer, error = %e, "Failed to enable keep-alive");
        }
    }
    if conn.deadlines() == Deadlines::Ignored {
        debug!(%peer, "Transport ignores read/write timeouts");
    }

    let mut lines = LineBuffer::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        if let Err(e) = conn.set_read_timeout(timeouts.read) {
            return Disconnect::TimeoutSetup(e);
        }

        let line = match read_line(conn, &mut lines, &mut chunk) {
            Ok(Some(line)) => line,
            Ok(None) => return Disconnect::Eof,
            Err(e) if transport::is_timeout(&e) => {
                debug!(%peer, "Read timeout");
                continue;
            }
            Err(e) => return Disconnect::ReadFailed(e),
        };

        let message = protocol::normalize(&line);
        info!(%peer, %message, "Received");

        if let Err(e) = conn.set_write_timeout(timeouts.write) {
            return Disconnect::TimeoutSetup(e);
        }

        if let Err(e) = write_all(conn, &protocol::response(&message)) {
            return if transport::is_timeout(&e) {
                Disconnect::WriteTimedOut(e)
            } else {
                Disconnect::WriteFailed(e)
            };
        }

        if protocol::is_quit(&message) {
            return Disconnect::Quit;
        }
    }
}

fn log_disconnect(peer: &str, disconnect: &Disconnect) {
    match disconnect {
        Disconnect::Quit => info!(peer, "Client requested to quit"),
        Disconnect::Eof => info!(peer, "Client disconnected"),
        Disconnect::ReadFailed(e) if e.kind() == io::ErrorKind::NotConnected => {
            debug!(peer, "Connection closed by server")
        }
        Disconnect::ReadFailed(e) => error!(peer, error = %e, "Client disconnected"),
        Disconnect::WriteTimedOut(e) => error!(peer, error = %e, "Write timeout"),
        Disconnect::WriteFailed(e) => error!(peer, error = %e, "Failed to send response"),
        Disconnect::TimeoutSetup(e) => error!(peer, error = %e, "Failed to set timeout"),
    }
}

/// Read until the buffer yields a full line. `Ok(None)` on end of stream.
fn read_line<C: Connection + ?Sized>(
    conn: &C,
    lines: &mut LineBuffer,
    chunk: &mut [u8],
) -> io::Result<Option<Bytes>> {
    loop {
        if let Some(line) = lines.next_line()? {
            return Ok(Some(line));
        }
        match conn.read(chunk) {
            Ok(0) => return Ok(None),
            Ok(n) => lines.extend(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Write the whole buffer, retrying short writes.
fn write_all<C: Connection + ?Sized>(conn: &C, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match conn.write(buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole response",
                ))
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
