//! tcp-echo: a line-oriented TCP echo server
//!
//! Each line a client sends is answered with `Server received: <line>`.
//! Sending `quit` ends the session.
//!
//! Two interchangeable transports:
//! - `standard`: `std::net` sockets with per-operation read/write timeouts
//! - `raw`: sockets driven directly by syscalls, without timeouts
//!
//! Configuration via CLI arguments or a TOML file.

mod config;
mod error;
mod logging;
mod protocol;
mod runtime;
mod server;
mod transport;

use config::{Config, ServerType};
use error::ServerError;
use server::{Server, ServerSettings};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};
use transport::{Listener, RawListener, StdListener};

/// How long to wait for handlers after the server has stopped
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn main() -> Result<(), Box<dyn Error>> {
    let config = Config::load()?;
    logging::init(&config.logging)?;

    info!(
        server_type = ?config.server_type,
        addr = %config.addr,
        port = config.port,
        read_timeout = ?config.read_timeout,
        write_timeout = ?config.write_timeout,
        "Starting tcp-echo server"
    );

    // Signals and the accept loop; connection handlers get their own threads.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("echo-worker")
        .build()?;

    let result = match config.server_type {
        ServerType::Standard => run::<StdListener>(&config, &runtime),
        ServerType::Raw => run::<RawListener>(&config, &runtime),
    };

    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

/// Serve on transport `L` until a shutdown signal arrives or startup fails.
fn run<L: Listener>(config: &Config, runtime: &tokio::runtime::Runtime) -> Result<(), Box<dyn Error>> {
    let server = Arc::new(Server::<L>::new(ServerSettings::from(config)));

    let accepting = Arc::clone(&server);
    let serving = runtime.spawn_blocking(move || accepting.start());

    info!(
        "Server started on {}:{}. Press Ctrl+C to stop",
        config.addr, config.port
    );

    runtime.block_on(serve_until_shutdown(server, serving))
}

async fn serve_until_shutdown<L: Listener>(
    server: Arc<Server<L>>,
    mut serving: JoinHandle<Result<(), ServerError>>,
) -> Result<(), Box<dyn Error>> {
    tokio::select! {
        result = &mut serving => {
            // The accept loop only returns on its own if startup or accept failed.
            result??;
            return Ok(());
        }
        _ = shutdown_signal() => {}
    }

    info!("Shutting down server...");
    server.stop()?;
    serving.await??;
    info!(
        state = ?server.state(),
        draining = server.active_connections(),
        "Server stopped"
    );
    Ok(())
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
