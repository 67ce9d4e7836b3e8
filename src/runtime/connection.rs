//! Registry of live connections for one server instance.
//!
//! Owns the server's running flag alongside the map so that registration and
//! shutdown are ordered: once `close_all` has run, nothing else is admitted.

use crate::transport::Connection;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Live connections keyed by remote address.
#[derive(Debug)]
pub struct ConnectionRegistry<C> {
    connections: RwLock<HashMap<String, Arc<C>>>,
    running: AtomicBool,
}

impl<C: Connection> ConnectionRegistry<C> {
    /// Create an empty registry in the running state.
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            running: AtomicBool::new(true),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<C>>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<C>>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `close_all` has not been called yet.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Track a connection under `key`.
    ///
    /// Returns `false` once the registry is shutting down; the caller owns
    /// closing the connection in that case.
    pub fn register(&self, key: String, conn: Arc<C>) -> bool {
        let mut connections = self.write();
        if !self.is_running() {
            return false;
        }
        if let Some(previous) = connections.insert(key, conn) {
            debug!(peer = %previous.remote_addr(), "Replaced stale registry entry");
        }
        true
    }

    /// Remove `key` if it still maps to `conn`.
    pub fn unregister(&self, key: &str, conn: &Arc<C>) -> bool {
        let mut connections = self.write();
        match connections.get(key) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                connections.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Stop admitting connections and close every registered one.
    ///
    /// Entries stay in the map until their handlers unregister them.
    /// Returns how many connections were closed.
    pub fn close_all(&self) -> usize {
        let snapshot: Vec<Arc<C>> = {
            let connections = self.write();
            self.running.store(false, Ordering::Release);
            connections.values().cloned().collect()
        };

        for conn in &snapshot {
            if let Err(e) = conn.close() {
                debug!(peer = %conn.remote_addr(), error = %e, "Error closing connection");
            }
        }
        snapshot.len()
    }

    #[cfg(test)]
    pub fn contains(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl<C: Connection> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a connection registered for as long as it lives.
///
/// Dropping it (normal return or unwinding) unregisters the connection and
/// closes it.
pub struct Registration<C: Connection> {
    registry: Arc<ConnectionRegistry<C>>,
    key: String,
    conn: Arc<C>,
}

impl<C: Connection> Registration<C> {
    /// Register `conn` under its remote address.
    ///
    /// Returns `None`, after closing the connection, if the registry is
    /// shutting down.
    pub fn register(registry: &Arc<ConnectionRegistry<C>>, conn: Arc<C>) -> Option<Self> {
        let key = conn.remote_addr().to_string();
        if !registry.register(key.clone(), Arc::clone(&conn)) {
            let _ = conn.close();
            return None;
        }
        Some(Self {
            registry: Arc::clone(registry),
            key,
            conn,
        })
    }

    pub fn conn(&self) -> &Arc<C> {
        &self.conn
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<C: Connection> Drop for Registration<C> {
    fn drop(&mut self) {
        if let Err(e) = self.conn.close() {
            debug!(peer = %self.key, error = %e, "Error closing connection");
        }
        self.registry.unregister(&self.key, &self.conn);
    }
}
