//! The engine: listener set, connection registry, and shutdown state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conn::Connection;
use crate::err::ListenerError;
use crate::listener::{ListenerParams, accept_loop};
use crate::resolve::{NetResolver, SystemResolver};

/// The context shared by every listener and connection of one proxy.
///
/// An engine owns its listener set and its registry of live connections,
/// and coordinates shutdown across them: once
/// [`start_shutdown`](Engine::start_shutdown) has been called, no new
/// connection is admitted, and [`wait_shutdown`](Engine::wait_shutdown)
/// completes as soon as the registry is empty. Engines are independent of
/// one another, so tests can run several side by side.
pub struct Engine {
    /// The listener set and connection registry.
    registry: Mutex<Registry>,
    /// Latches true when shutdown starts. Never unset.
    shutting_down: AtomicBool,
    /// Latches true when shutdown has completed. Guards the completion
    /// signal so it fires exactly once.
    finished: AtomicBool,
    /// Completion signal, sent once when shutdown finishes.
    done_tx: watch::Sender<bool>,
    /// Receiver kept around for [`Engine::wait_shutdown`] to clone.
    done_rx: watch::Receiver<bool>,
    /// Resolver handed to SOCKS-mode connections.
    resolver: Arc<dyn NetResolver>,
    /// Serial numbers for connections, for the logs.
    next_serial: AtomicU64,
}

/// The mutable registries behind the engine's lock.
#[derive(Default)]
struct Registry {
    /// Cancellation handles for every running accept loop.
    listeners: Vec<CancellationToken>,
    /// A force-close handle for every live connection.
    conns: HashMap<u64, CancellationToken>,
}

impl Engine {
    /// Construct an engine that resolves hostnames with the system
    /// resolver.
    pub fn new() -> Arc<Self> {
        Engine::with_resolver(Arc::new(SystemResolver::new()))
    }

    /// Construct an engine with a caller-supplied resolver.
    pub fn with_resolver(resolver: Arc<dyn NetResolver>) -> Arc<Self> {
        let (done_tx, done_rx) = watch::channel(false);
        Arc::new(Engine {
            registry: Mutex::new(Registry::default()),
            shutting_down: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            done_tx,
            done_rx,
            resolver,
            next_serial: AtomicU64::new(1),
        })
    }

    /// Bind a listener and start accepting connections for it.
    ///
    /// Returns the actual bound address, which matters when `params.listen`
    /// carries port zero.
    pub async fn add_listener(
        self: &Arc<Self>,
        params: ListenerParams,
    ) -> Result<SocketAddr, ListenerError> {
        params.validate()?;
        if self.is_shutting_down() {
            return Err(ListenerError::ShuttingDown);
        }
        let listener = TcpListener::bind(params.listen)
            .await
            .map_err(|e| ListenerError::Bind {
                addr: params.listen,
                source: Arc::new(e),
            })?;
        let local = listener.local_addr().map_err(|e| ListenerError::Bind {
            addr: params.listen,
            source: Arc::new(e),
        })?;
        let cancel = CancellationToken::new();
        self.registry
            .lock()
            .expect("poisoned lock")
            .listeners
            .push(cancel.clone());
        info!("Listening on {} in {:?} mode", local, params.mode);
        tokio::spawn(accept_loop(
            Arc::clone(self),
            listener,
            Arc::new(params),
            cancel,
        ));
        Ok(local)
    }

    /// Begin shutting down.
    ///
    /// Graceful shutdown leaves live connections to drain on their own;
    /// barbaric shutdown force-closes every one of them, dropping whatever
    /// they had buffered. Either way no new connection is admitted from
    /// here on. Idempotent, and graceful never un-does barbaric.
    pub fn start_shutdown(&self, barbaric: bool) {
        let first = !self.shutting_down.swap(true, Ordering::SeqCst);
        if first {
            info!(
                "Shutting down{}",
                if barbaric { " (barbarically)" } else { "" }
            );
        }
        if barbaric {
            let registry = self.registry.lock().expect("poisoned lock");
            for cancel in registry.conns.values() {
                cancel.cancel();
            }
        }
        self.maybe_finish();
    }

    /// Close every accepting socket and forget the listener set.
    ///
    /// Live connections are unaffected. Idempotent.
    pub fn free_all_listeners(&self) {
        let mut registry = self.registry.lock().expect("poisoned lock");
        for cancel in registry.listeners.drain(..) {
            cancel.cancel();
        }
    }

    /// Complete once shutdown has finished: shutdown was started, and the
    /// last connection is gone.
    pub async fn wait_shutdown(&self) {
        let mut rx = self.done_rx.clone();
        // The sender lives as long as we do, so this can't fail.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Return true once shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// How many connections are currently live.
    pub fn n_connections(&self) -> usize {
        self.registry.lock().expect("poisoned lock").conns.len()
    }

    /// Spawn a connection task for a freshly accepted socket.
    pub(crate) fn launch_conn(
        self: &Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        params: &Arc<ListenerParams>,
    ) {
        let proto = match params.protocol.build(params.endpoint()) {
            Ok(proto) => proto,
            Err(e) => {
                warn!("Dropping connection from {}: {}", peer, e);
                return;
            }
        };
        let Some((serial, cancel)) = self.admit() else {
            debug!("Refusing connection from {}: shutting down", peer);
            return;
        };
        debug!(conn = serial, "accepted connection from {}", peer);
        let conn = Connection::new(
            serial,
            params.mode,
            proto,
            stream,
            params.target,
            params.idle_timeout,
            Arc::clone(&self.resolver),
        );
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            // Deregisters on every exit path, including panics.
            let _guard = ConnGuard { engine, serial };
            match conn.run(cancel).await {
                Ok(()) => debug!(conn = serial, "connection finished"),
                Err(e) => debug!(conn = serial, "connection closed: {}", report(&e)),
            }
        });
    }

    /// Register a new connection, unless shutdown has begun.
    fn admit(&self) -> Option<(u64, CancellationToken)> {
        let mut registry = self.registry.lock().expect("poisoned lock");
        if self.is_shutting_down() {
            return None;
        }
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        registry.conns.insert(serial, cancel.clone());
        Some((serial, cancel))
    }

    /// Remove a connection from the registry, finishing shutdown if it was
    /// the last one.
    fn retire(&self, serial: u64) {
        self.registry
            .lock()
            .expect("poisoned lock")
            .conns
            .remove(&serial);
        self.maybe_finish();
    }

    /// Fire the completion signal if shutdown has started and nothing is
    /// left. Only the first caller to see that state sends it.
    fn maybe_finish(&self) {
        if !self.is_shutting_down() {
            return;
        }
        let empty = self.registry.lock().expect("poisoned lock").conns.is_empty();
        if empty && !self.finished.swap(true, Ordering::SeqCst) {
            debug!("Shutdown complete");
            let _ = self.done_tx.send(true);
        }
    }
}

/// Removes a connection from its engine's registry on drop.
struct ConnGuard {
    /// The engine that admitted us.
    engine: Arc<Engine>,
    /// Which connection to retire.
    serial: u64,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.engine.retire(self.serial);
    }
}

/// Format an error with its sources, for one-line logging.
fn report(e: &dyn std::error::Error) -> String {
    let mut line = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        line.push_str(": ");
        line.push_str(&cause.to_string());
        source = cause.source();
    }
    line
}
