//! Listener and run lifecycle.
//!
//! Binds the configured endpoint, accepts connections and hands each one a
//! state machine bound to the shared experiment interface. On shutdown:
//! stop accepting, signal every connection, wait for them to finalize, drain
//! the writer and export, then clean up the backing store file (when not
//! persisting) and any UNIX socket.
//!
//! A periodic timer logs the writer backlog for observability.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::{DatabaseEngine, Endpoint, RecorderConfig};
use crate::connection::{Connection, PeerAddr};
use crate::export::Exporter;
use crate::interface::{ExperimentInterface, InterfaceError};
use crate::store::{Store, StoreError};

/// Interval between writer backlog log lines.
const BACKLOG_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("bind failed: {0}")]
    Bind(std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Interface(#[from] InterfaceError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

enum BoundListener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

/// A bound, ready-to-run recording server.
pub struct RecorderServer {
    cfg: RecorderConfig,
    interface: Arc<ExperimentInterface>,
    listener: BoundListener,
    shutdown_tx: watch::Sender<bool>,
}

/// Handle for triggering a clean shutdown from signal handlers or tests.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl RecorderServer {
    /// Open the store, build the shared interface and bind the endpoint.
    pub async fn bind(cfg: RecorderConfig) -> Result<Self, ServerError> {
        let store = match &cfg.database.engine {
            DatabaseEngine::File(path) => Arc::new(Store::open(path)?),
            DatabaseEngine::Memory => Arc::new(Store::open_in_memory()?),
        };
        let exporter = Exporter::from_config(&cfg.output);
        let interface = Arc::new(ExperimentInterface::new(
            store,
            exporter,
            cfg.database.record_chunksize,
            cfg.experiment.default_metadata.clone(),
        )?);

        let listener = match &cfg.server.endpoint {
            Endpoint::Tcp4 { port, interface } => {
                let listener = TcpListener::bind((*interface, *port))
                    .await
                    .map_err(ServerError::Bind)?;
                info!(addr = %listener.local_addr().map_err(ServerError::Bind)?,
                      backlog = cfg.server.backlog, "listening (tcp4)");
                BoundListener::Tcp(listener)
            }
            Endpoint::Tcp6 { port, interface } => {
                let listener = TcpListener::bind((*interface, *port))
                    .await
                    .map_err(ServerError::Bind)?;
                info!(addr = %listener.local_addr().map_err(ServerError::Bind)?,
                      backlog = cfg.server.backlog, "listening (tcp6)");
                BoundListener::Tcp(listener)
            }
            Endpoint::Unix { path } => {
                let listener = UnixListener::bind(path).map_err(ServerError::Bind)?;
                info!(path = %path.display(), backlog = cfg.server.backlog, "listening (unix)");
                BoundListener::Unix(listener, path.clone())
            }
        };

        let (shutdown_tx, _) = watch::channel(false);
        Ok(RecorderServer {
            cfg,
            interface,
            listener,
            shutdown_tx,
        })
    }

    /// The bound TCP address (None for UNIX endpoints). Useful with port 0.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match &self.listener {
            BoundListener::Tcp(listener) => listener.local_addr().ok(),
            BoundListener::Unix(..) => None,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    pub fn interface(&self) -> Arc<ExperimentInterface> {
        Arc::clone(&self.interface)
    }

    /// Accept connections until shutdown is triggered, then drain and export.
    pub async fn run(self) -> Result<(), ServerError> {
        let RecorderServer {
            cfg,
            interface,
            listener,
            shutdown_tx,
        } = self;
        let mut shutdown_rx = shutdown_tx.subscribe();
        let mut connections = JoinSet::new();
        let mut backlog_timer = tokio::time::interval(BACKLOG_LOG_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = backlog_timer.tick() => {
                    let (chunks, records) = interface.backlog();
                    info!(chunks, approx_records = records, "writer backlog");
                }
                accepted = accept(&listener) => match accepted {
                    Ok((stream, peer)) => {
                        let conn_shutdown = shutdown_tx.subscribe();
                        match stream {
                            Accepted::Tcp(stream) => {
                                let conn =
                                    Connection::new(stream, peer, Arc::clone(&interface));
                                connections.spawn(conn.run(conn_shutdown));
                            }
                            Accepted::Unix(stream) => {
                                let conn =
                                    Connection::new(stream, peer, Arc::clone(&interface));
                                connections.spawn(conn.run(conn_shutdown));
                            }
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                    }
                },
            }
        }

        // Stop accepting, let in-flight connections observe the close event
        // and finalize their experiments.
        info!("shutting down: waiting for connections to finalize");
        let unix_path = match listener {
            BoundListener::Unix(listener, path) => {
                drop(listener);
                Some(path)
            }
            BoundListener::Tcp(listener) => {
                drop(listener);
                None
            }
        };
        let _ = shutdown_tx.send(true);
        while connections.join_next().await.is_some() {}

        // Drain the writer, emit the artifacts and close the store. The
        // store files are only deleted after a successful export.
        interface.close()?;
        if !cfg.database.persist {
            if let DatabaseEngine::File(path) = &cfg.database.engine {
                remove_store_files(path);
            }
        }
        if let Some(path) = unix_path {
            if let Err(err) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %err, "could not remove socket file");
            }
        }
        info!("shutdown complete");
        Ok(())
    }
}

/// Delete the SQLite file and its WAL sidecars.
///
/// The store was checkpointed and closed first, so the `-wal`/`-shm` files
/// are normally already gone; unlinking them as well covers an unclean
/// previous run leaving stale sidecars next to the database.
fn remove_store_files(path: &std::path::Path) {
    if let Err(err) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %err, "could not delete store file");
    } else {
        info!(path = %path.display(), "store file deleted");
    }
    for suffix in ["-wal", "-shm"] {
        let sidecar = sidecar_path(path, suffix);
        match std::fs::remove_file(&sidecar) {
            Ok(()) => info!(path = %sidecar.display(), "store sidecar deleted"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %sidecar.display(), error = %err, "could not delete store sidecar");
            }
        }
    }
}

/// `run.db` → `run.db-wal` / `run.db-shm` (SQLite appends to the full name).
fn sidecar_path(path: &std::path::Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

enum Accepted {
    Tcp(tokio::net::TcpStream),
    Unix(tokio::net::UnixStream),
}

async fn accept(listener: &BoundListener) -> std::io::Result<(Accepted, PeerAddr)> {
    match listener {
        BoundListener::Tcp(listener) => {
            let (stream, addr) = listener.accept().await?;
            Ok((Accepted::Tcp(stream), PeerAddr::Tcp(addr)))
        }
        BoundListener::Unix(listener, path) => {
            let (stream, _addr) = listener.accept().await?;
            let peer = PeerAddr::Unix(path.display().to_string());
            Ok((Accepted::Unix(stream), peer))
        }
    }
}
