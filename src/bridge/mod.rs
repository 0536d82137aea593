//! Bridge daemon: location registry behind a Unix socket.
//!
//! The bridge listens on a Unix domain socket. App connections issue
//! one-shot location requests and manage watches; host connections
//! deliver lifecycle events and answer permission prompts and settings
//! dialogs.
//!
//! Architecture: channel-based actor. A single bridge loop owns all
//! mutable state ([`state::BridgeState`]), including the
//! [`WatchRegistry`](crate::geo::registry::WatchRegistry). Per-connection
//! tasks forward commands via mpsc channels. Registry continuations
//! (permission answers, settings checks, fetch completions) re-enter the
//! loop as [`RegistryEvent`]s, so no state is shared across tasks.

mod connection;
mod handler;
pub mod state;

use std::future::Future;
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use connection::{BridgeCommand, DisconnectNotice};
use state::{BridgeState, ConnectionId};

use crate::geo::permission::PermissionMode;
use crate::geo::registry::{RegistryConfig, RegistryEvent};
use crate::geo::sim::SimConfig;

/// Bridge startup/runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("$XDG_RUNTIME_DIR is not set")]
    NoRuntimeDir,
    #[error("bridge already running at {0}")]
    AlreadyRunning(PathBuf),
    #[error("failed to create directory {path}: {source}")]
    MkdirFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to bind socket {path}: {source}")]
    BindFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Daemon configuration assembled from the command line.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Initial permission state.
    pub permission: PermissionMode,
    pub sim: SimConfig,
    pub registry: RegistryConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            permission: PermissionMode::Prompt,
            sim: SimConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

/// Run the bridge daemon until SIGTERM or SIGINT.
///
/// # Errors
///
/// Returns `BridgeError` if `$XDG_RUNTIME_DIR` is unset, socket bind
/// fails, or another bridge is already running.
///
/// - Socket at `$XDG_RUNTIME_DIR/geolocd/bridge.sock` (directory mode 0700)
/// - Stale socket detection and cleanup
/// - SIGTERM/SIGINT → graceful shutdown, socket file removed
/// - Watches and pending requests live in memory only
pub async fn run(config: BridgeConfig) -> Result<(), BridgeError> {
    let socket_path = resolve_socket_path()?;
    let listener = bind_socket(&socket_path).await?;

    tracing::info!(
        path = %socket_path.display(),
        permission = ?config.permission,
        location_mode = config.sim.location_mode,
        "bridge listening"
    );

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        }
    };

    serve(listener, config, shutdown).await;

    if let Err(e) = std::fs::remove_file(&socket_path) {
        tracing::warn!(error = %e, path = %socket_path.display(), "failed to remove socket");
    }

    tracing::info!("bridge stopped");
    Ok(())
}

/// Drive the bridge loop on `listener` until `shutdown` completes.
///
/// Dropping the state on exit stops every backend registration.
async fn serve(listener: UnixListener, config: BridgeConfig, shutdown: impl Future<Output = ()>) {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<BridgeCommand>();
    let (disconnect_tx, mut disconnect_rx) = mpsc::unbounded_channel::<DisconnectNotice>();

    let (mut state, mut events_rx, mut host_rx) = BridgeState::new(config);
    state.registry.initialize();

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            // -- New connection --
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        accept_connection(stream, &cmd_tx, &disconnect_tx, &mut state);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }

            // -- Command from connection task --
            Some(cmd) = cmd_rx.recv() => {
                handler::handle_message(&mut state, cmd.request, cmd.connection_id);
            }

            // -- Registry continuation --
            Some(event) = events_rx.recv() => {
                log_event(&event);
                state.registry.handle_event(event);
            }

            // -- Registry needs the host --
            Some(request) = host_rx.recv() => {
                tracing::debug!(?request, "host request");
                state.dispatch_host_request(request);
            }

            // -- Connection disconnected --
            Some(notice) = disconnect_rx.recv() => {
                let conn_id = notice.connection_id;
                state.remove_connection(conn_id);
                tracing::debug!(?conn_id, "connection cleaned up");
            }

            () = &mut shutdown => break,
        }
    }

    tracing::info!(
        watches = state.registry.watch_ids().count(),
        pending = state.registry.pending_requests(),
        paused = state.registry.is_paused(),
        "bridge loop exiting"
    );
    drop(listener);
}

/// Accept a new connection: register its outbound channel and spawn the
/// handler task.
fn accept_connection(
    stream: UnixStream,
    cmd_tx: &mpsc::UnboundedSender<BridgeCommand>,
    disconnect_tx: &mpsc::UnboundedSender<DisconnectNotice>,
    state: &mut BridgeState,
) {
    let conn_id = ConnectionId::new();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    state.add_connection(conn_id, outbound_tx);

    connection::spawn_connection(
        stream,
        conn_id,
        cmd_tx.clone(),
        outbound_rx,
        disconnect_tx.clone(),
    );

    tracing::debug!(?conn_id, "accepted connection");
}

fn log_event(event: &RegistryEvent) {
    match event {
        RegistryEvent::FetchCompleted(Err(e)) => {
            tracing::debug!(error = %e, "fetch completed with error")
        }
        other => tracing::trace!(event = ?other, "registry event"),
    }
}

// -- Socket setup --

/// Resolve the bridge socket path from `$XDG_RUNTIME_DIR`.
pub fn resolve_socket_path() -> Result<PathBuf, BridgeError> {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").map_err(|_| BridgeError::NoRuntimeDir)?;
    Ok(PathBuf::from(runtime_dir)
        .join("geolocd")
        .join("bridge.sock"))
}

/// Create the socket directory and bind the Unix listener.
///
/// Handles stale socket detection: if EADDRINUSE, attempts to connect
/// to the existing socket. If the connection succeeds, another bridge
/// is running. If it fails, the socket is stale and is removed.
async fn bind_socket(path: &Path) -> Result<UnixListener, BridgeError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    if !parent.exists() {
        std::fs::create_dir_all(parent).map_err(|e| BridgeError::MkdirFailed {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).map_err(|e| {
            BridgeError::MkdirFailed {
                path: parent.to_path_buf(),
                source: e,
            }
        })?;
    }

    let bind_failed = |source: std::io::Error| BridgeError::BindFailed {
        path: path.to_path_buf(),
        source,
    };

    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            if UnixStream::connect(path).await.is_ok() {
                return Err(BridgeError::AlreadyRunning(path.to_path_buf()));
            }
            tracing::info!(path = %path.display(), "removing stale socket");
            std::fs::remove_file(path).map_err(bind_failed)?;
            UnixListener::bind(path).map_err(bind_failed)
        }
        Err(e) => Err(bind_failed(e)),
    }
}
