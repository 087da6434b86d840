use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::engine::EngineCommand;
use crate::error::CrierdError;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, warn};

/// Maximum number of sockets allowed before their sessions are attached.
/// This prevents DoS by exhausting file descriptors before registration.
pub const MAX_PRE_AUTH_CONNECTIONS: usize = 1000;

/// Shared state for the relay server's transport layer.
pub struct ServerState {
    /// Command channel into the engine task that owns all core state.
    pub engine_tx: mpsc::Sender<EngineCommand>,
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Per-IP connection counter for enforcing connection limits.
    pub ip_connections: DashMap<IpAddr, usize>,
    /// Atomic counter for attached connections.
    pub active_connections: AtomicUsize,
    /// Semaphore to limit not-yet-attached connections.
    pub pre_auth_semaphore: Semaphore,
    /// Session id source; ids are never reused within a process run.
    pub next_session_id: AtomicU64,
}

impl ServerState {
    /// Build transport state around an engine command channel.
    #[must_use]
    pub fn new(config: ServerConfig, engine_tx: mpsc::Sender<EngineCommand>) -> Self {
        Self {
            engine_tx,
            config,
            ip_connections: DashMap::new(),
            active_connections: AtomicUsize::new(0),
            pre_auth_semaphore: Semaphore::new(MAX_PRE_AUTH_CONNECTIONS),
            next_session_id: AtomicU64::new(1),
        }
    }
}

/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), CrierdError> {
    let (shutdown_tx, _) = tokio::sync::watch::channel(());
    run_with_shutdown(listener, state, shutdown_tx).await
}

/// Run the server accept loop with an externally-controlled shutdown signal.
///
/// When the `shutdown_tx` sender is dropped, the accept loop stops accepting
/// new connections and waits for in-flight connections to finish.
///
/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown_tx: tokio::sync::watch::Sender<()>,
) -> Result<(), CrierdError> {
    let local_addr = listener.local_addr().map_err(CrierdError::Io)?;
    info!("server listening on {}", local_addr);
    let mut shutdown_rx = shutdown_tx.subscribe();
    let task_tracker = Arc::new(tokio::sync::Notify::new());
    let mut active_tasks: usize = 0;

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if state.active_connections.load(Ordering::Relaxed) >= state.config.max_conns {
                            warn!("max connections reached, rejecting {}", addr);
                            drop(stream);
                            continue;
                        }
                        let state = Arc::clone(&state);
                        let tracker = task_tracker.clone();
                        active_tasks += 1;
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, state).await {
                                tracing::debug!("connection from {} closed: {}", addr, e);
                            }
                            tracker.notify_one();
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!("shutdown signal received, draining {} connections", active_tasks);
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (with timeout)
    let drain_timeout = std::time::Duration::from_secs(30);
    let deadline = tokio::time::Instant::now() + drain_timeout;
    while active_tasks > 0 {
        if tokio::time::timeout_at(deadline, task_tracker.notified())
            .await
            .is_err()
        {
            warn!(
                "drain timeout reached with {} connections still active",
                active_tasks
            );
            break;
        }
        active_tasks = active_tasks.saturating_sub(1);
    }

    info!("server shut down gracefully");
    Ok(())
}
