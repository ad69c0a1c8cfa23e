//! Secure listener.
//!
//! Accepts TCP connections, runs the mutual TLS handshake and serves HTTP/1.1
//! on each authenticated connection from its own task. Connections whose
//! handshake fails are dropped without a response.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::router::{AgentState, router};
use crate::tls::{MutualTlsBuilder, TlsError};

/// Pause after a failed accept, so descriptor exhaustion doesn't spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Errors that can occur while starting or running the listener
#[derive(Debug, Error)]
pub enum ServerError {
    /// TLS material could not be loaded
    #[error(transparent)]
    Tls(#[from] TlsError),
    /// The listen address could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: SocketAddr,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },
    /// The listener task panicked or was aborted
    #[error("listener task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A bound, not yet running, secure listener.
pub struct SideloadServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    acceptor: TlsAcceptor,
    app: Router,
}

impl std::fmt::Debug for SideloadServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SideloadServer")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl SideloadServer {
    /// Load TLS material and bind the configured address.
    pub async fn bind(config: &AgentConfig, state: Arc<AgentState>) -> Result<Self, ServerError> {
        let acceptor =
            MutualTlsBuilder::from_files(&config.server_cert, &config.server_key, &config.client_ca)?
                .acceptor()?;
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.listen_addr,
                source,
            })?;
        let app = router(state, config.max_upload_bytes);
        Self::from_parts(listener, acceptor, app).map_err(|source| ServerError::Bind {
            addr: config.listen_addr,
            source,
        })
    }

    /// Assemble a server from an already bound listener.
    pub fn from_parts(
        listener: TcpListener,
        acceptor: TlsAcceptor,
        app: Router,
    ) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            acceptor,
            app,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// On shutdown the listener is closed first, then open connections are
    /// asked to finish their current request and the call waits for them.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        let connections = CancellationToken::new();
        let tracker = TaskTracker::new();

        info!("Sideloading agent listening on {}", self.local_addr);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let acceptor = self.acceptor.clone();
                        let app = self.app.clone();
                        let token = connections.clone();
                        tracker.spawn(handle_connection(stream, peer, acceptor, app, token));
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(self.listener);
        info!(
            "Listener closed, waiting for {} open connection(s)",
            tracker.len()
        );

        connections.cancel();
        tracker.close();
        tracker.wait().await;

        info!("Sideloading agent shut down");
        Ok(())
    }

    /// Run the listener on its own task.
    pub fn spawn(self) -> AgentHandle {
        let local_addr = self.local_addr;
        let token = CancellationToken::new();
        let shutdown = token.clone().cancelled_owned();
        let task = tokio::spawn(self.run(shutdown));
        AgentHandle {
            local_addr,
            token,
            task,
        }
    }
}

/// Handle to a listener running on its own task.
#[derive(Debug)]
pub struct AgentHandle {
    local_addr: SocketAddr,
    token: CancellationToken,
    task: JoinHandle<Result<(), ServerError>>,
}

impl AgentHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Token that stops the listener when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop accepting, let open connections finish, and wait for the task.
    pub async fn shutdown(self) -> Result<(), ServerError> {
        self.token.cancel();
        self.task.await?
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    app: Router,
    shutdown: CancellationToken,
) {
    let tls = tokio::select! {
        handshake = acceptor.accept(stream) => match handshake {
            Ok(tls) => tls,
            Err(e) => {
                warn!(%peer, "TLS handshake failed: {}", e);
                return;
            }
        },
        _ = shutdown.cancelled() => return,
    };
    debug!(%peer, "Client authenticated");

    let conn = http1::Builder::new().serve_connection(TokioIo::new(tls), TowerToHyperService::new(app));
    let mut conn = std::pin::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = result {
        debug!(%peer, "Connection error: {}", e);
    }
    debug!(%peer, "Connection closed");
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                // Fall through to let ctrl_c handle shutdown
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
