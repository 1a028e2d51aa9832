//! Server shell: listener binding, signal handling, graceful shutdown, and
//! the reload cycle.
//!
//! `run` serves one configuration snapshot per cycle. A reload signal stops
//! the accept loop, drains in-flight requests up to the grace period, then
//! rebuilds the routing table from the freshly published configuration and
//! rebinds. Requests in flight at swap time finish on the old pipeline set;
//! requests arriving after the rebind see the new one. Termination signals
//! end the loop the same way, minus the rebind.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ReloadHandle;
use crate::error::GatewayError;
use crate::ratelimit::LimiterRegistry;
use crate::router::{build_router, GatewayState};

/// Default drain window for in-flight requests.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Fatal server failures; anything recoverable is handled in the loop.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),

    #[error(transparent)]
    Init(#[from] GatewayError),
}

enum Cycle {
    Reload,
    Shutdown,
}

/// Owns the process-global registries and drives serve/drain/reload cycles.
pub struct Server {
    reload: Arc<ReloadHandle>,
    state: GatewayState,
    grace: Duration,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(reload: Arc<ReloadHandle>) -> Result<Self, ServerError> {
        let state = GatewayState::new()?;
        let shutdown = CancellationToken::new();
        Arc::clone(&state.limiters).spawn_sweeper(shutdown.clone());
        Ok(Self {
            reload,
            state,
            grace: SHUTDOWN_GRACE,
            shutdown,
        })
    }

    /// Override the drain grace period (tests use short windows).
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Registries owned by this server, shared with every pipeline build.
    pub fn limiters(&self) -> &Arc<LimiterRegistry> {
        &self.state.limiters
    }

    /// Serve until terminal shutdown. Reloads are transparent to callers:
    /// the method only returns on a termination signal or a fatal error.
    pub async fn run(self, mut reload_rx: mpsc::Receiver<()>) -> Result<(), ServerError> {
        loop {
            let config = self.reload.current();
            let addr = format!("{}:{}", config.server.host, config.server.port);
            let app = build_router(&config, &self.state);

            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|source| ServerError::Bind {
                    addr: addr.clone(),
                    source,
                })?;
            info!(
                addr = %addr,
                routes = config.routes.len(),
                "listening for connections"
            );

            let cycle_token = CancellationToken::new();
            let serve = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
            )
            .with_graceful_shutdown(cycle_token.clone().cancelled_owned())
            .into_future();
            tokio::pin!(serve);

            let mut serve_done = false;
            let outcome = tokio::select! {
                result = &mut serve => {
                    serve_done = true;
                    result?;
                    Cycle::Shutdown
                }
                _ = shutdown_signal() => {
                    info!("termination signal received, shutting down");
                    Cycle::Shutdown
                }
                _ = reload_notified(&mut reload_rx) => {
                    info!("configuration reload requested, restarting server");
                    Cycle::Reload
                }
            };

            cycle_token.cancel();
            if !serve_done {
                match tokio::time::timeout(self.grace, &mut serve).await {
                    Ok(result) => result?,
                    Err(_) => warn!(
                        grace_secs = self.grace.as_secs(),
                        "drain grace period expired, dropping remaining connections"
                    ),
                }
            }

            match outcome {
                Cycle::Reload => continue,
                Cycle::Shutdown => break,
            }
        }

        self.shutdown.cancel();
        info!("server stopped");
        Ok(())
    }
}

// A closed reload channel means hot reload is disabled, not shutdown.
async fn reload_notified(rx: &mut mpsc::Receiver<()>) {
    match rx.recv().await {
        Some(()) => {}
        None => std::future::pending().await,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(%error, "failed to install SIGTERM handler");
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
