//! Server setup and lifecycle management
//!
//! One daemon process runs the management API, the edge listeners and the
//! control plane's background loops. They share a single shutdown signal:
//! Ctrl+C, SIGTERM or an edge listener failure stops all three.

use crate::api::create_router;
use crate::api::rest::state::AppState;
use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};
use axum::Router;
use keel_control::{KeelControlPlane, KeelControlPlaneBuilder};
use keel_edge::EdgeServer;
use keel_runtime::SimulatedRuntime;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Keel daemon server
pub struct Server {
    config: DaemonConfig,
    control: Arc<KeelControlPlane>,
}

impl Server {
    /// Build the control plane over the simulated runtime
    pub async fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let hosts = config.hosts().map_err(DaemonError::Config)?;
        info!(hosts = hosts.len(), "Using simulated container runtime");

        let control = KeelControlPlaneBuilder::new(SimulatedRuntime::shared())
            .with_config(config.control_plane())
            .with_hosts(hosts)
            .build()
            .await?;

        Ok(Self {
            config,
            control: Arc::new(control),
        })
    }

    pub fn control(&self) -> Arc<KeelControlPlane> {
        Arc::clone(&self.control)
    }

    /// Management API router
    pub fn app(&self) -> Router {
        create_router(
            AppState::new(self.control()),
            self.config.server.enable_cors,
            self.config.server.max_body_size,
        )
    }

    /// Run until a shutdown signal arrives
    pub async fn run(self) -> DaemonResult<()> {
        let addr = self.config.server.listen_addr;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = self.control.start(shutdown_rx.clone());

        let edge = EdgeServer::new(
            self.config.edge.clone(),
            self.control.edge(),
            self.control.certificates_manager().store(),
        )?;
        let edge_tx = shutdown_tx.clone();
        let edge_task = tokio::spawn(edge.run(shutdown_rx.clone()));
        let edge_task = tokio::spawn(async move {
            let result = match edge_task.await {
                Ok(result) => result.map_err(DaemonError::from),
                Err(e) => Err(DaemonError::Server(format!("edge task panicked: {}", e))),
            };
            if let Err(e) = &result {
                error!(error = %e, "Edge listener failed, shutting down");
                let _ = edge_tx.send(true);
            }
            result
        });

        let signal_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = signal_tx.send(true);
        });

        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "Keel API listening");

        axum::serve(listener, self.app())
            .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
            .await
            .map_err(|e| DaemonError::Server(e.to_string()))?;

        info!("Keel daemon shutting down");
        let _ = shutdown_tx.send(true);

        let edge_result = match edge_task.await {
            Ok(result) => result,
            Err(e) => Err(DaemonError::Server(e.to_string())),
        };
        for task in futures::future::join_all(tasks).await {
            if let Err(e) = task {
                warn!(error = %e, "Background task did not stop cleanly");
            }
        }
        edge_result
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
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
            info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
