//! Wiring for a running collaboration server.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::broadcast::{DispatchQueue, FanoutStats};
use crate::config::{ConfigError, ServerConfig};
use crate::orchestrator::Orchestrator;
use crate::peers::ConnectionManager;
use crate::server::CollabServer;
use crate::storage::{SnapshotStore, StoreError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// The long-lived pieces of a server and the tasks driving them.
pub struct CollabContext {
    orchestrator: Arc<Orchestrator>,
    manager: Arc<ConnectionManager>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl CollabContext {
    /// Open the document directory, bind the listener and start the
    /// listener, housekeeping and dispatcher tasks.
    pub async fn start(config: ServerConfig) -> Result<Self, AppError> {
        config.validate()?;
        let store = SnapshotStore::open(&config.docs_dir).await?;
        let (queue, dispatch_rx) = DispatchQueue::new();
        let orchestrator = Arc::new(Orchestrator::new(
            config.housekeeping.clone(),
            store,
            Arc::new(queue),
        ));
        let manager = Arc::new(ConnectionManager::new(
            orchestrator.clone(),
            config.outbound_capacity,
        ));
        let server = CollabServer::bind(&config.bind_addr, manager.clone()).await?;
        let local_addr = server.local_addr()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(server.run(shutdown_rx.clone())),
            tokio::spawn(orchestrator.clone().run(shutdown_rx.clone())),
            tokio::spawn(manager.clone().run_dispatcher(dispatch_rx, shutdown_rx)),
        ];
        log::info!(
            "Collaboration server up on {local_addr}, documents in {}",
            config.docs_dir.display()
        );

        Ok(Self {
            orchestrator,
            manager,
            local_addr,
            shutdown,
            tasks,
        })
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn fanout_stats(&self) -> FanoutStats {
        self.manager.stats().await
    }

    /// Stop accepting, flush dirty documents and wait for every task.
    pub async fn shutdown(self) {
        log::info!("Shutting down");
        // Receivers may already be gone if a task ended early
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                log::error!("Server task ended abnormally: {e}");
            }
        }
    }
}
