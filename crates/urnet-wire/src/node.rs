//! Node — a directory plus its listening transports.

use crate::directory::Directory;
use crate::services;
use crate::websocket::serve_ws;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use urnet_types::config::NetworkConfig;
use urnet_types::BusResult;

/// A running hub: listeners, aging task and the directory they feed.
pub struct Node {
    directory: Directory,
    ws_local_addr: Option<SocketAddr>,
    pipe_path: Option<PathBuf>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Register the built-in services, start the configured listeners and
    /// the aging task.
    pub async fn start(directory: Directory, network: &NetworkConfig) -> BusResult<Self> {
        services::register_builtins(&directory)?;
        let mut tasks = vec![directory.start_aging()];

        let mut pipe_path = None;
        if let Some(path) = &network.pipe_path {
            #[cfg(unix)]
            {
                tasks.push(crate::pipe::serve_pipe(&directory, path).await?);
                pipe_path = Some(path.clone());
            }
            #[cfg(not(unix))]
            warn!(path = %path.display(), "Local pipes are not supported on this platform");
        }

        let mut ws_local_addr = None;
        if let Some(listen) = &network.ws_listen {
            let (local, handle) = serve_ws(&directory, listen).await?;
            ws_local_addr = Some(local);
            tasks.push(handle);
        }

        info!(
            address = %directory.address(),
            pipe = ?pipe_path,
            ws = ?ws_local_addr,
            "Node started"
        );
        Ok(Self {
            directory,
            ws_local_addr,
            pipe_path,
            tasks,
        })
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// The bound web socket address, when listening.
    pub fn ws_local_addr(&self) -> Option<SocketAddr> {
        self.ws_local_addr
    }

    /// Stop accepting connections, reject pending transactions, say goodbye
    /// and detach every socket. Waits for the listeners to stop.
    pub async fn shutdown(self, reason: &str) {
        self.directory.shutdown(reason);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Node task ended abnormally");
            }
        }
        if let Some(path) = &self.pipe_path {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "Could not remove pipe");
            }
        }
        info!("Node stopped");
    }
}
