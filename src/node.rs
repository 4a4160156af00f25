use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::catalog::{CatalogError, ResourceCatalog};
use crate::config::NodeConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::ProtocolError;
use crate::model::{messages, JobRequest, JobStatus};
use crate::server::{
    AgentLauncher, AgentRoutingTable, InMemoryJobStore, JobStore, KillOutcome, LocalAgentLauncher,
    PeerNode, ServerNode,
};

/// How often finished agent tasks are dropped from the launcher.
const REAP_INTERVAL_MS: u64 = 5_000;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Invalid handshake rule: {0}")]
    Handshake(#[from] regex::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Composition root: a server node, the in-process peers it routes to, and
/// the launcher that runs agents for jobs submitted through the API.
///
/// Every server node shares one job store, one catalog snapshot and one
/// routing table, so an agent connected to any of them is reachable from
/// all of them.
pub struct Node {
    config: NodeConfig,
    server: Arc<ServerNode>,
    peers: Vec<Arc<ServerNode>>,
    launcher: Arc<LocalAgentLauncher>,
    next_server: AtomicUsize,
}

impl Node {
    /// Build a node, loading the catalog from `config.catalog_path` when set.
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        let catalog = match &config.catalog_path {
            Some(path) => ResourceCatalog::from_json_file(path)?,
            None => {
                tracing::warn!("No catalog configured, every job will fail resolution");
                ResourceCatalog::new()
            }
        };
        Self::with_catalog(config, catalog)
    }

    pub fn with_catalog(config: NodeConfig, catalog: ResourceCatalog) -> Result<Self, NodeError> {
        let store: Arc<dyn JobStore> = Arc::new(
            InMemoryJobStore::with_capacity(config.server.max_jobs)
                .with_retained_finished(config.server.retained_finished_jobs),
        );
        let routing = Arc::new(AgentRoutingTable::new());

        let server = Arc::new(ServerNode::new(
            config.server.clone(),
            store.clone(),
            catalog.clone(),
            routing.clone(),
        )?);
        let mut peers = Vec::with_capacity(config.peers.len());
        for peer in &config.peers {
            let mut peer_config = config.server.clone();
            peer_config.hostname = peer.hostname.clone();
            peers.push(Arc::new(ServerNode::new(
                peer_config,
                store.clone(),
                catalog.clone(),
                routing.clone(),
            )?));
        }

        Ok(Self {
            launcher: Arc::new(LocalAgentLauncher::new(config.agent.clone())),
            config,
            server,
            peers,
            next_server: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The node that serves the dashboard.
    pub fn server(&self) -> &Arc<ServerNode> {
        &self.server
    }

    pub fn peers(&self) -> &[Arc<ServerNode>] {
        &self.peers
    }

    pub fn launcher(&self) -> &Arc<LocalAgentLauncher> {
        &self.launcher
    }

    /// Register every server node with every other one.
    pub async fn connect_peers(&self) {
        let all: Vec<&Arc<ServerNode>> = std::iter::once(&self.server).chain(&self.peers).collect();
        for node in &all {
            for other in &all {
                if node.hostname() == other.hostname() {
                    continue;
                }
                let peer: Arc<dyn PeerNode> = Arc::clone(*other) as Arc<dyn PeerNode>;
                node.peers().register(peer).await;
            }
        }
    }

    /// Reserve, resolve and launch an agent for `request`. Resolution
    /// failures leave the job FAILED and are returned to the caller.
    pub async fn submit_job(&self, request: JobRequest) -> Result<String, ProtocolError> {
        let coordinator = self.server.coordinator();
        let job_id = coordinator.reserve_job_id(request, None, true).await?;
        coordinator.resolve_job_specification(&job_id).await?;

        let target = self.pick_server();
        if let Err(e) = self.launcher.launch_agent(target.clone(), &job_id).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to launch agent");
            let message = format!("{}: {}", messages::AGENT_LAUNCH_FAILED, e);
            if let Err(update) = coordinator
                .update_job_status(&job_id, JobStatus::Resolved, JobStatus::Failed, &message)
                .await
            {
                tracing::warn!(job_id = %job_id, error = %update, "Could not mark job failed");
            }
            return Err(e);
        }
        tracing::info!(job_id = %job_id, server = target.hostname(), "Job submitted");
        Ok(job_id)
    }

    pub async fn kill_job(&self, job_id: &str, reason: &str) -> Result<KillOutcome, ProtocolError> {
        self.server.kill_job(job_id, reason).await
    }

    /// Agents are spread over the server nodes in turn.
    fn pick_server(&self) -> Arc<ServerNode> {
        let count = self.peers.len() + 1;
        match self.next_server.fetch_add(1, Ordering::Relaxed) % count {
            0 => self.server.clone(),
            i => self.peers[i - 1].clone(),
        }
    }

    /// Run background services until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        self.connect_peers().await;

        let mut cleanups = vec![self.server.start()];
        cleanups.extend(self.peers.iter().map(|peer| peer.start()));

        let dashboard = self.config.dashboard_addr.map(|addr| {
            let state = DashboardState::new(self.clone());
            let cancel = shutdown.clone();
            tokio::spawn(async move {
                run_dashboard(addr, state, cancel).await;
            })
        });

        let mut reap = tokio::time::interval(Duration::from_millis(REAP_INTERVAL_MS));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = reap.tick() => {
                    let reaped = self.launcher.reap_finished();
                    if reaped > 0 {
                        tracing::debug!(reaped, "Reaped finished agents");
                    }
                }
            }
        }

        tracing::info!("Shutting down node");
        self.shutdown().await;
        for handle in cleanups {
            let _ = handle.await;
        }
        if let Some(handle) = dashboard {
            let _ = handle.await;
        }
    }

    /// Stop launched agents first so they can still report their final
    /// status, then the server nodes.
    pub async fn shutdown(&self) {
        self.launcher
            .stop_all(self.config.agent.shutdown_budget())
            .await;
        self.server.shutdown().await;
        for peer in &self.peers {
            peer.shutdown().await;
        }
    }
}
