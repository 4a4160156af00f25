//! Server-side services: job coordination, agent connection tracking and
//! live file routing.

pub mod connections;
pub mod coordinator;
pub mod file_stream;
pub mod heartbeat;
pub mod kill;
pub mod launcher;
pub mod peers;
pub mod resource;
pub mod store;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::catalog::ResourceCatalog;
use crate::config::ServerConfig;
use crate::error::{ProtocolError, ResourceError, Result};
use crate::model::{messages, JobStatus};
use crate::resolver::{ResolutionDefaults, ResolutionEngine};

pub use connections::{AgentConnection, AgentConnectionTracker, AgentRoutingTable};
pub use coordinator::{AgentCoordinator, HandshakeRules};
pub use file_stream::{AgentFile, AgentFileResource, FileStreamConfig, FileStreamingService};
pub use heartbeat::HeartbeatService;
pub use kill::KillNotifier;
pub use launcher::{AgentLauncher, LocalAgentLauncher};
pub use peers::{PeerNode, PeerRegistry};
pub use resource::{AgentResourceUri, ByteRange};
pub use store::{InMemoryJobStore, JobRecord, JobStore};

/// Attempts before giving up on a kill whose job keeps changing status.
const KILL_ATTEMPTS: usize = 3;

/// What a kill request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// Job was already in a final status.
    AlreadyFinished,
    /// Job had not been claimed and was moved straight to KILLED.
    KilledBeforeStart,
    /// The job's agent was told to stop.
    AgentNotified,
}

/// One server node: the protocol endpoint agents talk to.
pub struct ServerNode {
    config: ServerConfig,
    coordinator: AgentCoordinator,
    routing: Arc<AgentRoutingTable>,
    tracker: Arc<AgentConnectionTracker>,
    heartbeats: HeartbeatService,
    files: FileStreamingService,
    kills: Arc<KillNotifier>,
    peers: PeerRegistry,
    cancel: CancellationToken,
}

impl ServerNode {
    /// Build a node. `routing` is shared with every other node that can
    /// serve the same jobs.
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn JobStore>,
        catalog: ResourceCatalog,
        routing: Arc<AgentRoutingTable>,
    ) -> std::result::Result<Self, regex::Error> {
        let cancel = CancellationToken::new();
        let handshake = HandshakeRules::compile(&config.handshake)?;
        let engine = ResolutionEngine::new(ResolutionDefaults::from(&config));
        let coordinator = AgentCoordinator::new(store, catalog, engine, handshake)
            .with_agent_properties(config.agent_properties.iter().cloned());
        let tracker = Arc::new(AgentConnectionTracker::new(
            config.hostname.clone(),
            config.connection_expiration_ms,
            routing.clone(),
        ));
        let files = FileStreamingService::new(
            FileStreamConfig {
                max_concurrent_transfers: config.max_concurrent_transfers,
                stalled_transfer_timeout_ms: config.stalled_transfer_timeout_ms,
            },
            cancel.child_token(),
        );

        Ok(Self {
            heartbeats: HeartbeatService::new(tracker.clone(), cancel.child_token()),
            coordinator,
            routing,
            tracker,
            files,
            kills: Arc::new(KillNotifier::new()),
            peers: PeerRegistry::new(),
            config,
            cancel,
        })
    }

    /// Spawn the connection cleanup loop. Kill subscriptions are dropped
    /// when the job's agent disconnects from this node.
    pub fn start(&self) -> JoinHandle<()> {
        let tracker = self.tracker.clone();
        let kills = self.kills.clone();
        let mut disconnects = self.tracker.disconnects();
        let interval_ms = self.config.connection_cleanup_interval_ms;
        let cancel = self.cancel.child_token();
        tracing::info!(hostname = %self.config.hostname, "Server node started");
        tokio::spawn(async move {
            let release = async {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = disconnects.recv() => match event {
                            Ok(job_id) => {
                                if kills.unsubscribe(&job_id) {
                                    tracing::debug!(job_id = %job_id, "Dropped kill subscription of disconnected agent");
                                }
                            }
                            Err(RecvError::Lagged(missed)) => {
                                let pruned = kills.prune();
                                tracing::warn!(missed, pruned, "Disconnect events lagged");
                            }
                            Err(RecvError::Closed) => break,
                        },
                    }
                }
            };
            tokio::join!(tracker.run_cleanup(interval_ms, cancel.clone()), release);
        })
    }

    pub fn hostname(&self) -> &str {
        &self.config.hostname
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &AgentCoordinator {
        &self.coordinator
    }

    pub fn tracker(&self) -> &AgentConnectionTracker {
        &self.tracker
    }

    pub fn heartbeats(&self) -> &HeartbeatService {
        &self.heartbeats
    }

    pub fn files(&self) -> &FileStreamingService {
        &self.files
    }

    pub fn kills(&self) -> &KillNotifier {
        &self.kills
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    /// Stop a job wherever it is in its lifecycle.
    pub async fn kill_job(&self, job_id: &str, reason: &str) -> Result<KillOutcome> {
        for _ in 0..KILL_ATTEMPTS {
            let status = self.coordinator.get_job_status(job_id).await?;
            if status.is_finished() {
                tracing::debug!(job_id, status = %status, "Kill ignored, job already finished");
                return Ok(KillOutcome::AlreadyFinished);
            }

            if matches!(status, JobStatus::Reserved | JobStatus::Resolved) {
                match self
                    .coordinator
                    .update_job_status(
                        job_id,
                        status,
                        JobStatus::Killed,
                        messages::JOB_KILLED_BEFORE_START,
                    )
                    .await
                {
                    Ok(()) => return Ok(KillOutcome::KilledBeforeStart),
                    Err(ProtocolError::StaleStatus { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }

            if self.kills.notify(job_id, reason).await {
                return Ok(KillOutcome::AgentNotified);
            }
            if let Some(peer) = self.peer_for(job_id).await {
                if peer.forward_kill(job_id, reason).await {
                    return Ok(KillOutcome::AgentNotified);
                }
            }
            return Err(ProtocolError::Unavailable(format!(
                "no agent connected for job {}",
                job_id
            )));
        }
        Err(ProtocolError::Unavailable(format!(
            "job {} kept changing status while being killed",
            job_id
        )))
    }

    /// Resolve an `agent://` URI, forwarding to the node the agent is
    /// connected to when that is not this one.
    pub async fn get_resource(
        &self,
        uri: &str,
    ) -> std::result::Result<AgentFileResource, ResourceError> {
        let uri = AgentResourceUri::parse(uri)?;
        self.fetch(&uri.job_id, &uri.relative_path, uri.range).await
    }

    pub async fn fetch(
        &self,
        job_id: &str,
        relative_path: &str,
        range: Option<ByteRange>,
    ) -> std::result::Result<AgentFileResource, ResourceError> {
        if self.tracker.is_connected(job_id) {
            return self.files.fetch(job_id, relative_path, range).await;
        }
        match self.peer_for(job_id).await {
            Some(peer) => {
                tracing::debug!(job_id, peer = peer.hostname(), "Forwarding file request");
                peer.fetch_resource(job_id, relative_path, range).await
            }
            None => Ok(AgentFileResource::Absent),
        }
    }

    async fn peer_for(&self, job_id: &str) -> Option<Arc<dyn PeerNode>> {
        let host = self.routing.host_for(job_id)?;
        if host == self.config.hostname {
            return None;
        }
        let peer = self.peers.get(&host).await;
        if peer.is_none() {
            tracing::warn!(job_id, host = %host, "Agent routed to unknown peer");
        }
        peer
    }

    /// Stop background tasks, close agent streams and release peers.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let peers = self.peers.shutdown().await;
        tracing::info!(hostname = %self.config.hostname, peers, "Server node shut down");
    }
}

#[async_trait]
impl PeerNode for ServerNode {
    fn hostname(&self) -> &str {
        &self.config.hostname
    }

    async fn fetch_resource(
        &self,
        job_id: &str,
        relative_path: &str,
        range: Option<ByteRange>,
    ) -> std::result::Result<AgentFileResource, ResourceError> {
        if !self.tracker.is_connected(job_id) {
            return Ok(AgentFileResource::Absent);
        }
        self.files.fetch(job_id, relative_path, range).await
    }

    async fn forward_kill(&self, job_id: &str, reason: &str) -> bool {
        self.kills.notify(job_id, reason).await
    }
}
