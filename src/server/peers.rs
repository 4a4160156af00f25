use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::ResourceError;
use crate::server::file_stream::AgentFileResource;
use crate::server::resource::ByteRange;

/// Another server node, as seen by this one.
#[async_trait]
pub trait PeerNode: Send + Sync {
    fn hostname(&self) -> &str;

    /// Serve a file from an agent connected to the peer. The peer must not
    /// forward the request any further.
    async fn fetch_resource(
        &self,
        job_id: &str,
        relative_path: &str,
        range: Option<ByteRange>,
    ) -> Result<AgentFileResource, ResourceError>;

    /// Deliver a kill request to an agent connected to the peer.
    async fn forward_kill(&self, job_id: &str, reason: &str) -> bool;
}

/// Connections to other server nodes, keyed by hostname.
///
/// Few entries and rare changes, so one lock covers the whole map.
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, Arc<dyn PeerNode>>>,
    closed: std::sync::atomic::AtomicBool,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, peer: Arc<dyn PeerNode>) {
        if self.is_closed() {
            tracing::warn!(peer = peer.hostname(), "Peer registry is shut down, ignoring peer");
            return;
        }
        let hostname = peer.hostname().to_string();
        self.peers.lock().await.insert(hostname.clone(), peer);
        tracing::info!(peer = %hostname, "Peer registered");
    }

    pub async fn get(&self, hostname: &str) -> Option<Arc<dyn PeerNode>> {
        self.peers.lock().await.get(hostname).cloned()
    }

    pub async fn remove(&self, hostname: &str) -> Option<Arc<dyn PeerNode>> {
        self.peers.lock().await.remove(hostname)
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Drop every peer and refuse new ones. Returns how many were dropped.
    pub async fn shutdown(&self) -> usize {
        self.closed
            .store(true, std::sync::atomic::Ordering::Release);
        let drained: Vec<_> = self.peers.lock().await.drain().collect();
        for (hostname, _) in &drained {
            tracing::debug!(peer = %hostname, "Peer connection closed");
        }
        drained.len()
    }
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("closed", &self.is_closed())
            .finish()
    }
}
