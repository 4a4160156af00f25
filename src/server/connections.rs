use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Which server node each connected agent streams to. Shared by every node
/// so any of them can route a request for a job to the right place.
#[derive(Debug, Default)]
pub struct AgentRoutingTable {
    routes: DashMap<String, String>,
}

impl AgentRoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent_connected(&self, job_id: &str, hostname: &str) {
        self.routes.insert(job_id.to_string(), hostname.to_string());
    }

    /// Drop the route only if it still points at `hostname`; the agent may
    /// already have reconnected elsewhere.
    pub fn agent_disconnected(&self, job_id: &str, hostname: &str) {
        self.routes.remove_if(job_id, |_, host| host == hostname);
    }

    pub fn host_for(&self, job_id: &str) -> Option<String> {
        self.routes.get(job_id).map(|h| h.clone())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// A live heartbeat stream from an agent to this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConnection {
    pub job_id: String,
    pub hostname: String,
    pub stream_id: String,
    pub last_heartbeat: Instant,
}

/// Tracks heartbeat streams per job on this node.
///
/// A job counts as connected while at least one of its streams has sent a
/// heartbeat within the expiration period. Expired streams are invisible to
/// readers immediately and are removed by [`evict_expired`].
///
/// [`evict_expired`]: AgentConnectionTracker::evict_expired
#[derive(Debug)]
pub struct AgentConnectionTracker {
    hostname: String,
    expiration: Duration,
    connections: DashMap<String, HashMap<String, Instant>>,
    routing: std::sync::Arc<AgentRoutingTable>,
    disconnects: broadcast::Sender<String>,
}

/// Disconnect events buffered per listener before it starts lagging.
const DISCONNECT_BUFFER: usize = 256;

impl AgentConnectionTracker {
    pub fn new(
        hostname: impl Into<String>,
        expiration_ms: u64,
        routing: std::sync::Arc<AgentRoutingTable>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            expiration: Duration::from_millis(expiration_ms),
            connections: DashMap::new(),
            routing,
            disconnects: broadcast::channel(DISCONNECT_BUFFER).0,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Job ids whose last agent stream on this node went away.
    pub fn disconnects(&self) -> broadcast::Receiver<String> {
        self.disconnects.subscribe()
    }

    fn announce_disconnect(&self, job_id: &str) {
        self.routing.agent_disconnected(job_id, &self.hostname);
        // No listener is fine.
        let _ = self.disconnects.send(job_id.to_string());
    }

    pub fn notify_heartbeat(&self, stream_id: &str, job_id: &str) {
        let now = Instant::now();
        let mut streams = self.connections.entry(job_id.to_string()).or_default();
        let first = streams.is_empty();
        streams.insert(stream_id.to_string(), now);
        drop(streams);

        if self.routing.host_for(job_id).as_deref() != Some(self.hostname.as_str()) {
            self.routing.agent_connected(job_id, &self.hostname);
        }
        if first {
            tracing::info!(job_id, stream_id, hostname = %self.hostname, "Agent connected");
        }
    }

    pub fn notify_disconnected(&self, stream_id: &str, job_id: &str) {
        let emptied = match self.connections.get_mut(job_id) {
            Some(mut streams) => {
                streams.remove(stream_id);
                streams.is_empty()
            }
            None => false,
        };
        if emptied && self.connections.remove_if(job_id, |_, s| s.is_empty()).is_some() {
            self.announce_disconnect(job_id);
            tracing::info!(job_id, stream_id, "Agent disconnected");
        }
    }

    fn is_live(&self, last: Instant, now: Instant) -> bool {
        now.duration_since(last) < self.expiration
    }

    pub fn is_connected(&self, job_id: &str) -> bool {
        self.connection(job_id).is_some()
    }

    /// The most recently refreshed live stream for a job.
    pub fn connection(&self, job_id: &str) -> Option<AgentConnection> {
        let now = Instant::now();
        let streams = self.connections.get(job_id)?;
        streams
            .iter()
            .filter(|(_, last)| self.is_live(**last, now))
            .max_by_key(|(_, last)| **last)
            .map(|(stream_id, last)| AgentConnection {
                job_id: job_id.to_string(),
                hostname: self.hostname.clone(),
                stream_id: stream_id.clone(),
                last_heartbeat: *last,
            })
    }

    pub fn connected_jobs(&self) -> usize {
        let now = Instant::now();
        self.connections
            .iter()
            .filter(|entry| entry.value().values().any(|last| self.is_live(*last, now)))
            .count()
    }

    /// Remove streams that missed their heartbeat. Returns the jobs that no
    /// longer have any stream on this node.
    pub fn evict_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let mut emptied = Vec::new();
        for mut entry in self.connections.iter_mut() {
            let job_id = entry.key().clone();
            entry.value_mut().retain(|stream_id, last| {
                let live = now.duration_since(*last) < self.expiration;
                if !live {
                    tracing::warn!(job_id = %job_id, stream_id = %stream_id, "Evicting expired agent stream");
                }
                live
            });
            if entry.value().is_empty() {
                emptied.push(job_id);
            }
        }

        emptied.retain(|job_id| {
            let removed = self
                .connections
                .remove_if(job_id, |_, s| s.is_empty())
                .is_some();
            if removed {
                self.announce_disconnect(job_id);
            }
            removed
        });
        emptied
    }

    /// Periodically evict expired streams until cancelled.
    pub async fn run_cleanup(&self, interval_ms: u64, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let evicted = self.evict_expired();
                    if !evicted.is_empty() {
                        tracing::info!(count = evicted.len(), "Evicted disconnected agents");
                    }
                }
            }
        }
    }
}
