use std::net::SocketAddr;
use std::path::PathBuf;

/// What to delete from the job directory once the job is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CleanupStrategy {
    /// Leave everything in place.
    #[default]
    None,
    /// Remove the whole job directory.
    Full,
    /// Remove only downloaded dependencies.
    Dependencies,
}

/// Agent-side tuning.
///
/// Timing fields are in milliseconds, matching the rest of the configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// How long to wait for the job to exit after SIGTERM.
    pub kill_graceful_window_ms: u64,
    /// How long to wait for the job to exit after SIGKILL.
    pub kill_forceful_window_ms: u64,
    /// Pause between process exit and reading the kill flag, so a kill
    /// delivered alongside the exit is recorded before status is decided.
    pub exit_race_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub reconnect_backoff_initial_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    pub manifest_refresh_interval_ms: u64,
    pub max_file_count: usize,
    pub max_file_size: u64,
    pub max_total_size: u64,
    pub remote_status_poll_interval_ms: u64,
    /// Bounded wait for file and heartbeat services to finish on shutdown.
    pub service_drain_ms: u64,
    /// Used when the specification does not name a job directory.
    pub job_directory_root: PathBuf,
    pub cleanup_strategy: CleanupStrategy,
    /// Attempts for RPCs that fail with a transient error.
    pub rpc_retry_attempts: u32,
    pub rpc_retry_backoff_ms: u64,
    /// Run the job with the job directory as working directory.
    pub launch_in_job_directory: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            kill_graceful_window_ms: 10_000,
            kill_forceful_window_ms: 5_000,
            exit_race_delay_ms: 100,
            heartbeat_interval_ms: 2_000,
            reconnect_backoff_initial_ms: 500,
            reconnect_backoff_max_ms: 30_000,
            manifest_refresh_interval_ms: 5_000,
            max_file_count: 64_000,
            max_file_size: 8 * 1024 * 1024 * 1024,
            max_total_size: 16 * 1024 * 1024 * 1024,
            remote_status_poll_interval_ms: 30_000,
            service_drain_ms: 5_000,
            job_directory_root: std::env::temp_dir().join("jobcoord"),
            cleanup_strategy: CleanupStrategy::None,
            rpc_retry_attempts: 5,
            rpc_retry_backoff_ms: 200,
            launch_in_job_directory: true,
        }
    }
}

impl AgentConfig {
    /// Longest a killed agent should need to wind down: both kill windows,
    /// the exit race delay and the service drain.
    pub fn shutdown_budget(&self) -> std::time::Duration {
        std::time::Duration::from_millis(
            self.kill_graceful_window_ms
                + self.kill_forceful_window_ms
                + self.exit_race_delay_ms
                + self.service_drain_ms,
        )
    }

    pub fn with_kill_windows(mut self, graceful_ms: u64, forceful_ms: u64) -> Self {
        self.kill_graceful_window_ms = graceful_ms;
        self.kill_forceful_window_ms = forceful_ms;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_manifest_refresh_interval(mut self, interval_ms: u64) -> Self {
        self.manifest_refresh_interval_ms = interval_ms;
        self
    }

    pub fn with_files_limits(mut self, max_count: usize, max_file: u64, max_total: u64) -> Self {
        self.max_file_count = max_count;
        self.max_file_size = max_file;
        self.max_total_size = max_total;
        self
    }

    pub fn with_remote_status_poll_interval(mut self, interval_ms: u64) -> Self {
        self.remote_status_poll_interval_ms = interval_ms;
        self
    }

    pub fn with_job_directory_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.job_directory_root = root.into();
        self
    }

    pub fn with_cleanup_strategy(mut self, strategy: CleanupStrategy) -> Self {
        self.cleanup_strategy = strategy;
        self
    }

    pub fn with_service_drain(mut self, drain_ms: u64) -> Self {
        self.service_drain_ms = drain_ms;
        self
    }

    /// Apply `key=value` overrides handed out by the server. Unknown keys
    /// and unparsable values are ignored with a warning.
    pub fn apply_overrides<'a>(&mut self, overrides: impl IntoIterator<Item = (&'a str, &'a str)>) {
        for (key, value) in overrides {
            let applied = match key {
                "agent.kill.graceful-window-ms" => parse_into(value, &mut self.kill_graceful_window_ms),
                "agent.kill.forceful-window-ms" => parse_into(value, &mut self.kill_forceful_window_ms),
                "agent.heartbeat.interval-ms" => parse_into(value, &mut self.heartbeat_interval_ms),
                "agent.manifest.refresh-interval-ms" => {
                    parse_into(value, &mut self.manifest_refresh_interval_ms)
                }
                "agent.files-limit.max-file-count" => parse_into(value, &mut self.max_file_count),
                "agent.files-limit.max-file-size" => parse_into(value, &mut self.max_file_size),
                "agent.files-limit.max-total-size" => parse_into(value, &mut self.max_total_size),
                "agent.remote-status.poll-interval-ms" => {
                    parse_into(value, &mut self.remote_status_poll_interval_ms)
                }
                _ => false,
            };
            if !applied {
                tracing::warn!(key, value, "Ignoring agent property override");
            }
        }
    }
}

fn parse_into<T: std::str::FromStr>(value: &str, target: &mut T) -> bool {
    match value.trim().parse() {
        Ok(parsed) => {
            *target = parsed;
            true
        }
        Err(_) => false,
    }
}

/// Rules applied when an agent connects.
#[derive(Debug, Clone, Default)]
pub struct HandshakeConfig {
    /// Lowest accepted agent version, dotted numeric (e.g. "0.2.0").
    pub minimum_version: Option<String>,
    /// Versions matching this regex are turned away.
    pub blocked_version_pattern: Option<String>,
}

/// Server-side tuning.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name this node is known by in the connection routing table.
    pub hostname: String,
    /// A connection with no heartbeat for this long counts as gone.
    pub connection_expiration_ms: u64,
    pub connection_cleanup_interval_ms: u64,
    pub max_concurrent_transfers: usize,
    /// A transfer with no chunk for this long is reaped.
    pub stalled_transfer_timeout_ms: u64,
    pub transfer_chunk_size: usize,
    pub default_job_directory: String,
    /// Archive root; the job id is appended per job.
    pub default_archive_location: Option<String>,
    pub default_memory_mb: u32,
    /// Cap on jobs that have not finished yet.
    pub max_jobs: usize,
    /// Finished jobs kept before the oldest are dropped.
    pub retained_finished_jobs: usize,
    pub handshake: HandshakeConfig,
    /// Properties handed to agents during configuration.
    pub agent_properties: Vec<(String, String)>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            connection_expiration_ms: 10_000,
            connection_cleanup_interval_ms: 2_000,
            max_concurrent_transfers: 100,
            stalled_transfer_timeout_ms: 20_000,
            transfer_chunk_size: 64 * 1024,
            default_job_directory: std::env::temp_dir()
                .join("jobcoord")
                .to_string_lossy()
                .into_owned(),
            default_archive_location: None,
            default_memory_mb: 1_536,
            max_jobs: 10_000,
            retained_finished_jobs: 10_000,
            handshake: HandshakeConfig::default(),
            agent_properties: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Default::default()
        }
    }

    pub fn with_connection_expiration(mut self, expiration_ms: u64) -> Self {
        self.connection_expiration_ms = expiration_ms;
        self
    }

    pub fn with_default_job_directory(mut self, dir: impl Into<String>) -> Self {
        self.default_job_directory = dir.into();
        self
    }

    pub fn with_default_archive_location(mut self, location: impl Into<String>) -> Self {
        self.default_archive_location = Some(location.into());
        self
    }

    pub fn with_max_concurrent_transfers(mut self, max: usize) -> Self {
        self.max_concurrent_transfers = max;
        self
    }

    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_agent_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.agent_properties.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub hostname: String,
}

/// Everything a `jobcoord server` process needs.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub server: ServerConfig,
    pub agent: AgentConfig,
    pub dashboard_addr: Option<SocketAddr>,
    pub catalog_path: Option<PathBuf>,
    pub peers: Vec<PeerConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            agent: AgentConfig::default(),
            dashboard_addr: None,
            catalog_path: None,
            peers: Vec::new(),
        }
    }
}

impl NodeConfig {
    pub fn new(server: ServerConfig) -> Self {
        Self {
            server,
            ..Default::default()
        }
    }

    pub fn with_dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }

    pub fn with_catalog(mut self, path: impl Into<PathBuf>) -> Self {
        self.catalog_path = Some(path.into());
        self
    }

    pub fn with_agent(mut self, agent: AgentConfig) -> Self {
        self.agent = agent;
        self
    }

    pub fn with_peer(mut self, hostname: impl Into<String>) -> Self {
        self.peers.push(PeerConfig {
            hostname: hostname.into(),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_config_default() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.exit_race_delay_ms, 100);
        assert_eq!(cfg.cleanup_strategy, CleanupStrategy::None);
        assert!(cfg.kill_graceful_window_ms > 0);
        assert!(cfg.kill_forceful_window_ms > 0);
    }

    #[test]
    fn agent_overrides_apply_known_keys() {
        let mut cfg = AgentConfig::default();
        cfg.apply_overrides([
            ("agent.heartbeat.interval-ms", "250"),
            ("agent.files-limit.max-file-count", "12"),
            ("agent.unknown", "1"),
            ("agent.kill.graceful-window-ms", "not a number"),
        ]);
        assert_eq!(cfg.heartbeat_interval_ms, 250);
        assert_eq!(cfg.max_file_count, 12);
        assert_eq!(cfg.kill_graceful_window_ms, 10_000);
    }

    #[test]
    fn server_config_builders() {
        let cfg = ServerConfig::new("node-a")
            .with_connection_expiration(500)
            .with_default_archive_location("file:///archive")
            .with_agent_property("agent.heartbeat.interval-ms", "100");
        assert_eq!(cfg.hostname, "node-a");
        assert_eq!(cfg.connection_expiration_ms, 500);
        assert_eq!(cfg.default_archive_location.as_deref(), Some("file:///archive"));
        assert_eq!(cfg.agent_properties.len(), 1);
    }

    #[test]
    fn node_config_with_peer() {
        let cfg = NodeConfig::default()
            .with_peer("node-b")
            .with_peer("node-c");
        assert_eq!(cfg.peers.len(), 2);
        assert_eq!(cfg.peers[1].hostname, "node-c");
    }
}
