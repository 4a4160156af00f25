//! Shared fixtures for integration tests: a small catalog, job requests and
//! server/agent configurations with short timings.

#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use jobcoord::catalog::ResourceCatalog;
use jobcoord::config::{AgentConfig, NodeConfig, ServerConfig};
use jobcoord::model::{Criterion, ExecutionResourceCriteria, JobMetadata, JobRequest};
use jobcoord::node::Node;
use jobcoord::server::{AgentRoutingTable, InMemoryJobStore, JobStore, ServerNode};

/// Two clusters and a shell command runnable on both.
///
/// `batch-1` is tagged `default`; `batch-2` is tagged `default` and `large`.
/// No cluster is tagged `gpu`.
pub const CATALOG: &str = r#"{
    "clusters": [
        {"id": "batch-1", "name": "batch", "status": "UP", "tags": ["default"], "commands": ["sh"]},
        {"id": "batch-2", "name": "batch-large", "status": "UP", "tags": ["default", "large"], "commands": ["sh", "echo"]},
        {"id": "old", "name": "retired", "status": "TERMINATED", "tags": ["default", "legacy"], "commands": ["sh"]}
    ],
    "commands": [
        {"id": "sh", "name": "shell", "status": "ACTIVE", "tags": ["shell"], "executable": ["/bin/sh", "-c"],
         "applications": ["tools"]},
        {"id": "echo", "name": "echo", "status": "ACTIVE", "tags": ["echo"], "executable": ["echo"], "memory_mb": 512}
    ],
    "applications": [
        {"id": "tools", "name": "tools", "status": "ACTIVE"}
    ]
}"#;

pub fn test_catalog() -> ResourceCatalog {
    ResourceCatalog::from_json(CATALOG).unwrap()
}

/// A request for the shell command on a `default` cluster running `script`.
pub fn shell_request(script: &str) -> JobRequest {
    request_with_tags(&[&["default"]], &["shell"]).with_command_args([script])
}

pub fn request_with_tags(clusters: &[&[&str]], command: &[&str]) -> JobRequest {
    let clusters = clusters
        .iter()
        .map(|tags| Criterion::with_tags(tags.iter().copied()).unwrap())
        .collect();
    let command = Criterion::with_tags(command.iter().copied()).unwrap();
    JobRequest::new(
        JobMetadata::new("test-job", "tester", "1.0"),
        ExecutionResourceCriteria::new(clusters, command, Vec::new()).unwrap(),
    )
}

/// Server configuration whose default job directory lives under `root`.
pub fn test_server_config(hostname: &str, root: &Path) -> ServerConfig {
    ServerConfig::new(hostname)
        .with_default_job_directory(root.display().to_string())
        .with_connection_expiration(2_000)
}

/// Agent configuration with short kill windows and fast background loops.
pub fn test_agent_config(root: &Path) -> AgentConfig {
    let mut config = AgentConfig::default()
        .with_kill_windows(1_000, 1_000)
        .with_heartbeat_interval(100)
        .with_manifest_refresh_interval(100)
        .with_remote_status_poll_interval(200)
        .with_service_drain(500)
        .with_job_directory_root(root);
    config.rpc_retry_attempts = 2;
    config.rpc_retry_backoff_ms = 10;
    config
}

pub fn test_server(config: ServerConfig, catalog: ResourceCatalog) -> Arc<ServerNode> {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    Arc::new(ServerNode::new(config, store, catalog, Arc::new(AgentRoutingTable::new())).unwrap())
}

pub fn test_node(root: &Path, peers: &[&str]) -> Arc<Node> {
    let mut config = NodeConfig::new(test_server_config("node-a", root))
        .with_agent(test_agent_config(root));
    for peer in peers {
        config = config.with_peer(*peer);
    }
    Arc::new(Node::with_catalog(config, test_catalog()).unwrap())
}

/// Poll `condition` every 20ms until it holds or `timeout` passes.
pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition().await
}
