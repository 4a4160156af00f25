mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use jobcoord::agent::{Backoff, KillService, KillWindows, ProcessLifecycleManager};
use jobcoord::config::ServerConfig;
use jobcoord::model::KillSource;
use jobcoord::rpc::{AgentHeartbeat, AgentRpcClient, LocalRpcClient};
use jobcoord::server::{AgentRoutingTable, InMemoryJobStore, JobStore, ServerNode};

use test_harness::{test_catalog, test_server, wait_for};

fn heartbeat(job_id: &str) -> AgentHeartbeat {
    AgentHeartbeat {
        job_id: job_id.to_string(),
    }
}

#[tokio::test]
async fn test_heartbeat_stream_connects_and_disconnects() {
    let server = test_server(ServerConfig::default(), test_catalog());
    let stream = server.heartbeats().connect();
    stream.heartbeats.send(heartbeat("job-1")).await.unwrap();

    let server_ref = &server;
    assert!(
        wait_for(Duration::from_secs(2), || async move {
            server_ref.tracker().is_connected("job-1")
        })
        .await
    );
    let connection = server.tracker().connection("job-1").unwrap();
    assert_eq!(connection.stream_id, stream.stream_id);
    assert_eq!(connection.hostname, "localhost");

    drop(stream);
    assert!(
        wait_for(Duration::from_secs(2), || async move {
            !server_ref.tracker().is_connected("job-1")
        })
        .await
    );
}

#[tokio::test]
async fn test_stream_switching_jobs_releases_the_old_one() {
    let server = test_server(ServerConfig::default(), test_catalog());
    let stream = server.heartbeats().connect();
    stream.heartbeats.send(heartbeat("job-1")).await.unwrap();
    stream.heartbeats.send(heartbeat("job-2")).await.unwrap();

    let server_ref = &server;
    assert!(
        wait_for(Duration::from_secs(2), || async move {
            server_ref.tracker().is_connected("job-2")
                && !server_ref.tracker().is_connected("job-1")
        })
        .await
    );
}

#[tokio::test]
async fn test_one_live_stream_keeps_job_connected() {
    let server = test_server(ServerConfig::default(), test_catalog());
    let first = server.heartbeats().connect();
    let second = server.heartbeats().connect();
    first.heartbeats.send(heartbeat("job-1")).await.unwrap();
    second.heartbeats.send(heartbeat("job-1")).await.unwrap();

    let server_ref = &server;
    assert!(
        wait_for(Duration::from_secs(2), || async move {
            server_ref.tracker().connected_jobs() == 1
        })
        .await
    );

    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.tracker().is_connected("job-1"));
    let connection = server.tracker().connection("job-1").unwrap();
    assert_eq!(connection.stream_id, second.stream_id);
}

#[tokio::test(start_paused = true)]
async fn test_silent_agent_is_evicted_by_cleanup_loop() {
    let routing = Arc::new(AgentRoutingTable::new());
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let mut config = ServerConfig::new("node-a").with_connection_expiration(1_000);
    config.connection_cleanup_interval_ms = 200;
    let server = Arc::new(ServerNode::new(config, store, test_catalog(), routing.clone()).unwrap());
    let cleanup = server.start();

    server.tracker().notify_heartbeat("s1", "job-1");
    assert_eq!(routing.host_for("job-1").as_deref(), Some("node-a"));

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(!server.tracker().is_connected("job-1"));
    assert!(routing.host_for("job-1").is_none());

    server.shutdown().await;
    cleanup.await.unwrap();
}

#[tokio::test]
async fn test_routing_is_shared_between_nodes() {
    let routing = Arc::new(AgentRoutingTable::new());
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let node_a = ServerNode::new(
        ServerConfig::new("node-a"),
        store.clone(),
        test_catalog(),
        routing.clone(),
    )
    .unwrap();
    let node_b =
        ServerNode::new(ServerConfig::new("node-b"), store, test_catalog(), routing.clone())
            .unwrap();

    node_a.tracker().notify_heartbeat("s1", "job-1");
    assert_eq!(routing.host_for("job-1").as_deref(), Some("node-a"));

    // The agent reconnects to node-b before node-a notices it left.
    node_b.tracker().notify_heartbeat("s2", "job-1");
    assert_eq!(routing.host_for("job-1").as_deref(), Some("node-b"));
    node_a.tracker().notify_disconnected("s1", "job-1");
    assert_eq!(routing.host_for("job-1").as_deref(), Some("node-b"));
}

#[tokio::test]
async fn test_shutdown_closes_heartbeat_streams() {
    let server = test_server(ServerConfig::default(), test_catalog());
    let stream = server.heartbeats().connect();
    stream.heartbeats.send(heartbeat("job-1")).await.unwrap();

    server.shutdown().await;
    let server_ref = &server;
    let closed = tokio::time::timeout(Duration::from_secs(2), stream.heartbeats.closed()).await;
    assert!(closed.is_ok());
    assert!(
        wait_for(Duration::from_secs(2), || async move {
            !server_ref.tracker().is_connected("job-1")
        })
        .await
    );
}

#[tokio::test]
async fn test_kill_subscription_released_when_agent_disconnects() {
    let server = test_server(ServerConfig::default(), test_catalog());
    let cleanup = server.start();
    let stream = server.heartbeats().connect();
    stream.heartbeats.send(heartbeat("job-1")).await.unwrap();
    let mut kills = server.kills().subscribe("job-1");

    let server_ref = &server;
    assert!(
        wait_for(Duration::from_secs(2), || async move {
            server_ref.tracker().is_connected("job-1")
        })
        .await
    );
    assert!(server.kills().is_subscribed("job-1"));

    drop(stream);
    let ended = tokio::time::timeout(Duration::from_secs(2), kills.recv()).await;
    assert!(matches!(ended, Ok(None)));
    assert!(server.kills().is_empty());

    server.shutdown().await;
    cleanup.await.unwrap();
}

#[tokio::test]
async fn test_kill_service_resubscribes_after_server_drops_it() {
    let server = test_server(ServerConfig::default(), test_catalog());
    let client: Arc<dyn AgentRpcClient> = Arc::new(LocalRpcClient::new(server.clone()));
    let process = ProcessLifecycleManager::new(KillWindows {
        graceful: Duration::from_millis(100),
        forceful: Duration::from_millis(100),
        exit_race_delay: Duration::from_millis(10),
    });
    let mut service =
        KillService::new(process.clone()).with_reconnect(client.clone(), Backoff::new(10, 50));
    service.start("job-1", client.subscribe_kill("job-1").await.unwrap());

    assert!(server.kills().unsubscribe("job-1"));
    let server_ref = &server;
    assert!(
        wait_for(Duration::from_secs(2), || async move {
            server_ref.kills().is_subscribed("job-1")
        })
        .await,
        "agent never resubscribed"
    );

    assert!(server.kills().notify("job-1", "user asked").await);
    let process_ref = &process;
    assert!(wait_for(Duration::from_secs(2), || async move { process_ref.is_killed() }).await);
    assert_eq!(process.kill_source(), Some(KillSource::ApiKillRequest));
    service.stop().await;
}
