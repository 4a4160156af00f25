mod test_harness;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use jobcoord::agent::{ExecutionOutcome, JobExecution, Stage};
use jobcoord::config::CleanupStrategy;
use jobcoord::model::{
    messages, AgentClientMetadata, ArchiveStatus, ExecutionEnvironment, JobRequest, JobStatus,
    KillSource,
};
use jobcoord::rpc::LocalRpcClient;
use jobcoord::server::{JobStore, KillOutcome, ServerNode};

use test_harness::{
    request_with_tags, shell_request, test_agent_config, test_catalog, test_node, test_server,
    test_server_config, wait_for,
};

fn agent() -> AgentClientMetadata {
    AgentClientMetadata::current("agent-host")
}

fn server_for(root: &Path) -> Arc<ServerNode> {
    test_server(test_server_config("node-a", root), test_catalog())
}

fn execution(server: &Arc<ServerNode>, root: &Path, request: JobRequest) -> JobExecution {
    let client = Arc::new(LocalRpcClient::new(server.clone()));
    JobExecution::new(client, test_agent_config(root), agent(), request)
}

async fn stored_status(server: &ServerNode, outcome: &ExecutionOutcome) -> (JobStatus, String) {
    let job_id = outcome.job_id.as_deref().expect("job id reserved");
    let record = server.coordinator().store().get_job(job_id).await.unwrap();
    (record.status, record.status_message)
}

#[tokio::test]
async fn test_successful_job() {
    let root = tempfile::tempdir().unwrap();
    let server = server_for(root.path());
    let request = shell_request("echo out; echo err >&2").with_archiving_disabled(true);

    let outcome = execution(&server, root.path(), request).run().await;
    assert_eq!(outcome.status, JobStatus::Succeeded, "errors: {:?}", outcome.errors);
    assert_eq!(outcome.message, messages::JOB_FINISHED_SUCCESSFULLY);
    assert_eq!(outcome.process_exit_code(), 0);
    assert!(outcome.errors.is_empty());
    assert_eq!(outcome.stages.first(), Some(&Stage::InitializeAgent));
    assert_eq!(outcome.stages.last(), Some(&Stage::Shutdown));

    let (status, message) = stored_status(&server, &outcome).await;
    assert_eq!(status, JobStatus::Succeeded);
    assert_eq!(message, messages::JOB_FINISHED_SUCCESSFULLY);

    let job_dir = root.path().join(outcome.job_id.as_deref().unwrap());
    assert_eq!(std::fs::read_to_string(job_dir.join("stdout")).unwrap(), "out\n");
    assert_eq!(std::fs::read_to_string(job_dir.join("stderr")).unwrap(), "err\n");

    let record = server
        .coordinator()
        .store()
        .get_job(outcome.job_id.as_deref().unwrap())
        .await
        .unwrap();
    assert!(!record.api_job);
    assert!(record.started_at.is_some());
    assert!(record.finished_at.is_some());
    assert_eq!(record.archive_status, ArchiveStatus::Disabled);
}

#[tokio::test]
async fn test_failing_job() {
    let root = tempfile::tempdir().unwrap();
    let server = server_for(root.path());
    let request = shell_request("exit 7").with_archiving_disabled(true);

    let outcome = execution(&server, root.path(), request).run().await;
    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.message, messages::JOB_FAILED);
    assert_eq!(outcome.exit_code, Some(7));
    assert_eq!(outcome.process_exit_code(), 7);
    assert_eq!(stored_status(&server, &outcome).await.0, JobStatus::Failed);
}

#[tokio::test]
async fn test_setup_file_failure() {
    let root = tempfile::tempdir().unwrap();
    let setup = root.path().join("broken-setup.sh");
    std::fs::write(&setup, "echo preparing\nexit 1\n").unwrap();

    let server = server_for(root.path());
    let request = shell_request("echo never")
        .with_archiving_disabled(true)
        .with_environment(ExecutionEnvironment {
            setup_file: Some(setup.display().to_string()),
            ..Default::default()
        });

    let outcome = execution(&server, root.path(), request).run().await;
    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.message, messages::JOB_SETUP_FAILED);
    let (status, message) = stored_status(&server, &outcome).await;
    assert_eq!(status, JobStatus::Failed);
    assert_eq!(message, messages::JOB_SETUP_FAILED);
}

#[tokio::test]
async fn test_resolution_failure() {
    let root = tempfile::tempdir().unwrap();
    let server = server_for(root.path());
    let request = request_with_tags(&[&["gpu"]], &["shell"]).with_command_args(["true"]);

    let outcome = execution(&server, root.path(), request).run().await;
    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.message, messages::RESOLUTION_FAILED);
    assert_eq!(outcome.errors[0].stage, Stage::ObtainJobSpecification);
    assert!(!outcome.stages.contains(&Stage::LaunchJob));
    assert!(outcome.stages.contains(&Stage::Shutdown));

    let (status, message) = stored_status(&server, &outcome).await;
    assert_eq!(status, JobStatus::Failed);
    assert!(message.starts_with(messages::RESOLUTION_FAILED));
}

#[tokio::test]
async fn test_handshake_rejection_stops_before_reservation() {
    let root = tempfile::tempdir().unwrap();
    let config = test_server_config("node-a", root.path()).with_handshake(
        jobcoord::config::HandshakeConfig {
            minimum_version: Some("999.0.0".to_string()),
            blocked_version_pattern: None,
        },
    );
    let server = test_server(config, test_catalog());

    let outcome = execution(&server, root.path(), shell_request("true")).run().await;
    assert_eq!(outcome.status, JobStatus::Failed);
    assert!(outcome.job_id.is_none());
    assert_eq!(outcome.errors[0].stage, Stage::InitializeAgent);
    assert!(server.coordinator().store().list_jobs().await.is_empty());
}

#[tokio::test]
async fn test_kill_through_server() {
    let root = tempfile::tempdir().unwrap();
    let server = server_for(root.path());
    let request = shell_request("sleep 30")
        .with_requested_id("to-kill")
        .with_archiving_disabled(true);

    let run = tokio::spawn(execution(&server, root.path(), request).run());

    let running = wait_for(Duration::from_secs(10), || {
        let server = server.clone();
        async move {
            matches!(
                server.coordinator().get_job_status("to-kill").await,
                Ok(JobStatus::Running)
            )
        }
    })
    .await;
    assert!(running);
    // Give the script time to start the command.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        server.kill_job("to-kill", "test").await.unwrap(),
        KillOutcome::AgentNotified
    );
    let outcome = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("job should stop after a kill")
        .unwrap();
    assert_eq!(outcome.status, JobStatus::Killed);
    assert_eq!(outcome.message, KillSource::ApiKillRequest.status_message(false));

    let (status, message) = stored_status(&server, &outcome).await;
    assert_eq!(status, JobStatus::Killed);
    assert_eq!(message, messages::JOB_KILLED_BY_USER);
}

#[tokio::test]
async fn test_kill_right_after_launch_still_waits_for_the_process() {
    let root = tempfile::tempdir().unwrap();
    let server = server_for(root.path());
    let request = shell_request("sleep 30").with_archiving_disabled(true);

    let execution = execution(&server, root.path(), request);
    let process = execution.process();
    let run = tokio::spawn(execution.run());

    let launched = wait_for(Duration::from_secs(10), || {
        let process = process.clone();
        async move { process.is_launched() }
    })
    .await;
    assert!(launched);
    process.kill(KillSource::ApiKillRequest).await;

    let outcome = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("job should stop after a kill")
        .unwrap();
    assert!(outcome.stages.contains(&Stage::WaitJobCompletion));
    assert!(process.has_exited());
    assert_eq!(outcome.status, JobStatus::Killed);
    assert_eq!(outcome.message, messages::JOB_KILLED_BY_USER);
}

#[tokio::test]
async fn test_timeout() {
    let root = tempfile::tempdir().unwrap();
    let server = server_for(root.path());
    let request = shell_request("sleep 30")
        .with_timeout_secs(1)
        .with_archiving_disabled(true);

    let outcome = tokio::time::timeout(
        Duration::from_secs(15),
        execution(&server, root.path(), request).run(),
    )
    .await
    .expect("timeout should stop the job");
    assert_eq!(outcome.status, JobStatus::Killed);
    assert_eq!(outcome.message, messages::JOB_EXCEEDED_TIMEOUT);
}

#[tokio::test]
async fn test_status_changed_on_server_stops_job() {
    let root = tempfile::tempdir().unwrap();
    let server = server_for(root.path());
    let request = shell_request("sleep 30")
        .with_requested_id("remote")
        .with_archiving_disabled(true);

    let run = tokio::spawn(execution(&server, root.path(), request).run());
    let running = wait_for(Duration::from_secs(10), || {
        let server = server.clone();
        async move {
            matches!(
                server.coordinator().get_job_status("remote").await,
                Ok(JobStatus::Running)
            )
        }
    })
    .await;
    assert!(running);

    // Someone else finishes the job; the agent notices and stops.
    server
        .coordinator()
        .update_job_status("remote", JobStatus::Running, JobStatus::Failed, "operator")
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("agent should stop the job")
        .unwrap();
    assert_eq!(outcome.status, JobStatus::Killed);
    assert_eq!(outcome.message, messages::JOB_KILLED_REMOTE_STATUS);

    // The server keeps the status it already had.
    let (status, message) = stored_status(&server, &outcome).await;
    assert_eq!(status, JobStatus::Failed);
    assert_eq!(message, "operator");
}

#[tokio::test]
async fn test_archive_to_local_directory() {
    let root = tempfile::tempdir().unwrap();
    let archive = tempfile::tempdir().unwrap();
    let config = test_server_config("node-a", root.path())
        .with_default_archive_location(format!("file://{}/", archive.path().display()));
    let server = test_server(config, test_catalog());

    let outcome = execution(&server, root.path(), shell_request("echo archived > result.txt"))
        .run()
        .await;
    assert_eq!(outcome.status, JobStatus::Succeeded, "errors: {:?}", outcome.errors);
    assert_eq!(outcome.archive_status, Some(ArchiveStatus::Archived));

    let job_id = outcome.job_id.as_deref().unwrap();
    let archived = archive.path().join(job_id).join("result.txt");
    assert_eq!(std::fs::read_to_string(archived).unwrap(), "archived\n");

    let record = server.coordinator().store().get_job(job_id).await.unwrap();
    assert_eq!(record.archive_status, ArchiveStatus::Archived);
}

#[tokio::test]
async fn test_cleanup_removes_job_directory() {
    let root = tempfile::tempdir().unwrap();
    let server = server_for(root.path());
    let client = Arc::new(LocalRpcClient::new(server.clone()));
    let config = test_agent_config(root.path()).with_cleanup_strategy(CleanupStrategy::Full);
    let request = shell_request("true").with_archiving_disabled(true);

    let outcome = JobExecution::new(client, config, agent(), request).run().await;
    assert_eq!(outcome.status, JobStatus::Succeeded);
    let job_dir = root.path().join(outcome.job_id.as_deref().unwrap());
    assert!(!job_dir.exists());
}

#[tokio::test]
async fn test_transient_server_outage_is_retried() {
    let root = tempfile::tempdir().unwrap();
    let server = server_for(root.path());
    let client = Arc::new(LocalRpcClient::new(server.clone()));
    client.set_available(false);

    let outcome = JobExecution::new(
        client.clone(),
        test_agent_config(root.path()),
        agent(),
        shell_request("true"),
    )
    .run()
    .await;
    // Retries run out while the server is unreachable.
    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.errors[0].stage, Stage::InitializeAgent);
}

#[tokio::test]
async fn test_api_submitted_job_runs_through_launcher() {
    let root = tempfile::tempdir().unwrap();
    let node = test_node(root.path(), &["node-b"]);
    node.connect_peers().await;

    let mut ids = Vec::new();
    for i in 0..2 {
        let request = shell_request(&format!("echo job {}", i)).with_archiving_disabled(true);
        ids.push(node.submit_job(request).await.unwrap());
    }

    for job_id in &ids {
        let outcome = node.launcher().wait(job_id).await.expect("agent launched");
        assert_eq!(outcome.job_id.as_deref(), Some(job_id.as_str()));
        assert_eq!(outcome.status, JobStatus::Succeeded, "errors: {:?}", outcome.errors);

        let record = node.server().coordinator().store().get_job(job_id).await.unwrap();
        assert!(record.api_job);
        assert_eq!(record.status, JobStatus::Succeeded);
        let claimed_by = record.claimed_by.expect("claimed");
        assert!(claimed_by.hostname == "node-a" || claimed_by.hostname == "node-b");
    }

    node.shutdown().await;
}

#[tokio::test]
async fn test_node_shutdown_kills_launched_agents() {
    let root = tempfile::tempdir().unwrap();
    let node = test_node(root.path(), &[]);
    let request = shell_request("sleep 30").with_archiving_disabled(true);
    let job_id = node.submit_job(request).await.unwrap();

    let node_ref = &node;
    let job = job_id.as_str();
    assert!(
        wait_for(Duration::from_secs(10), || async move {
            let store = node_ref.server().coordinator().store();
            matches!(store.get_job(job).await, Ok(r) if r.status == JobStatus::Running)
        })
        .await
    );

    tokio::time::timeout(Duration::from_secs(10), node.shutdown())
        .await
        .expect("shutdown finished");
    assert!(!node.launcher().is_running(&job_id));
    let record = node.server().coordinator().store().get_job(&job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Killed);
    assert_eq!(record.status_message, messages::JOB_KILLED_SYSTEM_SIGNAL);
}

#[tokio::test]
async fn test_api_submission_with_unresolvable_request() {
    let root = tempfile::tempdir().unwrap();
    let node = test_node(root.path(), &[]);
    let request = request_with_tags(&[&["gpu"]], &["shell"]).with_requested_id("bad");

    let err = node.submit_job(request).await.unwrap_err();
    assert!(matches!(err, jobcoord::error::ProtocolError::Resolution(_)));
    assert!(node.launcher().wait("bad").await.is_none());
    let record = node.server().coordinator().store().get_job("bad").await.unwrap();
    assert_eq!(record.status, JobStatus::Failed);
}

#[tokio::test]
async fn test_kill_before_agent_claims() {
    let root = tempfile::tempdir().unwrap();
    let server = server_for(root.path());
    let coordinator = server.coordinator();
    let job_id = coordinator
        .reserve_job_id(shell_request("sleep 30"), None, true)
        .await
        .unwrap();
    coordinator.resolve_job_specification(&job_id).await.unwrap();
    assert_eq!(
        server.kill_job(&job_id, "changed my mind").await.unwrap(),
        KillOutcome::KilledBeforeStart
    );

    let client = Arc::new(LocalRpcClient::new(server.clone()));
    let outcome =
        JobExecution::for_reserved_job(client, test_agent_config(root.path()), agent(), &job_id)
            .run()
            .await;
    assert_eq!(outcome.status, JobStatus::Failed);
    assert!(!outcome.stages.contains(&Stage::LaunchJob));

    // The claim was refused, so the stored status is untouched.
    let record = coordinator.store().get_job(&job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Killed);
    assert_eq!(record.status_message, messages::JOB_KILLED_BEFORE_START);
}
