use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::archive::ArchiveService;
use crate::agent::context::{ExecutionContext, StageError};
use crate::agent::file_service::{AgentFileService, FilesLimits};
use crate::agent::heartbeat::{Backoff, HeartbeatSender};
use crate::agent::kill::{KillService, RemoteStatusMonitor};
use crate::agent::process::{KillWindows, LaunchOptions, ProcessLifecycleManager};
use crate::agent::setup::JobSetup;
use crate::agent::stage::{transition, Stage, StageOutcome};
use crate::config::AgentConfig;
use crate::error::{LaunchError, ProtocolError};
use crate::model::manifest::PrefixFilter;
use crate::model::{
    messages, AgentClientMetadata, ArchiveStatus, JobRequest, JobResult, JobStatus, KillSource,
};
use crate::rpc::AgentRpcClient;

/// Attempts at moving the job to its final status when the server keeps
/// reporting a different current status.
const FINAL_STATUS_ATTEMPTS: usize = 3;

/// How a job execution ended, from the agent's point of view.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub job_id: Option<String>,
    pub status: JobStatus,
    pub message: String,
    pub exit_code: Option<i32>,
    pub archive_status: Option<ArchiveStatus>,
    pub stages: Vec<Stage>,
    pub errors: Vec<StageError>,
}

impl ExecutionOutcome {
    /// Exit code for a process wrapping this execution.
    pub fn process_exit_code(&self) -> i32 {
        match (self.status, self.exit_code) {
            (JobStatus::Succeeded, _) => 0,
            (_, Some(code)) if code != 0 => code,
            _ => 1,
        }
    }
}

/// Drives one job from handshake to shutdown.
pub struct JobExecution {
    client: Arc<dyn AgentRpcClient>,
    ctx: ExecutionContext,
    process: Arc<ProcessLifecycleManager>,
    setup: JobSetup,
    archives: ArchiveService,
    kill_service: KillService,
    remote_monitor: Option<RemoteStatusMonitor>,
    file_service: Option<AgentFileService>,
    heartbeat: Option<HeartbeatSender>,
}

impl JobExecution {
    /// Run a new job; the agent reserves the id itself.
    pub fn new(
        client: Arc<dyn AgentRpcClient>,
        config: AgentConfig,
        agent: AgentClientMetadata,
        request: JobRequest,
    ) -> Self {
        Self::with_context(client, ExecutionContext::for_request(config, agent, request))
    }

    /// Run a job that was reserved and resolved through the API.
    pub fn for_reserved_job(
        client: Arc<dyn AgentRpcClient>,
        config: AgentConfig,
        agent: AgentClientMetadata,
        job_id: impl Into<String>,
    ) -> Self {
        Self::with_context(
            client,
            ExecutionContext::for_reserved_job(config, agent, job_id),
        )
    }

    fn with_context(client: Arc<dyn AgentRpcClient>, ctx: ExecutionContext) -> Self {
        let process = ProcessLifecycleManager::new(KillWindows::from(&ctx.config));
        let backoff = Backoff::new(
            ctx.config.reconnect_backoff_initial_ms,
            ctx.config.reconnect_backoff_max_ms,
        );
        Self {
            kill_service: KillService::new(process.clone()).with_reconnect(client.clone(), backoff),
            client,
            ctx,
            process,
            setup: JobSetup::default(),
            archives: ArchiveService::default(),
            remote_monitor: None,
            file_service: None,
            heartbeat: None,
        }
    }

    pub fn with_setup(mut self, setup: JobSetup) -> Self {
        self.setup = setup;
        self
    }

    pub fn with_archives(mut self, archives: ArchiveService) -> Self {
        self.archives = archives;
        self
    }

    /// Handle for killing the job from outside, e.g. a signal handler.
    pub fn process(&self) -> Arc<ProcessLifecycleManager> {
        self.process.clone()
    }

    pub async fn run(mut self) -> ExecutionOutcome {
        let mut visited = Vec::with_capacity(Stage::ALL.len());
        let mut stage = Some(Stage::FIRST);

        while let Some(current) = stage {
            tracing::debug!(stage = %current, job_id = ?self.ctx.job_id, "Stage starting");
            let outcome = self.run_stage(current).await;
            if let StageOutcome::Fail(message) = &outcome {
                tracing::error!(stage = %current, job_id = ?self.ctx.job_id, error = %message, "Stage failed");
                self.ctx.record_error(current, message.clone());
            }
            visited.push(current);
            stage = transition(current, &outcome, self.process.is_killed());
        }

        let result = self.ctx.final_result.clone().unwrap_or_else(|| {
            JobResult::new(JobStatus::Failed, messages::AGENT_FAILED, None)
        });
        ExecutionOutcome {
            job_id: self.ctx.job_id.clone(),
            status: result.status,
            message: result.message,
            exit_code: result.exit_code,
            archive_status: self.ctx.archive_status,
            stages: visited,
            errors: std::mem::take(&mut self.ctx.errors),
        }
    }

    async fn run_stage(&mut self, stage: Stage) -> StageOutcome {
        match stage {
            Stage::InitializeAgent => self.initialize_agent().await,
            Stage::ConfigureAgent => self.configure_agent().await,
            Stage::ReserveJobId => self.reserve_job_id().await,
            Stage::ObtainJobSpecification => self.obtain_job_specification().await,
            Stage::CreateJobDirectory => self.create_job_directory().await,
            Stage::DownloadDependencies => self.download_dependencies().await,
            Stage::CreateJobScript => self.create_job_script().await,
            Stage::StartKillService => self.start_kill_service().await,
            Stage::StartFileService => self.start_file_service().await,
            Stage::StartHeartbeatService => self.start_heartbeat_service(),
            Stage::ClaimJob => self.claim_job().await,
            Stage::SetJobStatusRunning => self.set_job_status_running().await,
            Stage::LaunchJob => self.launch_job(),
            Stage::WaitJobCompletion => self.wait_job_completion().await,
            Stage::DetermineFinalStatus => self.determine_final_status(),
            Stage::ArchiveJobOutputs => self.archive_job_outputs().await,
            Stage::SetJobStatusFinal => self.set_job_status_final().await,
            Stage::StopServices => self.stop_services().await,
            Stage::CleanupJobDirectory => self.cleanup_job_directory().await,
            Stage::Shutdown => {
                tracing::info!(job_id = ?self.ctx.job_id, "Agent execution finished");
                StageOutcome::Proceed
            }
        }
    }

    fn job_id(&self) -> Result<String, String> {
        self.ctx
            .job_id
            .clone()
            .ok_or_else(|| "no job id".to_string())
    }

    fn retry_policy(&self) -> (u32, Duration) {
        (
            self.ctx.config.rpc_retry_attempts,
            Duration::from_millis(self.ctx.config.rpc_retry_backoff_ms),
        )
    }

    async fn initialize_agent(&mut self) -> StageOutcome {
        let (attempts, backoff) = self.retry_policy();
        let client = &self.client;
        let agent = &self.ctx.agent;
        match retry(attempts, backoff, "handshake", || client.handshake(agent)).await {
            Ok(()) => {
                tracing::info!(hostname = %agent.hostname, version = %agent.version, "Agent accepted by server");
                StageOutcome::Proceed
            }
            Err(e) => StageOutcome::Fail(e.to_string()),
        }
    }

    /// Server-side overrides are optional; failing to fetch them leaves the
    /// local configuration in place.
    async fn configure_agent(&mut self) -> StageOutcome {
        let (attempts, backoff) = self.retry_policy();
        let client = &self.client;
        let agent = &self.ctx.agent;
        match retry(attempts, backoff, "agent properties", || {
            client.get_agent_properties(agent)
        })
        .await
        {
            Ok(properties) => {
                self.ctx
                    .config
                    .apply_overrides(properties.iter().map(|(k, v)| (k.as_str(), v.as_str())));
                self.process
                    .set_kill_windows(KillWindows::from(&self.ctx.config));
                tracing::debug!(overrides = properties.len(), "Agent configured");
            }
            Err(e) => tracing::warn!(error = %e, "Using local agent configuration"),
        }
        StageOutcome::Proceed
    }

    async fn reserve_job_id(&mut self) -> StageOutcome {
        if self.ctx.job_id.is_some() {
            return StageOutcome::Proceed;
        }
        let Some(request) = self.ctx.request.as_ref() else {
            return StageOutcome::Fail("no job request to reserve".to_string());
        };
        let (attempts, backoff) = self.retry_policy();
        let client = &self.client;
        let agent = &self.ctx.agent;
        match retry(attempts, backoff, "reserve job id", || {
            client.reserve_job_id(request, agent)
        })
        .await
        {
            Ok(job_id) => {
                tracing::info!(job_id = %job_id, "Job id reserved");
                self.ctx.job_id = Some(job_id);
                self.ctx.current_status = Some(JobStatus::Reserved);
                StageOutcome::Proceed
            }
            Err(e) => StageOutcome::Fail(e.to_string()),
        }
    }

    async fn obtain_job_specification(&mut self) -> StageOutcome {
        let job_id = match self.job_id() {
            Ok(id) => id,
            Err(e) => return StageOutcome::Fail(e),
        };
        let (attempts, backoff) = self.retry_policy();
        let client = &self.client;

        let result = if self.ctx.pre_reserved {
            match retry(attempts, backoff, "get specification", || {
                client.get_job_specification(&job_id)
            })
            .await
            {
                Err(ProtocolError::NotResolved(_)) => {
                    retry(attempts, backoff, "resolve specification", || {
                        client.resolve_job_specification(&job_id)
                    })
                    .await
                }
                other => other,
            }
        } else {
            retry(attempts, backoff, "resolve specification", || {
                client.resolve_job_specification(&job_id)
            })
            .await
        };

        match result {
            Ok(spec) if spec.job_id() != job_id => StageOutcome::Fail(format!(
                "specification is for job {} not {}",
                spec.job_id(),
                job_id
            )),
            Ok(spec) => {
                tracing::info!(
                    job_id = %job_id,
                    command = ?spec.command_line(),
                    cluster = %spec.cluster.id,
                    "Job specification obtained"
                );
                self.ctx.specification = Some(spec);
                self.ctx.current_status = Some(JobStatus::Resolved);
                StageOutcome::Proceed
            }
            Err(e) => StageOutcome::Fail(e.to_string()),
        }
    }

    async fn create_job_directory(&mut self) -> StageOutcome {
        let (Some(spec), Some(dir)) = (self.ctx.specification.as_ref(), self.ctx.job_directory())
        else {
            return StageOutcome::Fail("no job specification".to_string());
        };
        match self.setup.create_job_directory(spec, &dir).await {
            Ok(layout) => {
                self.ctx.layout = Some(layout);
                StageOutcome::Proceed
            }
            Err(e) => StageOutcome::Fail(e.to_string()),
        }
    }

    async fn download_dependencies(&mut self) -> StageOutcome {
        let (Some(spec), Some(layout)) = (&self.ctx.specification, &self.ctx.layout) else {
            return StageOutcome::Fail("job directory not created".to_string());
        };
        match self.setup.download_resources(spec, layout).await {
            Ok(_) => StageOutcome::Proceed,
            Err(e) => StageOutcome::Fail(e.to_string()),
        }
    }

    async fn create_job_script(&mut self) -> StageOutcome {
        let (Some(spec), Some(layout)) = (&self.ctx.specification, &self.ctx.layout) else {
            return StageOutcome::Fail("job directory not created".to_string());
        };
        match self.setup.create_job_script(spec, layout).await {
            Ok(script) => {
                self.ctx.script = Some(script);
                StageOutcome::Proceed
            }
            Err(e) => StageOutcome::Fail(e.to_string()),
        }
    }

    async fn start_kill_service(&mut self) -> StageOutcome {
        let job_id = match self.job_id() {
            Ok(id) => id,
            Err(e) => return StageOutcome::Fail(e),
        };
        let (attempts, backoff) = self.retry_policy();
        let client = &self.client;
        let notifications = match retry(attempts, backoff, "subscribe kill", || {
            client.subscribe_kill(&job_id)
        })
        .await
        {
            Ok(rx) => rx,
            Err(e) => return StageOutcome::Fail(e.to_string()),
        };
        self.kill_service.start(&job_id, notifications);

        let mut monitor = RemoteStatusMonitor::new(
            self.client.clone(),
            self.process.clone(),
            self.ctx.config.remote_status_poll_interval_ms,
        );
        monitor.start(&job_id);
        self.remote_monitor = Some(monitor);
        StageOutcome::Proceed
    }

    async fn start_file_service(&mut self) -> StageOutcome {
        let job_id = match self.job_id() {
            Ok(id) => id,
            Err(e) => return StageOutcome::Fail(e),
        };
        let (Some(spec), Some(layout)) = (&self.ctx.specification, &self.ctx.layout) else {
            return StageOutcome::Fail("job directory not created".to_string());
        };
        let config = &self.ctx.config;
        let filter = PrefixFilter {
            unwalked_prefixes: layout.unwalked_prefixes(spec),
        };
        let mut service = AgentFileService::new(
            self.client.clone(),
            self.process.clone(),
            Arc::new(filter),
            FilesLimits {
                max_file_count: config.max_file_count,
                max_file_size: config.max_file_size,
                max_total_size: config.max_total_size,
            },
            config.manifest_refresh_interval_ms,
        )
        .with_reconnect_backoff(
            config.reconnect_backoff_initial_ms,
            config.reconnect_backoff_max_ms,
        );
        let root = layout.root().to_path_buf();
        let started = service.start(&job_id, &root).await;
        // Keep it even on failure so the tail stops whatever did start.
        self.file_service = Some(service);
        match started {
            Ok(()) => StageOutcome::Proceed,
            Err(e) => StageOutcome::Fail(e.to_string()),
        }
    }

    fn start_heartbeat_service(&mut self) -> StageOutcome {
        let job_id = match self.job_id() {
            Ok(id) => id,
            Err(e) => return StageOutcome::Fail(e),
        };
        let config = &self.ctx.config;
        let mut heartbeat = HeartbeatSender::new(
            self.client.clone(),
            config.heartbeat_interval_ms,
            config.reconnect_backoff_initial_ms,
            config.reconnect_backoff_max_ms,
        );
        heartbeat.start(&job_id);
        self.heartbeat = Some(heartbeat);
        StageOutcome::Proceed
    }

    async fn claim_job(&mut self) -> StageOutcome {
        let job_id = match self.job_id() {
            Ok(id) => id,
            Err(e) => return StageOutcome::Fail(e),
        };
        let (attempts, backoff) = self.retry_policy();
        let client = &self.client;
        let agent = &self.ctx.agent;
        match retry(attempts, backoff, "claim job", || client.claim_job(&job_id, agent)).await {
            Ok(()) => {
                self.ctx.claimed = true;
                self.ctx.current_status = Some(JobStatus::Claimed);
            }
            Err(e) => {
                if matches!(
                    e,
                    ProtocolError::AlreadyClaimed(_)
                        | ProtocolError::InvalidStatus { .. }
                        | ProtocolError::JobNotFound(_)
                ) {
                    self.ctx.claim_rejected = true;
                }
                return StageOutcome::Fail(e.to_string());
            }
        }
        self.update_status(&job_id, JobStatus::Init, messages::JOB_INITIALIZING)
            .await
    }

    async fn set_job_status_running(&mut self) -> StageOutcome {
        let job_id = match self.job_id() {
            Ok(id) => id,
            Err(e) => return StageOutcome::Fail(e),
        };
        self.update_status(&job_id, JobStatus::Running, messages::JOB_RUNNING)
            .await
    }

    async fn update_status(&mut self, job_id: &str, new: JobStatus, message: &str) -> StageOutcome {
        let Some(current) = self.ctx.current_status else {
            return StageOutcome::Fail("job status unknown".to_string());
        };
        let (attempts, backoff) = self.retry_policy();
        let client = &self.client;
        match retry(attempts, backoff, "update status", || {
            client.update_job_status(job_id, current, new, message)
        })
        .await
        {
            Ok(()) => {
                self.ctx.current_status = Some(new);
                StageOutcome::Proceed
            }
            Err(ProtocolError::StaleStatus { actual, .. }) => {
                self.ctx.current_status = Some(actual);
                StageOutcome::Fail(format!(
                    "job moved to {} while the agent expected {}",
                    actual, current
                ))
            }
            Err(e) => StageOutcome::Fail(e.to_string()),
        }
    }

    fn launch_job(&mut self) -> StageOutcome {
        let (Some(spec), Some(layout), Some(script)) =
            (&self.ctx.specification, &self.ctx.layout, &self.ctx.script)
        else {
            return StageOutcome::Fail("job script not created".to_string());
        };
        let mut options = LaunchOptions::new(layout.root(), script)
            .with_interactive(spec.interactive)
            .with_setup_marker(layout.setup_marker());
        if let Some(timeout) = spec.timeout_secs {
            options = options.with_timeout_secs(timeout);
        }
        options.launch_in_working_dir = self.ctx.config.launch_in_job_directory;

        match self.process.launch(options) {
            Ok(()) => StageOutcome::Proceed,
            // The boundary check picks the kill up.
            Err(LaunchError::KilledBeforeLaunch) => StageOutcome::Proceed,
            Err(e) => StageOutcome::Fail(e.to_string()),
        }
    }

    async fn wait_job_completion(&mut self) -> StageOutcome {
        match self.process.wait_for().await {
            Ok(result) => {
                tracing::info!(
                    job_id = ?self.ctx.job_id,
                    status = %result.status,
                    exit_code = ?result.exit_code,
                    "Job completed"
                );
                self.ctx.job_result = Some(result);
                StageOutcome::Proceed
            }
            Err(LaunchError::NotLaunched) if self.process.is_killed() => StageOutcome::Proceed,
            Err(e) => StageOutcome::Fail(e.to_string()),
        }
    }

    fn determine_final_status(&mut self) -> StageOutcome {
        let interactive = self
            .ctx
            .specification
            .as_ref()
            .map(|s| s.interactive)
            .or_else(|| self.ctx.request.as_ref().map(|r| r.interactive))
            .unwrap_or(false);

        let result = if let Some(result) = &self.ctx.job_result {
            result.clone()
        } else if let Some(source) = self.process.kill_source() {
            JobResult::new(JobStatus::Killed, source.status_message(interactive), None)
        } else if let Some(error) = self.ctx.fatal_error() {
            JobResult::new(JobStatus::Failed, error.stage.failure_message(), None)
        } else {
            JobResult::new(JobStatus::Failed, messages::AGENT_FAILED, None)
        };
        tracing::info!(job_id = ?self.ctx.job_id, status = %result.status, message = %result.message, "Final status determined");
        self.ctx.final_result = Some(result);
        StageOutcome::Proceed
    }

    async fn archive_job_outputs(&mut self) -> StageOutcome {
        let (Some(job_id), Some(spec), Some(layout)) =
            (&self.ctx.job_id, &self.ctx.specification, &self.ctx.layout)
        else {
            return StageOutcome::Proceed;
        };
        if self.ctx.claim_rejected {
            return StageOutcome::Proceed;
        }
        let status = self
            .archives
            .archive(layout.root(), spec.archive_location.as_deref())
            .await;
        self.ctx.archive_status = Some(status);

        let (attempts, backoff) = self.retry_policy();
        let client = &self.client;
        match retry(attempts, backoff, "archive status", || {
            client.update_job_archive_status(job_id, status)
        })
        .await
        {
            Ok(()) => StageOutcome::Proceed,
            Err(e) => StageOutcome::Fail(e.to_string()),
        }
    }

    /// Move the job to its final status unless the server already holds a
    /// final one or the job belongs to another agent.
    async fn set_job_status_final(&mut self) -> StageOutcome {
        if self.ctx.claim_rejected {
            tracing::info!(job_id = ?self.ctx.job_id, "Job not owned by this agent, leaving status alone");
            return StageOutcome::Proceed;
        }
        let (Some(job_id), Some(result), Some(mut current)) = (
            self.ctx.job_id.clone(),
            self.ctx.final_result.clone(),
            self.ctx.current_status,
        ) else {
            return StageOutcome::Proceed;
        };

        let (attempts, backoff) = self.retry_policy();
        for _ in 0..FINAL_STATUS_ATTEMPTS {
            if current.is_finished() {
                tracing::info!(job_id = %job_id, status = %current, "Job already in a final status");
                return StageOutcome::Proceed;
            }
            let client = &self.client;
            match retry(attempts, backoff, "final status", || {
                client.update_job_status(&job_id, current, result.status, &result.message)
            })
            .await
            {
                Ok(()) => {
                    self.ctx.current_status = Some(result.status);
                    return StageOutcome::Proceed;
                }
                Err(ProtocolError::StaleStatus { actual, .. }) => {
                    tracing::warn!(job_id = %job_id, expected = %current, actual = %actual, "Status changed on the server");
                    current = actual;
                    self.ctx.current_status = Some(actual);
                }
                Err(e) => return StageOutcome::Fail(e.to_string()),
            }
        }
        StageOutcome::Fail(format!("could not set final status of job {}", job_id))
    }

    async fn stop_services(&mut self) -> StageOutcome {
        if self.process.is_launched() && !self.process.has_exited() {
            tracing::warn!(job_id = ?self.ctx.job_id, "Job process still running at shutdown");
            self.process.kill(KillSource::SystemSignal).await;
        }
        let drain = Duration::from_millis(self.ctx.config.service_drain_ms);
        self.kill_service.stop().await;
        if let Some(mut monitor) = self.remote_monitor.take() {
            monitor.stop().await;
        }
        if let Some(mut files) = self.file_service.take() {
            files.stop(drain).await;
        }
        if let Some(mut heartbeat) = self.heartbeat.take() {
            heartbeat.stop(drain).await;
        }
        StageOutcome::Proceed
    }

    async fn cleanup_job_directory(&mut self) -> StageOutcome {
        let Some(layout) = &self.ctx.layout else {
            return StageOutcome::Proceed;
        };
        match self
            .setup
            .cleanup(layout, self.ctx.config.cleanup_strategy)
            .await
        {
            Ok(()) => StageOutcome::Proceed,
            Err(e) => StageOutcome::Fail(e.to_string()),
        }
    }
}

/// Call `op` until it succeeds, fails with a non-transient error, or
/// `attempts` run out. The delay doubles after each transient failure.
async fn retry<T, F, Fut>(
    attempts: u32,
    backoff: Duration,
    what: &str,
    mut op: F,
) -> Result<T, ProtocolError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProtocolError>>,
{
    let attempts = attempts.max(1);
    let mut delay = backoff;
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < attempts => {
                tracing::warn!(call = what, attempt, error = %e, "Transient RPC failure, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_then_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = retry(5, Duration::from_millis(10), "test", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ProtocolError::Unavailable("down".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = retry(3, Duration::from_millis(10), "test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ProtocolError::Unavailable("down".into()))
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_decisions() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = retry(5, Duration::from_millis(10), "test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ProtocolError::AlreadyClaimed("job".into()))
        })
        .await;
        assert!(matches!(result, Err(ProtocolError::AlreadyClaimed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_process_exit_code() {
        let outcome = |status, exit_code| ExecutionOutcome {
            job_id: None,
            status,
            message: String::new(),
            exit_code,
            archive_status: None,
            stages: Vec::new(),
            errors: Vec::new(),
        };
        assert_eq!(outcome(JobStatus::Succeeded, Some(0)).process_exit_code(), 0);
        assert_eq!(outcome(JobStatus::Failed, Some(3)).process_exit_code(), 3);
        assert_eq!(outcome(JobStatus::Failed, None).process_exit_code(), 1);
        assert_eq!(outcome(JobStatus::Killed, Some(0)).process_exit_code(), 1);
    }
}
