use std::path::PathBuf;

use crate::agent::setup::JobDirectoryLayout;
use crate::agent::stage::Stage;
use crate::config::AgentConfig;
use crate::model::{
    AgentClientMetadata, ArchiveStatus, JobRequest, JobResult, JobSpecification, JobStatus,
};

/// A stage that did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageError {
    pub stage: Stage,
    pub message: String,
}

/// State shared by every stage of one job execution.
#[derive(Debug)]
pub struct ExecutionContext {
    pub config: AgentConfig,
    pub agent: AgentClientMetadata,
    /// Present when the agent reserves the job itself.
    pub request: Option<JobRequest>,
    pub job_id: Option<String>,
    /// The job id was reserved by someone else before this agent started.
    pub pre_reserved: bool,
    pub specification: Option<JobSpecification>,
    pub layout: Option<JobDirectoryLayout>,
    pub script: Option<PathBuf>,
    /// Status the server last acknowledged; the `current` side of every
    /// status update.
    pub current_status: Option<JobStatus>,
    pub claimed: bool,
    /// The server turned the claim down; the job belongs to someone else.
    pub claim_rejected: bool,
    pub job_result: Option<JobResult>,
    pub final_result: Option<JobResult>,
    pub archive_status: Option<ArchiveStatus>,
    pub errors: Vec<StageError>,
}

impl ExecutionContext {
    pub fn for_request(config: AgentConfig, agent: AgentClientMetadata, request: JobRequest) -> Self {
        Self::new(config, agent, Some(request), None)
    }

    pub fn for_reserved_job(
        config: AgentConfig,
        agent: AgentClientMetadata,
        job_id: impl Into<String>,
    ) -> Self {
        Self::new(config, agent, None, Some(job_id.into()))
    }

    fn new(
        config: AgentConfig,
        agent: AgentClientMetadata,
        request: Option<JobRequest>,
        job_id: Option<String>,
    ) -> Self {
        Self {
            config,
            agent,
            request,
            pre_reserved: job_id.is_some(),
            job_id,
            specification: None,
            layout: None,
            script: None,
            current_status: None,
            claimed: false,
            claim_rejected: false,
            job_result: None,
            final_result: None,
            archive_status: None,
            errors: Vec::new(),
        }
    }

    pub fn record_error(&mut self, stage: Stage, message: impl Into<String>) {
        self.errors.push(StageError {
            stage,
            message: message.into(),
        });
    }

    /// First error raised by a forward stage, the one that stopped the job.
    pub fn fatal_error(&self) -> Option<&StageError> {
        self.errors.iter().find(|e| !e.stage.is_cleanup())
    }

    /// Where the job runs: the specification's location, or the agent's
    /// default root when the specification leaves it blank.
    pub fn job_directory(&self) -> Option<PathBuf> {
        let spec = self.specification.as_ref()?;
        if spec.job_directory_location.trim().is_empty() {
            Some(self.config.job_directory_root.join(spec.job_id()))
        } else {
            Some(spec.job_directory())
        }
    }
}
