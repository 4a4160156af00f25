//! The agent/server RPC surface.
//!
//! Unary calls are async trait methods. Streaming calls are modelled as
//! channel pairs: the agent holds the sending half of its upstream and the
//! receiving half of anything the server pushes down. Dropping either end
//! closes the stream for the other side.

pub mod local;

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::model::{
    AgentClientMetadata, ArchiveStatus, DirectoryManifest, JobRequest, JobSpecification,
    JobStatus,
};

pub use local::LocalRpcClient;

/// Liveness signal for one job, sent on a heartbeat stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentHeartbeat {
    pub job_id: String,
}

/// An open heartbeat stream. Send one [`AgentHeartbeat`] per interval; a
/// failed send means the server side is gone.
#[derive(Debug)]
pub struct HeartbeatStream {
    pub stream_id: String,
    pub heartbeats: mpsc::Sender<AgentHeartbeat>,
}

/// Latest directory snapshot from an agent.
#[derive(Debug, Clone)]
pub struct ManifestUpdate {
    pub job_id: String,
    pub manifest: DirectoryManifest,
}

/// A request from the server for bytes `[start, end)` of a job file. The agent
/// answers by sending chunks and then dropping `chunks`.
#[derive(Debug)]
pub struct FileRequest {
    pub transfer_id: String,
    pub relative_path: String,
    pub start: u64,
    pub end: u64,
    pub chunks: mpsc::Sender<std::result::Result<Bytes, String>>,
}

/// Agent end of the file control stream.
#[derive(Debug)]
pub struct ControlStream {
    pub stream_id: String,
    pub manifests: mpsc::Sender<ManifestUpdate>,
    pub file_requests: mpsc::Receiver<FileRequest>,
}

/// Server-to-agent request to stop the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillNotification {
    pub job_id: String,
    pub reason: String,
}

/// What an agent can ask of the server.
#[async_trait]
pub trait AgentRpcClient: Send + Sync {
    async fn handshake(&self, agent: &AgentClientMetadata) -> Result<()>;

    async fn get_agent_properties(
        &self,
        agent: &AgentClientMetadata,
    ) -> Result<BTreeMap<String, String>>;

    async fn reserve_job_id(
        &self,
        request: &JobRequest,
        agent: &AgentClientMetadata,
    ) -> Result<String>;

    async fn resolve_job_specification(&self, job_id: &str) -> Result<JobSpecification>;

    async fn get_job_specification(&self, job_id: &str) -> Result<JobSpecification>;

    async fn claim_job(&self, job_id: &str, agent: &AgentClientMetadata) -> Result<()>;

    async fn update_job_status(
        &self,
        job_id: &str,
        current: JobStatus,
        new: JobStatus,
        message: &str,
    ) -> Result<()>;

    async fn get_job_status(&self, job_id: &str) -> Result<JobStatus>;

    async fn update_job_archive_status(&self, job_id: &str, status: ArchiveStatus) -> Result<()>;

    async fn open_heartbeat_stream(&self) -> Result<HeartbeatStream>;

    async fn open_control_stream(&self, job_id: &str) -> Result<ControlStream>;

    async fn subscribe_kill(&self, job_id: &str) -> Result<mpsc::Receiver<KillNotification>>;
}
