use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{ProtocolError, Result};
use crate::model::{
    AgentClientMetadata, ArchiveStatus, JobRequest, JobSpecification, JobStatus,
};
use crate::rpc::{AgentRpcClient, ControlStream, HeartbeatStream, KillNotification};
use crate::server::ServerNode;

/// Binds an agent to a server node in the same process.
///
/// The link can be cut with [`set_available`]; while it is down every call
/// fails with [`ProtocolError::Unavailable`], as a dropped channel would.
///
/// [`set_available`]: LocalRpcClient::set_available
#[derive(Clone)]
pub struct LocalRpcClient {
    server: Arc<ServerNode>,
    available: Arc<AtomicBool>,
}

impl LocalRpcClient {
    pub fn new(server: Arc<ServerNode>) -> Self {
        Self {
            server,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn server(&self) -> &Arc<ServerNode> {
        &self.server
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProtocolError::Unavailable(format!(
                "server {} unreachable",
                self.server.hostname()
            )))
        }
    }
}

#[async_trait]
impl AgentRpcClient for LocalRpcClient {
    async fn handshake(&self, agent: &AgentClientMetadata) -> Result<()> {
        self.check()?;
        self.server.coordinator().handshake(agent).await
    }

    async fn get_agent_properties(
        &self,
        agent: &AgentClientMetadata,
    ) -> Result<BTreeMap<String, String>> {
        self.check()?;
        self.server.coordinator().agent_properties(agent).await
    }

    async fn reserve_job_id(
        &self,
        request: &JobRequest,
        agent: &AgentClientMetadata,
    ) -> Result<String> {
        self.check()?;
        self.server
            .coordinator()
            .reserve_job_id(request.clone(), Some(agent.clone()), false)
            .await
    }

    async fn resolve_job_specification(&self, job_id: &str) -> Result<JobSpecification> {
        self.check()?;
        self.server
            .coordinator()
            .resolve_job_specification(job_id)
            .await
    }

    async fn get_job_specification(&self, job_id: &str) -> Result<JobSpecification> {
        self.check()?;
        self.server.coordinator().get_job_specification(job_id).await
    }

    async fn claim_job(&self, job_id: &str, agent: &AgentClientMetadata) -> Result<()> {
        self.check()?;
        self.server
            .coordinator()
            .claim_job(job_id, agent.clone())
            .await
    }

    async fn update_job_status(
        &self,
        job_id: &str,
        current: JobStatus,
        new: JobStatus,
        message: &str,
    ) -> Result<()> {
        self.check()?;
        self.server
            .coordinator()
            .update_job_status(job_id, current, new, message)
            .await
    }

    async fn get_job_status(&self, job_id: &str) -> Result<JobStatus> {
        self.check()?;
        self.server.coordinator().get_job_status(job_id).await
    }

    async fn update_job_archive_status(&self, job_id: &str, status: ArchiveStatus) -> Result<()> {
        self.check()?;
        self.server
            .coordinator()
            .update_job_archive_status(job_id, status)
            .await
    }

    async fn open_heartbeat_stream(&self) -> Result<HeartbeatStream> {
        self.check()?;
        Ok(self.server.heartbeats().connect())
    }

    async fn open_control_stream(&self, job_id: &str) -> Result<ControlStream> {
        self.check()?;
        Ok(self.server.files().open_control_stream(job_id))
    }

    async fn subscribe_kill(&self, job_id: &str) -> Result<mpsc::Receiver<KillNotification>> {
        self.check()?;
        Ok(self.server.kills().subscribe(job_id))
    }
}
