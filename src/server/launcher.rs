use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::agent::{ExecutionOutcome, JobExecution, ProcessLifecycleManager};
use crate::config::AgentConfig;
use crate::error::{ProtocolError, Result};
use crate::model::{AgentClientMetadata, KillSource};
use crate::rpc::LocalRpcClient;
use crate::server::ServerNode;

/// Starts an agent for a job that was reserved and resolved through the API.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch_agent(&self, server: Arc<ServerNode>, job_id: &str) -> Result<()>;
}

struct LaunchedAgent {
    process: Arc<ProcessLifecycleManager>,
    task: JoinHandle<ExecutionOutcome>,
}

/// Runs agents as tasks in this process, connected to the server node
/// in-memory.
pub struct LocalAgentLauncher {
    config: AgentConfig,
    running: DashMap<String, LaunchedAgent>,
}

impl LocalAgentLauncher {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            running: DashMap::new(),
        }
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.running
            .get(job_id)
            .map(|agent| !agent.task.is_finished())
            .unwrap_or(false)
    }

    /// Wait for the agent running `job_id` and return how it ended. `None`
    /// if no agent was launched here for the job or it was already waited on.
    pub async fn wait(&self, job_id: &str) -> Option<ExecutionOutcome> {
        let (_, agent) = self.running.remove(job_id)?;
        match agent.task.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!(job_id, error = %e, "Agent task failed");
                None
            }
        }
    }

    /// Drop bookkeeping for agents that have finished.
    pub fn reap_finished(&self) -> usize {
        let before = self.running.len();
        self.running.retain(|_, agent| !agent.task.is_finished());
        before - self.running.len()
    }

    /// Kill every agent launched here and wait up to `timeout` for them to
    /// report their final status. Agents still running after that are
    /// aborted. Returns how many were stopped.
    pub async fn stop_all(&self, timeout: Duration) -> usize {
        let job_ids: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        let agents: Vec<(String, LaunchedAgent)> = job_ids
            .iter()
            .filter_map(|job_id| self.running.remove(job_id))
            .collect();
        if agents.is_empty() {
            return 0;
        }
        tracing::info!(count = agents.len(), "Stopping launched agents");

        let deadline = tokio::time::Instant::now() + timeout;
        let waits = agents.into_iter().map(|(job_id, mut agent)| async move {
            if !agent.task.is_finished() {
                let process = agent.process.clone();
                tokio::spawn(async move { process.kill(KillSource::SystemSignal).await });
            }
            if tokio::time::timeout_at(deadline, &mut agent.task).await.is_err() {
                tracing::warn!(job_id = %job_id, "Agent did not stop in time, aborting");
                agent.task.abort();
            }
        });
        let stopped = futures::future::join_all(waits).await.len();
        tracing::info!(stopped, "Launched agents stopped");
        stopped
    }
}

#[async_trait]
impl AgentLauncher for LocalAgentLauncher {
    async fn launch_agent(&self, server: Arc<ServerNode>, job_id: &str) -> Result<()> {
        if self.is_running(job_id) {
            return Err(ProtocolError::AlreadyClaimed(job_id.to_string()));
        }
        let agent = AgentClientMetadata::current(server.hostname());
        let client = Arc::new(LocalRpcClient::new(server));
        let execution =
            JobExecution::for_reserved_job(client, self.config.clone(), agent, job_id);
        let process = execution.process();
        let task = tokio::spawn(execution.run());
        self.running
            .insert(job_id.to_string(), LaunchedAgent { process, task });
        tracing::info!(job_id, "Agent launched");
        Ok(())
    }
}
