use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::catalog::ResourceCatalog;
use crate::config::HandshakeConfig;
use crate::error::{ProtocolError, Result};
use crate::model::{
    messages, AgentClientMetadata, ArchiveStatus, JobRequest, JobSpecification, JobStatus,
};
use crate::resolver::ResolutionEngine;
use crate::server::store::JobStore;

/// Admission rules for connecting agents.
#[derive(Debug, Clone, Default)]
pub struct HandshakeRules {
    minimum_version: Option<Vec<u64>>,
    blocked_versions: Option<Regex>,
}

impl HandshakeRules {
    pub fn compile(config: &HandshakeConfig) -> std::result::Result<Self, regex::Error> {
        let blocked_versions = config
            .blocked_version_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()?;
        Ok(Self {
            minimum_version: config.minimum_version.as_deref().map(parse_version),
            blocked_versions,
        })
    }

    pub fn check(&self, agent: &AgentClientMetadata) -> Result<()> {
        if agent.hostname.trim().is_empty() {
            return Err(ProtocolError::HandshakeRejected(
                "agent hostname is blank".to_string(),
            ));
        }
        if let Some(blocked) = &self.blocked_versions {
            if blocked.is_match(&agent.version) {
                return Err(ProtocolError::HandshakeRejected(format!(
                    "agent version {} is blocked",
                    agent.version
                )));
            }
        }
        if let Some(minimum) = &self.minimum_version {
            if parse_version(&agent.version) < *minimum {
                return Err(ProtocolError::HandshakeRejected(format!(
                    "agent version {} is older than the minimum supported version",
                    agent.version
                )));
            }
        }
        Ok(())
    }
}

/// Dotted numeric version; non-numeric suffixes such as `-SNAPSHOT` are
/// dropped from each part.
fn parse_version(version: &str) -> Vec<u64> {
    version
        .split('.')
        .map(|part| {
            part.chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse()
                .unwrap_or(0)
        })
        .collect()
}

/// The server half of the agent protocol.
///
/// Each operation is either idempotent or guarded by a precondition checked
/// atomically in the [`JobStore`].
pub struct AgentCoordinator {
    store: Arc<dyn JobStore>,
    catalog: RwLock<Arc<ResourceCatalog>>,
    engine: ResolutionEngine,
    handshake: HandshakeRules,
    agent_properties: BTreeMap<String, String>,
}

impl AgentCoordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        catalog: ResourceCatalog,
        engine: ResolutionEngine,
        handshake: HandshakeRules,
    ) -> Self {
        Self {
            store,
            catalog: RwLock::new(Arc::new(catalog)),
            engine,
            handshake,
            agent_properties: BTreeMap::new(),
        }
    }

    pub fn with_agent_properties(
        mut self,
        properties: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        self.agent_properties = properties.into_iter().collect();
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Current catalog snapshot.
    pub async fn catalog(&self) -> Arc<ResourceCatalog> {
        self.catalog.read().await.clone()
    }

    /// Swap in a new catalog. Jobs already resolved keep their specification.
    pub async fn replace_catalog(&self, catalog: ResourceCatalog) {
        *self.catalog.write().await = Arc::new(catalog);
        tracing::info!("Resource catalog replaced");
    }

    pub async fn handshake(&self, agent: &AgentClientMetadata) -> Result<()> {
        match self.handshake.check(agent) {
            Ok(()) => {
                tracing::info!(
                    hostname = %agent.hostname,
                    version = %agent.version,
                    pid = agent.pid,
                    "Agent handshake accepted"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(hostname = %agent.hostname, version = %agent.version, error = %e, "Agent handshake rejected");
                Err(e)
            }
        }
    }

    /// Server-side overrides for agent configuration.
    pub async fn agent_properties(
        &self,
        agent: &AgentClientMetadata,
    ) -> Result<BTreeMap<String, String>> {
        tracing::debug!(hostname = %agent.hostname, "Agent requested configuration");
        Ok(self.agent_properties.clone())
    }

    pub async fn reserve_job_id(
        &self,
        request: JobRequest,
        agent: Option<AgentClientMetadata>,
        api_job: bool,
    ) -> Result<String> {
        request.validate()?;
        let job_id = self.store.save_job_request(request, agent, api_job).await?;
        tracing::info!(job_id = %job_id, api_job, "Job id reserved");
        Ok(job_id)
    }

    /// Resolve once, then hand back the stored specification on every later
    /// call, even if the catalog has changed in between.
    pub async fn resolve_job_specification(&self, job_id: &str) -> Result<JobSpecification> {
        let job = self.store.get_job(job_id).await?;
        if let Some(specification) = job.specification {
            return Ok(specification);
        }

        let catalog = self.catalog().await;
        match self.engine.resolve(job_id, &job.request, &catalog) {
            Ok(specification) => self.store.save_specification(job_id, specification).await,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Job resolution failed");
                let message = format!("{}: {}", messages::RESOLUTION_FAILED, e);
                if let Err(update) = self
                    .store
                    .update_status(job_id, JobStatus::Reserved, JobStatus::Failed, &message)
                    .await
                {
                    tracing::warn!(job_id, error = %update, "Could not mark unresolvable job failed");
                }
                Err(e.into())
            }
        }
    }

    pub async fn get_job_specification(&self, job_id: &str) -> Result<JobSpecification> {
        self.store
            .get_job(job_id)
            .await?
            .specification
            .ok_or_else(|| ProtocolError::NotResolved(job_id.to_string()))
    }

    /// Resolution without persisting anything.
    pub async fn resolve_dry_run(&self, request: &JobRequest) -> Result<JobSpecification> {
        request.validate()?;
        let job_id = request
            .requested_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let catalog = self.catalog().await;
        Ok(self.engine.resolve(&job_id, request, &catalog)?)
    }

    pub async fn claim_job(&self, job_id: &str, agent: AgentClientMetadata) -> Result<()> {
        let hostname = agent.hostname.clone();
        match self.store.claim_job(job_id, agent).await {
            Ok(()) => {
                tracing::info!(job_id, hostname = %hostname, "Job claimed");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(job_id, hostname = %hostname, error = %e, "Job claim refused");
                Err(e)
            }
        }
    }

    pub async fn update_job_status(
        &self,
        job_id: &str,
        current: JobStatus,
        new: JobStatus,
        message: &str,
    ) -> Result<()> {
        self.store.update_status(job_id, current, new, message).await?;
        tracing::info!(job_id, from = %current, to = %new, message, "Job status updated");
        Ok(())
    }

    pub async fn get_job_status(&self, job_id: &str) -> Result<JobStatus> {
        self.store.get_status(job_id).await
    }

    pub async fn update_job_archive_status(
        &self,
        job_id: &str,
        status: ArchiveStatus,
    ) -> Result<()> {
        self.store.set_archive_status(job_id, status).await?;
        tracing::debug!(job_id, archive_status = %status, "Archive status updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(version: &str) -> AgentClientMetadata {
        AgentClientMetadata::new("host-1", version, 42)
    }

    #[test]
    fn version_parsing_ignores_suffixes() {
        assert_eq!(parse_version("1.2.3-SNAPSHOT"), vec![1, 2, 3]);
        assert!(parse_version("0.10.0") > parse_version("0.9.9"));
    }

    #[test]
    fn minimum_version_is_enforced() {
        let rules = HandshakeRules::compile(&HandshakeConfig {
            minimum_version: Some("1.0.0".to_string()),
            blocked_version_pattern: None,
        })
        .unwrap();
        assert!(rules.check(&agent("1.0.0")).is_ok());
        assert!(rules.check(&agent("1.2")).is_ok());
        assert!(matches!(
            rules.check(&agent("0.9.1")),
            Err(ProtocolError::HandshakeRejected(_))
        ));
    }

    #[test]
    fn blocked_versions_are_rejected() {
        let rules = HandshakeRules::compile(&HandshakeConfig {
            minimum_version: None,
            blocked_version_pattern: Some(r"^0\.3\.".to_string()),
        })
        .unwrap();
        assert!(rules.check(&agent("0.3.7")).is_err());
        assert!(rules.check(&agent("0.4.0")).is_ok());
    }

    #[test]
    fn invalid_pattern_fails_to_compile() {
        let config = HandshakeConfig {
            minimum_version: None,
            blocked_version_pattern: Some("(".to_string()),
        };
        assert!(HandshakeRules::compile(&config).is_err());
    }
}
