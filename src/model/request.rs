use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::model::ExecutionResourceCriteria;

/// Descriptive metadata the user attaches to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub name: String,
    pub user: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl JobMetadata {
    pub fn new(
        name: impl Into<String>,
        user: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            user: user.into(),
            version: version.into(),
            description: None,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// Files to place in a resource's directory before the job runs.
///
/// Entries are URIs (`file://` or plain local paths).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionEnvironment {
    #[serde(default)]
    pub configs: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub setup_file: Option<String>,
}

impl ExecutionEnvironment {
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty() && self.dependencies.is_empty() && self.setup_file.is_none()
    }
}

/// Agent-side knobs the user may request for this job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfigRequest {
    #[serde(default)]
    pub requested_job_directory: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub archiving_disabled: bool,
}

/// A request to run a job, as submitted by a user or an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub requested_id: Option<String>,
    pub metadata: JobMetadata,
    #[serde(default)]
    pub command_args: Vec<String>,
    pub criteria: ExecutionResourceCriteria,
    #[serde(default)]
    pub environment: ExecutionEnvironment,
    #[serde(default)]
    pub agent_config: AgentConfigRequest,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub requested_memory_mb: Option<u32>,
}

impl JobRequest {
    pub fn new(metadata: JobMetadata, criteria: ExecutionResourceCriteria) -> Self {
        Self {
            requested_id: None,
            metadata,
            command_args: Vec::new(),
            criteria,
            environment: ExecutionEnvironment::default(),
            agent_config: AgentConfigRequest::default(),
            interactive: false,
            requested_memory_mb: None,
        }
    }

    pub fn with_requested_id(mut self, id: impl Into<String>) -> Self {
        self.requested_id = Some(id.into());
        self
    }

    pub fn with_command_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_environment(mut self, environment: ExecutionEnvironment) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.agent_config.timeout_secs = Some(timeout_secs);
        self
    }

    pub fn with_job_directory(mut self, dir: impl Into<String>) -> Self {
        self.agent_config.requested_job_directory = Some(dir.into());
        self
    }

    pub fn with_archiving_disabled(mut self, disabled: bool) -> Self {
        self.agent_config.archiving_disabled = disabled;
        self
    }

    pub fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u32) -> Self {
        self.requested_memory_mb = Some(memory_mb);
        self
    }

    /// Checks performed once when the request enters the system.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.metadata.name.trim().is_empty() {
            return Err(ProtocolError::InvalidRequest(
                "job name must not be blank".to_string(),
            ));
        }
        if self.metadata.user.trim().is_empty() {
            return Err(ProtocolError::InvalidRequest(
                "job user must not be blank".to_string(),
            ));
        }
        if let Some(id) = &self.requested_id {
            if id.trim().is_empty() || id.contains('/') {
                return Err(ProtocolError::InvalidRequest(format!(
                    "invalid requested job id '{}'",
                    id
                )));
            }
        }
        if self.agent_config.timeout_secs == Some(0) {
            return Err(ProtocolError::InvalidRequest(
                "timeout must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}

/// Identity an agent presents when it connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentClientMetadata {
    pub hostname: String,
    pub version: String,
    pub pid: u32,
}

impl AgentClientMetadata {
    pub fn new(hostname: impl Into<String>, version: impl Into<String>, pid: u32) -> Self {
        Self {
            hostname: hostname.into(),
            version: version.into(),
            pid,
        }
    }

    /// Metadata for the agent running in this process.
    pub fn current(hostname: impl Into<String>) -> Self {
        Self::new(hostname, env!("CARGO_PKG_VERSION"), std::process::id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Criterion;

    fn request() -> JobRequest {
        let criteria = ExecutionResourceCriteria::new(
            vec![Criterion::with_tags(["default"]).unwrap()],
            Criterion::with_tags(["sh"]).unwrap(),
            Vec::new(),
        )
        .unwrap();
        JobRequest::new(JobMetadata::new("echo", "alice", "1.0"), criteria)
    }

    #[test]
    fn valid_request_passes() {
        assert!(request().with_timeout_secs(10).validate().is_ok());
    }

    #[test]
    fn blank_user_is_rejected() {
        let mut req = request();
        req.metadata.user = " ".to_string();
        assert!(matches!(
            req.validate(),
            Err(ProtocolError::InvalidRequest(_))
        ));
    }

    #[test]
    fn requested_id_with_slash_is_rejected() {
        assert!(request().with_requested_id("a/b").validate().is_err());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        assert!(request().with_timeout_secs(0).validate().is_err());
    }
}
