use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::ExecutionEnvironment;

/// One resource taking part in a job, with the files it contributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResource {
    pub id: String,
    pub environment: ExecutionEnvironment,
}

impl ExecutionResource {
    pub fn new(id: impl Into<String>, environment: ExecutionEnvironment) -> Self {
        Self {
            id: id.into(),
            environment,
        }
    }
}

/// The frozen outcome of resolution. Persisted once before an agent starts
/// work and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpecification {
    pub job: ExecutionResource,
    pub cluster: ExecutionResource,
    pub command: ExecutionResource,
    pub applications: Vec<ExecutionResource>,
    /// The command's executable, split into words.
    pub executable_args: Vec<String>,
    /// Arguments the user appended.
    pub job_args: Vec<String>,
    pub environment_variables: BTreeMap<String, String>,
    pub interactive: bool,
    pub job_directory_location: String,
    pub archive_location: Option<String>,
    pub timeout_secs: Option<u64>,
    pub memory_mb: u32,
}

impl JobSpecification {
    pub fn job_id(&self) -> &str {
        &self.job.id
    }

    /// The full command line: executable followed by job arguments.
    pub fn command_line(&self) -> Vec<String> {
        self.executable_args
            .iter()
            .chain(self.job_args.iter())
            .cloned()
            .collect()
    }

    /// Directory the job runs in: `<location>/<job id>`.
    pub fn job_directory(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.job_directory_location).join(self.job_id())
    }
}
