//! Value types shared by the server and the agent.

pub mod criterion;
pub mod manifest;
pub mod request;
pub mod specification;
pub mod status;

pub use criterion::{Criterion, ExecutionResourceCriteria, Matchable};
pub use manifest::{DirectoryManifest, ManifestEntry, ManifestFilter};
pub use request::{
    AgentClientMetadata, AgentConfigRequest, ExecutionEnvironment, JobMetadata, JobRequest,
};
pub use specification::{ExecutionResource, JobSpecification};
pub use status::{messages, ArchiveStatus, JobResult, JobStatus, KillSource};
