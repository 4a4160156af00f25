use std::path::PathBuf;

use thiserror::Error;

use crate::model::JobStatus;

/// Failures turning a job request into a job specification.
///
/// `NoMatchingResources` and `NoSelection` are permanent user-facing outcomes;
/// `SelectorFailed` means a selector implementation is broken and should be
/// surfaced as a bug rather than as bad input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("No matching resources: {0}")]
    NoMatchingResources(String),

    #[error("Selector {selector} did not select a {kind}: {rationale}")]
    NoSelection {
        selector: String,
        kind: &'static str,
        rationale: String,
    },

    #[error("Selector {selector} failed: {message}")]
    SelectorFailed { selector: String, message: String },

    #[error("Unknown application: {0}")]
    UnknownApplication(String),

    #[error("Invalid criteria: {0}")]
    InvalidCriteria(String),
}

/// Errors raised by the agent/server coordination protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {0} has not been resolved yet")]
    NotResolved(String),

    #[error("Job {0} is already claimed")]
    AlreadyClaimed(String),

    #[error("Job {job_id} is in status {status}: {reason}")]
    InvalidStatus {
        job_id: String,
        status: JobStatus,
        reason: String,
    },

    #[error("Job {job_id} expected status {expected} but is {actual}")]
    StaleStatus {
        job_id: String,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("Job {job_id} status transition {status} -> {status} is a no-op")]
    NoOpTransition { job_id: String, status: JobStatus },

    #[error("A job with id {0} already exists")]
    IdAlreadyExists(String),

    #[error("Job store is at capacity")]
    StoreFull,

    #[error("Agent rejected: {0}")]
    HandshakeRejected(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Server unavailable: {0}")]
    Unavailable(String),

    #[error("Resolution failed: {0}")]
    Resolution(#[from] ResolutionError),
}

impl ProtocolError {
    /// Transport-level failures worth retrying with backoff. Everything else
    /// is a decision by the server and retrying would yield the same answer.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProtocolError::Unavailable(_))
    }
}

/// Reasons a job process could not be launched. Each precondition gets its
/// own variant so the message reaching the user is specific.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Job already launched")]
    AlreadyLaunched,

    #[error("Job process not launched")]
    NotLaunched,

    #[error("Job was killed before it could be launched")]
    KilledBeforeLaunch,

    #[error("Job directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Job directory is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Job directory is not writable: {0}")]
    DirectoryNotWritable(PathBuf),

    #[error("Job script does not exist: {0}")]
    ScriptNotFound(PathBuf),

    #[error("Job script is not a regular file: {0}")]
    ScriptNotAFile(PathBuf),

    #[error("Job script is not executable: {0}")]
    ScriptNotExecutable(PathBuf),

    #[error("Failed to redirect job output: {0}")]
    OutputRedirect(#[source] std::io::Error),

    #[error("Failed to launch job: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Failures while preparing the job directory on the agent.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Job directory already exists: {0}")]
    DirectoryExists(PathBuf),

    #[error("Unsupported URI scheme for {0}")]
    UnsupportedScheme(String),

    #[error("Failed to download {uri}: {source}")]
    Download {
        uri: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write job script {path}: {source}")]
    Script {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to clean up {path}: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Invalid archive location: {0}")]
    InvalidLocation(String),

    #[error("Failed to archive {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors resolving an `agent://` resource. An absent resource is not an
/// error; see [`crate::server::AgentFileResource::Absent`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("Malformed agent resource URI: {0}")]
    MalformedUri(String),

    #[error("Invalid job id encoding: {0}")]
    InvalidJobId(String),

    #[error("Path escapes the job directory: {0}")]
    PathOutsideJobDirectory(String),

    #[error("Malformed byte range: {0}")]
    MalformedRange(String),

    #[error("Multiple byte ranges are not supported: {0}")]
    MultipleRanges(String),

    #[error("Range not satisfiable for a file of {size} bytes")]
    RangeNotSatisfiable { size: u64 },

    #[error("Too many concurrent file transfers")]
    TooManyTransfers,

    #[error("Peer node {0} unavailable")]
    PeerUnavailable(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
