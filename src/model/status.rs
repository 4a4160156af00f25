use serde::{Deserialize, Serialize};

/// Lifecycle of a job as persisted by the server.
///
/// The server is the single source of truth. Agents propose transitions and
/// the server accepts them only when the asserted current status matches the
/// persisted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Reserved,
    Resolved,
    Claimed,
    Init,
    Running,
    Succeeded,
    Failed,
    Killed,
}

impl JobStatus {
    /// A job that has not reached a final state.
    pub fn is_active(&self) -> bool {
        !self.is_finished()
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Killed
        )
    }

    pub fn is_resolvable(&self) -> bool {
        *self == JobStatus::Reserved
    }

    pub fn is_claimable(&self) -> bool {
        *self == JobStatus::Resolved
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Reserved => write!(f, "RESERVED"),
            JobStatus::Resolved => write!(f, "RESOLVED"),
            JobStatus::Claimed => write!(f, "CLAIMED"),
            JobStatus::Init => write!(f, "INIT"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Succeeded => write!(f, "SUCCEEDED"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Killed => write!(f, "KILLED"),
        }
    }
}

/// Whether job output has been copied off the execution node. Advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchiveStatus {
    Pending,
    Archived,
    Failed,
    Disabled,
    NoFiles,
    Unknown,
}

impl std::fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveStatus::Pending => write!(f, "PENDING"),
            ArchiveStatus::Archived => write!(f, "ARCHIVED"),
            ArchiveStatus::Failed => write!(f, "FAILED"),
            ArchiveStatus::Disabled => write!(f, "DISABLED"),
            ArchiveStatus::NoFiles => write!(f, "NO_FILES"),
            ArchiveStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// What asked for a job to be terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KillSource {
    ApiKillRequest,
    Timeout,
    FilesLimit,
    RemoteStatusMonitor,
    SystemSignal,
}

impl KillSource {
    /// Final status message for a job killed by this source. A signal hitting
    /// an interactive job is almost always the user pressing Ctrl-C.
    pub fn status_message(&self, interactive: bool) -> &'static str {
        match self {
            KillSource::ApiKillRequest => messages::JOB_KILLED_BY_USER,
            KillSource::Timeout => messages::JOB_EXCEEDED_TIMEOUT,
            KillSource::FilesLimit => messages::JOB_EXCEEDED_FILES_LIMIT,
            KillSource::RemoteStatusMonitor => messages::JOB_KILLED_REMOTE_STATUS,
            KillSource::SystemSignal if interactive => messages::JOB_KILLED_INTERACTIVE_SIGNAL,
            KillSource::SystemSignal => messages::JOB_KILLED_SYSTEM_SIGNAL,
        }
    }
}

impl std::fmt::Display for KillSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillSource::ApiKillRequest => write!(f, "api kill request"),
            KillSource::Timeout => write!(f, "timeout"),
            KillSource::FilesLimit => write!(f, "files limit"),
            KillSource::RemoteStatusMonitor => write!(f, "remote status monitor"),
            KillSource::SystemSignal => write!(f, "system signal"),
        }
    }
}

/// Outcome of a job process as observed by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub status: JobStatus,
    pub message: String,
    pub exit_code: Option<i32>,
}

impl JobResult {
    pub fn new(status: JobStatus, message: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            status,
            message: message.into(),
            exit_code,
        }
    }
}

pub mod messages {
    pub const JOB_RESERVED: &str = "Job reserved";
    pub const JOB_RESOLVED: &str = "Job resolved";
    pub const JOB_CLAIMED: &str = "Job claimed by agent";
    pub const JOB_INITIALIZING: &str = "Job is initializing";
    pub const JOB_RUNNING: &str = "Job is running";
    pub const JOB_FINISHED_SUCCESSFULLY: &str = "Job finished successfully";
    pub const JOB_FAILED: &str = "Job failed";
    pub const JOB_SETUP_FAILED: &str = "Job script failed during setup, see the setup log for details";
    pub const JOB_EXCEEDED_TIMEOUT: &str = "Job exceeded its timeout";
    pub const JOB_KILLED_BY_USER: &str = "Job was killed by user request";
    pub const JOB_EXCEEDED_FILES_LIMIT: &str = "Job exceeded the limits on its directory contents";
    pub const JOB_KILLED_REMOTE_STATUS: &str = "Job was killed after its status changed on the server";
    pub const JOB_KILLED_INTERACTIVE_SIGNAL: &str = "Job was killed by the user with an interrupt signal";
    pub const JOB_KILLED_SYSTEM_SIGNAL: &str = "Job was killed by a system signal";
    pub const JOB_KILLED_BEFORE_START: &str = "Job was killed before it started";
    pub const RESOLUTION_FAILED: &str = "Failed to resolve job";
    pub const AGENT_SETUP_FAILED: &str = "Agent failed to set up job";
    pub const AGENT_LAUNCH_FAILED: &str = "Agent failed to launch job";
    pub const AGENT_FAILED: &str = "Agent failed before the job completed";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_statuses_are_not_active() {
        for status in [JobStatus::Succeeded, JobStatus::Failed, JobStatus::Killed] {
            assert!(status.is_finished());
            assert!(!status.is_active());
        }
        for status in [
            JobStatus::Reserved,
            JobStatus::Resolved,
            JobStatus::Claimed,
            JobStatus::Init,
            JobStatus::Running,
        ] {
            assert!(status.is_active());
        }
    }

    #[test]
    fn only_resolved_jobs_are_claimable() {
        assert!(JobStatus::Resolved.is_claimable());
        assert!(!JobStatus::Reserved.is_claimable());
        assert!(!JobStatus::Claimed.is_claimable());
    }

    #[test]
    fn system_signal_message_depends_on_interactivity() {
        assert_eq!(
            KillSource::SystemSignal.status_message(true),
            messages::JOB_KILLED_INTERACTIVE_SIGNAL
        );
        assert_eq!(
            KillSource::SystemSignal.status_message(false),
            messages::JOB_KILLED_SYSTEM_SIGNAL
        );
        assert_eq!(
            KillSource::Timeout.status_message(true),
            messages::JOB_EXCEEDED_TIMEOUT
        );
    }

    #[test]
    fn status_serializes_in_upper_case() {
        let json = serde_json::to_string(&JobStatus::Succeeded).unwrap();
        assert_eq!(json, "\"SUCCEEDED\"");
        let back: ArchiveStatus = serde_json::from_str("\"NO_FILES\"").unwrap();
        assert_eq!(back, ArchiveStatus::NoFiles);
    }
}
