use std::fmt;

use crate::model::messages;

/// Every step of a job execution, in order.
///
/// Stages up to and including `WaitJobCompletion` are forward stages: a
/// failure or a kill skips the rest of them. The remaining stages form the
/// cleanup tail, which always runs to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    InitializeAgent,
    ConfigureAgent,
    ReserveJobId,
    ObtainJobSpecification,
    CreateJobDirectory,
    DownloadDependencies,
    CreateJobScript,
    StartKillService,
    StartFileService,
    StartHeartbeatService,
    ClaimJob,
    SetJobStatusRunning,
    LaunchJob,
    WaitJobCompletion,
    DetermineFinalStatus,
    ArchiveJobOutputs,
    SetJobStatusFinal,
    StopServices,
    CleanupJobDirectory,
    Shutdown,
}

impl Stage {
    pub const ALL: [Stage; 20] = [
        Stage::InitializeAgent,
        Stage::ConfigureAgent,
        Stage::ReserveJobId,
        Stage::ObtainJobSpecification,
        Stage::CreateJobDirectory,
        Stage::DownloadDependencies,
        Stage::CreateJobScript,
        Stage::StartKillService,
        Stage::StartFileService,
        Stage::StartHeartbeatService,
        Stage::ClaimJob,
        Stage::SetJobStatusRunning,
        Stage::LaunchJob,
        Stage::WaitJobCompletion,
        Stage::DetermineFinalStatus,
        Stage::ArchiveJobOutputs,
        Stage::SetJobStatusFinal,
        Stage::StopServices,
        Stage::CleanupJobDirectory,
        Stage::Shutdown,
    ];

    pub const FIRST: Stage = Stage::InitializeAgent;

    /// First stage of the cleanup tail.
    pub const CLEANUP: Stage = Stage::DetermineFinalStatus;

    pub fn is_cleanup(&self) -> bool {
        *self >= Stage::CLEANUP
    }

    /// The stage that follows in the fixed order.
    pub fn following(&self) -> Option<Stage> {
        let index = Stage::ALL.iter().position(|s| s == self)?;
        Stage::ALL.get(index + 1).copied()
    }

    /// Final status message for a job whose execution failed at this stage.
    pub fn failure_message(&self) -> &'static str {
        match self {
            Stage::ReserveJobId | Stage::ObtainJobSpecification => messages::RESOLUTION_FAILED,
            Stage::CreateJobDirectory | Stage::DownloadDependencies | Stage::CreateJobScript => {
                messages::AGENT_SETUP_FAILED
            }
            Stage::LaunchJob => messages::AGENT_LAUNCH_FAILED,
            _ => messages::AGENT_FAILED,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a stage asks the driver to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Proceed,
    /// Jump forward. Jumping backwards is treated as proceeding.
    SkipTo(Stage),
    Fail(String),
}

/// Pick the stage to run after `stage` finished with `outcome`. `killed`
/// is the job's kill flag as observed at this boundary. `None` ends the run.
pub fn transition(stage: Stage, outcome: &StageOutcome, killed: bool) -> Option<Stage> {
    if stage.is_cleanup() {
        return stage.following();
    }
    let next = match outcome {
        StageOutcome::Fail(_) => return Some(Stage::CLEANUP),
        StageOutcome::SkipTo(target) if *target > stage => Some(*target),
        _ => stage.following(),
    };
    match next {
        // A launched process is always waited for, so its exit code decides.
        Some(Stage::WaitJobCompletion) => Some(Stage::WaitJobCompletion),
        Some(next) if killed && !next.is_cleanup() => Some(Stage::CLEANUP),
        other => other,
    }
}
