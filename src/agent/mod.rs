//! The agent: runs one job on the node it lives on and reports back to the
//! server.

pub mod archive;
pub mod context;
pub mod download;
pub mod execution;
pub mod file_service;
pub mod heartbeat;
pub mod kill;
pub mod process;
pub mod setup;
pub mod stage;

pub use archive::{ArchiveService, FileSystemArchiver, JobArchiver, NoOpArchiver};
pub use context::{ExecutionContext, StageError};
pub use download::{DownloadService, Downloader, LocalDownloader};
pub use execution::{ExecutionOutcome, JobExecution};
pub use file_service::{AgentFileService, FilesLimits};
pub use heartbeat::{Backoff, HeartbeatSender};
pub use kill::{KillService, RemoteStatusMonitor};
pub use process::{KillWindows, LaunchOptions, ProcessLifecycleManager};
pub use setup::{JobDirectoryLayout, JobSetup};
pub use stage::{transition, Stage, StageOutcome};
