use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{access, AccessFlags, Pid};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::AgentConfig;
use crate::error::LaunchError;
use crate::model::{messages, JobResult, JobStatus, KillSource};

pub const STDOUT_FILE: &str = "stdout";
pub const STDERR_FILE: &str = "stderr";

/// How to launch a job process.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub working_dir: PathBuf,
    pub script: PathBuf,
    pub interactive: bool,
    pub timeout_secs: Option<u64>,
    pub launch_in_working_dir: bool,
    /// Present while the job script is still in its setup phase.
    pub setup_marker: Option<PathBuf>,
}

impl LaunchOptions {
    pub fn new(working_dir: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            script: script.into(),
            interactive: false,
            timeout_secs: None,
            launch_in_working_dir: true,
            setup_marker: None,
        }
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    pub fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn with_setup_marker(mut self, marker: impl Into<PathBuf>) -> Self {
        self.setup_marker = Some(marker.into());
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KillWindows {
    pub graceful: Duration,
    pub forceful: Duration,
    pub exit_race_delay: Duration,
}

impl From<&AgentConfig> for KillWindows {
    fn from(config: &AgentConfig) -> Self {
        Self {
            graceful: Duration::from_millis(config.kill_graceful_window_ms),
            forceful: Duration::from_millis(config.kill_forceful_window_ms),
            exit_race_delay: Duration::from_millis(config.exit_race_delay_ms),
        }
    }
}

#[derive(Debug, Clone)]
struct Running {
    pid: i32,
    /// The process leads its own group; signals go to the whole group.
    group: bool,
    exit: watch::Receiver<Option<i32>>,
}

/// Launches, watches and terminates the job process.
///
/// Launch happens once. Kill can come from any task at any time; only the
/// first source is recorded and the SIGTERM/SIGKILL escalation runs at most
/// once.
#[derive(Debug)]
pub struct ProcessLifecycleManager {
    windows: RwLock<KillWindows>,
    launched: AtomicBool,
    killed: AtomicBool,
    terminating: AtomicBool,
    kill_source: OnceLock<KillSource>,
    interactive: AtomicBool,
    setup_marker: OnceLock<PathBuf>,
    running: Mutex<Option<Running>>,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessLifecycleManager {
    pub fn new(windows: KillWindows) -> Arc<Self> {
        Arc::new(Self {
            windows: RwLock::new(windows),
            launched: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            terminating: AtomicBool::new(false),
            kill_source: OnceLock::new(),
            interactive: AtomicBool::new(false),
            setup_marker: OnceLock::new(),
            running: Mutex::new(None),
            timeout_task: Mutex::new(None),
        })
    }

    /// Replace the kill windows, e.g. after server-side overrides arrive.
    pub fn set_kill_windows(&self, windows: KillWindows) {
        match self.windows.write() {
            Ok(mut current) => *current = windows,
            Err(poisoned) => *poisoned.into_inner() = windows,
        }
    }

    fn windows(&self) -> KillWindows {
        match self.windows.read() {
            Ok(windows) => *windows,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn is_launched(&self) -> bool {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn kill_source(&self) -> Option<KillSource> {
        self.kill_source.get().copied()
    }

    pub fn pid(&self) -> Option<u32> {
        self.running
            .lock()
            .ok()
            .and_then(|r| r.as_ref().map(|r| r.pid as u32))
    }

    pub fn has_exited(&self) -> bool {
        self.running
            .lock()
            .ok()
            .and_then(|r| r.as_ref().map(|r| r.exit.borrow().is_some()))
            .unwrap_or(false)
    }

    pub fn launch(self: &Arc<Self>, options: LaunchOptions) -> Result<(), LaunchError> {
        if self.launched.swap(true, Ordering::SeqCst) {
            return Err(LaunchError::AlreadyLaunched);
        }
        if self.is_killed() {
            return Err(LaunchError::KilledBeforeLaunch);
        }
        validate(&options)?;

        self.interactive.store(options.interactive, Ordering::SeqCst);
        if let Some(marker) = &options.setup_marker {
            let _ = self.setup_marker.set(marker.clone());
        }

        let mut command = Command::new(&options.script);
        command.kill_on_drop(true);
        if options.launch_in_working_dir {
            command.current_dir(&options.working_dir);
        }
        if options.interactive {
            command
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            let stdout = std::fs::File::create(options.working_dir.join(STDOUT_FILE))
                .map_err(LaunchError::OutputRedirect)?;
            let stderr = std::fs::File::create(options.working_dir.join(STDERR_FILE))
                .map_err(LaunchError::OutputRedirect)?;
            command
                .stdin(Stdio::null())
                .stdout(stdout)
                .stderr(stderr)
                .process_group(0);
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let killed_during_launch = {
            let mut running = self
                .running
                .lock()
                .map_err(|_| LaunchError::Spawn(std::io::Error::other("process state poisoned")))?;
            let mut child = command.spawn().map_err(LaunchError::Spawn)?;
            let pid = child
                .id()
                .ok_or_else(|| LaunchError::Spawn(std::io::Error::other("process has no pid")))?
                as i32;
            tracing::info!(pid, script = %options.script.display(), interactive = options.interactive, "Job process launched");

            tokio::spawn(async move {
                let code = match child.wait().await {
                    Ok(status) => status
                        .code()
                        .or_else(|| status.signal().map(|s| 128 + s))
                        .unwrap_or(-1),
                    Err(e) => {
                        tracing::error!(pid, error = %e, "Failed to wait for job process");
                        -1
                    }
                };
                tracing::info!(pid, exit_code = code, "Job process exited");
                let _ = exit_tx.send(Some(code));
            });

            *running = Some(Running {
                pid,
                group: !options.interactive,
                exit: exit_rx,
            });
            self.is_killed()
        };

        if killed_during_launch {
            let me = self.clone();
            tokio::spawn(async move { me.terminate().await });
        }

        if let Some(secs) = options.timeout_secs {
            let me = Arc::downgrade(self);
            let handle = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                if let Some(manager) = me.upgrade() {
                    if manager.has_exited() {
                        return;
                    }
                    tracing::info!(timeout_secs = secs, "Job exceeded its timeout");
                    manager.kill(KillSource::Timeout).await;
                }
            });
            if let Ok(mut task) = self.timeout_task.lock() {
                *task = Some(handle);
            }
        }
        Ok(())
    }

    /// Ask the job to stop. Returns once the process is gone or both
    /// escalation windows have passed.
    pub async fn kill(&self, source: KillSource) {
        if self.kill_source.set(source).is_err() {
            tracing::debug!(source = %source, first = ?self.kill_source(), "Kill already requested");
            return;
        }
        self.killed.store(true, Ordering::SeqCst);
        tracing::info!(source = %source, "Killing job process");
        self.terminate().await;
    }

    async fn terminate(&self) {
        let Some(Running { pid, group, mut exit }) =
            self.running.lock().ok().and_then(|r| r.clone())
        else {
            tracing::debug!("Kill requested before launch");
            return;
        };
        if self.terminating.swap(true, Ordering::SeqCst) {
            return;
        }
        if exit.borrow().is_some() {
            tracing::debug!(pid, "Job process already exited");
            return;
        }

        let windows = self.windows();
        send_signal(pid, group, Signal::SIGTERM);
        if wait_exit(&mut exit, windows.graceful).await {
            return;
        }
        tracing::warn!(pid, "Job process still alive after SIGTERM, sending SIGKILL");
        send_signal(pid, group, Signal::SIGKILL);
        if wait_exit(&mut exit, windows.forceful).await {
            return;
        }
        tracing::warn!(pid, "Failed to kill job process");
    }

    /// Wait for the process to exit and decide its final status.
    pub async fn wait_for(&self) -> Result<JobResult, LaunchError> {
        let mut exit = self
            .running
            .lock()
            .ok()
            .and_then(|r| r.as_ref().map(|r| r.exit.clone()))
            .ok_or(LaunchError::NotLaunched)?;

        let code = match exit.wait_for(|code| code.is_some()).await {
            Ok(code) => (*code).unwrap_or(-1),
            Err(_) => -1,
        };

        if let Some(task) = self.timeout_task.lock().ok().and_then(|mut t| t.take()) {
            task.abort();
        }
        // Let a kill racing the exit land before reading the flag.
        tokio::time::sleep(self.windows().exit_race_delay).await;

        let interactive = self.interactive.load(Ordering::SeqCst);
        let result = if code == 0 {
            JobResult::new(JobStatus::Succeeded, messages::JOB_FINISHED_SUCCESSFULLY, Some(code))
        } else if self.is_killed() {
            let source = self.kill_source().unwrap_or(KillSource::SystemSignal);
            JobResult::new(JobStatus::Killed, source.status_message(interactive), Some(code))
        } else if self.setup_marker.get().is_some_and(|m| m.exists()) {
            JobResult::new(JobStatus::Failed, messages::JOB_SETUP_FAILED, Some(code))
        } else {
            JobResult::new(JobStatus::Failed, messages::JOB_FAILED, Some(code))
        };
        tracing::info!(status = %result.status, exit_code = code, "Job process finished");
        Ok(result)
    }
}

fn validate(options: &LaunchOptions) -> Result<(), LaunchError> {
    let dir = &options.working_dir;
    let meta = std::fs::metadata(dir).map_err(|_| LaunchError::DirectoryNotFound(dir.clone()))?;
    if !meta.is_dir() {
        return Err(LaunchError::NotADirectory(dir.clone()));
    }
    if !is_accessible(dir, AccessFlags::W_OK) {
        return Err(LaunchError::DirectoryNotWritable(dir.clone()));
    }

    let script = &options.script;
    let meta =
        std::fs::metadata(script).map_err(|_| LaunchError::ScriptNotFound(script.clone()))?;
    if !meta.is_file() {
        return Err(LaunchError::ScriptNotAFile(script.clone()));
    }
    if !is_accessible(script, AccessFlags::X_OK) {
        return Err(LaunchError::ScriptNotExecutable(script.clone()));
    }
    Ok(())
}

fn is_accessible(path: &Path, mode: AccessFlags) -> bool {
    access(path, mode).is_ok()
}

fn send_signal(pid: i32, group: bool, signal: Signal) {
    let target = Pid::from_raw(pid);
    let result = if group {
        killpg(target, signal)
    } else {
        kill(target, signal)
    };
    match result {
        Ok(()) => tracing::debug!(pid, signal = %signal, "Signal sent"),
        Err(e) => tracing::debug!(pid, signal = %signal, error = %e, "Signal not delivered"),
    }
}

async fn wait_exit(exit: &mut watch::Receiver<Option<i32>>, window: Duration) -> bool {
    matches!(
        tokio::time::timeout(window, exit.wait_for(|code| code.is_some())).await,
        Ok(Ok(_))
    )
}
