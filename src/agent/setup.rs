use std::fmt::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::agent::download::DownloadService;
use crate::config::CleanupStrategy;
use crate::error::SetupError;
use crate::model::{ExecutionEnvironment, ExecutionResource, JobSpecification};

/// Directory inside the job directory holding everything the agent puts
/// there on its own behalf.
pub const INTERNAL_DIR: &str = "jobcoord";
pub const SCRIPT_FILE: &str = "run";
const SETUP_FILE: &str = "setup";
const SETUP_MARKER_FILE: &str = "setup-failed.txt";
const SETUP_LOG_FILE: &str = "setup.log";
const ENVIRONMENT_LOG_FILE: &str = "env.log";
const JOB_DIR_ENV_VAR: &str = "JOBCOORD_JOB_DIR";
const TRAPPED_SIGNALS: [&str; 3] = ["SIGTERM", "SIGINT", "SIGHUP"];

/// Where things live inside one job directory.
#[derive(Debug, Clone)]
pub struct JobDirectoryLayout {
    root: PathBuf,
}

impl JobDirectoryLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn internal_dir(&self) -> PathBuf {
        self.root.join(INTERNAL_DIR)
    }

    pub fn cluster_dir(&self, id: &str) -> PathBuf {
        self.internal_dir().join("cluster").join(id)
    }

    pub fn command_dir(&self, id: &str) -> PathBuf {
        self.internal_dir().join("command").join(id)
    }

    pub fn applications_dir(&self) -> PathBuf {
        self.internal_dir().join("applications")
    }

    pub fn application_dir(&self, id: &str) -> PathBuf {
        self.applications_dir().join(id)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.internal_dir().join("logs")
    }

    pub fn script(&self) -> PathBuf {
        self.root.join(SCRIPT_FILE)
    }

    /// Exists only while the job script is still setting up.
    pub fn setup_marker(&self) -> PathBuf {
        self.internal_dir().join(SETUP_MARKER_FILE)
    }

    pub fn setup_log(&self) -> PathBuf {
        self.logs_dir().join(SETUP_LOG_FILE)
    }

    pub fn environment_log(&self) -> PathBuf {
        self.logs_dir().join(ENVIRONMENT_LOG_FILE)
    }

    /// Relative prefixes of directories whose contents the manifest skips.
    pub fn unwalked_prefixes(&self, spec: &JobSpecification) -> Vec<String> {
        resource_dirs(self, spec)
            .into_iter()
            .filter_map(|(_, dir)| {
                dir.join("dependencies")
                    .strip_prefix(&self.root)
                    .ok()
                    .map(|p| p.to_string_lossy().into_owned())
            })
            .collect()
    }

    fn reference(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(relative) => format!("${{{}}}/{}", JOB_DIR_ENV_VAR, relative.display()),
            Err(_) => path.display().to_string(),
        }
    }
}

fn resource_dirs(layout: &JobDirectoryLayout, spec: &JobSpecification) -> Vec<(String, PathBuf)> {
    let mut dirs = vec![(
        format!("cluster {}", spec.cluster.id),
        layout.cluster_dir(&spec.cluster.id),
    )];
    for app in &spec.applications {
        dirs.push((format!("application {}", app.id), layout.application_dir(&app.id)));
    }
    dirs.push((
        format!("command {}", spec.command.id),
        layout.command_dir(&spec.command.id),
    ));
    dirs
}

/// Prepares the job directory: layout, downloads and the job script.
pub struct JobSetup {
    downloads: DownloadService,
}

impl Default for JobSetup {
    fn default() -> Self {
        Self::new(DownloadService::default())
    }
}

impl JobSetup {
    pub fn new(downloads: DownloadService) -> Self {
        Self { downloads }
    }

    /// Create the job directory and the per-resource directories inside it.
    /// The job directory itself must not exist yet.
    pub async fn create_job_directory(
        &self,
        spec: &JobSpecification,
        job_directory: &Path,
    ) -> Result<JobDirectoryLayout, SetupError> {
        if let Some(parent) = job_directory.parent() {
            create_dir_all(parent).await?;
        }
        match tokio::fs::create_dir(job_directory).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(SetupError::DirectoryExists(job_directory.to_path_buf()));
            }
            Err(source) => {
                return Err(SetupError::CreateDirectory {
                    path: job_directory.to_path_buf(),
                    source,
                })
            }
        }

        let layout = JobDirectoryLayout::new(job_directory);
        for (_, dir) in resource_dirs(&layout, spec) {
            create_dir_all(&dir.join("config")).await?;
            create_dir_all(&dir.join("dependencies")).await?;
        }
        create_dir_all(&layout.logs_dir()).await?;
        tracing::info!(job_id = spec.job_id(), dir = %job_directory.display(), "Job directory created");
        Ok(layout)
    }

    /// Fetch configs, dependencies and setup files for every resource.
    /// Returns the files written.
    pub async fn download_resources(
        &self,
        spec: &JobSpecification,
        layout: &JobDirectoryLayout,
    ) -> Result<Vec<PathBuf>, SetupError> {
        let mut written = Vec::new();
        let mut resources: Vec<(&ExecutionResource, PathBuf)> = spec
            .applications
            .iter()
            .map(|app| (app, layout.application_dir(&app.id)))
            .collect();
        resources.push((&spec.cluster, layout.cluster_dir(&spec.cluster.id)));
        resources.push((&spec.command, layout.command_dir(&spec.command.id)));

        for (resource, dir) in resources {
            let env = &resource.environment;
            if let Some(setup) = &env.setup_file {
                let target = dir.join(SETUP_FILE);
                self.downloads.download_to_file(setup, &target).await?;
                written.push(target);
            }
            for dep in &env.dependencies {
                written.push(
                    self.downloads
                        .download_to_directory(dep, &dir.join("dependencies"))
                        .await?,
                );
            }
            for config in &env.configs {
                written.push(
                    self.downloads
                        .download_to_directory(config, &dir.join("config"))
                        .await?,
                );
            }
        }

        // The job's own files land in the job directory root.
        let job_env = &spec.job.environment;
        if let Some(setup) = &job_env.setup_file {
            let target = layout.internal_dir().join(SETUP_FILE);
            self.downloads.download_to_file(setup, &target).await?;
            written.push(target);
        }
        for uri in job_env.dependencies.iter().chain(job_env.configs.iter()) {
            written.push(self.downloads.download_to_directory(uri, layout.root()).await?);
        }

        tracing::info!(job_id = spec.job_id(), files = written.len(), "Job resources downloaded");
        Ok(written)
    }

    /// Write the executable job script and return its path.
    pub async fn create_job_script(
        &self,
        spec: &JobSpecification,
        layout: &JobDirectoryLayout,
    ) -> Result<PathBuf, SetupError> {
        let path = layout.script();
        let content = compose_script(spec, layout);
        let script_error = |source| SetupError::Script {
            path: path.clone(),
            source,
        };

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true).mode(0o755);
        let mut file = options.open(&path).await.map_err(script_error)?;
        tokio::io::AsyncWriteExt::write_all(&mut file, content.as_bytes())
            .await
            .map_err(script_error)?;
        file.sync_all().await.map_err(script_error)?;
        drop(file);
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(script_error)?;

        tracing::info!(job_id = spec.job_id(), script = %path.display(), "Job script created");
        Ok(path)
    }

    /// Remove what the strategy says to remove.
    pub async fn cleanup(
        &self,
        layout: &JobDirectoryLayout,
        strategy: CleanupStrategy,
    ) -> Result<(), SetupError> {
        match strategy {
            CleanupStrategy::None => {
                tracing::info!(dir = %layout.root().display(), "Skipping job directory cleanup");
                Ok(())
            }
            CleanupStrategy::Full => {
                tracing::info!(dir = %layout.root().display(), "Removing job directory");
                remove_dir_all(layout.root()).await
            }
            CleanupStrategy::Dependencies => {
                let internal = layout.internal_dir();
                for kind in ["cluster", "command", "applications"] {
                    let parent = internal.join(kind);
                    let mut entries = match tokio::fs::read_dir(&parent).await {
                        Ok(entries) => entries,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                        Err(source) => return Err(SetupError::Cleanup { path: parent, source }),
                    };
                    while let Some(entry) = entries
                        .next_entry()
                        .await
                        .map_err(|source| SetupError::Cleanup {
                            path: parent.clone(),
                            source,
                        })?
                    {
                        let deps = entry.path().join("dependencies");
                        if tokio::fs::metadata(&deps).await.is_ok() {
                            tracing::debug!(dir = %deps.display(), "Removing dependencies");
                            remove_dir_all(&deps).await?;
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

async fn create_dir_all(path: &Path) -> Result<(), SetupError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| SetupError::CreateDirectory {
            path: path.to_path_buf(),
            source,
        })
}

async fn remove_dir_all(path: &Path) -> Result<(), SetupError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SetupError::Cleanup {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn setup_reference(
    layout: &JobDirectoryLayout,
    dir: &Path,
    env: &ExecutionEnvironment,
) -> Option<String> {
    env.setup_file
        .as_ref()
        .map(|_| layout.reference(&dir.join(SETUP_FILE)))
}

/// Build the bash script that sets up the environment and runs the job.
///
/// While setup runs its output goes to the setup log and the marker file
/// exists. The command runs in the background so the traps can forward
/// termination to it.
pub fn compose_script(spec: &JobSpecification, layout: &JobDirectoryLayout) -> String {
    let mut s = String::new();
    let root = layout.root().display().to_string();
    let marker = layout.reference(&layout.setup_marker());
    let setup_log = layout.reference(&layout.setup_log());
    let env_log = layout.reference(&layout.environment_log());

    let _ = writeln!(s, "#!/usr/bin/env bash");
    let _ = writeln!(s);
    let _ = writeln!(s, "# Job {}", spec.job_id());
    let _ = writeln!(s);
    let _ = writeln!(s, "set -o errexit");
    let _ = writeln!(s, "set -o pipefail");
    let _ = writeln!(s, "set -o nounset");
    let _ = writeln!(s, "exec 6>&1");
    let _ = writeln!(s, "exec 7>&2");
    let _ = writeln!(s);

    let _ = writeln!(s, "function handle_kill_request {{");
    let _ = writeln!(s, "    echo \"Handling $1 signal\" >&2");
    let _ = writeln!(s, "    trap wait {}", TRAPPED_SIGNALS.join(" "));
    let _ = writeln!(s, "    pkill -P $$ || true");
    let _ = writeln!(s, "    for ((iteration=1; iteration < 30; iteration++)); do");
    let _ = writeln!(s, "        if pkill -0 -P $$ &> /dev/null; then");
    let _ = writeln!(s, "            sleep 1");
    let _ = writeln!(s, "        else");
    let _ = writeln!(s, "            exit 1");
    let _ = writeln!(s, "        fi");
    let _ = writeln!(s, "    done");
    let _ = writeln!(s, "    pkill -9 -P $$ || true");
    let _ = writeln!(s, "    exit 1");
    let _ = writeln!(s, "}}");
    for signal in TRAPPED_SIGNALS {
        let _ = writeln!(s, "trap 'handle_kill_request {}' {}", signal, signal);
    }
    let _ = writeln!(s);

    let _ = writeln!(s, "export {}={}", JOB_DIR_ENV_VAR, quote(&root));
    let _ = writeln!(
        s,
        "export JOBCOORD_APPLICATION_DIR=\"{}\"",
        layout.reference(&layout.applications_dir())
    );
    let _ = writeln!(
        s,
        "export JOBCOORD_COMMAND_DIR=\"{}\"",
        layout.reference(&layout.command_dir(&spec.command.id))
    );
    let _ = writeln!(
        s,
        "export JOBCOORD_CLUSTER_DIR=\"{}\"",
        layout.reference(&layout.cluster_dir(&spec.cluster.id))
    );
    let _ = writeln!(s);

    let _ = writeln!(
        s,
        "echo \"The job script failed during setup, see {} for details\" > \"{}\"",
        setup_log, marker
    );
    let _ = writeln!(s, "exec > \"{}\"", setup_log);
    let _ = writeln!(s, "exec 2>&1");
    let _ = writeln!(s, "echo \"Setup start: $(date '+%Y-%m-%d %H:%M:%S')\"");
    let _ = writeln!(s);

    for (key, value) in &spec.environment_variables {
        let _ = writeln!(s, "export {}={}", key, quote(value));
    }
    let _ = writeln!(s);

    let mut setups: Vec<(String, Option<String>)> = resource_dirs(layout, spec)
        .into_iter()
        .zip(
            std::iter::once(&spec.cluster)
                .chain(spec.applications.iter())
                .chain(std::iter::once(&spec.command)),
        )
        .map(|((description, dir), resource)| {
            (description, setup_reference(layout, &dir, &resource.environment))
        })
        .collect();
    setups.push((
        format!("job {}", spec.job_id()),
        setup_reference(layout, &layout.internal_dir(), &spec.job.environment),
    ));
    for (description, reference) in setups {
        match reference {
            Some(reference) => {
                let _ = writeln!(s, "echo \"Sourcing setup script for {}\"", description);
                let _ = writeln!(s, "source \"{}\"", reference);
            }
            None => {
                let _ = writeln!(s, "echo \"No setup script for {}\"", description);
            }
        }
    }
    let _ = writeln!(s);

    let _ = writeln!(s, "echo \"Setup end: $(date '+%Y-%m-%d %H:%M:%S')\"");
    let _ = writeln!(s, "rm \"{}\"", marker);
    let _ = writeln!(s, "exec 1>&6 6>&-");
    let _ = writeln!(s, "exec 2>&7 7>&-");
    let _ = writeln!(s, "env > \"{}\"", env_log);
    let _ = writeln!(s);

    let command_line = spec
        .command_line()
        .iter()
        .map(|arg| quote(arg))
        .collect::<Vec<_>>()
        .join(" ");
    if spec.interactive {
        let _ = writeln!(s, "{}", command_line);
    } else {
        let _ = writeln!(s, "{} <&0 &", command_line);
        let _ = writeln!(s, "wait $!");
        let _ = writeln!(s, "exit $?");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec(location: &Path) -> JobSpecification {
        JobSpecification {
            job: ExecutionResource::new("job-1", ExecutionEnvironment::default()),
            cluster: ExecutionResource::new("c1", ExecutionEnvironment::default()),
            command: ExecutionResource::new("cmd1", ExecutionEnvironment::default()),
            applications: vec![ExecutionResource::new("app1", ExecutionEnvironment::default())],
            executable_args: vec!["echo".into()],
            job_args: vec!["it's".into(), "done".into()],
            environment_variables: BTreeMap::from([("JOB_ID".to_string(), "job-1".to_string())]),
            interactive: false,
            job_directory_location: location.display().to_string(),
            archive_location: None,
            timeout_secs: None,
            memory_mb: 1024,
        }
    }

    #[tokio::test]
    async fn test_create_job_directory_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = spec(tmp.path());
        let setup = JobSetup::default();
        let layout = setup
            .create_job_directory(&spec, &spec.job_directory())
            .await
            .unwrap();

        assert!(layout.cluster_dir("c1").join("dependencies").is_dir());
        assert!(layout.command_dir("cmd1").join("config").is_dir());
        assert!(layout.application_dir("app1").join("config").is_dir());
        assert!(layout.logs_dir().is_dir());

        let again = setup.create_job_directory(&spec, &spec.job_directory()).await;
        assert!(matches!(again, Err(SetupError::DirectoryExists(_))));
    }

    #[test]
    fn test_script_marks_setup_and_quotes_args() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = spec(tmp.path());
        let layout = JobDirectoryLayout::new(spec.job_directory());
        let script = compose_script(&spec, &layout);

        assert!(script.starts_with("#!/usr/bin/env bash"));
        assert!(script.contains("setup-failed.txt"));
        assert!(script.contains("export JOB_ID='job-1'"));
        assert!(script.contains(r"'echo' 'it'\''s' 'done' <&0 &"));
        assert!(script.contains("No setup script for cluster c1"));
        let marker_created = script.find("> \"${JOBCOORD_JOB_DIR}/jobcoord/setup-failed.txt\"").unwrap();
        let marker_removed = script.find("rm \"${JOBCOORD_JOB_DIR}/jobcoord/setup-failed.txt\"").unwrap();
        assert!(marker_created < marker_removed);
    }

    #[tokio::test]
    async fn test_cleanup_dependencies_keeps_configs() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = spec(tmp.path());
        let setup = JobSetup::default();
        let layout = setup
            .create_job_directory(&spec, &spec.job_directory())
            .await
            .unwrap();
        std::fs::write(layout.cluster_dir("c1").join("dependencies/lib.jar"), "x").unwrap();

        setup
            .cleanup(&layout, CleanupStrategy::Dependencies)
            .await
            .unwrap();
        assert!(!layout.cluster_dir("c1").join("dependencies").exists());
        assert!(layout.cluster_dir("c1").join("config").exists());

        setup.cleanup(&layout, CleanupStrategy::Full).await.unwrap();
        assert!(!layout.root().exists());
    }
}
