use std::path::{Path, PathBuf};

use async_trait::async_trait;
use walkdir::WalkDir;

use crate::error::ArchiveError;
use crate::model::ArchiveStatus;

/// Copies a finished job directory somewhere durable.
#[async_trait]
pub trait JobArchiver: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, location: &str) -> bool;

    /// Copy `job_directory` to `location`. Returns the number of files
    /// copied.
    async fn archive(&self, job_directory: &Path, location: &str) -> Result<usize, ArchiveError>;
}

/// Archives to a local directory named by a `file://` URI.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSystemArchiver;

#[async_trait]
impl JobArchiver for FileSystemArchiver {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn supports(&self, location: &str) -> bool {
        location.starts_with("file://")
    }

    async fn archive(&self, job_directory: &Path, location: &str) -> Result<usize, ArchiveError> {
        let target = location
            .strip_prefix("file://")
            .map(PathBuf::from)
            .filter(|p| p.is_absolute())
            .ok_or_else(|| ArchiveError::InvalidLocation(location.to_string()))?;
        let source = job_directory.to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree(&source, &target))
            .await
            .map_err(|e| ArchiveError::Io {
                path: job_directory.to_path_buf(),
                source: std::io::Error::other(e),
            })?
    }
}

/// Accepts every location and does nothing. Always last in the chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpArchiver;

#[async_trait]
impl JobArchiver for NoOpArchiver {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn supports(&self, _location: &str) -> bool {
        true
    }

    async fn archive(&self, _job_directory: &Path, location: &str) -> Result<usize, ArchiveError> {
        tracing::warn!(location, "No archiver for location, output not archived");
        Ok(0)
    }
}

/// Ordered archivers with the no-op fallback appended.
pub struct ArchiveService {
    archivers: Vec<Box<dyn JobArchiver>>,
}

impl Default for ArchiveService {
    fn default() -> Self {
        Self::new(vec![Box::new(FileSystemArchiver)])
    }
}

impl ArchiveService {
    pub fn new(mut archivers: Vec<Box<dyn JobArchiver>>) -> Self {
        archivers.push(Box::new(NoOpArchiver));
        Self { archivers }
    }

    /// Archive the job directory and report the outcome. Failures are
    /// recorded, never raised.
    pub async fn archive(&self, job_directory: &Path, location: Option<&str>) -> ArchiveStatus {
        let Some(location) = location else {
            return ArchiveStatus::Disabled;
        };
        if !job_directory.is_dir() {
            return ArchiveStatus::NoFiles;
        }
        let Some(archiver) = self.archivers.iter().find(|a| a.supports(location)) else {
            return ArchiveStatus::Failed;
        };
        match archiver.archive(job_directory, location).await {
            Ok(0) if archiver.name() == "noop" => ArchiveStatus::Unknown,
            Ok(0) => ArchiveStatus::NoFiles,
            Ok(files) => {
                tracing::info!(location, archiver = archiver.name(), files, "Job output archived");
                ArchiveStatus::Archived
            }
            Err(e) => {
                tracing::error!(location, archiver = archiver.name(), error = %e, "Failed to archive job output");
                ArchiveStatus::Failed
            }
        }
    }
}

/// Mirror the directories and regular files under `source` into `target`.
/// Symlinks are not followed.
fn copy_tree(source: &Path, target: &Path) -> Result<usize, ArchiveError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| ArchiveError::Io { path, source }
    };
    let mut copied = 0;
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| ArchiveError::Io {
            path: e.path().unwrap_or(source).to_path_buf(),
            source: e.into(),
        })?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| io_err(entry.path())(std::io::Error::other(e)))?;
        let to = target.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&to).map_err(io_err(&to))?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &to).map_err(io_err(entry.path()))?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_filesystem_archive() {
        let job = tempfile::tempdir().unwrap();
        let archive = tempfile::tempdir().unwrap();
        std::fs::create_dir(job.path().join("sub")).unwrap();
        std::fs::write(job.path().join("stdout"), "out").unwrap();
        std::fs::write(job.path().join("sub/file"), "x").unwrap();

        let target = archive.path().join("job-1");
        let location = format!("file://{}", target.display());
        let status = ArchiveService::default()
            .archive(job.path(), Some(&location))
            .await;

        assert_eq!(status, ArchiveStatus::Archived);
        assert_eq!(std::fs::read_to_string(target.join("sub/file")).unwrap(), "x");
    }

    #[test]
    fn test_copy_tree_skips_symlinks() {
        let job = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), "s").unwrap();
        std::fs::create_dir_all(job.path().join("a/b")).unwrap();
        std::fs::write(job.path().join("a/b/c.txt"), "c").unwrap();
        std::os::unix::fs::symlink(outside.path(), job.path().join("link")).unwrap();

        let target = tempfile::tempdir().unwrap();
        let copied = copy_tree(job.path(), &target.path().join("out")).unwrap();
        assert_eq!(copied, 1);
        assert!(target.path().join("out/a/b/c.txt").is_file());
        assert!(!target.path().join("out/link").exists());
    }

    #[tokio::test]
    async fn test_archive_outcomes() {
        let job = tempfile::tempdir().unwrap();
        let service = ArchiveService::default();

        assert_eq!(service.archive(job.path(), None).await, ArchiveStatus::Disabled);
        assert_eq!(
            service.archive(&job.path().join("gone"), Some("file:///tmp/x")).await,
            ArchiveStatus::NoFiles
        );
        assert_eq!(
            service.archive(job.path(), Some("s3://bucket/prefix")).await,
            ArchiveStatus::Unknown
        );
        assert_eq!(
            service.archive(job.path(), Some("file://relative")).await,
            ArchiveStatus::Failed
        );
    }
}
