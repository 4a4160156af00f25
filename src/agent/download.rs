use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::SetupError;

/// Fetches a resource URI into a local file.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Whether this downloader understands the URI's scheme.
    fn supports(&self, uri: &str) -> bool;

    async fn download(&self, uri: &str, target: &Path) -> Result<(), SetupError>;
}

/// Copies `file://` URIs and plain local paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalDownloader;

impl LocalDownloader {
    fn local_path(uri: &str) -> Option<PathBuf> {
        if let Some(path) = uri.strip_prefix("file://") {
            return Some(PathBuf::from(path));
        }
        if uri.contains("://") {
            return None;
        }
        Some(PathBuf::from(uri))
    }
}

#[async_trait]
impl Downloader for LocalDownloader {
    fn supports(&self, uri: &str) -> bool {
        Self::local_path(uri).is_some()
    }

    async fn download(&self, uri: &str, target: &Path) -> Result<(), SetupError> {
        let source =
            Self::local_path(uri).ok_or_else(|| SetupError::UnsupportedScheme(uri.to_string()))?;
        tokio::fs::copy(&source, target)
            .await
            .map_err(|source| SetupError::Download {
                uri: uri.to_string(),
                source,
            })?;
        tracing::debug!(uri, target = %target.display(), "Downloaded");
        Ok(())
    }
}

/// Tries each downloader in order; the first one that supports a URI wins.
pub struct DownloadService {
    downloaders: Vec<Box<dyn Downloader>>,
}

impl Default for DownloadService {
    fn default() -> Self {
        Self::new(vec![Box::new(LocalDownloader)])
    }
}

impl DownloadService {
    pub fn new(downloaders: Vec<Box<dyn Downloader>>) -> Self {
        Self { downloaders }
    }

    /// Download into an explicit target file.
    pub async fn download_to_file(&self, uri: &str, target: &Path) -> Result<(), SetupError> {
        let downloader = self
            .downloaders
            .iter()
            .find(|d| d.supports(uri))
            .ok_or_else(|| SetupError::UnsupportedScheme(uri.to_string()))?;
        downloader.download(uri, target).await
    }

    /// Download into `directory`, keeping the URI's file name.
    pub async fn download_to_directory(
        &self,
        uri: &str,
        directory: &Path,
    ) -> Result<PathBuf, SetupError> {
        let name = file_name(uri).ok_or_else(|| SetupError::Download {
            uri: uri.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "URI has no file name"),
        })?;
        let target = directory.join(name);
        self.download_to_file(uri, &target).await?;
        Ok(target)
    }
}

fn file_name(uri: &str) -> Option<&str> {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    path.rsplit('/').next().filter(|n| !n.is_empty() && *n != "." && *n != "..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("file:///tmp/a/setup.sh"), Some("setup.sh"));
        assert_eq!(file_name("s3://bucket/key.jar?version=2"), Some("key.jar"));
        assert_eq!(file_name("file:///tmp/dir/"), None);
    }

    #[tokio::test]
    async fn test_local_download() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let file = src.path().join("dep.txt");
        std::fs::write(&file, "dep").unwrap();

        let service = DownloadService::default();
        let uri = format!("file://{}", file.display());
        let target = service.download_to_directory(&uri, dst.path()).await.unwrap();
        assert_eq!(std::fs::read_to_string(target).unwrap(), "dep");

        let plain = service
            .download_to_directory(&file.display().to_string(), dst.path())
            .await;
        assert!(plain.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_scheme_rejected() {
        let dst = tempfile::tempdir().unwrap();
        let err = DownloadService::default()
            .download_to_directory("s3://bucket/key", dst.path())
            .await
            .unwrap_err();
        assert!(matches!(err, SetupError::UnsupportedScheme(_)));
    }
}
