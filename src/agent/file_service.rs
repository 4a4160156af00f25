use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::agent::heartbeat::Backoff;
use crate::agent::process::ProcessLifecycleManager;
use crate::error::ProtocolError;
use crate::model::manifest::normalize_relative_path;
use crate::model::{DirectoryManifest, KillSource, ManifestFilter};
use crate::rpc::{AgentRpcClient, ControlStream, FileRequest, ManifestUpdate};

const CHUNK_SIZE: usize = 64 * 1024;

/// Caps on what a job may leave in its directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilesLimits {
    pub max_file_count: usize,
    pub max_file_size: u64,
    pub max_total_size: u64,
}

impl FilesLimits {
    /// Describe the first limit the manifest breaks, if any.
    pub fn check(&self, manifest: &DirectoryManifest) -> Option<String> {
        let count = manifest.num_files();
        if count > self.max_file_count {
            return Some(format!("{} files exceeds limit of {}", count, self.max_file_count));
        }
        let largest = manifest.largest_file_size();
        if largest > self.max_file_size {
            return Some(format!(
                "file of {} bytes exceeds limit of {}",
                largest, self.max_file_size
            ));
        }
        let total = manifest.total_size();
        if total > self.max_total_size {
            return Some(format!(
                "{} bytes in total exceeds limit of {}",
                total, self.max_total_size
            ));
        }
        None
    }
}

/// Publishes the job directory manifest to the server and serves the byte
/// ranges it asks for. With a reconnect backoff set, a control stream the
/// server drops is reopened until the service is stopped.
pub struct AgentFileService {
    client: Arc<dyn AgentRpcClient>,
    process: Arc<ProcessLifecycleManager>,
    filter: Arc<dyn ManifestFilter>,
    limits: FilesLimits,
    refresh_interval: Duration,
    reconnect: Option<Backoff>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl AgentFileService {
    pub fn new(
        client: Arc<dyn AgentRpcClient>,
        process: Arc<ProcessLifecycleManager>,
        filter: Arc<dyn ManifestFilter>,
        limits: FilesLimits,
        refresh_interval_ms: u64,
    ) -> Self {
        Self {
            client,
            process,
            filter,
            limits,
            refresh_interval: Duration::from_millis(refresh_interval_ms),
            reconnect: None,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn with_reconnect_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.reconnect = Some(Backoff::new(initial_ms, max_ms));
        self
    }

    pub async fn start(&mut self, job_id: &str, job_directory: &Path) -> Result<(), ProtocolError> {
        if self.task.is_some() {
            return Ok(());
        }
        let control = self.client.open_control_stream(job_id).await?;
        tracing::info!(job_id, stream_id = %control.stream_id, "File service started");

        let worker = Worker {
            client: self.client.clone(),
            job_id: job_id.to_string(),
            root: job_directory.to_path_buf(),
            process: self.process.clone(),
            filter: self.filter.clone(),
            limits: self.limits,
            refresh_interval: self.refresh_interval,
            reconnect: self.reconnect,
            cancel: self.cancel.clone(),
        };
        self.task = Some(tokio::spawn(worker.run(control)));
        Ok(())
    }

    /// Publish one last manifest, then give in-flight transfers up to
    /// `drain` to finish.
    pub async fn stop(&mut self, drain: Duration) {
        self.cancel.cancel();
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(drain, &mut task).await {
                Ok(_) => tracing::debug!("File service stopped"),
                Err(_) => {
                    tracing::warn!("File service did not drain in time, aborting");
                    task.abort();
                }
            }
        }
    }
}

struct Worker {
    client: Arc<dyn AgentRpcClient>,
    job_id: String,
    root: PathBuf,
    process: Arc<ProcessLifecycleManager>,
    filter: Arc<dyn ManifestFilter>,
    limits: FilesLimits,
    refresh_interval: Duration,
    reconnect: Option<Backoff>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(mut self, mut control: ControlStream) {
        let mut ticker = tokio::time::interval(self.refresh_interval);
        let mut transfers = JoinSet::new();
        let mut limits_breached = false;

        loop {
            let lost = tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => !self.publish(&control, &mut limits_breached).await,
                request = control.file_requests.recv() => match request {
                    Some(request) => {
                        let root = self.root.clone();
                        let cancel = self.cancel.clone();
                        transfers.spawn(serve_request(root, request, cancel));
                        false
                    }
                    None => true,
                },
                Some(_) = transfers.join_next(), if !transfers.is_empty() => false,
            };
            if !lost {
                continue;
            }
            tracing::info!(job_id = %self.job_id, stream_id = %control.stream_id, "Control stream lost");
            match self.reconnect().await {
                Some(reopened) => {
                    control = reopened;
                    self.publish(&control, &mut limits_breached).await;
                }
                None => break,
            }
        }

        // Final snapshot so the server sees the finished directory.
        let _ = self.publish(&control, &mut limits_breached).await;
        control.file_requests.close();
        while transfers.join_next().await.is_some() {}
    }

    /// Reopen the control stream with backoff. None when reconnecting is
    /// off or the service was stopped first.
    async fn reconnect(&mut self) -> Option<ControlStream> {
        let backoff = self.reconnect.as_mut()?;
        loop {
            let delay = backoff.next_delay();
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.client.open_control_stream(&self.job_id).await {
                Ok(control) => {
                    tracing::info!(job_id = %self.job_id, stream_id = %control.stream_id, "Control stream reopened");
                    backoff.reset();
                    return Some(control);
                }
                Err(e) => {
                    tracing::warn!(job_id = %self.job_id, error = %e, "Control stream reconnect failed");
                }
            }
        }
    }

    /// Returns false once the server side of the stream is gone.
    async fn publish(&self, control: &ControlStream, limits_breached: &mut bool) -> bool {
        let root = self.root.clone();
        let filter = self.filter.clone();
        let scan =
            tokio::task::spawn_blocking(move || DirectoryManifest::scan(&root, filter.as_ref())).await;
        let manifest = match scan {
            Ok(Ok(manifest)) => manifest,
            Ok(Err(e)) => {
                tracing::warn!(job_id = %self.job_id, error = %e, "Failed to scan job directory");
                return true;
            }
            Err(e) => {
                tracing::error!(job_id = %self.job_id, error = %e, "Manifest scan panicked");
                return true;
            }
        };

        if !*limits_breached {
            if let Some(breach) = self.limits.check(&manifest) {
                *limits_breached = true;
                tracing::warn!(job_id = %self.job_id, breach = %breach, "Job directory over limits");
                let process = self.process.clone();
                tokio::spawn(async move { process.kill(KillSource::FilesLimit).await });
            }
        }

        let update = ManifestUpdate {
            job_id: self.job_id.clone(),
            manifest,
        };
        control.manifests.send(update).await.is_ok()
    }
}

async fn serve_request(root: PathBuf, request: FileRequest, cancel: CancellationToken) {
    let FileRequest {
        transfer_id,
        relative_path,
        start,
        end,
        chunks,
    } = request;
    let Some(relative) = normalize_relative_path(&relative_path) else {
        let _ = chunks
            .send(Err(format!("invalid path {}", relative_path)))
            .await;
        return;
    };
    let path = root.join(&relative);
    tracing::debug!(transfer_id = %transfer_id, path = %relative, start, end, "Serving file range");

    let result = async {
        let mut file = tokio::fs::File::open(&path).await?;
        file.seek(SeekFrom::Start(start)).await?;
        let mut remaining = end.saturating_sub(start);
        while remaining > 0 {
            if cancel.is_cancelled() && chunks.is_closed() {
                break;
            }
            let want = remaining.min(CHUNK_SIZE as u64) as usize;
            let mut buf = BytesMut::zeroed(want);
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            buf.truncate(read);
            remaining -= read as u64;
            let chunk: Bytes = buf.freeze();
            if chunks.send(Ok(chunk)).await.is_err() {
                tracing::debug!(transfer_id = %transfer_id, "Transfer abandoned by server");
                break;
            }
        }
        Ok::<(), std::io::Error>(())
    }
    .await;

    if let Err(e) = result {
        tracing::warn!(transfer_id = %transfer_id, error = %e, "File transfer failed");
        let _ = chunks.send(Err(e.to_string())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::manifest::AcceptAll;
    use tokio::sync::mpsc;

    #[test]
    fn test_files_limits() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("b"), vec![0u8; 20]).unwrap();
        let manifest = DirectoryManifest::scan(dir.path(), &AcceptAll).unwrap();

        let ok = FilesLimits {
            max_file_count: 2,
            max_file_size: 20,
            max_total_size: 30,
        };
        assert!(ok.check(&manifest).is_none());
        assert!(FilesLimits { max_file_count: 1, ..ok }.check(&manifest).is_some());
        assert!(FilesLimits { max_file_size: 19, ..ok }.check(&manifest).is_some());
        assert!(FilesLimits { max_total_size: 29, ..ok }.check(&manifest).is_some());
    }

    #[tokio::test]
    async fn test_serve_request_reads_range() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("out"), b"0123456789").unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let request = FileRequest {
            transfer_id: "t".into(),
            relative_path: "out".into(),
            start: 2,
            end: 6,
            chunks: tx,
        };
        serve_request(dir.path().to_path_buf(), request, CancellationToken::new()).await;

        let mut data = Vec::new();
        while let Some(chunk) = rx.recv().await {
            data.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(data, b"2345");
    }

    #[tokio::test]
    async fn test_serve_request_missing_file_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let request = FileRequest {
            transfer_id: "t".into(),
            relative_path: "missing".into(),
            start: 0,
            end: 4,
            chunks: tx,
        };
        serve_request(dir.path().to_path_buf(), request, CancellationToken::new()).await;
        assert!(rx.recv().await.unwrap().is_err());
    }
}
