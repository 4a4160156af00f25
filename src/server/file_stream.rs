use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::ResourceError;
use crate::model::{DirectoryManifest, ManifestEntry};
use crate::rpc::{ControlStream, FileRequest, ManifestUpdate};
use crate::server::resource::ByteRange;

const MANIFEST_BUFFER: usize = 4;
const REQUEST_BUFFER: usize = 16;
const CHUNK_BUFFER: usize = 4;

/// Bytes of a job file as they arrive from the agent.
pub type ChunkStream = BoxStream<'static, Result<Bytes, ResourceError>>;

/// A readable file living on an agent.
pub struct AgentFile {
    pub entry: ManifestEntry,
    /// Offsets actually served, `[start, end)`.
    pub start: u64,
    pub end: u64,
    /// Whether the caller asked for a range.
    pub partial: bool,
    pub content: ChunkStream,
}

impl std::fmt::Debug for AgentFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentFile")
            .field("path", &self.entry.path)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("partial", &self.partial)
            .finish()
    }
}

/// Result of looking up a job path. Absence is an answer, not an error.
#[derive(Debug)]
pub enum AgentFileResource {
    /// No agent connected, no manifest yet, or path not in the manifest.
    Absent,
    Directory(ManifestEntry),
    File(AgentFile),
}

impl AgentFileResource {
    pub fn exists(&self) -> bool {
        !matches!(self, AgentFileResource::Absent)
    }
}

#[derive(Debug, Clone)]
pub struct FileStreamConfig {
    pub max_concurrent_transfers: usize,
    pub stalled_transfer_timeout_ms: u64,
}

#[derive(Debug)]
struct ControlHandle {
    stream_id: u64,
    requests: mpsc::Sender<FileRequest>,
}

/// Serves byte ranges of files that still live on an agent's disk.
///
/// Each job has at most one control stream; a new stream from the same job
/// replaces the old one. The manifest cache holds the latest snapshot only.
#[derive(Debug)]
pub struct FileStreamingService {
    config: FileStreamConfig,
    control_streams: Arc<DashMap<String, ControlHandle>>,
    manifests: Arc<DashMap<String, Arc<DirectoryManifest>>>,
    transfers: Arc<Semaphore>,
    next_stream_id: AtomicU64,
    next_transfer_id: AtomicU64,
    cancel: CancellationToken,
}

impl FileStreamingService {
    pub fn new(config: FileStreamConfig, cancel: CancellationToken) -> Self {
        Self {
            transfers: Arc::new(Semaphore::new(config.max_concurrent_transfers)),
            config,
            control_streams: Arc::new(DashMap::new()),
            manifests: Arc::new(DashMap::new()),
            next_stream_id: AtomicU64::new(1),
            next_transfer_id: AtomicU64::new(1),
            cancel,
        }
    }

    /// Register an agent's control stream for `job_id`.
    pub fn open_control_stream(&self, job_id: &str) -> ControlStream {
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (manifest_tx, manifest_rx) = mpsc::channel(MANIFEST_BUFFER);
        let (request_tx, request_rx) = mpsc::channel(REQUEST_BUFFER);

        let replaced = self.control_streams.insert(
            job_id.to_string(),
            ControlHandle {
                stream_id,
                requests: request_tx,
            },
        );
        if let Some(old) = replaced {
            tracing::info!(
                job_id,
                old_stream = old.stream_id,
                new_stream = stream_id,
                "Replacing control stream"
            );
        } else {
            tracing::info!(job_id, stream_id, "Control stream opened");
        }

        let control_streams = self.control_streams.clone();
        let manifests = self.manifests.clone();
        let cancel = self.cancel.clone();
        let job = job_id.to_string();
        tokio::spawn(async move {
            Self::receive_manifests(job, stream_id, manifest_rx, control_streams, manifests, cancel)
                .await;
        });

        ControlStream {
            stream_id: stream_id.to_string(),
            manifests: manifest_tx,
            file_requests: request_rx,
        }
    }

    async fn receive_manifests(
        job_id: String,
        stream_id: u64,
        mut rx: mpsc::Receiver<ManifestUpdate>,
        control_streams: Arc<DashMap<String, ControlHandle>>,
        manifests: Arc<DashMap<String, Arc<DirectoryManifest>>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                update = rx.recv() => match update {
                    Some(_) if !Self::is_current(&control_streams, &job_id, stream_id) => {
                        tracing::debug!(job_id = %job_id, stream_id, "Dropping superseded control stream");
                        break;
                    }
                    Some(update) if update.job_id == job_id => {
                        tracing::trace!(job_id = %job_id, files = update.manifest.num_files(), "Manifest received");
                        manifests.insert(job_id.clone(), Arc::new(update.manifest));
                    }
                    Some(update) => {
                        tracing::warn!(job_id = %job_id, other = %update.job_id, "Ignoring manifest for another job");
                    }
                    None => break,
                }
            }
        }

        // Only forget state that still belongs to this stream.
        if control_streams
            .remove_if(&job_id, |_, handle| handle.stream_id == stream_id)
            .is_some()
        {
            manifests.remove(&job_id);
            tracing::info!(job_id = %job_id, stream_id, "Control stream closed");
        }
    }

    fn is_current(
        control_streams: &DashMap<String, ControlHandle>,
        job_id: &str,
        stream_id: u64,
    ) -> bool {
        control_streams
            .get(job_id)
            .is_some_and(|handle| handle.stream_id == stream_id)
    }

    /// Hang up on the agent's control stream for `job_id`. The agent sees its
    /// request channel end and the cached manifest is forgotten.
    pub fn close_control_stream(&self, job_id: &str) -> bool {
        let closed = self.control_streams.remove(job_id).is_some();
        if closed {
            self.manifests.remove(job_id);
            tracing::info!(job_id, "Control stream closed by server");
        }
        closed
    }

    pub fn has_control_stream(&self, job_id: &str) -> bool {
        self.control_streams.contains_key(job_id)
    }

    pub fn manifest(&self, job_id: &str) -> Option<Arc<DirectoryManifest>> {
        self.manifests.get(job_id).map(|m| m.clone())
    }

    pub fn active_transfers(&self) -> usize {
        self.config.max_concurrent_transfers - self.transfers.available_permits()
    }

    /// Look up a path on this node's agent stream for `job_id`.
    pub async fn fetch(
        &self,
        job_id: &str,
        relative_path: &str,
        range: Option<ByteRange>,
    ) -> Result<AgentFileResource, ResourceError> {
        let requests = match self.control_streams.get(job_id) {
            Some(handle) => handle.requests.clone(),
            None => return Ok(AgentFileResource::Absent),
        };
        let Some(manifest) = self.manifest(job_id) else {
            return Ok(AgentFileResource::Absent);
        };
        let Some(entry) = manifest.entry(relative_path).cloned() else {
            return Ok(AgentFileResource::Absent);
        };
        if entry.is_directory {
            return Ok(AgentFileResource::Directory(entry));
        }

        let (start, end) = match range {
            Some(range) => range.to_offsets(entry.size)?,
            None => (0, entry.size),
        };
        let partial = range.is_some();

        if start == end {
            return Ok(AgentFileResource::File(AgentFile {
                entry,
                start,
                end,
                partial,
                content: futures::stream::empty().boxed(),
            }));
        }

        let permit = self
            .transfers
            .clone()
            .try_acquire_owned()
            .map_err(|_| ResourceError::TooManyTransfers)?;

        let transfer_id = format!(
            "{}-{}",
            job_id,
            self.next_transfer_id.fetch_add(1, Ordering::Relaxed)
        );
        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_BUFFER);
        let request = FileRequest {
            transfer_id: transfer_id.clone(),
            relative_path: entry.path.clone(),
            start,
            end,
            chunks: chunk_tx,
        };
        let stall_timeout = Duration::from_millis(self.config.stalled_transfer_timeout_ms);
        match requests.send_timeout(request, stall_timeout).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                tracing::warn!(job_id, transfer_id = %transfer_id, "Agent not accepting file requests");
                return Err(ResourceError::Transfer(
                    "agent did not accept the file request in time".to_string(),
                ));
            }
            Err(SendTimeoutError::Closed(_)) => {
                tracing::debug!(job_id, "Control stream closed before transfer started");
                return Ok(AgentFileResource::Absent);
            }
        }
        tracing::debug!(job_id, transfer_id = %transfer_id, path = %entry.path, start, end, "Transfer started");

        let content = transfer_stream(
            transfer_id,
            chunk_rx,
            permit,
            end - start,
            stall_timeout,
        );
        Ok(AgentFileResource::File(AgentFile {
            entry,
            start,
            end,
            partial,
            content,
        }))
    }
}

struct Transfer {
    id: String,
    rx: mpsc::Receiver<Result<Bytes, String>>,
    _permit: OwnedSemaphorePermit,
    remaining: u64,
    stall_timeout: Duration,
    done: bool,
}

/// Chunks from the agent until `expected` bytes arrived. A transfer with no
/// chunk for `stall_timeout` is reaped and ends with an error. The permit is
/// released when the stream is dropped.
fn transfer_stream(
    id: String,
    rx: mpsc::Receiver<Result<Bytes, String>>,
    permit: OwnedSemaphorePermit,
    expected: u64,
    stall_timeout: Duration,
) -> ChunkStream {
    let transfer = Transfer {
        id,
        rx,
        _permit: permit,
        remaining: expected,
        stall_timeout,
        done: false,
    };
    futures::stream::unfold(transfer, |mut t| async move {
        if t.done {
            return None;
        }
        let next = tokio::time::timeout(t.stall_timeout, t.rx.recv()).await;
        let item = match next {
            Err(_) => {
                tracing::warn!(transfer_id = %t.id, "Reaping stalled transfer");
                t.done = true;
                Err(ResourceError::Transfer("transfer stalled".to_string()))
            }
            Ok(None) if t.remaining == 0 => return None,
            Ok(None) => {
                t.done = true;
                Err(ResourceError::Transfer(format!(
                    "agent closed transfer with {} bytes outstanding",
                    t.remaining
                )))
            }
            Ok(Some(Err(message))) => {
                t.done = true;
                Err(ResourceError::Transfer(message))
            }
            Ok(Some(Ok(chunk))) => {
                let len = chunk.len() as u64;
                if len > t.remaining {
                    t.done = true;
                    Err(ResourceError::Transfer(
                        "agent sent more bytes than requested".to_string(),
                    ))
                } else {
                    t.remaining -= len;
                    if t.remaining == 0 {
                        tracing::debug!(transfer_id = %t.id, "Transfer complete");
                        t.done = true;
                    }
                    Ok(chunk)
                }
            }
        };
        Some((item, t))
    })
    .boxed()
}
