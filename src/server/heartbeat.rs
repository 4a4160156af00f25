use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::rpc::{AgentHeartbeat, HeartbeatStream};
use crate::server::connections::AgentConnectionTracker;

const HEARTBEAT_BUFFER: usize = 16;

/// Accepts agent heartbeat streams and feeds them into the connection tracker.
#[derive(Debug, Clone)]
pub struct HeartbeatService {
    tracker: Arc<AgentConnectionTracker>,
    cancel: CancellationToken,
}

impl HeartbeatService {
    pub fn new(tracker: Arc<AgentConnectionTracker>, cancel: CancellationToken) -> Self {
        Self { tracker, cancel }
    }

    /// Open a stream. Each stream gets its own id; the tracker is told about
    /// the disconnect when the agent drops its sender or the node shuts down.
    pub fn connect(&self) -> HeartbeatStream {
        let (tx, rx) = mpsc::channel(HEARTBEAT_BUFFER);
        let stream_id = Uuid::new_v4().to_string();
        tracing::debug!(stream_id = %stream_id, "Heartbeat stream opened");

        let tracker = self.tracker.clone();
        let cancel = self.cancel.clone();
        let id = stream_id.clone();
        tokio::spawn(async move {
            Self::serve(tracker, id, rx, cancel).await;
        });

        HeartbeatStream {
            stream_id,
            heartbeats: tx,
        }
    }

    async fn serve(
        tracker: Arc<AgentConnectionTracker>,
        stream_id: String,
        mut rx: mpsc::Receiver<AgentHeartbeat>,
        cancel: CancellationToken,
    ) {
        let mut current_job: Option<String> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                heartbeat = rx.recv() => match heartbeat {
                    Some(AgentHeartbeat { job_id }) => {
                        if let Some(previous) = current_job.as_deref() {
                            if previous != job_id {
                                tracker.notify_disconnected(&stream_id, previous);
                            }
                        }
                        tracker.notify_heartbeat(&stream_id, &job_id);
                        current_job = Some(job_id);
                    }
                    None => break,
                }
            }
        }

        if let Some(job_id) = current_job {
            tracker.notify_disconnected(&stream_id, &job_id);
        }
        tracing::debug!(stream_id = %stream_id, "Heartbeat stream closed");
    }
}
