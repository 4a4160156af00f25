use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::rpc::{AgentHeartbeat, AgentRpcClient, HeartbeatStream};

/// Exponential backoff with jitter for reconnect attempts.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        let initial = Duration::from_millis(initial_ms.max(1));
        Self {
            initial,
            max: Duration::from_millis(max_ms.max(initial_ms)),
            current: initial,
        }
    }

    /// Delay before the next attempt. Doubles every call up to the cap, with
    /// up to 20% random jitter on top.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 5);
        base + Duration::from_millis(jitter_ms)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Sends a heartbeat for the job every interval, reopening the stream with
/// backoff whenever the server side goes away. A lost connection never
/// fails the job; the process may still be running.
pub struct HeartbeatSender {
    client: Arc<dyn AgentRpcClient>,
    interval: Duration,
    backoff: Backoff,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatSender {
    pub fn new(
        client: Arc<dyn AgentRpcClient>,
        interval_ms: u64,
        backoff_initial_ms: u64,
        backoff_max_ms: u64,
    ) -> Self {
        Self {
            client,
            interval: Duration::from_millis(interval_ms),
            backoff: Backoff::new(backoff_initial_ms, backoff_max_ms),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn start(&mut self, job_id: &str) {
        if self.task.is_some() {
            return;
        }
        let client = self.client.clone();
        let interval = self.interval;
        let mut backoff = self.backoff;
        let cancel = self.cancel.clone();
        let job_id = job_id.to_string();

        self.task = Some(tokio::spawn(async move {
            let mut stream: Option<HeartbeatStream> = None;
            let mut ticker = tokio::time::interval(interval);
            loop {
                let current = match stream.take() {
                    Some(s) => s,
                    None => match client.open_heartbeat_stream().await {
                        Ok(s) => {
                            tracing::info!(job_id = %job_id, stream_id = %s.stream_id, "Heartbeat stream connected");
                            backoff.reset();
                            s
                        }
                        Err(e) => {
                            let delay = backoff.next_delay();
                            tracing::warn!(job_id = %job_id, error = %e, delay_ms = delay.as_millis() as u64, "Heartbeat connect failed, retrying");
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(delay) => continue,
                            }
                        }
                    },
                };

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let heartbeat = AgentHeartbeat {
                    job_id: job_id.clone(),
                };
                if current.heartbeats.send(heartbeat).await.is_ok() {
                    stream = Some(current);
                } else {
                    tracing::warn!(job_id = %job_id, stream_id = %current.stream_id, "Heartbeat stream lost");
                }
            }
            tracing::debug!(job_id = %job_id, "Heartbeat sender stopped");
        }));
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop sending. Dropping the stream tells the server we are gone.
    pub async fn stop(&mut self, drain: Duration) {
        self.cancel.cancel();
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(drain, &mut task).await.is_err() {
                tracing::warn!("Heartbeat sender did not stop in time, aborting");
                task.abort();
            }
        }
    }
}
