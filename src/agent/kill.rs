use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::heartbeat::Backoff;
use crate::agent::process::ProcessLifecycleManager;
use crate::model::KillSource;
use crate::rpc::{AgentRpcClient, KillNotification};

/// Turns server kill notifications into a local kill. With a reconnect
/// client set, a subscription the server ends is taken out again.
pub struct KillService {
    process: Arc<ProcessLifecycleManager>,
    reconnect: Option<(Arc<dyn AgentRpcClient>, Backoff)>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl KillService {
    pub fn new(process: Arc<ProcessLifecycleManager>) -> Self {
        Self {
            process,
            reconnect: None,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn with_reconnect(mut self, client: Arc<dyn AgentRpcClient>, backoff: Backoff) -> Self {
        self.reconnect = Some((client, backoff));
        self
    }

    /// Start listening. Calling `start` again is a no-op.
    pub fn start(&mut self, job_id: &str, mut notifications: mpsc::Receiver<KillNotification>) {
        if self.task.is_some() {
            return;
        }
        let process = self.process.clone();
        let mut reconnect = self.reconnect.clone();
        let cancel = self.cancel.clone();
        let job_id = job_id.to_string();
        self.task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    notification = notifications.recv() => match notification {
                        Some(n) if n.job_id == job_id => {
                            tracing::info!(job_id = %job_id, reason = %n.reason, "Kill requested by server");
                            process.kill(KillSource::ApiKillRequest).await;
                        }
                        Some(n) => {
                            tracing::warn!(job_id = %job_id, other = %n.job_id, "Ignoring kill for another job");
                        }
                        None => {
                            tracing::debug!(job_id = %job_id, "Kill stream closed");
                            let Some((client, backoff)) = reconnect.as_mut() else {
                                break;
                            };
                            match resubscribe(client.as_ref(), &job_id, backoff, &cancel).await {
                                Some(rx) => notifications = rx,
                                None => break,
                            }
                        }
                    }
                }
            }
        }));
    }

    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn resubscribe(
    client: &dyn AgentRpcClient,
    job_id: &str,
    backoff: &mut Backoff,
    cancel: &CancellationToken,
) -> Option<mpsc::Receiver<KillNotification>> {
    loop {
        let delay = backoff.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        match client.subscribe_kill(job_id).await {
            Ok(rx) => {
                tracing::info!(job_id, "Kill subscription renewed");
                backoff.reset();
                return Some(rx);
            }
            Err(e) => tracing::warn!(job_id, error = %e, "Kill resubscribe failed"),
        }
    }
}

/// Polls the server for the job's status and kills the local process when
/// the server already considers the job finished, for instance because it
/// was killed while this agent was unreachable.
pub struct RemoteStatusMonitor {
    client: Arc<dyn AgentRpcClient>,
    process: Arc<ProcessLifecycleManager>,
    interval: Duration,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RemoteStatusMonitor {
    pub fn new(
        client: Arc<dyn AgentRpcClient>,
        process: Arc<ProcessLifecycleManager>,
        interval_ms: u64,
    ) -> Self {
        Self {
            client,
            process,
            interval: Duration::from_millis(interval_ms),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn start(&mut self, job_id: &str) {
        if self.task.is_some() {
            return;
        }
        let client = self.client.clone();
        let process = self.process.clone();
        let cancel = self.cancel.clone();
        let interval = self.interval;
        let job_id = job_id.to_string();
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !process.is_launched() || process.has_exited() {
                    continue;
                }
                match client.get_job_status(&job_id).await {
                    Ok(status) if status.is_finished() => {
                        tracing::warn!(job_id = %job_id, status = %status, "Server reports job finished while process still runs");
                        process.kill(KillSource::RemoteStatusMonitor).await;
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => tracing::debug!(job_id = %job_id, error = %e, "Remote status poll failed"),
                }
            }
        }));
    }

    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::process::KillWindows;

    fn manager() -> Arc<ProcessLifecycleManager> {
        ProcessLifecycleManager::new(KillWindows {
            graceful: Duration::from_millis(100),
            forceful: Duration::from_millis(100),
            exit_race_delay: Duration::from_millis(10),
        })
    }

    #[tokio::test]
    async fn test_notification_records_api_kill() {
        let process = manager();
        let mut service = KillService::new(process.clone());
        let (tx, rx) = mpsc::channel(1);
        service.start("job-1", rx);

        tx.send(KillNotification {
            job_id: "job-1".into(),
            reason: "user".into(),
        })
        .await
        .unwrap();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !process.is_killed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(process.kill_source(), Some(KillSource::ApiKillRequest));
        service.stop().await;
    }

    #[tokio::test]
    async fn test_notification_for_other_job_ignored() {
        let process = manager();
        let mut service = KillService::new(process.clone());
        let (tx, rx) = mpsc::channel(1);
        service.start("job-1", rx);

        tx.send(KillNotification {
            job_id: "job-2".into(),
            reason: "user".into(),
        })
        .await
        .unwrap();
        drop(tx);
        service.stop().await;

        assert!(!process.is_killed());
    }
}
