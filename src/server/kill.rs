use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::rpc::KillNotification;

const KILL_BUFFER: usize = 4;

/// Delivers kill requests to agents connected to this node.
#[derive(Debug, Default)]
pub struct KillNotifier {
    subscribers: DashMap<String, mpsc::Sender<KillNotification>>,
}

impl KillNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the agent for `job_id`. A later subscription for the same job
    /// replaces the earlier one.
    pub fn subscribe(&self, job_id: &str) -> mpsc::Receiver<KillNotification> {
        let (tx, rx) = mpsc::channel(KILL_BUFFER);
        if self.subscribers.insert(job_id.to_string(), tx).is_some() {
            tracing::debug!(job_id, "Replaced kill subscription");
        }
        rx
    }

    pub fn is_subscribed(&self, job_id: &str) -> bool {
        self.subscribers
            .get(job_id)
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Forget the agent for `job_id`. Its receiver sees the stream end.
    pub fn unsubscribe(&self, job_id: &str) -> bool {
        self.subscribers.remove(job_id).is_some()
    }

    /// Drop subscriptions whose receiver is gone. Returns how many.
    pub fn prune(&self) -> usize {
        let before = self.subscribers.len();
        self.subscribers.retain(|_, tx| !tx.is_closed());
        before - self.subscribers.len()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Returns true if an agent received the request.
    pub async fn notify(&self, job_id: &str, reason: &str) -> bool {
        let Some(tx) = self.subscribers.get(job_id).map(|tx| tx.clone()) else {
            return false;
        };
        let notification = KillNotification {
            job_id: job_id.to_string(),
            reason: reason.to_string(),
        };
        if tx.send(notification).await.is_ok() {
            tracing::info!(job_id, reason, "Kill request sent to agent");
            true
        } else {
            self.subscribers.remove_if(job_id, |_, current| current.same_channel(&tx));
            tracing::debug!(job_id, "Kill subscriber gone");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notifies_subscriber() {
        let notifier = KillNotifier::new();
        let mut rx = notifier.subscribe("job-1");
        assert!(notifier.notify("job-1", "user asked").await);
        let kill = rx.recv().await.unwrap();
        assert_eq!(kill.reason, "user asked");
    }

    #[tokio::test]
    async fn dropped_subscriber_is_forgotten() {
        let notifier = KillNotifier::new();
        drop(notifier.subscribe("job-1"));
        assert!(!notifier.is_subscribed("job-1"));
        assert!(!notifier.notify("job-1", "user asked").await);
        assert!(!notifier.notify("job-2", "user asked").await);
    }

    #[tokio::test]
    async fn unsubscribe_ends_agent_stream() {
        let notifier = KillNotifier::new();
        let mut rx = notifier.subscribe("job-1");
        assert!(notifier.unsubscribe("job-1"));
        assert!(rx.recv().await.is_none());
        assert!(!notifier.unsubscribe("job-1"));
        assert!(notifier.is_empty());
    }

    #[test]
    fn prune_drops_closed_subscriptions() {
        let notifier = KillNotifier::new();
        let _live = notifier.subscribe("job-1");
        drop(notifier.subscribe("job-2"));
        assert_eq!(notifier.prune(), 1);
        assert_eq!(notifier.len(), 1);
        assert!(notifier.is_subscribed("job-1"));
    }
}
