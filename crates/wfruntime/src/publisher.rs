use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use wfcore::{ExecutionEvent, ExecutionId};

struct Subscriber {
    id: u64,
    sender: mpsc::UnboundedSender<ExecutionEvent>,
}

/// Fans execution events out to live subscribers, keyed by execution id.
///
/// The registry has its own lock, independent of execution state. Callers
/// publish while holding the instance lock, which is what keeps per-execution
/// delivery order equal to application order.
#[derive(Default)]
pub struct ProgressPublisher {
    subscribers: Mutex<HashMap<ExecutionId, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl ProgressPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber for one execution.
    pub fn register(&self, execution_id: ExecutionId) -> (u64, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers
            .entry(execution_id)
            .or_default()
            .push(Subscriber { id, sender });
        tracing::debug!(%execution_id, subscriber = id, "Subscriber registered");
        (id, receiver)
    }

    pub fn unregister(&self, execution_id: ExecutionId, subscriber: u64) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = subscribers.get_mut(&execution_id) {
            list.retain(|s| s.id != subscriber);
            if list.is_empty() {
                subscribers.remove(&execution_id);
            }
        }
    }

    /// Delivers events in order. Subscribers whose receiver is gone are dropped.
    pub fn publish(&self, events: &[ExecutionEvent]) {
        if events.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        for event in events {
            let execution_id = event.execution_id();
            if let Some(list) = subscribers.get_mut(&execution_id) {
                list.retain(|s| s.sender.send(event.clone()).is_ok());
            }
        }
    }

    /// Drops every subscriber of an execution, ending their streams.
    pub fn close(&self, execution_id: ExecutionId) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = subscribers.remove(&execution_id) {
            tracing::debug!(%execution_id, count = list.len(), "Closing subscribers");
        }
    }

    pub fn subscriber_count(&self, execution_id: ExecutionId) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&execution_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;
    use wfcore::ExecutionStatus;

    fn status_event(execution_id: ExecutionId, seq: u64) -> ExecutionEvent {
        ExecutionEvent::StatusChanged {
            seq,
            execution_id,
            from: ExecutionStatus::Pending,
            to: ExecutionStatus::Running,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn delivers_only_to_matching_execution_in_order() {
        let publisher = ProgressPublisher::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (_, mut rx_a) = publisher.register(a);
        let (_, mut rx_b) = publisher.register(b);

        publisher.publish(&[status_event(a, 1), status_event(b, 1), status_event(a, 2)]);

        assert_eq!(rx_a.recv().await.unwrap().seq(), 1);
        assert_eq!(rx_a.recv().await.unwrap().seq(), 2);
        assert_eq!(rx_b.recv().await.unwrap().seq(), 1);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn prunes_dropped_receivers_and_closes_streams() {
        let publisher = ProgressPublisher::new();
        let id = Uuid::new_v4();
        let (_, dropped) = publisher.register(id);
        let (sub, mut kept) = publisher.register(id);
        drop(dropped);

        publisher.publish(&[status_event(id, 1)]);
        assert_eq!(publisher.subscriber_count(id), 1);
        assert_eq!(kept.recv().await.unwrap().seq(), 1);

        publisher.close(id);
        assert!(kept.recv().await.is_none());
        publisher.unregister(id, sub);
        assert_eq!(publisher.subscriber_count(id), 0);
    }
}
