use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use runnerhub_types::{MonitorEvent, Snapshot};

const DEFAULT_BUFFER: usize = 256;

struct SubscriberInner {
    /// Topic prefixes this subscriber wants; empty means everything
    prefixes: Vec<String>,
    buffer: Mutex<VecDeque<MonitorEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
    closed: std::sync::atomic::AtomicBool,
}

impl SubscriberInner {
    fn wants(&self, topic: &str) -> bool {
        self.prefixes.is_empty() || self.prefixes.iter().any(|p| topic.starts_with(p.as_str()))
    }

    /// Push an event, dropping the oldest when full. Never blocks.
    fn push(&self, event: MonitorEvent) {
        let mut buffer = self.buffer.lock().unwrap();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        buffer.push_back(event);
        drop(buffer);
        self.notify.notify_one();
    }
}

/// A handle returned by [`MonitorBus::subscribe`]. Dropping it detaches the
/// subscriber on the next publish sweep.
pub struct Subscription {
    inner: Arc<SubscriberInner>,
}

impl Subscription {
    pub async fn recv(&self) -> MonitorEvent {
        loop {
            if let Some(event) = self.try_recv() {
                return event;
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<MonitorEvent> {
        self.inner.buffer.lock().unwrap().pop_front()
    }

    /// Events lost to the bounded buffer since subscribing.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Relaxed);
    }
}

/// In-process publish/subscribe fanout. Publishing never blocks: a slow
/// subscriber loses its oldest events and the loss is counted.
pub struct MonitorBus {
    subscribers: Mutex<Vec<Arc<SubscriberInner>>>,
    published: AtomicUsize,
    snapshot: tokio::sync::watch::Sender<Snapshot>,
}

impl Default for MonitorBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorBus {
    pub fn new() -> Self {
        let (snapshot, _) = tokio::sync::watch::channel(Snapshot::empty(chrono::Utc::now()));
        Self {
            subscribers: Mutex::new(Vec::new()),
            published: AtomicUsize::new(0),
            snapshot,
        }
    }

    /// Subscribe to topics by prefix (e.g. `"job."`, `"scaling."`). An empty
    /// prefix list subscribes to everything.
    pub fn subscribe(&self, prefixes: &[&str], capacity: Option<usize>) -> Subscription {
        let inner = Arc::new(SubscriberInner {
            prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
            buffer: Mutex::new(VecDeque::new()),
            capacity: capacity.unwrap_or(DEFAULT_BUFFER).max(1),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        self.subscribers.lock().unwrap().push(inner.clone());
        Subscription { inner }
    }

    pub fn publish(&self, event: MonitorEvent) {
        let topic = event.topic();
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|s| !s.closed.load(Ordering::Relaxed));
        for subscriber in subscribers.iter() {
            if subscriber.wants(topic) {
                subscriber.push(event.clone());
            }
        }
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn published(&self) -> usize {
        self.published.load(Ordering::Relaxed)
    }

    /// Latest aggregate snapshot; updated by the snapshot loop.
    pub fn watch_snapshot(&self) -> tokio::sync::watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }

    pub fn push_snapshot(&self, snapshot: Snapshot) {
        let _ = self.snapshot.send(snapshot);
    }

    pub fn latest_snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runnerhub_types::{JobId, JobStatus, Repository};

    fn queued(repo: &str) -> MonitorEvent {
        MonitorEvent::JobQueued {
            job_id: JobId::generate(),
            repository: Repository::new(repo).unwrap(),
        }
    }

    #[test]
    fn prefix_filtering() {
        let bus = MonitorBus::new();
        let jobs = bus.subscribe(&["job."], None);
        let networks = bus.subscribe(&["network."], None);

        bus.publish(queued("org/repo1"));

        assert!(jobs.try_recv().is_some());
        assert!(networks.try_recv().is_none());
    }

    #[test]
    fn slow_subscriber_drops_oldest() {
        let bus = MonitorBus::new();
        let sub = bus.subscribe(&[], Some(2));

        bus.publish(queued("org/a"));
        bus.publish(MonitorEvent::JobFinished {
            job_id: JobId::generate(),
            status: JobStatus::Completed,
        });
        bus.publish(queued("org/b"));

        assert_eq!(sub.dropped(), 1);
        // oldest was dropped; first receivable is the second event
        assert_eq!(sub.try_recv().unwrap().topic(), "job.finished");
        assert_eq!(sub.try_recv().unwrap().topic(), "job.queued");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn recv_wakes_on_publish() {
        let bus = Arc::new(MonitorBus::new());
        let sub = bus.subscribe(&["job."], None);

        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.publish(queued("org/repo1"));
            })
        };

        let event = sub.recv().await;
        assert_eq!(event.topic(), "job.queued");
        publisher.await.unwrap();
    }
}
