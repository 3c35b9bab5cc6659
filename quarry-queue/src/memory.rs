//! In-process broker backend
//!
//! Holds subscriptions, their ready and leased messages, and the reports sent
//! to their responders entirely in memory. Useful for embedding and as the
//! test double for the dispatch loop.

use async_trait::async_trait;
use bytes::Bytes;
use quarry_core::{PayloadWrapper, QueueType, Report, TaskEnvelope};
use regex::Regex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dispatch;
use crate::error::{QueueError, Result};
use crate::queue::{TaskQueue, WorkOutcome, WorkSettings, matches_filters};
use crate::receive::{Delivery, MessageSource};
use crate::responder::spawn_forwarder;

/// Counters kept per subscription
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub published: usize,
    pub delivered: usize,
    pub acked: usize,
    pub nacked: usize,
    /// Highest number of simultaneously leased messages observed
    pub peak_leased: usize,
}

struct StoredMessage {
    id: String,
    data: Bytes,
}

#[derive(Default)]
struct SubscriptionState {
    ready: VecDeque<StoredMessage>,
    leased: HashMap<String, StoredMessage>,
    stats: SubscriptionStats,
    responses: Vec<Report>,
}

struct BrokerInner {
    subscriptions: Mutex<HashMap<String, SubscriptionState>>,
    arrivals: Notify,
    next_id: AtomicU64,
    poll_interval: Duration,
}

impl BrokerInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, SubscriptionState>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle to an in-memory broker
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                subscriptions: Mutex::new(HashMap::new()),
                arrivals: Notify::new(),
                next_id: AtomicU64::new(1),
                poll_interval: Duration::from_millis(250),
            }),
        }
    }

    /// Sets how long an empty pull waits for new messages
    ///
    /// Only takes effect on a broker that has not been cloned yet.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.poll_interval = poll_interval;
        }
        self
    }

    /// Creates a subscription; returns false if it already existed
    pub fn create_subscription(&self, name: &str) -> bool {
        let mut subscriptions = self.inner.lock();
        if subscriptions.contains_key(name) {
            return false;
        }
        subscriptions.insert(name.to_string(), SubscriptionState::default());
        true
    }

    /// Deletes a subscription and everything queued on it
    pub fn delete_subscription(&self, name: &str) -> bool {
        self.inner.lock().remove(name).is_some()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Enqueues a message, returning its id
    pub fn publish(&self, subscription: &str, data: impl Into<Bytes>) -> Result<String> {
        let id = format!("m{}", self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        {
            let mut subscriptions = self.inner.lock();
            let state = subscriptions.get_mut(subscription).ok_or_else(|| {
                QueueError::discovery("publish", subscription, "subscription does not exist")
            })?;
            state.ready.push_back(StoredMessage {
                id: id.clone(),
                data: data.into(),
            });
            state.stats.published += 1;
        }
        self.inner.arrivals.notify_waiters();
        Ok(id)
    }

    pub fn stats(&self, subscription: &str) -> Option<SubscriptionStats> {
        self.inner
            .lock()
            .get(subscription)
            .map(|state| state.stats.clone())
    }

    pub fn ready_len(&self, subscription: &str) -> usize {
        self.inner
            .lock()
            .get(subscription)
            .map_or(0, |state| state.ready.len())
    }

    pub fn leased_len(&self, subscription: &str) -> usize {
        self.inner
            .lock()
            .get(subscription)
            .map_or(0, |state| state.leased.len())
    }

    /// Reports sent through responders opened on `subscription`
    pub fn responses(&self, subscription: &str) -> Vec<Report> {
        self.inner
            .lock()
            .get(subscription)
            .map(|state| state.responses.clone())
            .unwrap_or_default()
    }

    fn lease(&self, subscription: &str, max: usize) -> Result<Vec<Box<dyn Delivery>>> {
        let mut subscriptions = self.inner.lock();
        let state = subscriptions.get_mut(subscription).ok_or_else(|| {
            QueueError::discovery("pull", subscription, "subscription does not exist")
        })?;

        let mut batch: Vec<Box<dyn Delivery>> = Vec::new();
        while batch.len() < max {
            let Some(message) = state.ready.pop_front() else {
                break;
            };
            batch.push(Box::new(MemoryDelivery {
                broker: Arc::clone(&self.inner),
                subscription: subscription.to_string(),
                id: message.id.clone(),
                data: message.data.clone(),
            }));
            state.leased.insert(message.id.clone(), message);
        }

        state.stats.delivered += batch.len();
        state.stats.peak_leased = state.stats.peak_leased.max(state.leased.len());
        Ok(batch)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("subscriptions", &self.subscriptions())
            .finish()
    }
}

struct MemoryDelivery {
    broker: Arc<BrokerInner>,
    subscription: String,
    id: String,
    data: Bytes,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn id(&self) -> &str {
        &self.id
    }

    fn data(&self) -> &Bytes {
        &self.data
    }

    async fn ack(&self) -> Result<()> {
        let mut subscriptions = self.broker.lock();
        if let Some(state) = subscriptions.get_mut(&self.subscription) {
            if state.leased.remove(&self.id).is_some() {
                state.stats.acked += 1;
            }
        }
        Ok(())
    }

    async fn nack(&self) -> Result<()> {
        {
            let mut subscriptions = self.broker.lock();
            if let Some(state) = subscriptions.get_mut(&self.subscription) {
                if let Some(message) = state.leased.remove(&self.id) {
                    state.ready.push_front(message);
                    state.stats.nacked += 1;
                }
            }
        }
        self.broker.arrivals.notify_waiters();
        Ok(())
    }

    async fn extend(&self, _lease: Duration) -> Result<()> {
        // Leases never expire in memory
        Ok(())
    }
}

struct MemorySource {
    broker: MemoryBroker,
    subscription: String,
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn pull(&self, max: usize) -> Result<Vec<Box<dyn Delivery>>> {
        let batch = self.broker.lease(&self.subscription, max)?;
        if !batch.is_empty() {
            return Ok(batch);
        }

        let inner = &self.broker.inner;
        let _ = tokio::time::timeout(inner.poll_interval, inner.arrivals.notified()).await;
        self.broker.lease(&self.subscription, max)
    }
}

/// `TaskQueue` over a `MemoryBroker`
pub struct MemoryQueue {
    project: String,
    broker: MemoryBroker,
}

impl MemoryQueue {
    pub fn new(project: impl Into<String>, broker: MemoryBroker) -> Self {
        Self {
            project: project.into(),
            broker,
        }
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    fn queue_type(&self) -> QueueType {
        QueueType::Memory
    }

    async fn refresh(
        &self,
        _ctx: &CancellationToken,
        matcher: Option<&Regex>,
        mismatcher: Option<&Regex>,
    ) -> Result<BTreeSet<String>> {
        Ok(self
            .broker
            .subscriptions()
            .into_iter()
            .filter(|name| matches_filters(name, matcher, mismatcher))
            .collect())
    }

    async fn exists(&self, _ctx: &CancellationToken, subscription: &str) -> Result<bool> {
        Ok(self.broker.inner.lock().contains_key(subscription))
    }

    async fn has_work(&self, _ctx: &CancellationToken, subscription: &str) -> Result<bool> {
        Ok(self.broker.ready_len(subscription) > 0)
    }

    async fn work(
        &self,
        ctx: &CancellationToken,
        settings: &WorkSettings,
        task: &TaskEnvelope,
    ) -> Result<WorkOutcome> {
        if !self.broker.inner.lock().contains_key(&task.subscription) {
            return Err(QueueError::discovery(
                "work",
                &task.subscription,
                "subscription does not exist",
            ));
        }
        debug!(project = %self.project, subscription = %task.subscription, "Receiving from memory broker");

        let source = MemorySource {
            broker: self.broker.clone(),
            subscription: task.subscription.clone(),
        };
        dispatch::work(&source, ctx, settings, task).await
    }

    async fn responder(
        &self,
        _ctx: &CancellationToken,
        subscription: &str,
        _wrapper: Option<Arc<dyn PayloadWrapper>>,
    ) -> Result<mpsc::Sender<Report>> {
        if !self.broker.inner.lock().contains_key(subscription) {
            return Err(QueueError::discovery(
                "responder",
                subscription,
                "subscription does not exist",
            ));
        }

        let broker = Arc::clone(&self.broker.inner);
        let target = subscription.to_string();
        Ok(spawn_forwarder(subscription.to_string(), move |report| {
            let broker = Arc::clone(&broker);
            let target = target.clone();
            async move {
                let mut subscriptions = broker.lock();
                let state = subscriptions.get_mut(&target).ok_or_else(|| {
                    QueueError::discovery("respond", &target, "subscription was deleted")
                })?;
                state.responses.push(report);
                Ok::<_, QueueError>(())
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::ReportPayload;

    fn broker_with(names: &[&str]) -> MemoryBroker {
        let broker = MemoryBroker::new().with_poll_interval(Duration::from_millis(10));
        for name in names {
            broker.create_subscription(name);
        }
        broker
    }

    #[tokio::test]
    async fn test_refresh_applies_filters() {
        let broker = broker_with(&["train-a", "train-b-paused", "eval"]);
        let queue = MemoryQueue::new("p", broker);
        let ctx = CancellationToken::new();

        let all = queue.refresh(&ctx, None, None).await.unwrap();
        assert_eq!(all.len(), 3);

        let include = Regex::new("^train").unwrap();
        let exclude = Regex::new("paused").unwrap();
        let known = queue
            .refresh(&ctx, Some(&include), Some(&exclude))
            .await
            .unwrap();
        assert_eq!(known.into_iter().collect::<Vec<_>>(), vec!["train-a"]);
    }

    #[tokio::test]
    async fn test_exists_agrees_with_refresh() {
        let broker = broker_with(&["a", "b"]);
        let queue = MemoryQueue::new("p", broker.clone());
        let ctx = CancellationToken::new();

        let known = queue.refresh(&ctx, None, None).await.unwrap();
        for name in ["a", "b", "c"] {
            let exists = queue.exists(&ctx, name).await.unwrap();
            assert_eq!(exists, known.contains(name));
        }

        broker.delete_subscription("a");
        assert!(!queue.exists(&ctx, "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_has_work_tracks_ready_messages() {
        let broker = broker_with(&["jobs"]);
        let queue = MemoryQueue::new("p", broker.clone());
        let ctx = CancellationToken::new();

        assert!(!queue.has_work(&ctx, "jobs").await.unwrap());
        assert!(!queue.has_work(&ctx, "missing").await.unwrap());
        broker.publish("jobs", "payload").unwrap();
        assert!(queue.has_work(&ctx, "jobs").await.unwrap());
    }

    #[tokio::test]
    async fn test_nack_redelivers_first() {
        let broker = broker_with(&["jobs"]);
        broker.publish("jobs", "first").unwrap();
        broker.publish("jobs", "second").unwrap();

        let mut batch = broker.lease("jobs", 1).unwrap();
        let first = batch.pop().unwrap();
        assert_eq!(first.data().as_ref(), b"first");
        assert_eq!(broker.leased_len("jobs"), 1);

        first.nack().await.unwrap();
        let again = broker.lease("jobs", 1).unwrap().pop().unwrap();
        assert_eq!(again.data().as_ref(), b"first");
        again.ack().await.unwrap();

        let stats = broker.stats("jobs").unwrap();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.nacked, 1);
        assert_eq!(stats.acked, 1);
        assert_eq!(broker.ready_len("jobs"), 1);
    }

    #[tokio::test]
    async fn test_pull_wakes_on_publish() {
        let broker = MemoryBroker::new().with_poll_interval(Duration::from_secs(5));
        broker.create_subscription("jobs");
        let source = MemorySource {
            broker: broker.clone(),
            subscription: "jobs".to_string(),
        };

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            publisher.publish("jobs", "late").unwrap();
        });

        let started = std::time::Instant::now();
        let batch = source.pull(4).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_responder_stores_reports() {
        let broker = broker_with(&["jobs"]);
        let queue = MemoryQueue::new("p", broker.clone());
        let ctx = CancellationToken::new();

        assert!(queue.responder(&ctx, "missing", None).await.is_err());

        let tx = queue.responder(&ctx, "jobs", None).await.unwrap();
        tx.send(Report::new(
            "runner",
            "jobs",
            ReportPayload::Progress {
                state: "done".to_string(),
                message: String::new(),
            },
        ))
        .await
        .unwrap();

        for _ in 0..50 {
            if !broker.responses("jobs").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(broker.responses("jobs").len(), 1);
    }
}
