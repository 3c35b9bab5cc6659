//! Queue backend contract
//!
//! Every backend implements `TaskQueue`. Backends are selected by the
//! `QueueType` tag through `open_queue`; there is no shared base type.

use async_trait::async_trait;
use quarry_core::{
    PayloadWrapper, QueueDesc, QueueType, Report, Resource, TaskEnvelope, short_name,
};
use regex::Regex;
use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{QueueError, Result};
use crate::file::{FileQueue, FileQueueConfig};
use crate::memory::{MemoryBroker, MemoryQueue};
use crate::pubsub::{PubSub, PubSubConfig};

/// Leases may be extended for up to this long; compute jobs routinely run for hours
pub const DEFAULT_MAX_EXTENSION: Duration = Duration::from_secs(12 * 60 * 60);

/// Lease requested from the backend on every extension
pub const DEFAULT_ACK_DEADLINE: Duration = Duration::from_secs(60);

/// Settings for one `TaskQueue::work` call
#[derive(Debug, Clone)]
pub struct WorkSettings {
    /// Bounds how long the call keeps receiving new messages
    pub timeout: Duration,

    /// Maximum number of unacknowledged messages held at once
    pub max_jobs: usize,

    pub max_extension: Duration,

    pub ack_deadline: Duration,
}

impl WorkSettings {
    pub fn new(timeout: Duration, max_jobs: usize) -> Self {
        Self {
            timeout,
            max_jobs,
            max_extension: DEFAULT_MAX_EXTENSION,
            ack_deadline: DEFAULT_ACK_DEADLINE,
        }
    }
}

/// Why a `work` call stopped receiving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The per-call timeout elapsed
    Deadline,

    /// The caller's context was cancelled
    Shutdown,

    /// A handler asked for redelivery, which stops intake for this call
    HandlerFailure,
}

/// Result of one `work` call
#[derive(Debug, Clone)]
pub struct WorkOutcome {
    /// Messages handed to the handler, whatever their outcome
    pub attempted: u64,

    /// Resource record from the most recent acknowledged message that had one
    pub resource: Option<Resource>,

    pub stop: StopReason,
}

/// Operations every queue backend provides
#[async_trait]
pub trait TaskQueue: Send + Sync {
    fn queue_type(&self) -> QueueType;

    /// Lists every subscription matching `matcher` and not matching `mismatcher`
    ///
    /// Read only; safe to call while any number of `work` calls are active.
    async fn refresh(
        &self,
        ctx: &CancellationToken,
        matcher: Option<&Regex>,
        mismatcher: Option<&Regex>,
    ) -> Result<BTreeSet<String>>;

    /// Targeted existence check for one subscription
    async fn exists(&self, ctx: &CancellationToken, subscription: &str) -> Result<bool>;

    /// Cheap probe for pending work
    ///
    /// Best effort: both false positives and false negatives are possible.
    async fn has_work(&self, ctx: &CancellationToken, subscription: &str) -> Result<bool>;

    /// Receives and dispatches messages for `task.subscription`
    ///
    /// Runs until `settings.timeout` elapses, `ctx` is cancelled or a handler
    /// nacks. Each of those ends the call without error.
    async fn work(
        &self,
        ctx: &CancellationToken,
        settings: &WorkSettings,
        task: &TaskEnvelope,
    ) -> Result<WorkOutcome>;

    /// Opens a best-effort channel for progress reports about `subscription`
    async fn responder(
        &self,
        ctx: &CancellationToken,
        subscription: &str,
        wrapper: Option<Arc<dyn PayloadWrapper>>,
    ) -> Result<mpsc::Sender<Report>>;

    /// Short queue name for the envelope, used to look up signing keys
    fn short_qname(&self, task: &TaskEnvelope) -> Result<String> {
        Ok(short_name(&task.subscription).to_string())
    }
}

/// Options shared by the backends `open_queue` can construct
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Bound applied to discovery calls
    pub op_timeout: Duration,

    /// How long pull-polling backends wait before looking for messages again
    pub poll_interval: Duration,

    pub pubsub_endpoint: String,

    /// Broker used by the memory backend; a fresh one is created when absent
    pub broker: Option<MemoryBroker>,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
            pubsub_endpoint: crate::pubsub::DEFAULT_ENDPOINT.to_string(),
            broker: None,
        }
    }
}

/// Constructs the backend selected by `kind`
pub fn open_queue(
    kind: QueueType,
    desc: &QueueDesc,
    options: &BackendOptions,
) -> Result<Arc<dyn TaskQueue>> {
    let queue: Arc<dyn TaskQueue> = match kind {
        QueueType::PubSub => Arc::new(PubSub::new(
            desc.project(),
            desc.credentials(),
            PubSubConfig {
                endpoint: options.pubsub_endpoint.clone(),
                op_timeout: options.op_timeout,
            },
        )),
        QueueType::File => {
            if desc.management().is_empty() {
                return Err(QueueError::Connect {
                    project: desc.project().to_string(),
                    message: "file queues need a root directory".to_string(),
                });
            }
            Arc::new(FileQueue::new(
                desc.project(),
                PathBuf::from(desc.management()),
                FileQueueConfig {
                    poll_interval: options.poll_interval,
                },
            ))
        }
        QueueType::Memory => Arc::new(MemoryQueue::new(
            desc.project(),
            options.broker.clone().unwrap_or_default(),
        )),
    };
    Ok(queue)
}

/// Applies the include and exclude patterns used by `refresh`
pub fn matches_filters(name: &str, matcher: Option<&Regex>, mismatcher: Option<&Regex>) -> bool {
    if let Some(matcher) = matcher {
        if !matcher.is_match(name) {
            return false;
        }
    }
    if let Some(mismatcher) = mismatcher {
        if mismatcher.is_match(name) {
            return false;
        }
    }
    true
}

/// Runs a discovery call bounded by both the caller's context and `timeout`
pub(crate) async fn bounded<T, F>(
    ctx: &CancellationToken,
    timeout: Duration,
    operation: &'static str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = ctx.cancelled() => Err(QueueError::Cancelled { operation }),
        outcome = tokio::time::timeout(timeout, fut) => match outcome {
            Ok(result) => result,
            Err(_) => Err(QueueError::Timeout { operation, after: timeout }),
        },
    }
}
