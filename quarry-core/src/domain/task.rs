//! Task envelope and handler contract
//!
//! A `TaskEnvelope` is created for exactly one delivery attempt of a message.
//! A redelivered message produces a fresh envelope even though the payload is
//! the same logical message.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::queue::QueueType;
use crate::domain::report::Report;
use crate::domain::resource::Resource;

/// Derives the short queue name from a subscription identifier
///
/// Subscriptions may be given fully qualified
/// (`projects/p/subscriptions/name`) or bare; the short name is the final
/// path segment in both cases. Used for indexing signing keys.
pub fn short_name(subscription: &str) -> &str {
    subscription
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(subscription)
}

/// Opaque crypto context applied around handlers and outbound reports
///
/// Payload decryption and signature verification live outside this crate;
/// the queue layer only carries the context and uses it to seal reports.
pub trait PayloadWrapper: Send + Sync {
    /// Recovers the plain request from a sealed payload
    ///
    /// Never called by the queue layer, which hands handlers the raw payload.
    /// A handler that decorates the real job calls it through
    /// `TaskEnvelope::wrapper` before doing any work.
    fn unwrap_request(&self, sealed: &[u8]) -> anyhow::Result<Vec<u8>>;

    /// Seals an outbound report body for the response channel
    fn seal_report(&self, report: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// Outcome of one handler invocation
#[derive(Debug, Default)]
pub struct HandlerOutcome {
    /// Resources used by the job, when the handler could measure them
    pub resource: Option<Resource>,

    /// `true` acknowledges the message, `false` returns it for redelivery
    pub ack: bool,

    /// Failure detail; informational only, the ack decision drives the queue
    pub error: Option<anyhow::Error>,
}

impl HandlerOutcome {
    pub fn ack(resource: Option<Resource>) -> Self {
        Self {
            resource,
            ack: true,
            error: None,
        }
    }

    pub fn nack(error: Option<anyhow::Error>) -> Self {
        Self {
            resource: None,
            ack: false,
            error,
        }
    }
}

/// Handler invoked for every delivered message
///
/// `ctx` is the caller's process-wide context, never the receive loop's
/// internal deadline. Long running work must honor it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: CancellationToken, task: &TaskEnvelope) -> HandlerOutcome;
}

/// Adapts an async closure into a `MessageHandler`
///
/// The closure receives its own clone of the envelope; cloning is cheap as the
/// payload and collaborators are reference counted.
pub struct FnHandler<F>(F);

impl<F> FnHandler<F> {
    pub fn new<Fut>(f: F) -> Self
    where
        F: Fn(CancellationToken, TaskEnvelope) -> Fut + Send + Sync,
        Fut: Future<Output = HandlerOutcome> + Send,
    {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(CancellationToken, TaskEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerOutcome> + Send,
{
    async fn handle(&self, ctx: CancellationToken, task: &TaskEnvelope) -> HandlerOutcome {
        (self.0)(ctx, task.clone()).await
    }
}

/// Metadata and payload for one delivery attempt
#[derive(Clone)]
pub struct TaskEnvelope {
    /// Runner label uniquely identifying the project across backends
    pub fq_project: String,
    pub project: String,
    pub queue_type: QueueType,
    pub subscription: String,
    /// Short queue name, used to retrieve signing keys
    pub short_qname: String,
    pub credentials: String,
    /// Raw payload; never modified once received
    pub msg: Bytes,
    pub handler: Arc<dyn MessageHandler>,
    pub wrapper: Option<Arc<dyn PayloadWrapper>>,
    /// Best-effort progress channel, absent when no responder could be opened
    pub response_q: Option<mpsc::Sender<Report>>,
}

impl TaskEnvelope {
    /// Creates a template envelope for a subscription, with an empty payload
    pub fn new(
        queue_type: QueueType,
        project: impl Into<String>,
        subscription: impl Into<String>,
        credentials: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let project = project.into();
        let subscription = subscription.into();
        Self {
            fq_project: format!("{}:{}", queue_type, project),
            short_qname: short_name(&subscription).to_string(),
            project,
            queue_type,
            subscription,
            credentials: credentials.into(),
            msg: Bytes::new(),
            handler,
            wrapper: None,
            response_q: None,
        }
    }

    pub fn with_wrapper(mut self, wrapper: Arc<dyn PayloadWrapper>) -> Self {
        self.wrapper = Some(wrapper);
        self
    }

    pub fn with_response_q(mut self, response_q: mpsc::Sender<Report>) -> Self {
        self.response_q = Some(response_q);
        self
    }

    /// Creates the envelope for one delivery of `msg`, based on this template
    pub fn for_delivery(&self, msg: Bytes) -> Self {
        Self {
            msg,
            ..self.clone()
        }
    }
}

impl fmt::Debug for TaskEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEnvelope")
            .field("fq_project", &self.fq_project)
            .field("queue_type", &self.queue_type)
            .field("subscription", &self.subscription)
            .field("short_qname", &self.short_qname)
            .field("msg_len", &self.msg.len())
            .field("wrapped", &self.wrapper.is_some())
            .field("has_response_q", &self.response_q.is_some())
            .finish()
    }
}
