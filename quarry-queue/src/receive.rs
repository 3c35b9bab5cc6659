//! Flow-controlled concurrent delivery
//!
//! Backends only know how to pull leased messages and settle them. This module
//! turns that primitive into the delivery model the dispatch loop relies on:
//! - at most `max_outstanding` messages are unacknowledged at any time
//! - every message is handed to the callback on its own task
//! - leases are extended while a callback runs, up to `max_extension`
//! - all callbacks have returned before `receive` does
//! - a callback that panics leaves its message to be returned like any other
//!   unsettled delivery

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use std::any::Any;
use std::convert::Infallible;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::Result;

/// One leased message
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Backend message id, for logging
    fn id(&self) -> &str;

    fn data(&self) -> &Bytes;

    /// Permanently removes the message
    async fn ack(&self) -> Result<()>;

    /// Returns the message for redelivery
    async fn nack(&self) -> Result<()>;

    /// Keeps the message hidden from other consumers for another `lease`
    async fn extend(&self, lease: Duration) -> Result<()>;
}

/// Pull primitive implemented by every backend
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Leases up to `max` messages
    ///
    /// May wait for messages to arrive, but must return within a bounded
    /// time; an empty result is not an error. A pull that has started is
    /// always awaited, even after `receive` is told to stop, and whatever it
    /// leased is then returned.
    async fn pull(&self, max: usize) -> Result<Vec<Box<dyn Delivery>>>;
}

/// Flow control applied by `receive`
#[derive(Debug, Clone)]
pub struct ReceiveSettings {
    /// Maximum number of unacknowledged messages held by this receiver
    pub max_outstanding: usize,

    /// How long a message lease may be extended for in total
    pub max_extension: Duration,

    /// Lease requested on each extension
    pub ack_deadline: Duration,
}

impl ReceiveSettings {
    fn extension_period(&self) -> Duration {
        (self.ack_deadline / 2).max(Duration::from_millis(100))
    }
}

/// Delivery wrapper that settles at most once
struct Tracked {
    inner: Box<dyn Delivery>,
    settled: AtomicBool,
}

impl Tracked {
    fn new(inner: Box<dyn Delivery>) -> Self {
        Self {
            inner,
            settled: AtomicBool::new(false),
        }
    }

    fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Delivery for Tracked {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn data(&self) -> &Bytes {
        self.inner.data()
    }

    async fn ack(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.ack().await
    }

    async fn nack(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.nack().await
    }

    async fn extend(&self, lease: Duration) -> Result<()> {
        if self.is_settled() {
            return Ok(());
        }
        self.inner.extend(lease).await
    }
}

/// Receives messages until `token` is cancelled or the backend fails
///
/// `callback` runs concurrently for distinct messages and is expected to ack
/// or nack the delivery it is given; a delivery left unsettled is nacked once
/// the callback returns. Cancellation is the normal way to stop and yields
/// `Ok(())`. In both cases intake stops first and every in-flight callback is
/// joined before returning.
pub async fn receive<F, Fut>(
    source: &dyn MessageSource,
    token: CancellationToken,
    settings: &ReceiveSettings,
    callback: F,
) -> Result<()>
where
    F: Fn(Arc<dyn Delivery>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let limiter = Arc::new(Semaphore::new(settings.max_outstanding.max(1)));
    let callback = Arc::new(callback);
    let mut in_flight = JoinSet::new();

    let result = loop {
        let first = tokio::select! {
            biased;
            _ = token.cancelled() => break Ok(()),
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                reap(joined);
                continue;
            }
            permit = limiter.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break Ok(()),
            },
        };

        let mut permits = vec![first];
        while let Ok(permit) = limiter.clone().try_acquire_owned() {
            permits.push(permit);
        }

        // Dropping a pull midway could strand messages the backend already leased
        let deliveries = match source.pull(permits.len()).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                warn!(error = %e, "Pull failed, stopping intake");
                break Err(e);
            }
        };

        if token.is_cancelled() {
            if !deliveries.is_empty() {
                debug!(count = deliveries.len(), "Stopped while pulling, returning messages");
            }
            for delivery in deliveries {
                give_back(delivery.as_ref()).await;
            }
            break Ok(());
        }

        if !deliveries.is_empty() {
            debug!(count = deliveries.len(), "Received messages");
        }

        for delivery in deliveries {
            let Some(permit) = permits.pop() else {
                warn!(
                    message_id = delivery.id(),
                    "Backend returned more messages than requested, returning surplus"
                );
                give_back(delivery.as_ref()).await;
                continue;
            };

            let tracked = Arc::new(Tracked::new(delivery));
            let callback = Arc::clone(&callback);
            let settings = settings.clone();

            in_flight.spawn(async move {
                let _permit = permit;
                let work = AssertUnwindSafe(callback(Arc::clone(&tracked) as Arc<dyn Delivery>))
                    .catch_unwind();
                if let Err(panic) = with_lease(tracked.as_ref(), &settings, work).await {
                    error!(
                        message_id = tracked.id(),
                        panic = panic_message(panic.as_ref()),
                        "Message callback panicked"
                    );
                }

                if !tracked.is_settled() {
                    warn!(
                        message_id = tracked.id(),
                        "Callback returned without settling message, returning it"
                    );
                    if let Err(e) = tracked.nack().await {
                        warn!(error = %e, "Failed to return unsettled message");
                    }
                }
            });
        }
    };

    while let Some(joined) = in_flight.join_next().await {
        reap(joined);
    }

    result
}

async fn give_back(delivery: &dyn Delivery) {
    if let Err(e) = delivery.nack().await {
        warn!(message_id = delivery.id(), error = %e, "Failed to return message");
    }
}

/// Runs `work` while periodically extending the lease of `delivery`
async fn with_lease<Fut>(delivery: &dyn Delivery, settings: &ReceiveSettings, work: Fut) -> Fut::Output
where
    Fut: Future,
{
    let keeper = async {
        let period = settings.extension_period();
        let started = Instant::now();
        let mut ticker = tokio::time::interval_at(started + period, period);

        loop {
            ticker.tick().await;
            if started.elapsed() >= settings.max_extension {
                debug!(
                    message_id = delivery.id(),
                    "Maximum lease extension reached"
                );
                break;
            }
            if let Err(e) = delivery.extend(settings.ack_deadline).await {
                warn!(message_id = delivery.id(), error = %e, "Failed to extend lease");
            }
        }

        std::future::pending::<Infallible>().await
    };

    tokio::select! {
        output = work => output,
        never = keeper => match never {},
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

fn reap(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Message callback panicked");
        }
    }
}
