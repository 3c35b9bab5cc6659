//! Subscription worker
//!
//! Serves one subscription until its token is cancelled: probes for work,
//! runs a bounded work call, and backs off after idle cycles and errors.

use quarry_core::{MessageHandler, TaskEnvelope};
use quarry_queue::{StopReason, TaskQueue, WorkSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct SubscriptionWorker {
    queue: Arc<dyn TaskQueue>,
    subscription: String,
    project: String,
    credentials: String,
    handler: Arc<dyn MessageHandler>,
    settings: WorkSettings,
    idle_delay: Duration,
}

impl SubscriptionWorker {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        subscription: String,
        project: String,
        credentials: String,
        handler: Arc<dyn MessageHandler>,
        settings: WorkSettings,
    ) -> Self {
        Self {
            queue,
            subscription,
            project,
            credentials,
            handler,
            settings,
            idle_delay: INITIAL_BACKOFF,
        }
    }

    /// Sets how long the worker waits after finding no work
    pub fn with_idle_delay(mut self, idle_delay: Duration) -> Self {
        self.idle_delay = idle_delay;
        self
    }

    /// Envelope template for this subscription, with a responder when one can be opened
    async fn template(&self, token: &CancellationToken) -> TaskEnvelope {
        let template = TaskEnvelope::new(
            self.queue.queue_type(),
            self.project.clone(),
            self.subscription.clone(),
            self.credentials.clone(),
            Arc::clone(&self.handler),
        );

        match self.queue.responder(token, &self.subscription, None).await {
            Ok(response_q) => template.with_response_q(response_q),
            Err(e) => {
                debug!(subscription = %self.subscription, error = %e, "No responder, progress reports disabled");
                template
            }
        }
    }

    /// Runs until `token` is cancelled
    pub async fn run(self, token: CancellationToken) {
        info!(subscription = %self.subscription, "Starting subscription worker");

        let template = self.template(&token).await;
        let mut backoff = INITIAL_BACKOFF;

        while !token.is_cancelled() {
            match self.queue.has_work(&token, &self.subscription).await {
                Ok(true) => {}
                Ok(false) => {
                    pause(&token, self.idle_delay).await;
                    continue;
                }
                Err(e) => {
                    warn!(subscription = %self.subscription, error = %e, "Work probe failed");
                    pause(&token, backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            }

            match self.queue.work(&token, &self.settings, &template).await {
                Ok(outcome) => {
                    backoff = INITIAL_BACKOFF;
                    if outcome.attempted > 0 {
                        info!(
                            subscription = %self.subscription,
                            attempted = outcome.attempted,
                            stop = ?outcome.stop,
                            resource = ?outcome.resource,
                            "Work call finished"
                        );
                    }
                    match outcome.stop {
                        StopReason::Shutdown => break,
                        StopReason::HandlerFailure => pause(&token, self.idle_delay).await,
                        StopReason::Deadline if outcome.attempted == 0 => {
                            pause(&token, self.idle_delay).await
                        }
                        StopReason::Deadline => {}
                    }
                }
                Err(e) => {
                    if e.is_discovery() {
                        warn!(subscription = %self.subscription, error = %e, "Subscription unavailable");
                    } else {
                        warn!(subscription = %self.subscription, error = %e, "Work call failed");
                    }
                    pause(&token, backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        info!(subscription = %self.subscription, "Subscription worker stopped");
    }
}

/// Sleeps for `delay` or until `token` is cancelled
async fn pause(token: &CancellationToken, delay: Duration) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}
