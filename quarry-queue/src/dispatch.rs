//! Worker dispatch loop
//!
//! Shared by every backend's `work`. Two cancellation domains are in play:
//! - `ctx`, the caller's process-wide context, which handlers also receive
//! - an internal receive context that ends this call, cancelled by the
//!   timeout, by `ctx`, or by a handler nack
//!
//! The watcher merging them runs joined with the receive loop, so it cannot
//! outlive the call.

use futures::FutureExt;
use quarry_core::{HandlerOutcome, Resource, TaskEnvelope};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::queue::{StopReason, WorkOutcome, WorkSettings};
use crate::receive::{Delivery, MessageSource, ReceiveSettings, panic_message, receive};

/// State shared by concurrent handler invocations of one call
struct Dispatcher {
    ctx: CancellationToken,
    receive_ctx: CancellationToken,
    template: TaskEnvelope,
    attempted: AtomicU64,
    last_resource: Mutex<Option<Resource>>,
    stop: OnceLock<StopReason>,
}

impl Dispatcher {
    fn stop(&self, reason: StopReason) {
        let _ = self.stop.set(reason);
        self.receive_ctx.cancel();
    }

    async fn dispatch(&self, delivery: Arc<dyn Delivery>) {
        let subscription = self.template.subscription.as_str();

        if self.ctx.is_cancelled() || self.receive_ctx.is_cancelled() {
            debug!(
                subscription,
                message_id = delivery.id(),
                "Receive stopped, returning message without handling it"
            );
            if let Err(e) = delivery.nack().await {
                warn!(subscription, error = %e, "Failed to return message");
            }
            return;
        }

        let task = self.template.for_delivery(delivery.data().clone());
        let outcome = AssertUnwindSafe(task.handler.handle(self.ctx.clone(), &task))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                error!(
                    subscription,
                    message_id = delivery.id(),
                    panic = panic_message(panic.as_ref()),
                    "Handler panicked"
                );
                HandlerOutcome::nack(None)
            });

        if let Some(e) = &outcome.error {
            warn!(
                subscription,
                message_id = delivery.id(),
                ack = outcome.ack,
                error = %format!("{:#}", e),
                "Handler reported an error"
            );
        }

        if outcome.ack {
            if let Err(e) = delivery.ack().await {
                warn!(subscription, message_id = delivery.id(), error = %e, "Failed to acknowledge message");
            }
            if let Some(resource) = outcome.resource {
                *self
                    .last_resource
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(resource);
            }
        } else {
            if let Err(e) = delivery.nack().await {
                warn!(subscription, message_id = delivery.id(), error = %e, "Failed to return message");
            }
            info!(
                subscription,
                message_id = delivery.id(),
                "Handler declined message, stopping intake"
            );
            self.stop(StopReason::HandlerFailure);
        }

        self.attempted.fetch_add(1, Ordering::SeqCst);
    }
}

/// Receives from `source` and dispatches every message to `task.handler`
///
/// The backend connection must already be open. Handlers run with `ctx`, so a
/// message already being handled finishes even after intake has stopped.
pub(crate) async fn work(
    source: &dyn MessageSource,
    ctx: &CancellationToken,
    settings: &WorkSettings,
    task: &TaskEnvelope,
) -> Result<WorkOutcome> {
    let dispatcher = Arc::new(Dispatcher {
        ctx: ctx.clone(),
        receive_ctx: CancellationToken::new(),
        template: task.clone(),
        attempted: AtomicU64::new(0),
        last_resource: Mutex::new(None),
        stop: OnceLock::new(),
    });

    if ctx.is_cancelled() {
        dispatcher.stop(StopReason::Shutdown);
    }

    let receive_settings = ReceiveSettings {
        max_outstanding: settings.max_jobs,
        max_extension: settings.max_extension,
        ack_deadline: settings.ack_deadline,
    };

    let watcher = async {
        tokio::select! {
            biased;
            _ = dispatcher.receive_ctx.cancelled() => {}
            _ = ctx.cancelled() => dispatcher.stop(StopReason::Shutdown),
            _ = tokio::time::sleep(settings.timeout) => dispatcher.stop(StopReason::Deadline),
        }
    };

    let receiving = async {
        let callback = {
            let dispatcher = Arc::clone(&dispatcher);
            move |delivery: Arc<dyn Delivery>| {
                let dispatcher = Arc::clone(&dispatcher);
                async move { dispatcher.dispatch(delivery).await }
            }
        };
        let result = receive(
            source,
            dispatcher.receive_ctx.clone(),
            &receive_settings,
            callback,
        )
        .await;
        dispatcher.receive_ctx.cancel();
        result
    };

    let (result, ()) = tokio::join!(receiving, watcher);

    let attempted = dispatcher.attempted.load(Ordering::SeqCst);
    if let Err(e) = result {
        warn!(
            subscription = %task.subscription,
            attempted,
            error = %e,
            "Receive failed"
        );
        return Err(e);
    }

    let resource = dispatcher
        .last_resource
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    let stop = dispatcher
        .stop
        .get()
        .copied()
        .unwrap_or(StopReason::Deadline);

    debug!(
        subscription = %task.subscription,
        attempted,
        stop = ?stop,
        "Work call finished"
    );

    Ok(WorkOutcome {
        attempted,
        resource,
        stop,
    })
}
