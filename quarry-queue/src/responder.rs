//! Report forwarding for `TaskQueue::responder`
//!
//! A responder is a channel whose receiving end is drained by a background
//! task into a backend specific sink. Delivery is best effort: sink failures
//! are logged and the report is dropped. The task ends once every sender has
//! been dropped.

use quarry_core::{PayloadWrapper, Report};
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{QueueError, Result};

/// Reports buffered per responder before senders have to wait
pub const RESPONSE_BUFFER: usize = 64;

/// Spawns the forwarding task for one responder channel
pub(crate) fn spawn_forwarder<S, Fut>(subscription: String, sink: S) -> mpsc::Sender<Report>
where
    S: Fn(Report) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Report>(RESPONSE_BUFFER);

    tokio::spawn(async move {
        while let Some(report) = rx.recv().await {
            if let Err(e) = sink(report).await {
                warn!(subscription = %subscription, error = %e, "Failed to deliver report, dropping it");
            }
        }
        debug!(subscription = %subscription, "Response channel closed");
    });

    tx
}

/// Serializes a report, sealing it when a wrapper is present
pub(crate) fn encode_report(
    report: &Report,
    wrapper: Option<&dyn PayloadWrapper>,
) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(report).map_err(|e| QueueError::Decode {
        what: "report",
        message: e.to_string(),
    })?;

    match wrapper {
        Some(wrapper) => wrapper.seal_report(&body).map_err(|e| QueueError::Decode {
            what: "sealed report",
            message: format!("{:#}", e),
        }),
        None => Ok(body),
    }
}
