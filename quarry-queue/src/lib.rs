//! Quarry queue backends
//!
//! A uniform `TaskQueue` contract over message queue technologies, and the
//! dispatch loop every backend shares: flow-controlled concurrent delivery,
//! lease extension, and fail-fast intake shutdown once a handler nacks.
//!
//! # Example
//!
//! ```no_run
//! use quarry_core::{FnHandler, HandlerOutcome, QueueDesc, QueueType, TaskEnvelope};
//! use quarry_queue::{BackendOptions, WorkSettings, open_queue};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let desc = QueueDesc::new("local", "/var/spool/quarry", "");
//! let queue = open_queue(QueueType::File, &desc, &BackendOptions::default())?;
//!
//! let handler = Arc::new(FnHandler::new(|_ctx, _task| async { HandlerOutcome::ack(None) }));
//! let task = TaskEnvelope::new(QueueType::File, "local", "train", "", handler);
//! let outcome = queue
//!     .work(&CancellationToken::new(), &WorkSettings::new(Duration::from_secs(30), 4), &task)
//!     .await?;
//! println!("attempted {} messages", outcome.attempted);
//! # Ok(())
//! # }
//! ```

mod dispatch;
pub mod error;
pub mod file;
pub mod memory;
pub mod pubsub;
mod queue;
pub mod receive;
mod responder;

pub use error::{QueueError, Result};
pub use file::{FileQueue, FileQueueConfig};
pub use memory::{MemoryBroker, MemoryQueue, SubscriptionStats};
pub use pubsub::{PubSub, PubSubConfig};
pub use queue::{
    BackendOptions, DEFAULT_ACK_DEADLINE, DEFAULT_MAX_EXTENSION, StopReason, TaskQueue,
    WorkOutcome, WorkSettings, matches_filters, open_queue,
};
pub use receive::{Delivery, MessageSource, ReceiveSettings, receive};
pub use responder::RESPONSE_BUFFER;
