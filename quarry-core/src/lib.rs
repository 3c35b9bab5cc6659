//! Quarry Core
//!
//! Core types shared by the queue backends, the device reporter and the runner.
//!
//! This crate contains:
//! - Queue descriptors and the queue-type tag used to select a backend
//! - The task envelope threaded through a message handler, and the handler contract
//! - Resource, report and device telemetry records

pub mod domain;

pub use domain::device::{Device, DeviceSnapshot};
pub use domain::queue::{QueueDesc, QueueType};
pub use domain::report::{Report, ReportPayload};
pub use domain::resource::Resource;
pub use domain::task::{
    FnHandler, HandlerOutcome, MessageHandler, PayloadWrapper, TaskEnvelope, short_name,
};
