//! Core domain types
//!
//! These types are shared between the queue backends (which produce envelopes),
//! the handlers (which consume them) and the runner (which wires both together).

pub mod device;
pub mod queue;
pub mod report;
pub mod resource;
pub mod task;
