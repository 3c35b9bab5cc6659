//! Accelerator telemetry for admission decisions
//!
//! `DeviceReporter` serves `DeviceSnapshot`s from a `DeviceDriver`. With the
//! default `nvml` feature the process-wide reporter reads NVIDIA GPUs through
//! NVML; hosts without the driver get a reporter that replays the
//! initialization error.

pub mod error;
#[cfg(feature = "nvml")]
pub mod nvml;
mod reporter;

pub use error::{DeviceError, Result};
#[cfg(feature = "nvml")]
pub use nvml::NvmlDriver;
pub use reporter::{DeviceDriver, DeviceReporter};
