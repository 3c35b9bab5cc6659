//! Resource usage record returned by handlers

use serde::{Deserialize, Serialize};

/// Resources consumed (or requested) by one unit of work
///
/// Quantities that carry units (disk, memory) are kept as the human readable
/// strings the job payloads use, e.g. "10gb".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub cpus: u32,
    #[serde(default)]
    pub gpus: u32,
    #[serde(default)]
    pub hdd: String,
    #[serde(default)]
    pub ram: String,
    #[serde(default, rename = "gpuMem")]
    pub gpu_mem: String,
}
