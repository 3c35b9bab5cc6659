//! NVIDIA driver backed telemetry

use nvml_wrapper::Nvml;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use quarry_core::Device;

use crate::error::{DeviceError, Result};
use crate::reporter::DeviceDriver;

const BYTES_PER_MIB: u64 = 1024 * 1024;

pub struct NvmlDriver {
    nvml: Nvml,
}

impl NvmlDriver {
    /// Loads the NVML library and initializes it
    pub fn init() -> Result<Self> {
        let nvml = Nvml::init().map_err(|e| DeviceError::Init {
            message: e.to_string(),
        })?;
        Ok(Self { nvml })
    }
}

impl DeviceDriver for NvmlDriver {
    fn device_count(&self) -> Result<u32> {
        self.nvml.device_count().map_err(|e| DeviceError::Count {
            message: e.to_string(),
        })
    }

    fn device(&self, index: u32) -> Result<Device> {
        let device = self
            .nvml
            .device_by_index(index)
            .map_err(|e| DeviceError::query(index, None, "handle", e))?;

        let uuid = device
            .uuid()
            .map_err(|e| DeviceError::query(index, None, "uuid", e))?;
        let query = |field: &'static str, e: nvml_wrapper::error::NvmlError| {
            DeviceError::query(index, Some(&uuid), field, e)
        };

        let name = device.name().map_err(|e| query("name", e))?;
        let temp = device
            .temperature(TemperatureSensor::Gpu)
            .map_err(|e| query("temperature", e))?;
        let milliwatts = device.power_usage().map_err(|e| query("power", e))?;
        let memory = device.memory_info().map_err(|e| query("memory", e))?;

        let mem_used = memory.used / BYTES_PER_MIB;
        let mem_free = memory.free / BYTES_PER_MIB;

        Ok(Device {
            name,
            temp,
            power: milliwatts / 1000,
            mem_total: mem_used + mem_free,
            mem_used,
            mem_free,
            uuid,
        })
    }
}
