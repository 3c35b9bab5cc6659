//! Accelerator telemetry records

use serde::{Deserialize, Serialize};

/// A point-in-time reading of one accelerator
///
/// The field set and wire names are consumed by the admission component and
/// are fixed. Temperature is in degrees Celsius, power in watts and memory in
/// MiB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "UUID")]
    pub uuid: String,
    #[serde(rename = "Temp")]
    pub temp: u32,
    #[serde(rename = "Powr")]
    pub power: u32,
    #[serde(rename = "MemTot")]
    pub mem_total: u64,
    #[serde(rename = "MemUsed")]
    pub mem_used: u64,
    #[serde(rename = "MemFree")]
    pub mem_free: u64,
}

/// One consistent enumeration of every device on the host, in index order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    #[serde(rename = "Devices")]
    pub devices: Vec<Device>,
}

impl DeviceSnapshot {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Total free accelerator memory across all devices, in MiB
    pub fn free_memory(&self) -> u64 {
        self.devices.iter().map(|d| d.mem_free).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_wire_names() {
        let device = Device {
            name: "Tesla T4".to_string(),
            uuid: "GPU-1".to_string(),
            temp: 41,
            power: 27,
            mem_total: 15360,
            mem_used: 360,
            mem_free: 15000,
        };

        let json = serde_json::to_value(&device).unwrap();
        assert_eq!(json["Name"], "Tesla T4");
        assert_eq!(json["UUID"], "GPU-1");
        assert_eq!(json["Powr"], 27);
        assert_eq!(json["MemTot"], 15360);
        assert_eq!(json.as_object().unwrap().len(), 7);
    }

    #[test]
    fn test_snapshot_free_memory() {
        let mut snapshot = DeviceSnapshot::default();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.free_memory(), 0);

        for free in [100, 250] {
            snapshot.devices.push(Device {
                name: "gpu".to_string(),
                uuid: format!("GPU-{}", free),
                temp: 30,
                power: 10,
                mem_total: free + 10,
                mem_used: 10,
                mem_free: free,
            });
        }
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.free_memory(), 350);
    }
}
