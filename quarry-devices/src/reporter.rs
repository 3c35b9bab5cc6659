//! Device reporter
//!
//! Initializes the accelerator driver once and serves point-in-time snapshots
//! from it. A host without a usable driver keeps running in degraded mode: the
//! initialization error is stored and replayed on every query.

use quarry_core::{Device, DeviceSnapshot};
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::error::{DeviceError, Result};

/// Source of per-device readings
pub trait DeviceDriver: Send + Sync {
    fn device_count(&self) -> Result<u32>;

    /// Reads identity and current status of the device at `index`
    fn device(&self, index: u32) -> Result<Device>;
}

pub struct DeviceReporter {
    driver: std::result::Result<Box<dyn DeviceDriver>, DeviceError>,
}

impl DeviceReporter {
    pub fn new(driver: std::result::Result<Box<dyn DeviceDriver>, DeviceError>) -> Self {
        if let Err(e) = &driver {
            warn!(error = %e, "Device telemetry unavailable, running in degraded mode");
        }
        Self { driver }
    }

    /// Process-wide reporter backed by the default driver
    ///
    /// The driver is initialized on first use and never again.
    pub fn global() -> &'static DeviceReporter {
        static REPORTER: OnceLock<DeviceReporter> = OnceLock::new();
        REPORTER.get_or_init(|| DeviceReporter::new(default_driver()))
    }

    pub fn is_available(&self) -> bool {
        self.driver.is_ok()
    }

    /// Reads every device in index order
    ///
    /// Either all devices are read or an error is returned; a snapshot is
    /// never partially populated.
    pub fn snapshot(&self) -> Result<DeviceSnapshot> {
        let driver = self.driver.as_ref().map_err(Clone::clone)?;

        let count = driver.device_count()?;
        let devices = (0..count)
            .map(|index| driver.device(index))
            .collect::<Result<Vec<_>>>()?;

        debug!(devices = devices.len(), "Read device snapshot");
        Ok(DeviceSnapshot::new(devices))
    }
}

#[cfg(feature = "nvml")]
fn default_driver() -> std::result::Result<Box<dyn DeviceDriver>, DeviceError> {
    crate::nvml::NvmlDriver::init().map(|driver| Box::new(driver) as Box<dyn DeviceDriver>)
}

#[cfg(not(feature = "nvml"))]
fn default_driver() -> std::result::Result<Box<dyn DeviceDriver>, DeviceError> {
    Err(DeviceError::Init {
        message: "built without NVML support".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeDriver {
        devices: Vec<Device>,
        fail_at: Option<u32>,
        reads: Arc<AtomicUsize>,
    }

    impl FakeDriver {
        fn with(count: usize) -> Self {
            let devices = (0..count)
                .map(|i| Device {
                    name: "Tesla T4".to_string(),
                    uuid: format!("GPU-{}", i),
                    temp: 40 + i as u32,
                    power: 30,
                    mem_total: 15360,
                    mem_used: 1024,
                    mem_free: 14336,
                })
                .collect();
            Self {
                devices,
                fail_at: None,
                reads: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl DeviceDriver for FakeDriver {
        fn device_count(&self) -> Result<u32> {
            Ok(self.devices.len() as u32)
        }

        fn device(&self, index: u32) -> Result<Device> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail_at == Some(index) {
                return Err(DeviceError::query(index, None, "power", "gpu is lost"));
            }
            Ok(self.devices[index as usize].clone())
        }
    }

    #[test]
    fn test_snapshot_in_index_order() {
        let reporter = DeviceReporter::new(Ok(Box::new(FakeDriver::with(3))));
        let snapshot = reporter.snapshot().unwrap();

        assert_eq!(snapshot.len(), 3);
        let uuids: Vec<_> = snapshot.devices.iter().map(|d| d.uuid.as_str()).collect();
        assert_eq!(uuids, vec!["GPU-0", "GPU-1", "GPU-2"]);
        assert_eq!(snapshot.free_memory(), 3 * 14336);
    }

    #[test]
    fn test_zero_devices_is_empty_snapshot() {
        let reporter = DeviceReporter::new(Ok(Box::new(FakeDriver::with(0))));
        let snapshot = reporter.snapshot().unwrap();
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_init_failure_replayed() {
        let init = DeviceError::Init {
            message: "libnvidia-ml.so.1 not found".to_string(),
        };
        let reporter = DeviceReporter::new(Err(init.clone()));

        assert!(!reporter.is_available());
        for _ in 0..3 {
            assert_eq!(reporter.snapshot().unwrap_err(), init);
        }
    }

    #[test]
    fn test_device_failure_fails_whole_snapshot() {
        let mut driver = FakeDriver::with(3);
        driver.fail_at = Some(1);
        let reads = Arc::clone(&driver.reads);
        let reporter = DeviceReporter::new(Ok(Box::new(driver)));

        let err = reporter.snapshot().unwrap_err();
        assert!(matches!(err, DeviceError::Query { index: 1, .. }));
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_global_initializes_once() {
        let first = DeviceReporter::global() as *const DeviceReporter;
        let second = DeviceReporter::global() as *const DeviceReporter;
        assert_eq!(first, second);
    }
}
