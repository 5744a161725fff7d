//! Device catalog: lazily discovered list of device indices.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::QueryError;
use crate::executor::DeviceQueryExecutor;
use crate::parse::parse_device_list;

/// Caches the device indices reported by the query tool.
///
/// The tool is asked once; later calls return the cached list. Devices are
/// assumed stable for the lifetime of the catalog.
pub struct DeviceCatalog {
    executor: Arc<dyn DeviceQueryExecutor>,
    devices: Mutex<Option<Vec<u32>>>,
}

impl DeviceCatalog {
    pub fn new(executor: Arc<dyn DeviceQueryExecutor>) -> Self {
        Self {
            executor,
            devices: Mutex::new(None),
        }
    }

    /// Returns the sorted, duplicate-free device indices.
    ///
    /// The lock is held while the tool runs, so concurrent first callers
    /// trigger a single invocation. Failures and empty listings are not
    /// cached, so the tool is asked again until it reports a device.
    pub fn list_devices(&self) -> Result<Vec<u32>, QueryError> {
        let mut cached = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(devices) = cached.as_ref() {
            return Ok(devices.clone());
        }

        let output = self.executor.list_device_indices()?;
        let devices = parse_device_list(&output)?;
        if devices.is_empty() {
            debug!("query tool reported no devices");
            return Ok(devices);
        }
        debug!(?devices, "device catalog populated");

        *cached = Some(devices.clone());
        Ok(devices)
    }
}
