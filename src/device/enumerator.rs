//! Audio device enumeration and selection by configured name

use crate::audio::{AudioHost, DeviceInfo, Direction};
use crate::error::{Result, SinkError};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Device enumerator over an [`AudioHost`]
pub struct DeviceEnumerator {
    host: Arc<dyn AudioHost>,
}

impl DeviceEnumerator {
    pub fn new(host: Arc<dyn AudioHost>) -> Self {
        Self { host }
    }

    /// Enumerate all devices in one direction
    pub fn enumerate(&self, direction: Direction) -> Result<Vec<DeviceInfo>> {
        let devices = self.host.devices(direction)?;
        debug!(
            "Found {} {:?} devices on {}",
            devices.len(),
            direction,
            self.host.name()
        );
        Ok(devices)
    }

    /// Get the default device for a direction
    pub fn default_device(&self, direction: Direction) -> Result<DeviceInfo> {
        match self.host.default_device(direction)? {
            Some(device) => Ok(device),
            None => self
                .enumerate(direction)?
                .into_iter()
                .next()
                .ok_or(SinkError::NoDevices),
        }
    }

    /// Find a device by exact name
    pub fn find_by_name(&self, direction: Direction, name: &str) -> Result<DeviceInfo> {
        self.enumerate(direction)?
            .into_iter()
            .find(|device| device.name == name)
            .ok_or_else(|| SinkError::DeviceNotFound(name.to_string()))
    }

    /// Resolve the configured device name
    ///
    /// An empty name selects the default device. A name that matches nothing
    /// falls back to the default device with a warning.
    pub fn select(&self, direction: Direction, configured_name: &str) -> Result<DeviceInfo> {
        if self.host.devices(direction)?.is_empty() {
            return Err(SinkError::NoDevices);
        }

        if configured_name.is_empty() {
            let device = self.default_device(direction)?;
            info!("Using default {:?} device: {}", direction, device.name);
            return Ok(device);
        }

        match self.find_by_name(direction, configured_name) {
            Ok(device) => {
                info!("Using configured {:?} device: {}", direction, device.name);
                Ok(device)
            }
            Err(SinkError::DeviceNotFound(_)) => {
                warn!(
                    "Configured device '{}' not found. Using default.",
                    configured_name
                );
                self.default_device(direction)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;

    #[test]
    fn test_select_by_name() {
        let host = Arc::new(FakeHost::new());
        let enumerator = DeviceEnumerator::new(host);

        let device = enumerator.select(Direction::Output, "USB DAC").unwrap();
        assert_eq!(device.name, "USB DAC");
        assert!(!device.is_default);
    }

    #[test]
    fn test_empty_name_selects_default() {
        let enumerator = DeviceEnumerator::new(Arc::new(FakeHost::new()));
        let device = enumerator.select(Direction::Output, "").unwrap();
        assert!(device.is_default);
    }

    #[test]
    fn test_unknown_name_falls_back_to_default() {
        let enumerator = DeviceEnumerator::new(Arc::new(FakeHost::new()));
        let device = enumerator.select(Direction::Input, "Bluetooth Mic").unwrap();
        assert!(device.is_default);
        assert_eq!(device.direction, Direction::Input);
    }

    #[test]
    fn test_no_devices() {
        let enumerator = DeviceEnumerator::new(Arc::new(FakeHost::empty()));
        assert!(matches!(
            enumerator.select(Direction::Output, ""),
            Err(SinkError::NoDevices)
        ));
    }
}
