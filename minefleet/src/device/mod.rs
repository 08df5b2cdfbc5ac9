//! Device control boundary.
//!
//! Every hardware family is reached through [`DeviceControl`], a small
//! fixed capability set. Drivers register a [`DriverDescriptor`] with
//! `inventory::submit!` and the control loop builds handles by driver name,
//! so adding a family never touches the loop itself.

pub mod simulated;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::types::{Device, Mode, TelemetryReading};

/// Failure of a single device call.
///
/// Drivers return these instead of panicking; the control loop records
/// them and moves on to the next device or the next tick.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ControlError {
    #[error("device unreachable: {0}")]
    Unreachable(String),

    #[error("device call timed out after {0:?}")]
    Timeout(Duration),

    #[error("mode {0} is not supported by the device")]
    UnsupportedMode(Mode),

    #[error("device rejected command: {0}")]
    Rejected(String),

    #[error("no driver registered as {0:?}")]
    UnknownDriver(String),
}

impl ControlError {
    /// Timeouts and unreachable devices are the same thing to the loop.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ControlError::Unreachable(_) | ControlError::Timeout(_))
    }
}

/// The capability set of a managed device.
///
/// Implementations must not block; every call is awaited under a short
/// timeout by the caller (see [`timed`]).
#[async_trait]
pub trait DeviceControl: Send + Sync {
    /// Read current telemetry.
    async fn telemetry(&self) -> Result<TelemetryReading, ControlError>;

    /// Switch the device to an operating mode.
    async fn set_mode(&self, mode: &Mode) -> Result<(), ControlError>;

    /// Modes the device currently accepts.
    async fn list_modes(&self) -> Result<Vec<Mode>, ControlError>;

    /// Point the device at another pool.
    async fn switch_pool(
        &self,
        url: &str,
        port: u16,
        user: &str,
        password: &str,
    ) -> Result<(), ControlError>;

    async fn restart(&self) -> Result<(), ControlError>;

    async fn is_online(&self) -> bool;
}

/// Await a device call with a deadline. Expiry becomes
/// [`ControlError::Timeout`].
pub async fn timed<T, F>(limit: Duration, call: F) -> Result<T, ControlError>
where
    F: Future<Output = Result<T, ControlError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ControlError::Timeout(limit)),
    }
}

/// Same as [`timed`] for `is_online`, where a timeout reads as offline.
pub async fn timed_is_online(limit: Duration, control: &dyn DeviceControl) -> bool {
    tokio::time::timeout(limit, control.is_online())
        .await
        .unwrap_or(false)
}

/// Factory function signature for building a control handle for a device.
pub type DriverFactoryFn = fn(&Device) -> Result<Arc<dyn DeviceControl>, ControlError>;

/// Driver descriptor collected by inventory.
pub struct DriverDescriptor {
    /// Name referenced by `Device::driver`.
    pub name: &'static str,
    pub create_fn: DriverFactoryFn,
}

inventory::collect!(DriverDescriptor);

/// Lookup over all registered drivers.
pub struct DriverRegistry;

impl DriverRegistry {
    pub fn find(&self, name: &str) -> Option<&'static DriverDescriptor> {
        inventory::iter::<DriverDescriptor>().find(|desc| desc.name == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        inventory::iter::<DriverDescriptor>()
            .map(|desc| desc.name)
            .collect()
    }

    /// Build the control handle for a device from its configured driver.
    pub fn create(&self, device: &Device) -> Result<Arc<dyn DeviceControl>, ControlError> {
        let desc = self
            .find(&device.driver)
            .ok_or_else(|| ControlError::UnknownDriver(device.driver.clone()))?;
        (desc.create_fn)(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceType;

    #[test]
    fn registry_finds_simulated_driver() {
        assert!(DriverRegistry.names().contains(&"simulated"));

        let device = Device::new("rig-1", DeviceType::Bitaxe, "10.0.0.2");
        assert!(DriverRegistry.create(&device).is_ok());
    }

    #[test]
    fn unknown_driver_is_an_error() {
        let mut device = Device::new("rig-1", DeviceType::Bitaxe, "10.0.0.2");
        device.driver = "nonexistent".to_string();
        assert_eq!(
            DriverRegistry.create(&device).err(),
            Some(ControlError::UnknownDriver("nonexistent".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timed_maps_expiry_to_timeout() {
        let limit = Duration::from_secs(2);
        let result: Result<(), ControlError> = timed(limit, async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(ControlError::Timeout(limit)));
        assert!(ControlError::Timeout(limit).is_connectivity());
    }
}
