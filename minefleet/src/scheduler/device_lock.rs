use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::types::DeviceId;

/// One async mutex per device.
///
/// Held around every mutation of a device's control state (mode, pool,
/// restart) so two jobs never interleave commands to the same device.
/// Devices never contend with each other.
#[derive(Default)]
pub struct DeviceLocks {
    locks: Mutex<HashMap<DeviceId, Arc<AsyncMutex<()>>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &DeviceId) -> Arc<AsyncMutex<()>> {
        self.locks.lock().entry(id.clone()).or_default().clone()
    }

    pub async fn lock(&self, id: &DeviceId) -> OwnedMutexGuard<()> {
        self.slot(id).lock_owned().await
    }

    pub fn try_lock(&self, id: &DeviceId) -> Option<OwnedMutexGuard<()>> {
        self.slot(id).try_lock_owned().ok()
    }
}
