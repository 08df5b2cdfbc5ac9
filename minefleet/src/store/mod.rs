//! Configuration and history persistence.
//!
//! [`Store`] is the contract the control loop relies on: CRUD for
//! configuration records and append-only logs for telemetry, verdicts,
//! pool probes, prices and audit events. Reads return owned copies, so no
//! caller ever holds a store lock across device I/O.

mod memory;

pub use memory::{MemoryStore, Retention};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

use crate::energy::EnergyBand;
use crate::error::Result;
use crate::health::HealthEvent;
use crate::pool::{Pool, PoolHealthSample, PoolId};
use crate::rules::AutomationRule;
use crate::types::{Device, DeviceId, DeviceStatus, Event, Mode, TelemetrySample};

/// Fleet-wide switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Price-driven mode optimization through the energy band table.
    pub auto_optimize: bool,
    /// Offset used to read time-of-day rule windows, in minutes east of UTC.
    pub utc_offset_minutes: i16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_optimize: false,
            utc_offset_minutes: 0,
        }
    }
}

impl Settings {
    pub fn utc_offset(&self) -> UtcOffset {
        UtcOffset::from_whole_seconds(i32::from(self.utc_offset_minutes) * 60)
            .unwrap_or(UtcOffset::UTC)
    }
}

/// Energy price observed at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub price: f64,
}

pub trait Store: Send + Sync {
    fn devices(&self) -> Vec<Device>;
    fn device(&self, id: &DeviceId) -> Option<Device>;
    fn upsert_device(&self, device: Device);
    fn remove_device(&self, id: &DeviceId) -> Result<()>;
    /// Record a completed mode change.
    fn set_device_mode(&self, id: &DeviceId, mode: Mode, at: OffsetDateTime) -> Result<()>;

    fn pools(&self) -> Vec<Pool>;
    fn pool(&self, id: &PoolId) -> Option<Pool>;
    fn upsert_pool(&self, pool: Pool);
    fn remove_pool(&self, id: &PoolId) -> Result<()>;

    /// Bands ordered by `sort_order`.
    fn bands(&self) -> Vec<EnergyBand>;
    fn replace_bands(&self, bands: Vec<EnergyBand>);

    /// Rules ordered by priority, then name.
    fn rules(&self) -> Vec<AutomationRule>;
    fn rule(&self, name: &str) -> Option<AutomationRule>;
    fn upsert_rule(&self, rule: AutomationRule);
    fn remove_rule(&self, name: &str) -> Result<()>;

    fn settings(&self) -> Settings;
    fn put_settings(&self, settings: Settings);

    /// Append a sample. Returns false (and stores nothing) when the sample
    /// is older than the device's latest one.
    fn append_telemetry(&self, sample: TelemetrySample) -> bool;
    fn latest_telemetry(&self, id: &DeviceId) -> Option<TelemetrySample>;
    /// All retained samples at or after `since`, every device.
    fn telemetry_since(&self, since: OffsetDateTime) -> Vec<TelemetrySample>;

    fn record_poll(&self, id: &DeviceId, online: bool, at: OffsetDateTime);
    fn device_status(&self, id: &DeviceId) -> Option<DeviceStatus>;

    fn append_health(&self, event: HealthEvent);
    fn latest_health(&self, id: &DeviceId) -> Option<HealthEvent>;
    /// Latest verdict per device.
    fn current_health(&self) -> Vec<HealthEvent>;
    fn health_history(&self, id: &DeviceId) -> Vec<HealthEvent>;

    fn append_pool_health(&self, sample: PoolHealthSample);
    fn pool_health(&self, id: &PoolId) -> Vec<PoolHealthSample>;

    fn record_price(&self, point: PricePoint);
    fn latest_price(&self) -> Option<PricePoint>;

    fn append_event(&self, event: Event);
    fn events(&self) -> Vec<Event>;
}
