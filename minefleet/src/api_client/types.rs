//! API data transfer objects.
//!
//! These types define the API contract shared between the daemon and
//! clients.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A managed device with its latest observations.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct DeviceState {
    pub id: String,
    pub name: String,
    pub device_type: String,
    pub address: String,
    pub enabled: bool,
    pub current_mode: Option<String>,
    /// None until the device has been polled.
    pub online: Option<bool>,
    pub hashrate_ghs: Option<f64>,
    pub temperature_c: Option<f64>,
    pub pool: Option<String>,
    pub health: Option<HealthState>,
}

/// Latest health verdict of a device.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct HealthState {
    /// Composite score, 0 to 100.
    pub score: f64,
    pub reasons: Vec<String>,
    pub suggested_actions: Vec<String>,
}

/// Audit log entry.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct EventRecord {
    /// RFC 3339.
    pub timestamp: String,
    pub category: String,
    pub severity: String,
    pub device_id: Option<String>,
    pub message: String,
    #[schema(value_type = Object)]
    pub details: serde_json::Value,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct SettingsState {
    pub auto_optimize: bool,
    pub utc_offset_minutes: i16,
}

/// Partial settings update; absent fields are left alone.
#[derive(Clone, Debug, Default, Deserialize, Serialize, ToSchema)]
pub struct SettingsPatch {
    pub auto_optimize: Option<bool>,
    pub utc_offset_minutes: Option<i16>,
}

/// Partial rule update.
#[derive(Clone, Debug, Default, Deserialize, Serialize, ToSchema)]
pub struct RulePatch {
    pub enabled: Option<bool>,
    pub priority: Option<i32>,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct JobState {
    pub name: String,
    /// None for jobs that only run on demand.
    pub interval_secs: Option<u64>,
    pub running: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct FailoverResult {
    pub device_id: String,
    /// `switched`, `unchanged` or `unverified`.
    pub outcome: String,
}

/// Pool with its rolling health.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct PoolState {
    pub id: String,
    pub url: String,
    pub port: u16,
    pub priority: i32,
    pub enabled: bool,
    pub rolling_score: Option<f64>,
    pub reachable: Option<bool>,
    pub in_use_by: Vec<String>,
    pub failing: bool,
}
