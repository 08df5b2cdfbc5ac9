use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{DeviceId, Mode};

/// What a driver reports for a single poll, before the control loop stamps
/// it with identity and time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    /// Hashrate in GH/s.
    pub hashrate_ghs: f64,
    /// None when the hardware has no temperature sensor.
    pub temperature_c: Option<f64>,
    pub power_w: Option<f64>,
    pub shares_accepted: u64,
    pub shares_rejected: u64,
    /// Pool URL the device is currently hashing on.
    pub pool_in_use: Option<String>,
    /// Mode as reported by the device, if it reports one.
    pub mode: Option<Mode>,
    /// Vendor-specific fields, passed through untouched.
    #[serde(default)]
    pub extras: serde_json::Map<String, serde_json::Value>,
}

/// Immutable, timestamped telemetry for one poll of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub device_id: DeviceId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Mode the device was in when sampled. Baselines are conditioned on it.
    pub mode: Option<Mode>,
    pub hashrate_ghs: f64,
    pub temperature_c: Option<f64>,
    pub power_w: Option<f64>,
    pub shares_accepted: u64,
    pub shares_rejected: u64,
    pub pool_in_use: Option<String>,
    #[serde(default)]
    pub extras: serde_json::Map<String, serde_json::Value>,
}

impl TelemetrySample {
    /// Stamp a reading. The device-reported mode wins over the mode the
    /// store believes is current.
    pub fn from_reading(
        device_id: DeviceId,
        timestamp: OffsetDateTime,
        fallback_mode: Option<Mode>,
        reading: TelemetryReading,
    ) -> Self {
        Self {
            device_id,
            timestamp,
            mode: reading.mode.or(fallback_mode),
            hashrate_ghs: reading.hashrate_ghs,
            temperature_c: reading.temperature_c,
            power_w: reading.power_w,
            shares_accepted: reading.shares_accepted,
            shares_rejected: reading.shares_rejected,
            pool_in_use: reading.pool_in_use,
            extras: reading.extras,
        }
    }

    /// Rejected share fraction, or None before any share was submitted.
    pub fn reject_rate(&self) -> Option<f64> {
        let total = self.shares_accepted + self.shares_rejected;
        if total == 0 {
            None
        } else {
            Some(self.shares_rejected as f64 / total as f64)
        }
    }
}

/// Telemetry quantities that carry baselines.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Metric {
    Hashrate,
    Temperature,
    Power,
    RejectRate,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::Hashrate,
        Metric::Temperature,
        Metric::Power,
        Metric::RejectRate,
    ];

    pub fn value(self, sample: &TelemetrySample) -> Option<f64> {
        match self {
            Metric::Hashrate => Some(sample.hashrate_ghs),
            Metric::Temperature => sample.temperature_c,
            Metric::Power => sample.power_w,
            Metric::RejectRate => sample.reject_rate(),
        }
    }

    /// Whether a signed deviation from the median points the bad way.
    ///
    /// Low hashrate, high temperature and high reject rate are harmful;
    /// power is flagged in either direction.
    pub fn is_harmful(self, signed_deviation: f64) -> bool {
        match self {
            Metric::Hashrate => signed_deviation < 0.0,
            Metric::Temperature | Metric::RejectRate => signed_deviation > 0.0,
            Metric::Power => signed_deviation != 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn sample(accepted: u64, rejected: u64) -> TelemetrySample {
        TelemetrySample::from_reading(
            DeviceId::new("rig-1"),
            datetime!(2026-01-01 00:00 UTC),
            Some(Mode::new("standard")),
            TelemetryReading {
                hashrate_ghs: 1000.0,
                shares_accepted: accepted,
                shares_rejected: rejected,
                ..Default::default()
            },
        )
    }

    #[test]
    fn reject_rate_is_none_without_shares() {
        assert_eq!(sample(0, 0).reject_rate(), None);
        assert_eq!(sample(98, 2).reject_rate(), Some(0.02));
    }

    #[test]
    fn reported_mode_overrides_fallback() {
        let reading = TelemetryReading {
            mode: Some(Mode::new("eco")),
            ..Default::default()
        };
        let s = TelemetrySample::from_reading(
            DeviceId::new("rig-1"),
            datetime!(2026-01-01 00:00 UTC),
            Some(Mode::new("turbo")),
            reading,
        );
        assert_eq!(s.mode, Some(Mode::new("eco")));
    }

    #[test]
    fn harmful_direction_per_metric() {
        assert!(Metric::Hashrate.is_harmful(-1.0));
        assert!(!Metric::Hashrate.is_harmful(1.0));
        assert!(Metric::Temperature.is_harmful(1.0));
        assert!(!Metric::Temperature.is_harmful(-1.0));
        assert!(Metric::Power.is_harmful(-1.0));
        assert!(Metric::Power.is_harmful(1.0));
    }
}
