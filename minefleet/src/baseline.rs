//! Mode-conditioned robust baselines.
//!
//! For every (device, metric, mode) the store keeps the median and the
//! median absolute deviation (MAD) of the samples taken in that mode within
//! a trailing window. MAD is used instead of standard deviation so a single
//! overheat or hashrate dip does not widen the baseline and hide the next
//! one.
//!
//! Recompute builds a fresh table and swaps it in behind an `Arc`;
//! readers take a snapshot and never hold the lock while scoring.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::types::{DeviceId, Metric, Mode, TelemetrySample};

/// Normalizes MAD to a standard-deviation equivalent for normal data.
pub const MAD_SCALE: f64 = 1.4826;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// Trailing window of samples a baseline is computed from.
    pub window_hours: u64,
    /// Samples required before a baseline is used for scoring.
    pub min_samples: usize,
    /// Lower bound on MAD relative to |median|. Steady metrics have a MAD
    /// of zero, which would make any change look infinitely anomalous.
    pub mad_floor_ratio: f64,
    /// Absolute lower bound on MAD.
    pub mad_floor_abs: f64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            window_hours: 24,
            min_samples: 30,
            mad_floor_ratio: 0.01,
            mad_floor_abs: 1e-3,
        }
    }
}

impl BaselineConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_hours * 3600)
    }

    /// MAD after applying the floors.
    pub fn effective_mad(&self, median: f64, mad: f64) -> f64 {
        mad.max(median.abs() * self.mad_floor_ratio)
            .max(self.mad_floor_abs)
    }

    /// Robust deviation score: `|value - median| / (MAD * MAD_SCALE)`.
    ///
    /// Monotonically non-decreasing in `|value - median|` for a fixed MAD.
    pub fn deviation(&self, value: f64, median: f64, mad: f64) -> f64 {
        (value - median).abs() / (self.effective_mad(median, mad) * MAD_SCALE)
    }
}

/// Robust summary of one metric in one mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub median: f64,
    pub mad: f64,
    pub sample_count: usize,
    /// Span of the window the baseline was computed over.
    pub window: Duration,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
}

impl Baseline {
    /// Build from raw values. None for an empty set.
    pub fn from_values(
        values: &mut [f64],
        window: Duration,
        computed_at: OffsetDateTime,
    ) -> Option<Self> {
        let median = median(values)?;
        let mad = median_absolute_deviation(values, median);
        Some(Self {
            median,
            mad,
            sample_count: values.len(),
            window,
            computed_at,
        })
    }

    pub fn is_valid(&self, min_samples: usize) -> bool {
        self.sample_count >= min_samples
    }
}

/// Median of `values`, which is sorted in place. None when empty.
pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

pub fn median_absolute_deviation(values: &[f64], median_value: f64) -> f64 {
    let mut deviations: Vec<f64> = values.iter().map(|v| (v - median_value).abs()).collect();
    median(&mut deviations).unwrap_or(0.0)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    device_id: DeviceId,
    metric: Metric,
    mode: Mode,
}

/// Immutable set of baselines from one recompute.
#[derive(Debug, Default)]
pub struct BaselineTable {
    entries: HashMap<Key, Baseline>,
}

impl BaselineTable {
    /// Group samples by device, metric and mode, and summarize each group.
    /// Samples without a known mode are skipped.
    pub fn build(samples: &[TelemetrySample], window: Duration, now: OffsetDateTime) -> Self {
        let mut groups: HashMap<Key, Vec<f64>> = HashMap::new();
        for sample in samples {
            let Some(mode) = &sample.mode else {
                continue;
            };
            for metric in Metric::ALL {
                let Some(value) = metric.value(sample) else {
                    continue;
                };
                if !value.is_finite() {
                    continue;
                }
                groups
                    .entry(Key {
                        device_id: sample.device_id.clone(),
                        metric,
                        mode: mode.clone(),
                    })
                    .or_default()
                    .push(value);
            }
        }

        let entries = groups
            .into_iter()
            .filter_map(|(key, mut values)| {
                Baseline::from_values(&mut values, window, now).map(|b| (key, b))
            })
            .collect();

        Self { entries }
    }

    pub fn get(&self, device_id: &DeviceId, metric: Metric, mode: &Mode) -> Option<&Baseline> {
        self.entries.get(&Key {
            device_id: device_id.clone(),
            metric,
            mode: mode.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Holder of the current baseline table.
pub struct BaselineStore {
    config: BaselineConfig,
    table: RwLock<Arc<BaselineTable>>,
}

impl BaselineStore {
    pub fn new(config: BaselineConfig) -> Self {
        Self {
            config,
            table: RwLock::new(Arc::new(BaselineTable::default())),
        }
    }

    pub fn config(&self) -> &BaselineConfig {
        &self.config
    }

    /// Start of the trailing window ending at `now`.
    pub fn window_start(&self, now: OffsetDateTime) -> OffsetDateTime {
        now - self.config.window()
    }

    /// Rebuild from samples and swap the table in. Samples outside the
    /// window are ignored. Returns the number of baselines.
    pub fn recompute(&self, samples: &[TelemetrySample], now: OffsetDateTime) -> usize {
        let start = self.window_start(now);
        let resident: Vec<TelemetrySample> = samples
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp <= now)
            .cloned()
            .collect();
        let table = BaselineTable::build(&resident, self.config.window(), now);
        let count = table.len();
        *self.table.write() = Arc::new(table);
        count
    }

    pub fn snapshot(&self) -> Arc<BaselineTable> {
        self.table.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TelemetryReading;
    use test_case::test_case;
    use time::macros::datetime;

    fn sample(mode: &str, hashrate: f64, at: OffsetDateTime) -> TelemetrySample {
        TelemetrySample::from_reading(
            DeviceId::new("rig-1"),
            at,
            Some(Mode::new(mode)),
            TelemetryReading {
                hashrate_ghs: hashrate,
                temperature_c: Some(60.0),
                ..Default::default()
            },
        )
    }

    #[test_case(&[], None; "empty")]
    #[test_case(&[3.0], Some(3.0); "single")]
    #[test_case(&[5.0, 1.0, 3.0], Some(3.0); "odd")]
    #[test_case(&[4.0, 1.0, 3.0, 2.0], Some(2.5); "even")]
    fn median_cases(values: &[f64], expected: Option<f64>) {
        let mut values = values.to_vec();
        assert_eq!(median(&mut values), expected);
    }

    #[test]
    fn mad_ignores_single_outlier() {
        let values = [10.0, 10.0, 11.0, 9.0, 10.0, 500.0];
        let mut sorted = values.to_vec();
        let m = median(&mut sorted).unwrap();
        assert_eq!(m, 10.0);
        assert_eq!(median_absolute_deviation(&values, m), 0.5);
    }

    #[test]
    fn deviation_is_monotonic_in_distance() {
        let config = BaselineConfig::default();
        let median = 1000.0;
        let mad = 20.0;
        let mut previous = 0.0;
        for step in 0..200 {
            let distance = step as f64 * 5.0;
            let below = config.deviation(median - distance, median, mad);
            let above = config.deviation(median + distance, median, mad);
            assert_eq!(below, above);
            assert!(below >= previous);
            previous = below;
        }
    }

    #[test]
    fn zero_mad_is_floored() {
        let config = BaselineConfig::default();
        let score = config.deviation(990.0, 1000.0, 0.0);
        // floor = 1% of 1000 = 10, so 10 / (10 * 1.4826)
        assert!((score - 1.0 / MAD_SCALE).abs() < 1e-9);
    }

    #[test]
    fn baselines_are_conditioned_on_mode() {
        let now = datetime!(2026-01-02 00:00 UTC);
        let mut samples = Vec::new();
        for i in 0..10 {
            let at = now - time::Duration::minutes(i);
            samples.push(sample("eco", 800.0, at));
            samples.push(sample("turbo", 1400.0, at));
        }

        let store = BaselineStore::new(BaselineConfig::default());
        store.recompute(&samples, now);
        let table = store.snapshot();

        let id = DeviceId::new("rig-1");
        let eco = table.get(&id, Metric::Hashrate, &Mode::new("eco")).unwrap();
        let turbo = table
            .get(&id, Metric::Hashrate, &Mode::new("turbo"))
            .unwrap();
        assert_eq!(eco.median, 800.0);
        assert_eq!(turbo.median, 1400.0);
        assert_eq!(eco.sample_count, 10);
        assert!(!eco.is_valid(30));
        assert!(eco.is_valid(10));
    }

    #[test]
    fn samples_outside_window_are_ignored() {
        let now = datetime!(2026-01-02 00:00 UTC);
        let samples = vec![
            sample("eco", 800.0, now - time::Duration::hours(1)),
            sample("eco", 100.0, now - time::Duration::hours(30)),
        ];

        let store = BaselineStore::new(BaselineConfig::default());
        store.recompute(&samples, now);

        let table = store.snapshot();
        let eco = table
            .get(&DeviceId::new("rig-1"), Metric::Hashrate, &Mode::new("eco"))
            .unwrap();
        assert_eq!(eco.sample_count, 1);
        assert_eq!(eco.median, 800.0);
    }

    #[test]
    fn snapshot_survives_recompute() {
        let now = datetime!(2026-01-02 00:00 UTC);
        let store = BaselineStore::new(BaselineConfig::default());
        store.recompute(&[sample("eco", 800.0, now)], now);

        let before = store.snapshot();
        store.recompute(&[], now);

        assert_eq!(before.len(), 2);
        assert!(store.snapshot().is_empty());
    }
}
