use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{Pool, PoolHealthSample, PoolId, PoolStatus};
use crate::types::{AlarmStatus, DebouncedAlarm, DeviceId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Samples in the rolling score.
    pub window: usize,
    /// Rolling score below which a pool in use counts as failing.
    pub failover_threshold: f64,
    /// Consecutive failing ticks before failover fires.
    pub failover_ticks: u32,
    pub probe_timeout_ms: u64,
    /// Connect latency that scores 0.
    pub latency_zero_score_ms: f64,
    /// Reject rate that scores 0.
    pub reject_rate_zero_score: f64,
    /// Share of latency in the blended score; the rest is reject rate.
    pub latency_weight: f64,
    /// Restrict failover candidates to pools mining the current band's coin.
    pub filter_by_band_coin: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            window: 5,
            failover_threshold: 50.0,
            failover_ticks: 3,
            probe_timeout_ms: 5_000,
            latency_zero_score_ms: 1_000.0,
            reject_rate_zero_score: 0.10,
            latency_weight: 0.5,
            filter_by_band_coin: true,
        }
    }
}

/// Outcome of feeding one sample into the monitor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolVerdict {
    pub rolling_score: f64,
    pub alarm: AlarmStatus,
    /// Devices on this pool should be moved.
    pub failover: bool,
}

struct Track {
    scores: VecDeque<f64>,
    alarm: DebouncedAlarm,
    last: Option<PoolHealthSample>,
    in_use_by: Vec<DeviceId>,
}

impl Track {
    fn rolling(&self) -> Option<f64> {
        if self.scores.is_empty() {
            return None;
        }
        Some(self.scores.iter().sum::<f64>() / self.scores.len() as f64)
    }
}

/// Rolling per-pool health with debounced failover.
pub struct PoolHealthMonitor {
    config: PoolConfig,
    tracks: Mutex<HashMap<PoolId, Track>>,
}

impl PoolHealthMonitor {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            tracks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Record a probe result. `in_use_by` lists the devices currently
    /// hashing on the pool; an idle pool never triggers failover and its
    /// alarm count is discarded. Once fired, the alarm only resolves when
    /// the rolling score is back above the threshold, idle or not.
    pub fn observe(&self, sample: PoolHealthSample, in_use_by: Vec<DeviceId>) -> PoolVerdict {
        let mut tracks = self.tracks.lock();
        let track = tracks.entry(sample.pool_id.clone()).or_insert_with(|| Track {
            scores: VecDeque::with_capacity(self.config.window),
            alarm: DebouncedAlarm::new(self.config.failover_ticks),
            last: None,
            in_use_by: Vec::new(),
        });

        if track.scores.len() >= self.config.window.max(1) {
            track.scores.pop_front();
        }
        track.scores.push_back(sample.score);
        track.last = Some(sample);

        let rolling_score = track.rolling().unwrap_or(0.0);
        let below = rolling_score < self.config.failover_threshold;
        let idle = in_use_by.is_empty();
        let failing = if track.alarm.is_fired() {
            below
        } else {
            !idle && below
        };
        track.in_use_by = in_use_by;
        let alarm = track.alarm.tick(failing);

        PoolVerdict {
            rolling_score,
            alarm,
            failover: !idle && matches!(alarm, AlarmStatus::Triggered | AlarmStatus::Active),
        }
    }

    pub fn rolling_score(&self, id: &PoolId) -> Option<f64> {
        self.tracks.lock().get(id).and_then(Track::rolling)
    }

    pub fn status(&self, id: &PoolId) -> PoolStatus {
        let tracks = self.tracks.lock();
        let track = tracks.get(id);
        PoolStatus {
            pool_id: id.clone(),
            rolling_score: track.and_then(Track::rolling),
            reachable: track.and_then(|t| t.last.as_ref()).map(|s| s.reachable),
            in_use_by: track.map(|t| t.in_use_by.clone()).unwrap_or_default(),
            failing: track.is_some_and(|t| t.alarm.is_fired()),
        }
    }

    /// Failover targets for devices leaving `current`, best first.
    ///
    /// Enabled pools other than `current`, optionally restricted to
    /// `coin`, excluding pools whose last probe failed, ordered by
    /// priority, then rolling score (higher first), then latency.
    pub fn candidates(&self, pools: &[Pool], current: &PoolId, coin: Option<&str>) -> Vec<Pool> {
        let tracks = self.tracks.lock();
        let mut ranked: Vec<(Pool, f64, f64)> = pools
            .iter()
            .filter(|p| p.enabled && &p.id != current)
            .filter(|p| match coin {
                Some(coin) if self.config.filter_by_band_coin => p.mines(coin),
                _ => true,
            })
            .filter_map(|p| {
                let track = tracks.get(&p.id);
                let last = track.and_then(|t| t.last.as_ref());
                if last.is_some_and(|s| !s.reachable) {
                    return None;
                }
                let score = track.and_then(Track::rolling).unwrap_or(0.0);
                let latency = last.and_then(|s| s.latency_ms).unwrap_or(f64::INFINITY);
                Some((p.clone(), score, latency))
            })
            .collect();

        ranked.sort_by(|(a, a_score, a_lat), (b, b_score, b_lat)| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b_score.total_cmp(a_score))
                .then_with(|| a_lat.total_cmp(b_lat))
                .then_with(|| a.id.cmp(&b.id))
        });
        ranked.into_iter().map(|(pool, _, _)| pool).collect()
    }

    /// Forget the alarm state of a pool, e.g. after a manual failover.
    pub fn reset(&self, id: &PoolId) {
        if let Some(track) = self.tracks.lock().get_mut(id) {
            track.alarm.reset();
        }
    }
}
