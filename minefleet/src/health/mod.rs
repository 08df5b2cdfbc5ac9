//! Health verdicts.
//!
//! The [`HealthEngine`] turns the latest telemetry of a device and the
//! mode-matched baselines into a [`HealthEvent`]: a 0-100 composite score,
//! per-metric sub-scores, reason codes with severity and the suggested
//! remediation. It is a pure function of its inputs; the health sweep job
//! feeds it and persists the result.

mod engine;
mod reason;

pub use engine::{DeviceObservation, HealthEngine};
pub use reason::{Reason, ReasonCode, SuggestedAction, suggested_actions};

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::types::{DeviceId, Metric, Mode, Severity};

/// Per-metric deviation thresholds, in robust standard deviations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviationThresholds {
    pub warning: f64,
    pub critical: f64,
}

impl DeviationThresholds {
    pub fn classify(&self, score: f64) -> Option<Severity> {
        if score >= self.critical {
            Some(Severity::Critical)
        } else if score >= self.warning {
            Some(Severity::Warning)
        } else {
            None
        }
    }
}

/// Weights of the sub-scores in the composite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub uptime: f64,
    pub hashrate: f64,
    pub temperature: f64,
    pub reject_rate: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            uptime: 0.30,
            hashrate: 0.35,
            temperature: 0.20,
            reject_rate: 0.15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Absolute temperature safety ceiling; at or above it the device is
    /// `TEMP_CRITICAL` whatever its baseline says.
    pub temp_ceiling_c: f64,
    /// Composite scores below this are unhealthy.
    pub healthy_threshold: f64,
    /// Composite cap while the device is unreachable.
    pub offline_score_cap: f64,
    /// Composite cap while any critical reason is active.
    pub critical_score_cap: f64,
    /// Reject rate at which the reject sub-score reaches zero.
    pub reject_rate_zero_score: f64,
    pub warning_penalty: f64,
    pub critical_penalty: f64,
    pub weights: ScoreWeights,
    pub thresholds: BTreeMap<Metric, DeviationThresholds>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        let standard = DeviationThresholds {
            warning: 3.5,
            critical: 6.0,
        };
        Self {
            temp_ceiling_c: 90.0,
            healthy_threshold: 60.0,
            offline_score_cap: 20.0,
            critical_score_cap: 50.0,
            reject_rate_zero_score: 0.10,
            warning_penalty: 20.0,
            critical_penalty: 50.0,
            weights: ScoreWeights::default(),
            thresholds: Metric::ALL.into_iter().map(|m| (m, standard)).collect(),
        }
    }
}

impl HealthConfig {
    pub fn thresholds(&self, metric: Metric) -> DeviationThresholds {
        self.thresholds
            .get(&metric)
            .copied()
            .unwrap_or(DeviationThresholds {
                warning: 3.5,
                critical: 6.0,
            })
    }

    pub fn penalty(&self, severity: Severity) -> f64 {
        match severity {
            Severity::Info => 0.0,
            Severity::Warning => self.warning_penalty,
            Severity::Critical => self.critical_penalty,
        }
    }
}

/// How a metric fared against its baseline on this evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MetricAssessment {
    /// Baseline missing or below the minimum sample count. Unknown, never
    /// anomalous.
    InsufficientData { samples: usize },
    Normal { score: f64 },
    Anomalous { score: f64, severity: Severity },
}

impl MetricAssessment {
    pub fn is_insufficient(&self) -> bool {
        matches!(self, MetricAssessment::InsufficientData { .. })
    }
}

/// Sub-scores in [0, 100]. `None` means excluded from the composite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    pub uptime: f64,
    pub hashrate: Option<f64>,
    pub temperature: Option<f64>,
    pub reject_rate: Option<f64>,
}

impl SubScores {
    /// Weighted mean over included sub-scores; excluded weights are
    /// redistributed proportionally.
    pub fn composite(&self, weights: &ScoreWeights) -> f64 {
        let parts = [
            (Some(self.uptime), weights.uptime),
            (self.hashrate, weights.hashrate),
            (self.temperature, weights.temperature),
            (self.reject_rate, weights.reject_rate),
        ];
        let (sum, total_weight) = parts
            .iter()
            .filter_map(|(score, weight)| score.map(|s| (s * weight, *weight)))
            .fold((0.0, 0.0), |(sum, total), (ws, w)| (sum + ws, total + w));
        if total_weight <= 0.0 {
            return 0.0;
        }
        (sum / total_weight).clamp(0.0, 100.0)
    }
}

/// One health verdict for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEvent {
    pub device_id: DeviceId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub score: f64,
    pub sub_scores: SubScores,
    pub reasons: Vec<Reason>,
    pub metrics: BTreeMap<Metric, MetricAssessment>,
    pub suggested_actions: BTreeSet<SuggestedAction>,
    pub mode: Option<Mode>,
}

impl HealthEvent {
    pub fn has_reason(&self, code: ReasonCode) -> bool {
        self.reasons.iter().any(|r| r.code == code)
    }

    pub fn is_offline(&self) -> bool {
        self.has_reason(ReasonCode::Offline)
    }

    pub fn is_healthy(&self, threshold: f64) -> bool {
        self.score >= threshold
    }

    pub fn worst_severity(&self) -> Option<Severity> {
        self.reasons.iter().map(|r| r.severity).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_redistributes_missing_weights() {
        let weights = ScoreWeights::default();
        let scores = SubScores {
            uptime: 100.0,
            hashrate: Some(50.0),
            temperature: None,
            reject_rate: None,
        };
        // (100 * 0.30 + 50 * 0.35) / 0.65
        let expected = (30.0 + 17.5) / 0.65;
        assert!((scores.composite(&weights) - expected).abs() < 1e-9);
    }

    #[test]
    fn thresholds_classify_by_tier() {
        let t = DeviationThresholds {
            warning: 3.0,
            critical: 6.0,
        };
        assert_eq!(t.classify(2.9), None);
        assert_eq!(t.classify(3.0), Some(Severity::Warning));
        assert_eq!(t.classify(6.5), Some(Severity::Critical));
    }
}
