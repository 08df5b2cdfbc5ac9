use std::collections::BTreeMap;

use time::OffsetDateTime;

use super::{
    HealthConfig, HealthEvent, MetricAssessment, Reason, ReasonCode, SubScores, suggested_actions,
};
use crate::baseline::{BaselineConfig, BaselineTable};
use crate::types::{Device, DeviceStatus, Metric, Severity, TelemetrySample};

/// Everything the engine needs to judge one device.
pub struct DeviceObservation<'a> {
    pub device: &'a Device,
    /// None when the device has never been polled.
    pub status: Option<&'a DeviceStatus>,
    pub latest: Option<&'a TelemetrySample>,
    pub baselines: &'a BaselineTable,
    pub now: OffsetDateTime,
}

/// Deterministic statistical scorer.
#[derive(Debug, Clone)]
pub struct HealthEngine {
    config: HealthConfig,
    baseline: BaselineConfig,
}

impl HealthEngine {
    pub fn new(config: HealthConfig, baseline: BaselineConfig) -> Self {
        Self { config, baseline }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Produce a verdict, or None when there is nothing to judge yet: the
    /// device was never polled, or is online without a sample.
    pub fn evaluate(&self, obs: &DeviceObservation<'_>) -> Option<HealthEvent> {
        let status = obs.status?;
        if !status.online {
            return Some(self.offline_verdict(obs, status));
        }
        let sample = obs.latest?;
        Some(self.online_verdict(obs, status, sample))
    }

    fn offline_verdict(&self, obs: &DeviceObservation<'_>, status: &DeviceStatus) -> HealthEvent {
        let reasons = vec![Reason::new(
            ReasonCode::Offline,
            Severity::Critical,
            format!(
                "unreachable for {} consecutive poll(s)",
                status.consecutive_failures
            ),
        )];
        let sub_scores = SubScores {
            uptime: status.availability() * 100.0,
            hashrate: Some(0.0),
            temperature: None,
            reject_rate: None,
        };
        let score = sub_scores
            .composite(&self.config.weights)
            .min(self.config.offline_score_cap);

        HealthEvent {
            device_id: obs.device.id.clone(),
            timestamp: obs.now,
            score,
            sub_scores,
            suggested_actions: suggested_actions(reasons.iter().map(|r| r.code)),
            reasons,
            metrics: BTreeMap::new(),
            mode: obs.device.current_mode.clone(),
        }
    }

    fn online_verdict(
        &self,
        obs: &DeviceObservation<'_>,
        status: &DeviceStatus,
        sample: &TelemetrySample,
    ) -> HealthEvent {
        let mode = sample
            .mode
            .clone()
            .or_else(|| obs.device.current_mode.clone());
        let mut reasons = Vec::new();
        let mut metrics = BTreeMap::new();
        let mut medians = BTreeMap::new();

        for metric in Metric::ALL {
            let Some(value) = metric.value(sample) else {
                continue;
            };
            let baseline = mode
                .as_ref()
                .and_then(|m| obs.baselines.get(&obs.device.id, metric, m));

            let assessment = match baseline {
                Some(b) if b.is_valid(self.baseline.min_samples) => {
                    medians.insert(metric, b.median);
                    let score = self.baseline.deviation(value, b.median, b.mad);
                    let harmful = metric.is_harmful(value - b.median);
                    match harmful
                        .then(|| self.config.thresholds(metric).classify(score))
                        .flatten()
                    {
                        Some(severity) => {
                            reasons.push(Reason::new(
                                ReasonCode::for_deviation(metric),
                                severity,
                                format!(
                                    "{metric} {value:.2} vs median {:.2} ({score:.1} robust sd)",
                                    b.median
                                ),
                            ));
                            MetricAssessment::Anomalous { score, severity }
                        }
                        None => MetricAssessment::Normal { score },
                    }
                }
                other => MetricAssessment::InsufficientData {
                    samples: other.map_or(0, |b| b.sample_count),
                },
            };
            metrics.insert(metric, assessment);
        }

        self.apply_hard_floors(sample, &mut reasons);

        let sub_scores = self.sub_scores(status, sample, &metrics, &medians, &reasons);
        let mut score = sub_scores.composite(&self.config.weights);
        if reasons.iter().any(|r| r.severity == Severity::Critical) {
            score = score.min(self.config.critical_score_cap);
        }

        HealthEvent {
            device_id: obs.device.id.clone(),
            timestamp: obs.now,
            score,
            sub_scores,
            suggested_actions: suggested_actions(reasons.iter().map(|r| r.code)),
            reasons,
            metrics,
            mode,
        }
    }

    /// Baseline-independent checks. A hard-floor code supersedes the
    /// baseline code for the same metric.
    fn apply_hard_floors(&self, sample: &TelemetrySample, reasons: &mut Vec<Reason>) {
        if let Some(temp) = sample.temperature_c {
            if temp >= self.config.temp_ceiling_c {
                reasons.retain(|r| r.code != ReasonCode::TempHigh);
                reasons.push(Reason::new(
                    ReasonCode::TempCritical,
                    Severity::Critical,
                    format!(
                        "temperature {temp:.1}C at or above ceiling {:.1}C",
                        self.config.temp_ceiling_c
                    ),
                ));
            }
        }

        if sample.hashrate_ghs <= 0.0 {
            reasons.retain(|r| r.code != ReasonCode::HashrateLow);
            reasons.push(Reason::new(
                ReasonCode::HashrateZero,
                Severity::Critical,
                "online but not hashing",
            ));
        }

        if sample.pool_in_use.is_none() {
            reasons.push(Reason::new(
                ReasonCode::NoPool,
                Severity::Warning,
                "no pool in use",
            ));
        }
    }

    fn sub_scores(
        &self,
        status: &DeviceStatus,
        sample: &TelemetrySample,
        metrics: &BTreeMap<Metric, MetricAssessment>,
        medians: &BTreeMap<Metric, f64>,
        reasons: &[Reason],
    ) -> SubScores {
        let valid = |metric: Metric| {
            metrics
                .get(&metric)
                .is_some_and(|a| !a.is_insufficient())
        };
        let has = |code: ReasonCode| reasons.iter().any(|r| r.code == code);

        let hashrate = if has(ReasonCode::HashrateZero) {
            Some(0.0)
        } else if valid(Metric::Hashrate) {
            let median = medians.get(&Metric::Hashrate).copied().unwrap_or(0.0);
            let ratio = if median > 0.0 {
                sample.hashrate_ghs / median
            } else {
                1.0
            };
            Some(100.0 * ratio.clamp(0.0, 1.0))
        } else {
            None
        };

        let ceiling = self.config.temp_ceiling_c;
        let temperature = match sample.temperature_c {
            None => None,
            Some(temp) if temp >= ceiling => Some(0.0),
            Some(temp) if valid(Metric::Temperature) => {
                let median = medians.get(&Metric::Temperature).copied().unwrap_or(temp);
                if temp <= median || median >= ceiling {
                    Some(100.0)
                } else {
                    Some(100.0 * ((ceiling - temp) / (ceiling - median)).clamp(0.0, 1.0))
                }
            }
            Some(_) => None,
        };

        let reject_rate = match sample.reject_rate() {
            Some(rate) if valid(Metric::RejectRate) => {
                let zero_at = self.config.reject_rate_zero_score.max(f64::EPSILON);
                Some(100.0 * (1.0 - rate / zero_at).clamp(0.0, 1.0))
            }
            _ => None,
        };

        let mut scores = SubScores {
            uptime: status.availability() * 100.0,
            hashrate,
            temperature,
            reject_rate,
        };

        for reason in reasons {
            let penalty = self.config.penalty(reason.severity);
            let slot = match reason.code.metric() {
                Some(Metric::Hashrate) => scores.hashrate.as_mut(),
                Some(Metric::Temperature) => scores.temperature.as_mut(),
                Some(Metric::RejectRate) => scores.reject_rate.as_mut(),
                Some(Metric::Power) | None => None,
            };
            if let Some(score) = slot {
                *score = (*score - penalty).max(0.0);
            }
        }

        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::BaselineStore;
    use crate::types::{DeviceId, DeviceType, Mode, TelemetryReading};
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-03-01 12:00 UTC);

    fn device() -> Device {
        let mut device = Device::new("rig-1", DeviceType::Bitaxe, "10.0.0.2");
        device.current_mode = Some(Mode::new("standard"));
        device
    }

    fn sample_at(at: OffsetDateTime, hashrate: f64, temp: Option<f64>) -> TelemetrySample {
        TelemetrySample::from_reading(
            DeviceId::new("rig-1"),
            at,
            Some(Mode::new("standard")),
            TelemetryReading {
                hashrate_ghs: hashrate,
                temperature_c: temp,
                power_w: Some(18.0),
                shares_accepted: 990,
                shares_rejected: 10,
                pool_in_use: Some("stratum+tcp://pool.local:3333".into()),
                ..Default::default()
            },
        )
    }

    /// Baselines from `count` samples alternating around 1000 GH/s and 60C.
    fn baselines(count: usize) -> BaselineStore {
        let store = BaselineStore::new(BaselineConfig::default());
        let samples: Vec<_> = (0..count)
            .map(|i| {
                let jitter = if i % 2 == 0 { 10.0 } else { -10.0 };
                sample_at(
                    NOW - time::Duration::minutes(i as i64 + 1),
                    1000.0 + jitter,
                    Some(60.0 + jitter / 10.0),
                )
            })
            .collect();
        store.recompute(&samples, NOW);
        store
    }

    fn engine() -> HealthEngine {
        HealthEngine::new(HealthConfig::default(), BaselineConfig::default())
    }

    fn evaluate(
        baselines: &BaselineStore,
        status: Option<&DeviceStatus>,
        latest: Option<&TelemetrySample>,
    ) -> Option<HealthEvent> {
        let table = baselines.snapshot();
        let device = device();
        engine().evaluate(&DeviceObservation {
            device: &device,
            status,
            latest,
            baselines: &table,
            now: NOW,
        })
    }

    #[test]
    fn never_polled_device_is_skipped() {
        assert!(evaluate(&baselines(40), None, None).is_none());
    }

    #[test]
    fn normal_sample_is_healthy() {
        let status = DeviceStatus::new(true, NOW);
        let latest = sample_at(NOW, 1005.0, Some(60.5));
        let verdict = evaluate(&baselines(40), Some(&status), Some(&latest)).unwrap();

        assert!(verdict.reasons.is_empty(), "{:?}", verdict.reasons);
        assert!(verdict.score > 90.0, "score {}", verdict.score);
        assert!(matches!(
            verdict.metrics[&Metric::Hashrate],
            MetricAssessment::Normal { .. }
        ));
    }

    #[test]
    fn insufficient_baseline_is_never_anomalous() {
        let status = DeviceStatus::new(true, NOW);
        // Far outside anything seen, but only 5 samples of history.
        let latest = sample_at(NOW, 100.0, Some(85.0));
        let verdict = evaluate(&baselines(5), Some(&status), Some(&latest)).unwrap();

        for metric in [Metric::Hashrate, Metric::Temperature, Metric::RejectRate] {
            assert_eq!(
                verdict.metrics[&metric],
                MetricAssessment::InsufficientData { samples: 5 },
                "{metric}"
            );
        }
        assert!(!verdict.has_reason(ReasonCode::HashrateLow));
        assert!(!verdict.has_reason(ReasonCode::TempHigh));
        // Excluded, not penalized.
        assert_eq!(verdict.sub_scores.hashrate, None);
        assert_eq!(verdict.sub_scores.temperature, None);
        assert_eq!(verdict.score, 100.0);
    }

    #[test]
    fn low_hashrate_raises_reason_with_tiered_severity() {
        let status = DeviceStatus::new(true, NOW);
        let store = baselines(40);

        let mild = sample_at(NOW, 940.0, Some(60.0));
        let verdict = evaluate(&store, Some(&status), Some(&mild)).unwrap();
        let reason = verdict
            .reasons
            .iter()
            .find(|r| r.code == ReasonCode::HashrateLow)
            .unwrap();
        assert_eq!(reason.severity, Severity::Warning);

        let severe = sample_at(NOW, 700.0, Some(60.0));
        let verdict = evaluate(&store, Some(&status), Some(&severe)).unwrap();
        let reason = verdict
            .reasons
            .iter()
            .find(|r| r.code == ReasonCode::HashrateLow)
            .unwrap();
        assert_eq!(reason.severity, Severity::Critical);
        assert!(!verdict.is_healthy(60.0));
    }

    #[test]
    fn high_hashrate_is_not_a_problem() {
        let status = DeviceStatus::new(true, NOW);
        let latest = sample_at(NOW, 1500.0, Some(60.0));
        let verdict = evaluate(&baselines(40), Some(&status), Some(&latest)).unwrap();
        assert!(!verdict.has_reason(ReasonCode::HashrateLow));
        assert_eq!(verdict.sub_scores.hashrate, Some(100.0));
    }

    #[test]
    fn temperature_ceiling_applies_without_baseline() {
        let status = DeviceStatus::new(true, NOW);
        let latest = sample_at(NOW, 1000.0, Some(95.0));
        let verdict = evaluate(&baselines(3), Some(&status), Some(&latest)).unwrap();

        assert!(verdict.has_reason(ReasonCode::TempCritical));
        assert!(!verdict.has_reason(ReasonCode::TempHigh));
        assert_eq!(verdict.sub_scores.temperature, Some(0.0));
        assert!(verdict.score <= HealthConfig::default().critical_score_cap);
        assert!(
            verdict
                .suggested_actions
                .contains(&crate::health::SuggestedAction::ApplyEcoMode)
        );
    }

    #[test]
    fn sensorless_device_redistributes_temperature_weight() {
        let status = DeviceStatus::new(true, NOW);
        let latest = sample_at(NOW, 1000.0, None);
        let verdict = evaluate(&baselines(40), Some(&status), Some(&latest)).unwrap();

        assert_eq!(verdict.sub_scores.temperature, None);
        assert!(!verdict.metrics.contains_key(&Metric::Temperature));
        // uptime 100, hashrate 100, reject rate 90 over the remaining 0.80
        let expected = (30.0 + 35.0 + 0.15 * 90.0) / 0.80;
        assert!((verdict.score - expected).abs() < 1e-9, "score {}", verdict.score);
    }

    #[test]
    fn zero_hashrate_is_critical() {
        let status = DeviceStatus::new(true, NOW);
        let latest = sample_at(NOW, 0.0, Some(60.0));
        let verdict = evaluate(&baselines(40), Some(&status), Some(&latest)).unwrap();

        assert!(verdict.has_reason(ReasonCode::HashrateZero));
        assert!(!verdict.has_reason(ReasonCode::HashrateLow));
        assert_eq!(verdict.sub_scores.hashrate, Some(0.0));
    }

    #[test]
    fn offline_device_is_capped_every_tick() {
        let store = baselines(40);
        let mut status = DeviceStatus::new(true, NOW);
        for _ in 0..3 {
            status.record(false, NOW);
            let verdict = evaluate(&store, Some(&status), None).unwrap();

            let offline: Vec<_> = verdict
                .reasons
                .iter()
                .filter(|r| r.code == ReasonCode::Offline)
                .collect();
            assert_eq!(offline.len(), 1);
            assert_eq!(verdict.reasons.len(), 1);
            assert!(verdict.score < 60.0, "score {}", verdict.score);
            assert!(verdict.metrics.is_empty());
        }
    }
}
