use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::{Metric, Severity};

/// Symbolic tag for a detected abnormality.
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
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Offline,
    TempCritical,
    TempHigh,
    HashrateZero,
    HashrateLow,
    RejectRateHigh,
    PowerAnomaly,
    NoPool,
}

impl ReasonCode {
    /// Metric whose sub-score this reason penalizes. `Offline` and
    /// `NoPool` affect the composite only.
    pub fn metric(self) -> Option<Metric> {
        match self {
            ReasonCode::TempCritical | ReasonCode::TempHigh => Some(Metric::Temperature),
            ReasonCode::HashrateZero | ReasonCode::HashrateLow => Some(Metric::Hashrate),
            ReasonCode::RejectRateHigh => Some(Metric::RejectRate),
            ReasonCode::PowerAnomaly => Some(Metric::Power),
            ReasonCode::Offline | ReasonCode::NoPool => None,
        }
    }

    /// Baseline-derived code raised for a harmful deviation on `metric`.
    pub fn for_deviation(metric: Metric) -> Self {
        match metric {
            Metric::Hashrate => ReasonCode::HashrateLow,
            Metric::Temperature => ReasonCode::TempHigh,
            Metric::RejectRate => ReasonCode::RejectRateHigh,
            Metric::Power => ReasonCode::PowerAnomaly,
        }
    }

    pub fn suggested_actions(self) -> &'static [SuggestedAction] {
        use SuggestedAction::*;
        match self {
            ReasonCode::Offline => &[CheckNetwork, PowerCycle],
            ReasonCode::TempCritical => &[ApplyEcoMode, CheckCooling, Restart],
            ReasonCode::TempHigh => &[CheckCooling, ApplyEcoMode],
            ReasonCode::HashrateZero => &[Restart, CheckPool],
            ReasonCode::HashrateLow => &[Restart, CheckPool],
            ReasonCode::RejectRateHigh => &[CheckPool, SwitchPool],
            ReasonCode::PowerAnomaly => &[CheckPsu],
            ReasonCode::NoPool => &[SwitchPool],
        }
    }
}

/// Operator-facing remediation hint.
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
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SuggestedAction {
    CheckNetwork,
    PowerCycle,
    Restart,
    ApplyEcoMode,
    CheckCooling,
    CheckPool,
    SwitchPool,
    CheckPsu,
}

/// Union of the suggested actions of all `codes`, deduplicated and ordered.
pub fn suggested_actions<I>(codes: I) -> BTreeSet<SuggestedAction>
where
    I: IntoIterator<Item = ReasonCode>,
{
    codes
        .into_iter()
        .flat_map(|code| code.suggested_actions().iter().copied())
        .collect()
}

/// An active reason on a verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reason {
    pub code: ReasonCode,
    pub severity: Severity,
    pub detail: String,
}

impl Reason {
    pub fn new(code: ReasonCode, severity: Severity, detail: impl Into<String>) -> Self {
        Self {
            code,
            severity,
            detail: detail.into(),
        }
    }
}
