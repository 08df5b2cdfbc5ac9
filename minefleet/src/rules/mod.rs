//! Trigger/action automation rules.
//!
//! A rule is stored with an opaque JSON config for its trigger and its
//! action so new kinds can be added without touching the store. The
//! typed [`Trigger`] and [`Action`] are parsed on demand; a config that
//! fails to parse is rejected when the rule is created and reported as a
//! warning if it is ever encountered during a sweep.

mod book;
mod engine;

pub use book::RuleBook;
pub use engine::{ActionOutcome, Plan, PlannedAction, PlannedKind, RuleSnapshot, execute, plan};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Time, macros::format_description};

use crate::error::{Error, Result};
use crate::pool::PoolId;
use crate::types::{DeviceId, Mode, Severity};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    utoipa::ToSchema,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TriggerType {
    PriceThreshold,
    TimeWindow,
    DeviceOffline,
    DeviceOverheat,
    PoolFailure,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    utoipa::ToSchema,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ActionType {
    ApplyMode,
    SwitchPool,
    SendAlert,
    LogEvent,
}

/// A stored automation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct AutomationRule {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub trigger_type: TriggerType,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub trigger_config: Value,
    pub action_type: ActionType,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub action_config: Value,
    /// Lower evaluates first.
    #[serde(default)]
    pub priority: i32,
}

fn default_true() -> bool {
    true
}

/// Parsed trigger condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Matches while every set bound holds: `price >= above`, `price < below`.
    Price {
        above: Option<f64>,
        below: Option<f64>,
    },
    /// Local time of day in `[start, end)`, wrapping past midnight when
    /// `end < start`. `start == end` covers the whole day.
    TimeWindow { start: Time, end: Time },
    DeviceOffline { device_id: Option<DeviceId> },
    /// Without a threshold the device's temperature reason codes decide.
    DeviceOverheat {
        device_id: Option<DeviceId>,
        threshold_c: Option<f64>,
    },
    PoolFailure { pool_id: Option<PoolId> },
}

impl Trigger {
    pub fn matches_price(&self, price: f64) -> bool {
        match self {
            Trigger::Price { above, below } => {
                above.is_none_or(|a| price >= a) && below.is_none_or(|b| price < b)
            }
            _ => false,
        }
    }

    pub fn matches_time(&self, now: Time) -> bool {
        match *self {
            Trigger::TimeWindow { start, end } if start == end => true,
            Trigger::TimeWindow { start, end } if start < end => now >= start && now < end,
            Trigger::TimeWindow { start, end } => now >= start || now < end,
            _ => false,
        }
    }
}

/// Parsed action.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// An empty `device_ids` targets the devices the trigger matched, or
    /// every enabled device for fleet-wide triggers.
    ApplyMode { mode: Mode, device_ids: Vec<DeviceId> },
    SwitchPool {
        pool_id: PoolId,
        device_ids: Vec<DeviceId>,
    },
    SendAlert {
        message: Option<String>,
        severity: Severity,
    },
    LogEvent { message: Option<String> },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PriceConfig {
    above: Option<f64>,
    below: Option<f64>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TimeWindowConfig {
    start: String,
    end: String,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DeviceConfig {
    device_id: Option<DeviceId>,
    threshold_c: Option<f64>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PoolFailureConfig {
    pool_id: Option<PoolId>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ApplyModeConfig {
    mode: Mode,
    #[serde(default)]
    device_ids: Vec<DeviceId>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SwitchPoolConfig {
    pool_id: PoolId,
    #[serde(default)]
    device_ids: Vec<DeviceId>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AlertConfig {
    message: Option<String>,
    #[serde(default = "default_alert_severity")]
    severity: Severity,
}

fn default_alert_severity() -> Severity {
    Severity::Warning
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct LogConfig {
    message: Option<String>,
}

fn parse_time(value: &str) -> std::result::Result<Time, String> {
    Time::parse(value, format_description!("[hour]:[minute]"))
        .map_err(|e| format!("invalid time {value:?}, expected HH:MM: {e}"))
}

impl AutomationRule {
    pub fn new(
        name: impl Into<String>,
        trigger_type: TriggerType,
        trigger_config: Value,
        action_type: ActionType,
        action_config: Value,
    ) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            trigger_type,
            trigger_config,
            action_type,
            action_config,
            priority: 0,
        }
    }

    /// Enabled price-threshold rules compete with auto-optimization for
    /// device modes.
    pub fn is_active_price_rule(&self) -> bool {
        self.enabled && self.trigger_type == TriggerType::PriceThreshold
    }

    fn invalid(&self, reason: impl Into<String>) -> Error {
        Error::InvalidRule {
            rule: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn config<T>(&self, value: &Value, what: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned + Default,
    {
        if value.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(value.clone())
            .map_err(|e| self.invalid(format!("{what} config: {e}")))
    }

    fn required_config<T>(&self, value: &Value, what: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_value(value.clone())
            .map_err(|e| self.invalid(format!("{what} config: {e}")))
    }

    pub fn trigger(&self) -> Result<Trigger> {
        let config = &self.trigger_config;
        match self.trigger_type {
            TriggerType::PriceThreshold => {
                let c: PriceConfig = self.required_config(config, "price-threshold")?;
                if c.above.is_none() && c.below.is_none() {
                    return Err(self.invalid("price-threshold needs `above` or `below`"));
                }
                Ok(Trigger::Price {
                    above: c.above,
                    below: c.below,
                })
            }
            TriggerType::TimeWindow => {
                let c: TimeWindowConfig = self.required_config(config, "time-window")?;
                Ok(Trigger::TimeWindow {
                    start: parse_time(&c.start).map_err(|e| self.invalid(e))?,
                    end: parse_time(&c.end).map_err(|e| self.invalid(e))?,
                })
            }
            TriggerType::DeviceOffline => {
                let c: DeviceConfig = self.config(config, "device-offline")?;
                if c.threshold_c.is_some() {
                    return Err(self.invalid("device-offline takes no threshold"));
                }
                Ok(Trigger::DeviceOffline {
                    device_id: c.device_id,
                })
            }
            TriggerType::DeviceOverheat => {
                let c: DeviceConfig = self.config(config, "device-overheat")?;
                Ok(Trigger::DeviceOverheat {
                    device_id: c.device_id,
                    threshold_c: c.threshold_c,
                })
            }
            TriggerType::PoolFailure => {
                let c: PoolFailureConfig = self.config(config, "pool-failure")?;
                Ok(Trigger::PoolFailure { pool_id: c.pool_id })
            }
        }
    }

    pub fn action(&self) -> Result<Action> {
        let config = &self.action_config;
        match self.action_type {
            ActionType::ApplyMode => {
                let c: ApplyModeConfig = self.required_config(config, "apply-mode")?;
                Ok(Action::ApplyMode {
                    mode: c.mode,
                    device_ids: c.device_ids,
                })
            }
            ActionType::SwitchPool => {
                let c: SwitchPoolConfig = self.required_config(config, "switch-pool")?;
                Ok(Action::SwitchPool {
                    pool_id: c.pool_id,
                    device_ids: c.device_ids,
                })
            }
            ActionType::SendAlert => {
                let c: AlertConfig = if config.is_null() {
                    AlertConfig {
                        message: None,
                        severity: default_alert_severity(),
                    }
                } else {
                    self.required_config(config, "send-alert")?
                };
                Ok(Action::SendAlert {
                    message: c.message,
                    severity: c.severity,
                })
            }
            ActionType::LogEvent => {
                let c: LogConfig = self.config(config, "log-event")?;
                Ok(Action::LogEvent { message: c.message })
            }
        }
    }

    /// Parse both halves, surfacing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(self.invalid("rule name must not be empty"));
        }
        self.trigger()?;
        self.action()?;
        Ok(())
    }
}
