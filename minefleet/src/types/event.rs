use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::DeviceId;

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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
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
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EventCategory {
    Scheduler,
    Device,
    Health,
    Rule,
    Energy,
    Pool,
    Discovery,
    Config,
}

/// Audit log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub category: EventCategory,
    pub severity: Severity,
    pub device_id: Option<DeviceId>,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl Event {
    pub fn new(category: EventCategory, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            category,
            severity,
            device_id: None,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn device(mut self, id: &DeviceId) -> Self {
        self.device_id = Some(id.clone());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}
