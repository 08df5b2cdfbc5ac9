use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Number of recent polls kept for the availability ratio.
const AVAILABILITY_WINDOW: usize = 20;

/// Stable device identifier, as used in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Supported hardware classes.
///
/// Energy bands carry one operating mode per class, since mode names and
/// their power envelopes differ between families.
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
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum DeviceType {
    Bitaxe,
    NerdQaxe,
    Antminer,
    Whatsminer,
    Avalon,
}

/// Named operating mode (e.g. "eco", "standard", "turbo").
///
/// Opaque to the control loop; devices advertise the modes they accept
/// through `list_modes`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mode(String);

impl Mode {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Mode {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A managed device as held by the configuration store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    #[serde(default)]
    pub name: String,
    pub device_type: DeviceType,
    /// Host or host:port the driver connects to.
    pub address: String,
    /// Registered driver used to build the device's control handle.
    #[serde(default = "default_driver")]
    pub driver: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub current_mode: Option<Mode>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_mode_change: Option<OffsetDateTime>,
}

fn default_driver() -> String {
    "simulated".to_string()
}

fn default_true() -> bool {
    true
}

impl Device {
    pub fn new(id: impl Into<String>, device_type: DeviceType, address: impl Into<String>) -> Self {
        let id = DeviceId::new(id);
        Self {
            name: id.to_string(),
            id,
            device_type,
            address: address.into(),
            driver: default_driver(),
            enabled: true,
            current_mode: None,
            last_mode_change: None,
        }
    }

    /// Host part of `address`, without any port.
    pub fn host(&self) -> &str {
        match self.address.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => host,
            _ => &self.address,
        }
    }
}

/// Reachability bookkeeping maintained by the telemetry poll.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub online: bool,
    pub last_poll: OffsetDateTime,
    pub last_seen: Option<OffsetDateTime>,
    pub consecutive_failures: u32,
    recent: VecDeque<bool>,
}

impl DeviceStatus {
    pub fn new(online: bool, at: OffsetDateTime) -> Self {
        let mut status = Self {
            online,
            last_poll: at,
            last_seen: None,
            consecutive_failures: 0,
            recent: VecDeque::with_capacity(AVAILABILITY_WINDOW),
        };
        status.record(online, at);
        status
    }

    pub fn record(&mut self, online: bool, at: OffsetDateTime) {
        self.online = online;
        self.last_poll = at;
        if online {
            self.last_seen = Some(at);
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }

        if self.recent.len() == AVAILABILITY_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(online);
    }

    /// Fraction of recent polls that reached the device, in [0, 1].
    pub fn availability(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let up = self.recent.iter().filter(|&&online| online).count();
        up as f64 / self.recent.len() as f64
    }
}
