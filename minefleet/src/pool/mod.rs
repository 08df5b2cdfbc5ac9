//! Mining pools, their health, and failover decisions.

mod monitor;
mod probe;

pub use monitor::{PoolConfig, PoolHealthMonitor, PoolVerdict};
pub use probe::{PoolProbe, ProbeOutcome, TcpProbe, pool_score};

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::types::DeviceId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolId(String);

impl PoolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PoolId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    #[serde(default)]
    pub name: String,
    /// Stratum URL without the port, e.g. `stratum+tcp://pool.example.com`.
    pub url: String,
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Lower is preferred.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub coin: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Pool {
    pub fn new(id: &str, url: &str, port: u16) -> Self {
        Self {
            id: PoolId::new(id),
            name: id.to_string(),
            url: url.to_string(),
            port,
            user: String::new(),
            password: String::new(),
            priority: 0,
            enabled: true,
            coin: None,
        }
    }

    /// Host name without scheme or path.
    pub fn host(&self) -> &str {
        let rest = strip_scheme(&self.url);
        let rest = rest.split('/').next().unwrap_or(rest);
        match rest.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => host,
            _ => rest,
        }
    }

    /// Whether a device-reported pool string refers to this pool.
    ///
    /// Devices report pools in several shapes (`host:port`,
    /// `stratum+tcp://host:port`, bare host); scheme and trailing path are
    /// ignored, and the port is compared only when the report has one.
    pub fn matches_endpoint(&self, reported: &str) -> bool {
        let reported = strip_scheme(reported.trim());
        let reported = reported.split('/').next().unwrap_or(reported);
        match reported.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => host.eq_ignore_ascii_case(self.host()) && port == self.port,
                Err(_) => false,
            },
            None => reported.eq_ignore_ascii_case(self.host()),
        }
    }

    /// Whether the pool may mine `coin`. Pools without a coin accept any.
    pub fn mines(&self, coin: &str) -> bool {
        self.coin
            .as_deref()
            .is_none_or(|own| own.eq_ignore_ascii_case(coin))
    }
}

fn strip_scheme(url: &str) -> &str {
    url.split_once("://").map_or(url, |(_, rest)| rest)
}

/// Result of one probe of one pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolHealthSample {
    pub pool_id: PoolId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub reachable: bool,
    pub latency_ms: Option<f64>,
    /// Mean reject rate of the devices hashing on the pool.
    pub reject_rate: Option<f64>,
    /// 0 to 100; 0 when unreachable.
    pub score: f64,
}

/// Current view of a pool for rule evaluation and the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub pool_id: PoolId,
    pub rolling_score: Option<f64>,
    pub reachable: Option<bool>,
    pub in_use_by: Vec<DeviceId>,
    /// Below threshold for at least the required number of ticks.
    pub failing: bool,
}
