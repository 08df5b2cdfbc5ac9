//! Daemon configuration.
//!
//! One JSON document holds the fleet (devices, pools, bands, rules,
//! settings) and the tuning of every component. Every section has
//! defaults, so `{}` is a valid, if idle, configuration.

use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::baseline::BaselineConfig;
use crate::device::DriverRegistry;
use crate::discovery::DiscoveryConfig;
use crate::energy::{EnergyBand, validate_bands};
use crate::error::{Error, Result};
use crate::health::HealthConfig;
use crate::notify::NotifierConfig;
use crate::pool::{Pool, PoolConfig};
use crate::price::PriceConfig;
use crate::rules::AutomationRule;
use crate::store::Settings;
use crate::tracing::prelude::*;
use crate::types::Device;

pub const CONFIG_ENV: &str = "MINEFLEET_CONFIG";
pub const API_ADDR_ENV: &str = "MINEFLEET_API_ADDR";
pub const DEFAULT_CONFIG_PATH: &str = "minefleet.json";
pub const DEFAULT_API_ADDR: &str = "127.0.0.1:7785";

/// Interval of each scheduled job, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobIntervals {
    pub telemetry_poll_secs: u64,
    pub baseline_recompute_secs: u64,
    pub health_sweep_secs: u64,
    pub rule_sweep_secs: u64,
    pub energy_optimize_secs: u64,
    pub pool_check_secs: u64,
    /// 0 disables the periodic scan; manual scans still work.
    pub discovery_scan_secs: u64,
}

impl Default for JobIntervals {
    fn default() -> Self {
        Self {
            telemetry_poll_secs: 30,
            baseline_recompute_secs: 900,
            health_sweep_secs: 60,
            rule_sweep_secs: 60,
            energy_optimize_secs: 300,
            pool_check_secs: 60,
            discovery_scan_secs: 0,
        }
    }
}

/// Limits on device interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Deadline for every device call. Expiry counts as unreachable.
    pub device_timeout_ms: u64,
    /// Devices polled concurrently.
    pub poll_batch_size: usize,
    /// The energy optimizer leaves a device alone for this long after a
    /// mode change.
    pub min_mode_dwell_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            device_timeout_ms: 5_000,
            poll_batch_size: 8,
            min_mode_dwell_secs: 600,
        }
    }
}

impl ControlConfig {
    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.device_timeout_ms)
    }

    pub fn min_mode_dwell(&self) -> Duration {
        Duration::from_secs(self.min_mode_dwell_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub api_addr: String,
    pub devices: Vec<Device>,
    pub pools: Vec<Pool>,
    pub bands: Vec<EnergyBand>,
    pub rules: Vec<AutomationRule>,
    pub settings: Settings,
    pub intervals: JobIntervals,
    pub control: ControlConfig,
    pub baseline: BaselineConfig,
    pub health: HealthConfig,
    pub pool: PoolConfig,
    pub price: PriceConfig,
    pub notifier: NotifierConfig,
    pub discovery: DiscoveryConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            api_addr: DEFAULT_API_ADDR.to_string(),
            devices: Vec::new(),
            pools: Vec::new(),
            bands: Vec::new(),
            rules: Vec::new(),
            settings: Settings::default(),
            intervals: JobIntervals::default(),
            control: ControlConfig::default(),
            baseline: BaselineConfig::default(),
            health: HealthConfig::default(),
            pool: PoolConfig::default(),
            price: PriceConfig::default(),
            notifier: NotifierConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl FleetConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load from `MINEFLEET_CONFIG`, falling back to `minefleet.json` in
    /// the working directory, then to defaults when that file is absent.
    /// `MINEFLEET_API_ADDR` overrides the bind address.
    pub fn from_env() -> Result<Self> {
        let mut config = match env::var(CONFIG_ENV) {
            Ok(path) => Self::load(Path::new(&path))?,
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::load(Path::new(DEFAULT_CONFIG_PATH))?
            }
            Err(_) => {
                warn!("No configuration file found, starting with an empty fleet");
                Self::default()
            }
        };
        if let Ok(addr) = env::var(API_ADDR_ENV) {
            config.api_addr = addr;
        }
        Ok(config)
    }

    /// Reject configurations that cannot run; return warnings for the
    /// ones that can but look wrong.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        let mut ids = HashSet::new();
        for device in &self.devices {
            if !ids.insert(&device.id) {
                return Err(Error::Config(format!("duplicate device id {}", device.id)));
            }
            if DriverRegistry.find(&device.driver).is_none() {
                return Err(Error::Config(format!(
                    "device {} uses unknown driver {:?} (known: {})",
                    device.id,
                    device.driver,
                    DriverRegistry.names().join(", ")
                )));
            }
        }

        let mut pool_ids = HashSet::new();
        for pool in &self.pools {
            if !pool_ids.insert(&pool.id) {
                return Err(Error::Config(format!("duplicate pool id {}", pool.id)));
            }
        }

        let mut names = HashSet::new();
        for rule in &self.rules {
            if !names.insert(rule.name.as_str()) {
                return Err(Error::Config(format!("duplicate rule name {}", rule.name)));
            }
            rule.validate()?;
        }

        if self.settings.auto_optimize {
            if let Some(rule) = self.rules.iter().find(|r| r.is_active_price_rule()) {
                return Err(Error::Conflict(format!(
                    "auto_optimize is enabled and price-threshold rule {} is enabled",
                    rule.name
                )));
            }
        }

        let intervals = &self.intervals;
        for (name, secs) in [
            ("telemetry_poll_secs", intervals.telemetry_poll_secs),
            ("baseline_recompute_secs", intervals.baseline_recompute_secs),
            ("health_sweep_secs", intervals.health_sweep_secs),
            ("rule_sweep_secs", intervals.rule_sweep_secs),
            ("energy_optimize_secs", intervals.energy_optimize_secs),
            ("pool_check_secs", intervals.pool_check_secs),
        ] {
            if secs == 0 {
                return Err(Error::Config(format!("intervals.{name} must be positive")));
            }
        }
        if self.control.poll_batch_size == 0 {
            return Err(Error::Config("control.poll_batch_size must be positive".into()));
        }

        warnings.extend(validate_bands(&self.bands).iter().map(|i| format!("energy bands: {i}")));
        if self.settings.auto_optimize && self.bands.is_empty() {
            warnings.push("auto_optimize is enabled but no energy bands are configured".into());
        }

        Ok(warnings)
    }
}
