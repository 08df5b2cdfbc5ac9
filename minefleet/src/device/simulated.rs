//! Virtual device driver.
//!
//! Behaves like a small miner: each mode has a hashrate, power and
//! temperature profile, shares accumulate per poll, and pool switches and
//! restarts take effect immediately. Faults can be induced for testing and
//! for dry runs of rules against a fleet that does not exist yet.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ControlError, DeviceControl, DriverDescriptor};
use crate::types::{Device, Mode, TelemetryReading};

const SHARES_PER_POLL: u64 = 10;

/// Steady-state readings for one mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModeProfile {
    pub hashrate_ghs: f64,
    pub power_w: f64,
    pub temperature_c: f64,
}

#[derive(Debug)]
struct State {
    online: bool,
    mode: Mode,
    profiles: BTreeMap<Mode, ModeProfile>,
    has_sensor: bool,
    pool: Option<String>,
    accepted: u64,
    rejected: u64,
    rejects_per_poll: u64,
    hashrate_override: Option<f64>,
    temperature_override: Option<f64>,
    reject_commands: bool,
    offline_after_pool_switch: bool,
    set_mode_calls: u32,
    switch_pool_calls: u32,
    restarts: u32,
}

/// In-process stand-in for a networked miner.
#[derive(Debug)]
pub struct SimulatedDevice {
    state: Mutex<State>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    /// A device with eco/standard/turbo modes, starting in standard.
    pub fn new() -> Self {
        let profiles = BTreeMap::from([
            (
                Mode::new("eco"),
                ModeProfile {
                    hashrate_ghs: 800.0,
                    power_w: 12.0,
                    temperature_c: 52.0,
                },
            ),
            (
                Mode::new("standard"),
                ModeProfile {
                    hashrate_ghs: 1100.0,
                    power_w: 18.0,
                    temperature_c: 60.0,
                },
            ),
            (
                Mode::new("turbo"),
                ModeProfile {
                    hashrate_ghs: 1400.0,
                    power_w: 26.0,
                    temperature_c: 68.0,
                },
            ),
        ]);

        Self {
            state: Mutex::new(State {
                online: true,
                mode: Mode::new("standard"),
                profiles,
                has_sensor: true,
                pool: Some("stratum+tcp://pool.local:3333".to_string()),
                accepted: 0,
                rejected: 0,
                rejects_per_poll: 0,
                hashrate_override: None,
                temperature_override: None,
                reject_commands: false,
                offline_after_pool_switch: false,
                set_mode_calls: 0,
                switch_pool_calls: 0,
                restarts: 0,
            }),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.state.lock().online = online;
    }

    pub fn set_mode_now(&self, mode: Mode) {
        self.state.lock().mode = mode;
    }

    pub fn set_pool(&self, pool: Option<String>) {
        self.state.lock().pool = pool;
    }

    /// Report this hashrate instead of the mode profile's.
    pub fn set_hashrate(&self, hashrate_ghs: Option<f64>) {
        self.state.lock().hashrate_override = hashrate_ghs;
    }

    /// Report this temperature instead of the mode profile's.
    pub fn set_temperature(&self, temperature_c: Option<f64>) {
        self.state.lock().temperature_override = temperature_c;
    }

    pub fn set_has_sensor(&self, has_sensor: bool) {
        self.state.lock().has_sensor = has_sensor;
    }

    /// Rejected shares added per poll, out of `SHARES_PER_POLL` submitted.
    pub fn set_rejects_per_poll(&self, rejects: u64) {
        self.state.lock().rejects_per_poll = rejects.min(SHARES_PER_POLL);
    }

    /// Make every mutating command fail with `Rejected`.
    pub fn set_reject_commands(&self, reject: bool) {
        self.state.lock().reject_commands = reject;
    }

    /// Drop offline right after the next pool switch.
    pub fn set_offline_after_pool_switch(&self, offline: bool) {
        self.state.lock().offline_after_pool_switch = offline;
    }

    pub fn mode(&self) -> Mode {
        self.state.lock().mode.clone()
    }

    pub fn pool(&self) -> Option<String> {
        self.state.lock().pool.clone()
    }

    pub fn set_mode_calls(&self) -> u32 {
        self.state.lock().set_mode_calls
    }

    pub fn switch_pool_calls(&self) -> u32 {
        self.state.lock().switch_pool_calls
    }

    pub fn restarts(&self) -> u32 {
        self.state.lock().restarts
    }

    fn check_command(state: &State) -> Result<(), ControlError> {
        if !state.online {
            return Err(ControlError::Unreachable("simulated device offline".into()));
        }
        if state.reject_commands {
            return Err(ControlError::Rejected("simulated rejection".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceControl for SimulatedDevice {
    async fn telemetry(&self) -> Result<TelemetryReading, ControlError> {
        let mut state = self.state.lock();
        if !state.online {
            return Err(ControlError::Unreachable("simulated device offline".into()));
        }

        let profile = state
            .profiles
            .get(&state.mode)
            .copied()
            .unwrap_or(ModeProfile {
                hashrate_ghs: 0.0,
                power_w: 0.0,
                temperature_c: 0.0,
            });

        let rejects = state.rejects_per_poll;
        state.accepted += SHARES_PER_POLL - rejects;
        state.rejected += rejects;

        Ok(TelemetryReading {
            hashrate_ghs: state.hashrate_override.unwrap_or(profile.hashrate_ghs),
            temperature_c: state
                .has_sensor
                .then(|| state.temperature_override.unwrap_or(profile.temperature_c)),
            power_w: Some(profile.power_w),
            shares_accepted: state.accepted,
            shares_rejected: state.rejected,
            pool_in_use: state.pool.clone(),
            mode: Some(state.mode.clone()),
            extras: serde_json::Map::new(),
        })
    }

    async fn set_mode(&self, mode: &Mode) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        Self::check_command(&state)?;
        if !state.profiles.contains_key(mode) {
            return Err(ControlError::UnsupportedMode(mode.clone()));
        }
        state.mode = mode.clone();
        state.set_mode_calls += 1;
        Ok(())
    }

    async fn list_modes(&self) -> Result<Vec<Mode>, ControlError> {
        let state = self.state.lock();
        if !state.online {
            return Err(ControlError::Unreachable("simulated device offline".into()));
        }
        Ok(state.profiles.keys().cloned().collect())
    }

    async fn switch_pool(
        &self,
        url: &str,
        port: u16,
        _user: &str,
        _password: &str,
    ) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        Self::check_command(&state)?;
        state.pool = Some(format!("{url}:{port}"));
        state.switch_pool_calls += 1;
        // Fresh session on the new pool.
        state.accepted = 0;
        state.rejected = 0;
        if state.offline_after_pool_switch {
            state.online = false;
        }
        Ok(())
    }

    async fn restart(&self) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        Self::check_command(&state)?;
        state.restarts += 1;
        state.accepted = 0;
        state.rejected = 0;
        Ok(())
    }

    async fn is_online(&self) -> bool {
        self.state.lock().online
    }
}

fn create(_device: &Device) -> Result<Arc<dyn DeviceControl>, ControlError> {
    Ok(Arc::new(SimulatedDevice::new()))
}

inventory::submit! {
    DriverDescriptor {
        name: "simulated",
        create_fn: create,
    }
}
