use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::RwLock;
use time::OffsetDateTime;

use super::{PricePoint, Settings, Store};
use crate::energy::EnergyBand;
use crate::error::{Error, Result};
use crate::health::HealthEvent;
use crate::pool::{Pool, PoolHealthSample, PoolId};
use crate::rules::AutomationRule;
use crate::tracing::prelude::*;
use crate::types::{Device, DeviceId, DeviceStatus, Event, Mode, TelemetrySample};

/// Bounds on the append-only logs.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    /// Telemetry older than this (relative to the newest sample of the same
    /// device) is pruned on append.
    pub telemetry_age: Duration,
    pub telemetry_per_device: usize,
    pub health_per_device: usize,
    pub pool_samples: usize,
    pub events: usize,
    pub prices: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            telemetry_age: Duration::from_secs(48 * 3600),
            telemetry_per_device: 10_000,
            health_per_device: 1_000,
            pool_samples: 500,
            events: 10_000,
            prices: 1_000,
        }
    }
}

#[derive(Default)]
struct Inner {
    devices: HashMap<DeviceId, Device>,
    pools: HashMap<PoolId, Pool>,
    bands: Vec<EnergyBand>,
    rules: HashMap<String, AutomationRule>,
    settings: Settings,
    telemetry: HashMap<DeviceId, VecDeque<TelemetrySample>>,
    statuses: HashMap<DeviceId, DeviceStatus>,
    health: HashMap<DeviceId, VecDeque<HealthEvent>>,
    pool_health: HashMap<PoolId, VecDeque<PoolHealthSample>>,
    prices: VecDeque<PricePoint>,
    events: VecDeque<Event>,
}

/// Process-local [`Store`].
pub struct MemoryStore {
    retention: Retention,
    inner: RwLock<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Retention::default())
    }
}

impl MemoryStore {
    pub fn new(retention: Retention) -> Self {
        Self {
            retention,
            inner: RwLock::new(Inner::default()),
        }
    }
}

fn push_bounded<T>(log: &mut VecDeque<T>, item: T, cap: usize) {
    if cap > 0 && log.len() >= cap {
        log.pop_front();
    }
    log.push_back(item);
}

impl Store for MemoryStore {
    fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<_> = self.inner.read().devices.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    fn device(&self, id: &DeviceId) -> Option<Device> {
        self.inner.read().devices.get(id).cloned()
    }

    fn upsert_device(&self, device: Device) {
        self.inner.write().devices.insert(device.id.clone(), device);
    }

    fn remove_device(&self, id: &DeviceId) -> Result<()> {
        let mut inner = self.inner.write();
        inner
            .devices
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("device", id))
    }

    fn set_device_mode(&self, id: &DeviceId, mode: Mode, at: OffsetDateTime) -> Result<()> {
        let mut inner = self.inner.write();
        let device = inner
            .devices
            .get_mut(id)
            .ok_or_else(|| Error::not_found("device", id))?;
        device.current_mode = Some(mode);
        device.last_mode_change = Some(at);
        Ok(())
    }

    fn pools(&self) -> Vec<Pool> {
        let mut pools: Vec<_> = self.inner.read().pools.values().cloned().collect();
        pools.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        pools
    }

    fn pool(&self, id: &PoolId) -> Option<Pool> {
        self.inner.read().pools.get(id).cloned()
    }

    fn upsert_pool(&self, pool: Pool) {
        self.inner.write().pools.insert(pool.id.clone(), pool);
    }

    fn remove_pool(&self, id: &PoolId) -> Result<()> {
        let mut inner = self.inner.write();
        inner
            .pools
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("pool", id))
    }

    fn bands(&self) -> Vec<EnergyBand> {
        let mut bands = self.inner.read().bands.clone();
        bands.sort_by_key(|band| band.sort_order);
        bands
    }

    fn replace_bands(&self, bands: Vec<EnergyBand>) {
        self.inner.write().bands = bands;
    }

    fn rules(&self) -> Vec<AutomationRule> {
        let mut rules: Vec<_> = self.inner.read().rules.values().cloned().collect();
        rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        rules
    }

    fn rule(&self, name: &str) -> Option<AutomationRule> {
        self.inner.read().rules.get(name).cloned()
    }

    fn upsert_rule(&self, rule: AutomationRule) {
        self.inner.write().rules.insert(rule.name.clone(), rule);
    }

    fn remove_rule(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        inner
            .rules
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("rule", name))
    }

    fn settings(&self) -> Settings {
        self.inner.read().settings
    }

    fn put_settings(&self, settings: Settings) {
        self.inner.write().settings = settings;
    }

    fn append_telemetry(&self, sample: TelemetrySample) -> bool {
        let mut inner = self.inner.write();
        let log = inner.telemetry.entry(sample.device_id.clone()).or_default();

        if let Some(last) = log.back() {
            if sample.timestamp < last.timestamp {
                warn!(
                    device = %sample.device_id,
                    sample_at = %sample.timestamp,
                    latest_at = %last.timestamp,
                    "Dropping out-of-order telemetry sample"
                );
                return false;
            }
        }

        let cutoff = sample.timestamp - self.retention.telemetry_age;
        while log.front().is_some_and(|s| s.timestamp < cutoff) {
            log.pop_front();
        }
        push_bounded(log, sample, self.retention.telemetry_per_device);
        true
    }

    fn latest_telemetry(&self, id: &DeviceId) -> Option<TelemetrySample> {
        self.inner
            .read()
            .telemetry
            .get(id)
            .and_then(|log| log.back().cloned())
    }

    fn telemetry_since(&self, since: OffsetDateTime) -> Vec<TelemetrySample> {
        self.inner
            .read()
            .telemetry
            .values()
            .flat_map(|log| log.iter().filter(|s| s.timestamp >= since).cloned())
            .collect()
    }

    fn record_poll(&self, id: &DeviceId, online: bool, at: OffsetDateTime) {
        let mut inner = self.inner.write();
        inner
            .statuses
            .entry(id.clone())
            .and_modify(|status| status.record(online, at))
            .or_insert_with(|| DeviceStatus::new(online, at));
    }

    fn device_status(&self, id: &DeviceId) -> Option<DeviceStatus> {
        self.inner.read().statuses.get(id).cloned()
    }

    fn append_health(&self, event: HealthEvent) {
        let cap = self.retention.health_per_device;
        let mut inner = self.inner.write();
        let log = inner.health.entry(event.device_id.clone()).or_default();
        push_bounded(log, event, cap);
    }

    fn latest_health(&self, id: &DeviceId) -> Option<HealthEvent> {
        self.inner
            .read()
            .health
            .get(id)
            .and_then(|log| log.back().cloned())
    }

    fn current_health(&self) -> Vec<HealthEvent> {
        let mut current: Vec<_> = self
            .inner
            .read()
            .health
            .values()
            .filter_map(|log| log.back().cloned())
            .collect();
        current.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        current
    }

    fn health_history(&self, id: &DeviceId) -> Vec<HealthEvent> {
        self.inner
            .read()
            .health
            .get(id)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn append_pool_health(&self, sample: PoolHealthSample) {
        let cap = self.retention.pool_samples;
        let mut inner = self.inner.write();
        let log = inner.pool_health.entry(sample.pool_id.clone()).or_default();
        push_bounded(log, sample, cap);
    }

    fn pool_health(&self, id: &PoolId) -> Vec<PoolHealthSample> {
        self.inner
            .read()
            .pool_health
            .get(id)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn record_price(&self, point: PricePoint) {
        let cap = self.retention.prices;
        push_bounded(&mut self.inner.write().prices, point, cap);
    }

    fn latest_price(&self) -> Option<PricePoint> {
        self.inner.read().prices.back().copied()
    }

    fn append_event(&self, event: Event) {
        let cap = self.retention.events;
        push_bounded(&mut self.inner.write().events, event, cap);
    }

    fn events(&self) -> Vec<Event> {
        self.inner.read().events.iter().cloned().collect()
    }
}
