//! The fleet context.
//!
//! Everything a job needs, passed explicitly: the store, the baseline
//! table, the engines, the pool monitor, the device control handles and
//! the per-device locks. Control mutations (mode, pool, restart) go
//! through the methods here so the lock and audit trail are never
//! skipped.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use time::OffsetDateTime;
use tokio_util::task::TaskTracker;

use crate::baseline::{BaselineConfig, BaselineStore};
use crate::config::{ControlConfig, FleetConfig};
use crate::device::{ControlError, DeviceControl, DriverRegistry, timed, timed_is_online};
use crate::discovery::DiscoveryConfig;
use crate::energy::{BandIssue, EnergyBand, validate_bands};
use crate::error::{Error, Result};
use crate::health::{HealthConfig, HealthEngine};
use crate::notify::{LogNotifier, Notifier};
use crate::pool::{Pool, PoolConfig, PoolHealthMonitor, PoolId, PoolProbe, TcpProbe};
use crate::price::PriceSource;
use crate::rules::RuleBook;
use crate::scheduler::DeviceLocks;
use crate::store::{MemoryStore, Store};
use crate::tracing::prelude::*;
use crate::types::{Device, DeviceId, Event, EventCategory, Mode, Severity};

/// Result of a mode request.
#[derive(Debug, Clone, PartialEq)]
pub enum ModeChange {
    Changed { from: Option<Mode>, to: Mode },
    /// Already in the requested mode; nothing was sent.
    Unchanged,
}

/// Result of a pool switch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolSwitch {
    Switched,
    /// Already on the requested pool; nothing was sent.
    Unchanged,
    /// The switch was accepted but the device was not reachable afterwards.
    /// The device is left on the new pool.
    Unverified,
}

/// Ingredients of a [`FleetContext`].
pub struct ContextParts {
    pub store: Arc<dyn Store>,
    pub baseline: BaselineConfig,
    pub health: HealthConfig,
    pub pool: PoolConfig,
    pub control: ControlConfig,
    pub discovery: DiscoveryConfig,
    pub notifier: Arc<dyn Notifier>,
    pub price: Option<Arc<dyn PriceSource>>,
    pub probe: Arc<dyn PoolProbe>,
}

impl ContextParts {
    /// Defaults around `store`: log notifier, no price feed, TCP probes.
    pub fn new(store: Arc<dyn Store>) -> Self {
        let pool = PoolConfig::default();
        let probe = Arc::new(TcpProbe::new(std::time::Duration::from_millis(
            pool.probe_timeout_ms,
        )));
        Self {
            store,
            baseline: BaselineConfig::default(),
            health: HealthConfig::default(),
            pool,
            control: ControlConfig::default(),
            discovery: DiscoveryConfig::default(),
            notifier: Arc::new(LogNotifier),
            price: None,
            probe,
        }
    }
}

pub struct FleetContext {
    store: Arc<dyn Store>,
    baselines: BaselineStore,
    health: HealthEngine,
    pools: PoolHealthMonitor,
    rules: RuleBook,
    notifier: Arc<dyn Notifier>,
    price: Option<Arc<dyn PriceSource>>,
    probe: Arc<dyn PoolProbe>,
    control: ControlConfig,
    discovery: DiscoveryConfig,
    locks: DeviceLocks,
    controls: RwLock<HashMap<DeviceId, Arc<dyn DeviceControl>>>,
    /// Pool most recently commanded per device, with when.
    assigned_pools: Mutex<HashMap<DeviceId, (PoolId, OffsetDateTime)>>,
    tasks: TaskTracker,
}

impl FleetContext {
    pub fn new(parts: ContextParts) -> Self {
        Self {
            rules: RuleBook::new(parts.store.clone()),
            baselines: BaselineStore::new(parts.baseline.clone()),
            health: HealthEngine::new(parts.health, parts.baseline),
            pools: PoolHealthMonitor::new(parts.pool),
            store: parts.store,
            notifier: parts.notifier,
            price: parts.price,
            probe: parts.probe,
            control: parts.control,
            discovery: parts.discovery,
            locks: DeviceLocks::new(),
            controls: RwLock::new(HashMap::new()),
            assigned_pools: Mutex::new(HashMap::new()),
            tasks: TaskTracker::new(),
        }
    }

    /// Build a context with an in-memory store seeded from `config`.
    pub fn from_config(config: &FleetConfig) -> anyhow::Result<Self> {
        let store = Arc::new(MemoryStore::default());
        for device in &config.devices {
            store.upsert_device(device.clone());
        }
        for pool in &config.pools {
            store.upsert_pool(pool.clone());
        }
        for rule in &config.rules {
            store.upsert_rule(rule.clone());
        }
        store.put_settings(config.settings);

        let ctx = Self::new(ContextParts {
            store,
            baseline: config.baseline.clone(),
            health: config.health.clone(),
            probe: Arc::new(TcpProbe::new(std::time::Duration::from_millis(
                config.pool.probe_timeout_ms,
            ))),
            pool: config.pool.clone(),
            control: config.control.clone(),
            discovery: config.discovery.clone(),
            notifier: config.notifier.build()?,
            price: config.price.build()?,
        });
        ctx.replace_bands(config.bands.clone());
        Ok(ctx)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn baselines(&self) -> &BaselineStore {
        &self.baselines
    }

    pub fn health(&self) -> &HealthEngine {
        &self.health
    }

    pub fn pools(&self) -> &PoolHealthMonitor {
        &self.pools
    }

    pub fn rules(&self) -> &RuleBook {
        &self.rules
    }

    pub fn price_source(&self) -> Option<&Arc<dyn PriceSource>> {
        self.price.as_ref()
    }

    pub fn probe(&self) -> &Arc<dyn PoolProbe> {
        &self.probe
    }

    pub fn control_config(&self) -> &ControlConfig {
        &self.control
    }

    pub fn discovery_config(&self) -> &DiscoveryConfig {
        &self.discovery
    }

    pub fn locks(&self) -> &DeviceLocks {
        &self.locks
    }

    /// Use `control` for `id` instead of building one from its driver.
    pub fn register_control(&self, id: DeviceId, control: Arc<dyn DeviceControl>) {
        self.controls.write().insert(id, control);
    }

    /// Control handle for a device, built from its driver on first use.
    pub fn control(
        &self,
        device: &Device,
    ) -> std::result::Result<Arc<dyn DeviceControl>, ControlError> {
        if let Some(control) = self.controls.read().get(&device.id) {
            return Ok(control.clone());
        }
        let control = DriverRegistry.create(device)?;
        debug!(device = %device.id, driver = %device.driver, "Created control handle");
        Ok(self
            .controls
            .write()
            .entry(device.id.clone())
            .or_insert(control)
            .clone())
    }

    fn device(&self, id: &DeviceId) -> Result<Device> {
        self.store
            .device(id)
            .ok_or_else(|| Error::not_found("device", id))
    }

    /// Put a device into `mode`.
    ///
    /// No-op when the store already records that mode. Otherwise the mode
    /// must be one the device lists; the change is made under the device
    /// lock and recorded with its timestamp.
    pub async fn apply_mode(&self, id: &DeviceId, mode: &Mode) -> Result<ModeChange> {
        let _guard = self.locks.lock(id).await;
        let device = self.device(id)?;
        if device.current_mode.as_ref() == Some(mode) {
            return Ok(ModeChange::Unchanged);
        }

        let control = self.control(&device)?;
        let limit = self.control.device_timeout();
        let modes = timed(limit, control.list_modes()).await?;
        if !modes.contains(mode) {
            return Err(ControlError::UnsupportedMode(mode.clone()).into());
        }
        timed(limit, control.set_mode(mode)).await?;

        let from = device.current_mode;
        self.store
            .set_device_mode(id, mode.clone(), OffsetDateTime::now_utc())?;
        info!(device = %id, from = ?from, to = %mode, "Mode changed");
        self.record(
            Event::new(
                EventCategory::Device,
                Severity::Info,
                format!("mode changed to {mode}"),
            )
            .device(id)
            .details(json!({ "from": from, "to": mode })),
        );
        Ok(ModeChange::Changed {
            from,
            to: mode.clone(),
        })
    }

    fn on_pool(&self, id: &DeviceId, pool: &Pool) -> bool {
        let latest = self.store.latest_telemetry(id);
        if let Some((assigned, at)) = self.assigned_pools.lock().get(id) {
            if latest.as_ref().is_none_or(|s| s.timestamp <= *at) {
                return assigned == &pool.id;
            }
        }
        latest
            .and_then(|s| s.pool_in_use)
            .is_some_and(|reported| pool.matches_endpoint(&reported))
    }

    /// Point a device at `pool`, then check it is still reachable.
    ///
    /// No-op when the device is already on the pool. A device that drops
    /// off after the switch is left where it is and reported critical.
    pub async fn switch_pool(&self, id: &DeviceId, pool: &Pool) -> Result<PoolSwitch> {
        let _guard = self.locks.lock(id).await;
        let device = self.device(id)?;
        if self.on_pool(id, pool) {
            return Ok(PoolSwitch::Unchanged);
        }

        let control = self.control(&device)?;
        let limit = self.control.device_timeout();
        timed(
            limit,
            control.switch_pool(&pool.url, pool.port, &pool.user, &pool.password),
        )
        .await?;
        self.assigned_pools
            .lock()
            .insert(id.clone(), (pool.id.clone(), OffsetDateTime::now_utc()));

        if !timed_is_online(limit, control.as_ref()).await {
            error!(device = %id, pool = %pool.id, "Device unreachable after pool switch");
            let message = format!("device offline after switching to pool {}", pool.id);
            self.record(
                Event::new(EventCategory::Pool, Severity::Critical, message.clone())
                    .device(id)
                    .details(json!({ "pool": pool.id })),
            );
            self.notify(format!("{id}: {message}"), Severity::Critical, EventCategory::Pool);
            return Ok(PoolSwitch::Unverified);
        }

        info!(device = %id, pool = %pool.id, "Switched pool");
        self.record(
            Event::new(
                EventCategory::Pool,
                Severity::Info,
                format!("switched to pool {}", pool.id),
            )
            .device(id)
            .details(json!({ "pool": pool.id })),
        );
        Ok(PoolSwitch::Switched)
    }

    pub async fn restart(&self, id: &DeviceId) -> Result<()> {
        let _guard = self.locks.lock(id).await;
        let device = self.device(id)?;
        let control = self.control(&device)?;
        timed(self.control.device_timeout(), control.restart()).await?;
        self.record(Event::new(EventCategory::Device, Severity::Info, "restarted").device(id));
        Ok(())
    }

    /// Replace the energy band table. Structural problems are recorded as
    /// warnings; the table is stored regardless.
    pub fn replace_bands(&self, bands: Vec<EnergyBand>) -> Vec<BandIssue> {
        let issues = validate_bands(&bands);
        for issue in &issues {
            self.record(Event::new(
                EventCategory::Config,
                Severity::Warning,
                format!("energy bands: {issue}"),
            ));
        }
        self.store.replace_bands(bands);
        issues
    }

    /// Log and persist an audit event.
    pub fn record(&self, event: Event) {
        let device = event.device_id.as_ref().map(DeviceId::as_str).unwrap_or("-");
        match event.severity {
            Severity::Critical => {
                error!(category = %event.category, device, "{}", event.message)
            }
            Severity::Warning => warn!(category = %event.category, device, "{}", event.message),
            Severity::Info => debug!(category = %event.category, device, "{}", event.message),
        }
        self.store.append_event(event);
    }

    /// Send a notification in the background. Failures are logged.
    pub fn notify(&self, message: String, severity: Severity, category: EventCategory) {
        let notifier = self.notifier.clone();
        self.tasks.spawn(async move {
            if let Err(e) = notifier.send(&message, severity, category).await {
                warn!(error = %e, "Notification failed");
            }
        });
    }

    /// Wait for notifications in flight.
    pub async fn settle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}
