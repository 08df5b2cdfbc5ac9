//! Shared fixtures for unit tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::context::{ContextParts, FleetContext};
use crate::device::simulated::SimulatedDevice;
use crate::notify::Notifier;
use crate::pool::{Pool, PoolId, PoolProbe, ProbeOutcome};
use crate::store::MemoryStore;
use crate::types::{Device, DeviceId, DeviceType, EventCategory, Mode, Severity};

/// Keeps every notification it is handed.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, Severity, EventCategory)>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(m, _, _)| m.clone()).collect()
    }

    pub fn sent(&self) -> Vec<(String, Severity, EventCategory)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        message: &str,
        severity: Severity,
        category: EventCategory,
    ) -> anyhow::Result<()> {
        self.sent.lock().push((message.to_string(), severity, category));
        Ok(())
    }
}

/// Probe answering from a table; unknown pools are unreachable.
#[derive(Default)]
pub struct ScriptedProbe {
    outcomes: Mutex<HashMap<PoolId, ProbeOutcome>>,
}

impl ScriptedProbe {
    pub fn set(&self, pool: &str, outcome: ProbeOutcome) {
        self.outcomes.lock().insert(PoolId::new(pool), outcome);
    }
}

#[async_trait]
impl PoolProbe for ScriptedProbe {
    async fn probe(&self, pool: &Pool) -> ProbeOutcome {
        self.outcomes
            .lock()
            .get(&pool.id)
            .copied()
            .unwrap_or_else(ProbeOutcome::unreachable)
    }
}

/// A context over an in-memory store, simulated devices, a recording
/// notifier and a scripted pool probe.
pub struct Harness {
    ctx: Arc<FleetContext>,
    notifier: Arc<RecordingNotifier>,
    probe: Arc<ScriptedProbe>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_parts(|_| {})
    }

    /// Like [`Harness::new`], with a chance to adjust the parts first.
    pub fn with_parts(adjust: impl FnOnce(&mut ContextParts)) -> Self {
        let notifier = Arc::new(RecordingNotifier::default());
        let probe = Arc::new(ScriptedProbe::default());
        let mut parts = ContextParts::new(Arc::new(MemoryStore::default()));
        parts.notifier = notifier.clone() as Arc<dyn Notifier>;
        parts.probe = probe.clone() as Arc<dyn PoolProbe>;
        adjust(&mut parts);
        Self {
            ctx: Arc::new(FleetContext::new(parts)),
            notifier,
            probe,
        }
    }

    /// Add an enabled simulated device, recorded in its starting mode.
    pub fn add_device(&self, id: &str, device_type: DeviceType) -> Arc<SimulatedDevice> {
        let mut device = Device::new(id, device_type, "10.0.0.2");
        let sim = Arc::new(SimulatedDevice::new());
        device.current_mode = Some(Mode::new("standard"));
        self.ctx.store().upsert_device(device);
        self.ctx.register_control(DeviceId::new(id), sim.clone());
        sim
    }

    pub fn add_pool(&self, pool: Pool) {
        self.ctx.store().upsert_pool(pool);
    }

    pub fn ctx(&self) -> Arc<FleetContext> {
        self.ctx.clone()
    }

    pub fn notifier(&self) -> &RecordingNotifier {
        &self.notifier
    }

    pub fn probe(&self) -> &ScriptedProbe {
        &self.probe
    }

    pub async fn settle(&self) {
        self.ctx.settle().await;
    }
}
