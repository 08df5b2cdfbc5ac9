//! Rule sweep: plan against a frozen snapshot, then execute.
//!
//! Planning is pure. Executing the same plan twice is harmless because
//! mode and pool changes to the current value are no-ops at the device
//! boundary.

use std::collections::{BTreeSet, HashMap};

use serde_json::json;
use time::{OffsetDateTime, Time};

use super::{Action, AutomationRule, Trigger};
use crate::context::{FleetContext, ModeChange, PoolSwitch};
use crate::health::{HealthEvent, ReasonCode};
use crate::pool::{Pool, PoolStatus};
use crate::store::Store;
use crate::tracing::prelude::*;
use crate::types::{Device, DeviceId, Event, EventCategory, Mode, Severity};

/// Everything triggers are evaluated against, captured once per sweep.
#[derive(Debug, Clone)]
pub struct RuleSnapshot {
    pub now: OffsetDateTime,
    /// Wall-clock time of day at the configured site offset.
    pub local_time: Time,
    pub price: Option<f64>,
    pub devices: Vec<Device>,
    pub health: HashMap<DeviceId, HealthEvent>,
    pub temperatures: HashMap<DeviceId, f64>,
    pub pools: Vec<Pool>,
    pub pool_status: Vec<PoolStatus>,
}

impl RuleSnapshot {
    pub fn capture(ctx: &FleetContext, now: OffsetDateTime) -> Self {
        let store = ctx.store();
        let offset = store.settings().utc_offset();
        let devices = store.devices();
        let temperatures = devices
            .iter()
            .filter_map(|d| {
                let temp = store.latest_telemetry(&d.id)?.temperature_c?;
                Some((d.id.clone(), temp))
            })
            .collect();
        let pools = store.pools();
        let pool_status = pools.iter().map(|p| ctx.pools().status(&p.id)).collect();

        Self {
            now,
            local_time: now.to_offset(offset).time(),
            price: store.latest_price().map(|p| p.price),
            health: store
                .current_health()
                .into_iter()
                .map(|h| (h.device_id.clone(), h))
                .collect(),
            devices,
            temperatures,
            pools,
            pool_status,
        }
    }

    fn enabled_device(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| &d.id == id && d.enabled)
    }

    fn enabled_devices(&self) -> Vec<DeviceId> {
        self.devices
            .iter()
            .filter(|d| d.enabled)
            .map(|d| d.id.clone())
            .collect()
    }
}

/// A side effect decided by a rule.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedKind {
    ApplyMode { device_id: DeviceId, mode: Mode },
    SwitchPool { device_id: DeviceId, pool: Pool },
    Alert { message: String, severity: Severity },
    Log { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAction {
    pub rule: String,
    /// Human-readable description of what matched.
    pub condition: String,
    pub kind: PlannedKind,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub actions: Vec<PlannedAction>,
    /// Configuration problems found while planning.
    pub warnings: Vec<String>,
}

struct Matched {
    condition: String,
    /// Devices the trigger is about; None for fleet-wide triggers.
    devices: Option<Vec<DeviceId>>,
}

fn device_scope(
    snapshot: &RuleSnapshot,
    filter: Option<&DeviceId>,
    rule: &str,
    warnings: &mut Vec<String>,
) -> Vec<DeviceId> {
    match filter {
        Some(id) if snapshot.enabled_device(id).is_none() => {
            warnings.push(format!("rule {rule}: unknown or disabled device {id}"));
            Vec::new()
        }
        Some(id) => vec![id.clone()],
        None => snapshot.enabled_devices(),
    }
}

fn evaluate_trigger(
    rule: &str,
    trigger: &Trigger,
    snapshot: &RuleSnapshot,
    warnings: &mut Vec<String>,
) -> Option<Matched> {
    match trigger {
        Trigger::Price { .. } => {
            let price = snapshot.price?;
            trigger.matches_price(price).then(|| Matched {
                condition: format!("price {price}"),
                devices: None,
            })
        }
        Trigger::TimeWindow { .. } => trigger.matches_time(snapshot.local_time).then(|| Matched {
            condition: format!("local time {}", snapshot.local_time),
            devices: None,
        }),
        Trigger::DeviceOffline { device_id } => {
            let offline: Vec<_> = device_scope(snapshot, device_id.as_ref(), rule, warnings)
                .into_iter()
                .filter(|id| snapshot.health.get(id).is_some_and(HealthEvent::is_offline))
                .collect();
            (!offline.is_empty()).then(|| Matched {
                condition: format!("offline: {}", join(&offline)),
                devices: Some(offline),
            })
        }
        Trigger::DeviceOverheat {
            device_id,
            threshold_c,
        } => {
            let hot: Vec<_> = device_scope(snapshot, device_id.as_ref(), rule, warnings)
                .into_iter()
                .filter(|id| match threshold_c {
                    Some(limit) => snapshot.temperatures.get(id).is_some_and(|t| t >= limit),
                    None => snapshot.health.get(id).is_some_and(|h| {
                        h.has_reason(ReasonCode::TempHigh) || h.has_reason(ReasonCode::TempCritical)
                    }),
                })
                .collect();
            (!hot.is_empty()).then(|| Matched {
                condition: format!("overheating: {}", join(&hot)),
                devices: Some(hot),
            })
        }
        Trigger::PoolFailure { pool_id } => {
            if let Some(id) = pool_id {
                if !snapshot.pools.iter().any(|p| &p.id == id) {
                    warnings.push(format!("rule {rule}: unknown pool {id}"));
                    return None;
                }
            }
            let failing: Vec<_> = snapshot
                .pool_status
                .iter()
                .filter(|s| s.failing)
                .filter(|s| pool_id.as_ref().is_none_or(|id| &s.pool_id == id))
                .collect();
            if failing.is_empty() {
                return None;
            }
            let devices: BTreeSet<DeviceId> = failing
                .iter()
                .flat_map(|s| s.in_use_by.iter().cloned())
                .collect();
            Some(Matched {
                condition: format!(
                    "pool failing: {}",
                    failing
                        .iter()
                        .map(|s| s.pool_id.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                devices: Some(devices.into_iter().collect()),
            })
        }
    }
}

fn join(ids: &[DeviceId]) -> String {
    ids.iter()
        .map(DeviceId::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn targets(
    rule: &str,
    explicit: &[DeviceId],
    matched: &Matched,
    snapshot: &RuleSnapshot,
    warnings: &mut Vec<String>,
) -> Vec<DeviceId> {
    if explicit.is_empty() {
        return matched
            .devices
            .clone()
            .unwrap_or_else(|| snapshot.enabled_devices());
    }
    explicit
        .iter()
        .filter(|id| {
            let known = snapshot.enabled_device(id).is_some();
            if !known {
                warnings.push(format!("rule {rule}: unknown or disabled device {id}"));
            }
            known
        })
        .cloned()
        .collect()
}

fn default_message(rule: &str, matched: &Matched) -> String {
    format!("rule {rule} matched: {}", matched.condition)
}

/// Decide what every enabled rule wants done, in priority order.
///
/// A pure function of its inputs: the same rules and snapshot always give
/// the same plan.
pub fn plan(rules: &[AutomationRule], snapshot: &RuleSnapshot) -> Plan {
    let mut ordered: Vec<_> = rules.iter().filter(|r| r.enabled).collect();
    ordered.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));

    let mut plan = Plan::default();
    for rule in ordered {
        let (trigger, action) = match (rule.trigger(), rule.action()) {
            (Ok(t), Ok(a)) => (t, a),
            (Err(e), _) | (_, Err(e)) => {
                plan.warnings.push(e.to_string());
                continue;
            }
        };

        let Some(matched) = evaluate_trigger(&rule.name, &trigger, snapshot, &mut plan.warnings)
        else {
            continue;
        };

        let planned = |kind| PlannedAction {
            rule: rule.name.clone(),
            condition: matched.condition.clone(),
            kind,
        };

        match action {
            Action::ApplyMode { mode, device_ids } => {
                let devices =
                    targets(&rule.name, &device_ids, &matched, snapshot, &mut plan.warnings);
                for device_id in devices {
                    plan.actions.push(planned(PlannedKind::ApplyMode {
                        device_id,
                        mode: mode.clone(),
                    }));
                }
            }
            Action::SwitchPool {
                pool_id,
                device_ids,
            } => {
                let Some(pool) = snapshot.pools.iter().find(|p| p.id == pool_id && p.enabled)
                else {
                    plan.warnings.push(format!(
                        "rule {}: unknown or disabled pool {pool_id}",
                        rule.name
                    ));
                    continue;
                };
                let devices =
                    targets(&rule.name, &device_ids, &matched, snapshot, &mut plan.warnings);
                for device_id in devices {
                    plan.actions.push(planned(PlannedKind::SwitchPool {
                        device_id,
                        pool: pool.clone(),
                    }));
                }
            }
            Action::SendAlert { message, severity } => {
                let message = message.unwrap_or_else(|| default_message(&rule.name, &matched));
                plan.actions
                    .push(planned(PlannedKind::Alert { message, severity }));
            }
            Action::LogEvent { message } => {
                let message = message.unwrap_or_else(|| default_message(&rule.name, &matched));
                plan.actions.push(planned(PlannedKind::Log { message }));
            }
        }
    }
    plan
}

/// Result of executing one planned action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// The action changed something or was delivered.
    Applied,
    /// The device was already in the requested state.
    Unchanged,
    Failed(String),
}

/// Run a plan. Every action is attempted and audited; failures do not
/// stop later actions.
pub async fn execute(ctx: &FleetContext, plan: &Plan) -> Vec<ActionOutcome> {
    for warning in &plan.warnings {
        warn!(warning = %warning, "Rule configuration problem");
        ctx.record(Event::new(EventCategory::Config, Severity::Warning, warning.clone()));
    }

    let mut outcomes = Vec::with_capacity(plan.actions.len());
    for action in &plan.actions {
        let (device_id, description, outcome) = match &action.kind {
            PlannedKind::ApplyMode { device_id, mode } => {
                let outcome = match ctx.apply_mode(device_id, mode).await {
                    Ok(ModeChange::Changed { .. }) => ActionOutcome::Applied,
                    Ok(ModeChange::Unchanged) => ActionOutcome::Unchanged,
                    Err(e) => ActionOutcome::Failed(e.to_string()),
                };
                (Some(device_id), format!("apply mode {mode}"), outcome)
            }
            PlannedKind::SwitchPool { device_id, pool } => {
                let outcome = match ctx.switch_pool(device_id, pool).await {
                    Ok(PoolSwitch::Switched) => ActionOutcome::Applied,
                    Ok(PoolSwitch::Unchanged) => ActionOutcome::Unchanged,
                    Ok(PoolSwitch::Unverified) => {
                        ActionOutcome::Failed("device offline after pool switch".into())
                    }
                    Err(e) => ActionOutcome::Failed(e.to_string()),
                };
                (Some(device_id), format!("switch to pool {}", pool.id), outcome)
            }
            PlannedKind::Alert { message, severity } => {
                ctx.notify(message.clone(), *severity, EventCategory::Rule);
                (None, format!("alert: {message}"), ActionOutcome::Applied)
            }
            PlannedKind::Log { message } => (None, message.clone(), ActionOutcome::Applied),
        };

        let (severity, result) = match &outcome {
            ActionOutcome::Applied => (Severity::Info, "applied".to_string()),
            ActionOutcome::Unchanged => (Severity::Info, "unchanged".to_string()),
            ActionOutcome::Failed(e) => (Severity::Warning, format!("failed: {e}")),
        };
        if let ActionOutcome::Failed(e) = &outcome {
            warn!(rule = %action.rule, error = %e, "Rule action failed");
        } else {
            debug!(rule = %action.rule, action = %description, result = %result, "Rule action");
        }

        let mut event = Event::new(
            EventCategory::Rule,
            severity,
            format!("rule {}: {description} ({result})", action.rule),
        )
        .details(json!({
            "rule": action.rule,
            "condition": action.condition,
            "action": description,
            "outcome": result,
        }));
        if let Some(id) = device_id {
            event = event.device(id);
        }
        ctx.record(event);
        outcomes.push(outcome);
    }
    outcomes
}
