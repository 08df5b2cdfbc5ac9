//! The scheduled jobs of the control loop.
//!
//! Each job is a plain async function over a [`FleetContext`]; the
//! scheduler runs them on their intervals and the API runs the same
//! functions on demand.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde_json::json;
use time::OffsetDateTime;

use crate::config::JobIntervals;
use crate::context::{FleetContext, ModeChange, PoolSwitch};
use crate::device::timed;
use crate::discovery;
use crate::energy::select_band;
use crate::health::DeviceObservation;
use crate::pool::{Pool, PoolHealthSample, pool_score};
use crate::rules;
use crate::scheduler::{Scheduler, SchedulerError, job_fn};
use crate::store::PricePoint;
use crate::tracing::prelude::*;
use crate::types::{
    AlarmStatus, Device, DeviceId, Event, EventCategory, Mode, Severity, TelemetrySample,
};

pub const TELEMETRY_POLL: &str = "telemetry-poll";
pub const BASELINE_RECOMPUTE: &str = "baseline-recompute";
pub const HEALTH_SWEEP: &str = "health-sweep";
pub const RULE_SWEEP: &str = "rule-sweep";
pub const ENERGY_OPTIMIZE: &str = "energy-optimize";
pub const POOL_CHECK: &str = "pool-check";
pub const DISCOVERY_SCAN: &str = "discovery-scan";

pub const JOB_NAMES: [&str; 7] = [
    TELEMETRY_POLL,
    BASELINE_RECOMPUTE,
    HEALTH_SWEEP,
    RULE_SWEEP,
    ENERGY_OPTIMIZE,
    POOL_CHECK,
    DISCOVERY_SCAN,
];

fn enabled_devices(ctx: &FleetContext) -> Vec<Device> {
    ctx.store()
        .devices()
        .into_iter()
        .filter(|d| d.enabled)
        .collect()
}

/// Poll every enabled device, at most `poll_batch_size` at a time.
pub async fn poll_telemetry(ctx: &FleetContext) -> anyhow::Result<()> {
    let devices = enabled_devices(ctx);
    let batch = ctx.control_config().poll_batch_size.max(1);
    trace!(devices = devices.len(), batch, "Polling telemetry");

    stream::iter(devices)
        .for_each_concurrent(batch, |device| poll_device(ctx, device))
        .await;
    Ok(())
}

async fn poll_device(ctx: &FleetContext, device: Device) {
    let id = device.id.clone();
    let was_online = ctx.store().device_status(&id).map(|s| s.online);

    let reading = match ctx.control(&device) {
        Ok(control) => {
            timed(ctx.control_config().device_timeout(), control.telemetry()).await
        }
        Err(e) => Err(e),
    };
    let now = OffsetDateTime::now_utc();

    let reading = match reading {
        Ok(reading) => reading,
        Err(e) => {
            ctx.store().record_poll(&id, false, now);
            if was_online != Some(false) {
                ctx.record(
                    Event::new(EventCategory::Device, Severity::Warning, "device unreachable")
                        .device(&id)
                        .details(json!({ "error": e.to_string() })),
                );
            } else {
                debug!(device = %id, error = %e, "Device still unreachable");
            }
            return;
        }
    };

    ctx.store().record_poll(&id, true, now);
    if was_online == Some(false) {
        ctx.record(
            Event::new(EventCategory::Device, Severity::Info, "device back online").device(&id),
        );
    }

    let reported = reading.mode.clone();
    let sample =
        TelemetrySample::from_reading(id.clone(), now, device.current_mode.clone(), reading);
    if !ctx.store().append_telemetry(sample) {
        debug!(device = %id, "Dropped sample older than the latest one");
    }

    if let Some(mode) = reported {
        if device.current_mode.as_ref() != Some(&mode) {
            sync_reported_mode(ctx, &id, mode).await;
        }
    }
}

/// Adopt a mode the device reports but the store does not know about.
async fn sync_reported_mode(ctx: &FleetContext, id: &DeviceId, mode: Mode) {
    let _guard = ctx.locks().lock(id).await;
    let Some(mut device) = ctx.store().device(id) else {
        return;
    };
    if device.current_mode.as_ref() == Some(&mode) {
        return;
    }
    info!(
        device = %id,
        from = ?device.current_mode,
        to = %mode,
        "Device reports a different mode"
    );
    device.current_mode = Some(mode);
    ctx.store().upsert_device(device);
}

/// Rebuild the baseline table from the trailing window.
pub async fn recompute_baselines(ctx: &FleetContext) -> anyhow::Result<()> {
    let now = OffsetDateTime::now_utc();
    let samples = ctx
        .store()
        .telemetry_since(ctx.baselines().window_start(now));
    let count = ctx.baselines().recompute(&samples, now);
    debug!(baselines = count, samples = samples.len(), "Baselines recomputed");
    Ok(())
}

/// Judge every enabled device and store the verdicts.
///
/// A device whose verdict turns critical is announced once; it is not
/// announced again until it has recovered.
pub async fn health_sweep(ctx: &FleetContext) -> anyhow::Result<()> {
    let now = OffsetDateTime::now_utc();
    let table = ctx.baselines().snapshot();

    for device in enabled_devices(ctx) {
        let status = ctx.store().device_status(&device.id);
        let latest = ctx.store().latest_telemetry(&device.id);
        let observation = DeviceObservation {
            device: &device,
            status: status.as_ref(),
            latest: latest.as_ref(),
            baselines: &table,
            now,
        };
        let Some(verdict) = ctx.health().evaluate(&observation) else {
            trace!(device = %device.id, "Nothing to judge yet");
            continue;
        };

        let was_critical = ctx
            .store()
            .latest_health(&device.id)
            .is_some_and(|v| v.worst_severity() == Some(Severity::Critical));
        if verdict.worst_severity() == Some(Severity::Critical) && !was_critical {
            let codes: Vec<String> = verdict.reasons.iter().map(|r| r.code.to_string()).collect();
            let message = format!(
                "{}: health {:.0} ({})",
                device.id,
                verdict.score,
                codes.join(", ")
            );
            ctx.record(
                Event::new(EventCategory::Health, Severity::Critical, message.clone())
                    .device(&device.id)
                    .details(json!({ "score": verdict.score, "reasons": codes })),
            );
            ctx.notify(message, Severity::Critical, EventCategory::Health);
        }

        trace!(device = %device.id, score = verdict.score, "Health verdict");
        ctx.store().append_health(verdict);
    }
    Ok(())
}

/// Evaluate every enabled rule against one snapshot and run the matches.
pub async fn rule_sweep(ctx: &FleetContext) -> anyhow::Result<()> {
    let snapshot = rules::RuleSnapshot::capture(ctx, OffsetDateTime::now_utc());
    let plan = rules::plan(&ctx.store().rules(), &snapshot);
    if plan.actions.is_empty() && plan.warnings.is_empty() {
        return Ok(());
    }
    let outcomes = rules::execute(ctx, &plan).await;
    let failed = outcomes
        .iter()
        .filter(|o| matches!(o, rules::ActionOutcome::Failed(_)))
        .count();
    debug!(actions = outcomes.len(), failed, "Rule sweep finished");
    Ok(())
}

/// Move every device into its mode for the current price band.
///
/// The price is sampled whenever a price source is configured, so
/// price-threshold rules see it with auto-optimization off. Modes only
/// change when auto-optimization is on. Devices changed within the mode
/// dwell time are left alone.
pub async fn energy_optimize(ctx: &FleetContext) -> anyhow::Result<()> {
    let Some(source) = ctx.price_source() else {
        debug!("No price source configured");
        return Ok(());
    };
    let price = source
        .current_price()
        .await
        .context("reading energy price")?;
    let now = OffsetDateTime::now_utc();
    ctx.store().record_price(PricePoint {
        timestamp: now,
        price,
    });
    if !ctx.store().settings().auto_optimize {
        trace!(price, "Auto-optimization off");
        return Ok(());
    }

    let bands = ctx.store().bands();
    let Some(selection) = select_band(&bands, price) else {
        ctx.record(Event::new(
            EventCategory::Config,
            Severity::Warning,
            "auto-optimization is on but no energy bands are configured",
        ));
        return Ok(());
    };
    let band = selection.band;
    if selection.fallback {
        ctx.record(
            Event::new(
                EventCategory::Config,
                Severity::Warning,
                format!("price {price} is outside every band, using {}", band.name),
            )
            .details(json!({ "price": price, "band": band.name })),
        );
    }
    debug!(price, band = %band.name, "Energy band selected");

    let dwell = ctx.control_config().min_mode_dwell();
    for device in enabled_devices(ctx) {
        let Some(mode) = band.mode_for(device.device_type) else {
            continue;
        };
        if device.current_mode.as_ref() == Some(mode) {
            continue;
        }
        if let Some(changed) = device.last_mode_change {
            if now - changed < dwell {
                debug!(device = %device.id, "Mode changed recently, leaving it");
                continue;
            }
        }

        match ctx.apply_mode(&device.id, mode).await {
            Ok(ModeChange::Changed { .. }) => ctx.record(
                Event::new(
                    EventCategory::Energy,
                    Severity::Info,
                    format!("band {} at price {price}: mode {mode}", band.name),
                )
                .device(&device.id)
                .details(json!({ "band": band.name, "price": price, "mode": mode })),
            ),
            Ok(ModeChange::Unchanged) => {}
            Err(e) => {
                warn!(device = %device.id, error = %e, "Energy mode change failed");
                ctx.record(
                    Event::new(
                        EventCategory::Energy,
                        Severity::Warning,
                        format!("could not apply mode {mode}: {e}"),
                    )
                    .device(&device.id),
                );
            }
        }
    }
    Ok(())
}

/// Coin of the band the latest recorded price falls in.
fn band_coin(ctx: &FleetContext) -> Option<String> {
    let price = ctx.store().latest_price()?.price;
    let bands = ctx.store().bands();
    select_band(&bands, price)?.band.target_coin.clone()
}

/// Probe every enabled pool, score it and fail devices over from pools
/// that keep failing.
pub async fn pool_check(ctx: &FleetContext) -> anyhow::Result<()> {
    let pools = ctx.store().pools();
    let latest: Vec<TelemetrySample> = enabled_devices(ctx)
        .iter()
        .filter_map(|d| ctx.store().latest_telemetry(&d.id))
        .collect();

    let probes = join_all(pools.iter().filter(|p| p.enabled).map(|pool| async move {
        (pool, ctx.probe().probe(pool).await)
    }))
    .await;
    let now = OffsetDateTime::now_utc();

    for (pool, outcome) in probes {
        let users: Vec<&TelemetrySample> = latest
            .iter()
            .filter(|s| {
                s.pool_in_use
                    .as_deref()
                    .is_some_and(|reported| pool.matches_endpoint(reported))
            })
            .collect();
        let rates: Vec<f64> = users.iter().filter_map(|s| s.reject_rate()).collect();
        let reject_rate =
            (!rates.is_empty()).then(|| rates.iter().sum::<f64>() / rates.len() as f64);

        let sample = PoolHealthSample {
            pool_id: pool.id.clone(),
            timestamp: now,
            reachable: outcome.reachable,
            latency_ms: outcome.latency.map(|l| l.as_secs_f64() * 1000.0),
            reject_rate,
            score: pool_score(ctx.pools().config(), &outcome, reject_rate),
        };
        ctx.store().append_pool_health(sample.clone());

        let in_use_by: Vec<DeviceId> = users.iter().map(|s| s.device_id.clone()).collect();
        let verdict = ctx.pools().observe(sample, in_use_by.clone());
        trace!(
            pool = %pool.id,
            score = verdict.rolling_score,
            alarm = ?verdict.alarm,
            "Pool checked"
        );

        match verdict.alarm {
            AlarmStatus::Triggered => {
                let message = format!(
                    "pool {} failing (score {:.0}), moving {} device(s)",
                    pool.id,
                    verdict.rolling_score,
                    in_use_by.len()
                );
                ctx.record(
                    Event::new(EventCategory::Pool, Severity::Critical, message.clone())
                        .details(json!({ "pool": pool.id, "devices": in_use_by })),
                );
                ctx.notify(message, Severity::Critical, EventCategory::Pool);
            }
            AlarmStatus::Resolved => ctx.record(Event::new(
                EventCategory::Pool,
                Severity::Info,
                format!("pool {} recovered", pool.id),
            )),
            _ => {}
        }

        if verdict.failover {
            for id in &in_use_by {
                if let Err(e) = move_device(ctx, id, pool, &pools).await {
                    warn!(device = %id, pool = %pool.id, error = %e, "Failover failed");
                }
            }
        }
    }
    Ok(())
}

/// Switch a device off `from` to the best candidate. None when there is
/// no candidate.
async fn move_device(
    ctx: &FleetContext,
    id: &DeviceId,
    from: &Pool,
    pools: &[Pool],
) -> crate::error::Result<Option<PoolSwitch>> {
    let coin = band_coin(ctx);
    let candidates = ctx.pools().candidates(pools, &from.id, coin.as_deref());
    let Some(target) = candidates.first() else {
        warn!(device = %id, pool = %from.id, coin = ?coin, "No failover candidate");
        return Ok(None);
    };
    ctx.switch_pool(id, target).await.map(Some)
}

/// Move one device off its current pool now.
pub async fn failover_device(ctx: &FleetContext, id: &DeviceId) -> anyhow::Result<PoolSwitch> {
    if ctx.store().device(id).is_none() {
        anyhow::bail!("device {id} not found");
    }
    let pools = ctx.store().pools();
    let reported = ctx
        .store()
        .latest_telemetry(id)
        .and_then(|s| s.pool_in_use)
        .with_context(|| format!("device {id} has not reported a pool"))?;
    let current = pools
        .iter()
        .find(|p| p.matches_endpoint(&reported))
        .with_context(|| format!("device {id} is on unmanaged pool {reported}"))?;

    info!(device = %id, pool = %current.id, "Manual failover");
    let switched = move_device(ctx, id, current, &pools)
        .await?
        .with_context(|| format!("no failover candidate for pool {}", current.id))?;
    ctx.pools().reset(&current.id);
    Ok(switched)
}

/// Scan the configured ranges and add unknown hosts as disabled devices.
pub async fn discovery_scan(ctx: &FleetContext) -> anyhow::Result<()> {
    let config = ctx.discovery_config();
    let addrs = discovery::targets(config)?;
    if addrs.is_empty() {
        debug!("No discovery ranges configured");
        return Ok(());
    }

    let scanned = addrs.len();
    let found = discovery::sweep(
        addrs,
        config.port,
        config.concurrency,
        Duration::from_millis(config.connect_timeout_ms),
    )
    .await;

    let known: HashSet<String> = ctx
        .store()
        .devices()
        .iter()
        .map(|d| d.host().to_string())
        .collect();
    let mut added = 0;
    for addr in found {
        let host = addr.to_string();
        let id = format!("discovered-{}", host.replace('.', "-"));
        if known.contains(&host) || ctx.store().device(&DeviceId::new(id.as_str())).is_some() {
            continue;
        }

        let mut device = Device::new(id, config.device_type, host.clone());
        device.driver = config.driver.clone();
        device.enabled = false;
        let id = device.id.clone();
        ctx.store().upsert_device(device);
        ctx.record(
            Event::new(
                EventCategory::Discovery,
                Severity::Info,
                format!("found device at {host}"),
            )
            .device(&id)
            .details(json!({ "address": host })),
        );
        added += 1;
    }
    info!(scanned, added, "Discovery scan finished");
    Ok(())
}

/// Register every job with the scheduler. A zero discovery interval
/// leaves the scan available on demand only.
pub fn register_all(
    scheduler: &Scheduler,
    ctx: &Arc<FleetContext>,
    intervals: &JobIntervals,
) -> Result<(), SchedulerError> {
    macro_rules! job {
        ($run:path) => {{
            let ctx = ctx.clone();
            job_fn(move || {
                let ctx = ctx.clone();
                async move { $run(&ctx).await }
            })
        }};
    }

    let secs = Duration::from_secs;
    scheduler.schedule(
        TELEMETRY_POLL,
        secs(intervals.telemetry_poll_secs),
        job!(poll_telemetry),
    )?;
    scheduler.schedule(
        BASELINE_RECOMPUTE,
        secs(intervals.baseline_recompute_secs),
        job!(recompute_baselines),
    )?;
    scheduler.schedule(
        HEALTH_SWEEP,
        secs(intervals.health_sweep_secs),
        job!(health_sweep),
    )?;
    scheduler.schedule(RULE_SWEEP, secs(intervals.rule_sweep_secs), job!(rule_sweep))?;
    scheduler.schedule(
        ENERGY_OPTIMIZE,
        secs(intervals.energy_optimize_secs),
        job!(energy_optimize),
    )?;
    scheduler.schedule(POOL_CHECK, secs(intervals.pool_check_secs), job!(pool_check))?;
    if intervals.discovery_scan_secs > 0 {
        scheduler.schedule(
            DISCOVERY_SCAN,
            secs(intervals.discovery_scan_secs),
            job!(discovery_scan),
        )?;
    } else {
        scheduler.register(DISCOVERY_SCAN, job!(discovery_scan))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::EnergyBand;
    use crate::health::ReasonCode;
    use crate::pool::ProbeOutcome;
    use crate::price::FixedPrice;
    use crate::rules::{ActionType, AutomationRule, TriggerType};
    use crate::store::{MemoryStore, Settings};
    use crate::testing::Harness;
    use crate::types::DeviceType;
    use std::collections::BTreeMap;

    fn bands() -> Vec<EnergyBand> {
        let band = |name: &str, order, min, max, mode: &str| EnergyBand {
            name: name.to_string(),
            sort_order: order,
            min_price: min,
            max_price: max,
            target_coin: None,
            modes: BTreeMap::from([(DeviceType::Bitaxe, Mode::new(mode))]),
        };
        vec![
            band("cheap", 1, Some(0.0), Some(20.0), "turbo"),
            band("dear", 2, Some(20.0), None, "eco"),
        ]
    }

    fn optimizing(price: f64) -> (Harness, Arc<FixedPrice>) {
        let source = Arc::new(FixedPrice::new(price));
        let harness = Harness::with_parts(|parts| {
            parts.price = Some(source.clone() as Arc<dyn crate::price::PriceSource>);
        });
        let ctx = harness.ctx();
        ctx.store().replace_bands(bands());
        ctx.store().put_settings(Settings {
            auto_optimize: true,
            ..Settings::default()
        });
        (harness, source)
    }

    fn events(ctx: &FleetContext, category: EventCategory) -> Vec<Event> {
        ctx.store()
            .events()
            .into_iter()
            .filter(|e| e.category == category)
            .collect()
    }

    #[tokio::test]
    async fn poll_records_samples_and_reachability() {
        let harness = Harness::new();
        let rig = harness.add_device("rig-1", DeviceType::Bitaxe);
        let ctx = harness.ctx();
        let id = DeviceId::new("rig-1");

        poll_telemetry(&ctx).await.unwrap();
        let sample = ctx.store().latest_telemetry(&id).unwrap();
        assert_eq!(sample.hashrate_ghs, 1100.0);
        assert_eq!(sample.mode, Some(Mode::new("standard")));
        assert!(ctx.store().device_status(&id).unwrap().online);

        rig.set_online(false);
        poll_telemetry(&ctx).await.unwrap();
        poll_telemetry(&ctx).await.unwrap();
        let status = ctx.store().device_status(&id).unwrap();
        assert!(!status.online);
        assert_eq!(status.consecutive_failures, 2);
        // One event for the transition, not one per failed poll.
        assert_eq!(events(&ctx, EventCategory::Device).len(), 1);
    }

    #[tokio::test]
    async fn disabled_devices_are_not_polled() {
        let harness = Harness::new();
        harness.add_device("rig-1", DeviceType::Bitaxe);
        let ctx = harness.ctx();
        let id = DeviceId::new("rig-1");
        let mut device = ctx.store().device(&id).unwrap();
        device.enabled = false;
        ctx.store().upsert_device(device);

        poll_telemetry(&ctx).await.unwrap();
        assert!(ctx.store().device_status(&id).is_none());
    }

    #[tokio::test]
    async fn reported_mode_is_adopted() {
        let harness = Harness::new();
        let rig = harness.add_device("rig-1", DeviceType::Bitaxe);
        rig.set_mode_now(Mode::new("turbo"));
        let ctx = harness.ctx();

        poll_telemetry(&ctx).await.unwrap();
        let device = ctx.store().device(&DeviceId::new("rig-1")).unwrap();
        assert_eq!(device.current_mode, Some(Mode::new("turbo")));
        assert_eq!(device.last_mode_change, None);
    }

    #[tokio::test]
    async fn offline_device_is_critical_every_tick_and_announced_once() {
        let harness = Harness::new();
        let rig = harness.add_device("rig-1", DeviceType::Bitaxe);
        rig.set_online(false);
        let ctx = harness.ctx();
        let id = DeviceId::new("rig-1");

        for _ in 0..3 {
            poll_telemetry(&ctx).await.unwrap();
            health_sweep(&ctx).await.unwrap();
            let verdict = ctx.store().latest_health(&id).unwrap();
            assert!(verdict.is_offline());
            assert!(verdict.score < 60.0);
        }
        assert_eq!(ctx.store().health_history(&id).len(), 3);

        harness.settle().await;
        assert_eq!(harness.notifier().messages().len(), 1);
    }

    #[tokio::test]
    async fn never_polled_device_gets_no_verdict() {
        let harness = Harness::new();
        harness.add_device("rig-1", DeviceType::Bitaxe);
        let ctx = harness.ctx();

        health_sweep(&ctx).await.unwrap();
        assert!(ctx.store().current_health().is_empty());
    }

    #[tokio::test]
    async fn hard_floors_apply_without_baselines() {
        let harness = Harness::new();
        let rig = harness.add_device("rig-1", DeviceType::Bitaxe);
        rig.set_temperature(Some(95.0));
        rig.set_hashrate(Some(0.0));
        rig.set_pool(None);
        let ctx = harness.ctx();
        let id = DeviceId::new("rig-1");

        poll_telemetry(&ctx).await.unwrap();
        health_sweep(&ctx).await.unwrap();
        let verdict = ctx.store().latest_health(&id).unwrap();
        assert!(verdict.has_reason(ReasonCode::TempCritical));
        assert!(verdict.has_reason(ReasonCode::HashrateZero));
        assert!(verdict.has_reason(ReasonCode::NoPool));

        health_sweep(&ctx).await.unwrap();
        harness.settle().await;
        let sent = harness.notifier().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, Severity::Critical);
    }

    #[tokio::test]
    async fn baselines_follow_telemetry() {
        let harness = Harness::new();
        harness.add_device("rig-1", DeviceType::Bitaxe);
        let ctx = harness.ctx();

        poll_telemetry(&ctx).await.unwrap();
        recompute_baselines(&ctx).await.unwrap();
        assert!(!ctx.baselines().snapshot().is_empty());
    }

    #[tokio::test]
    async fn energy_optimize_applies_band_mode() {
        let (harness, _) = optimizing(20.0);
        let rig = harness.add_device("rig-1", DeviceType::Bitaxe);
        let ctx = harness.ctx();

        energy_optimize(&ctx).await.unwrap();
        // 20.0 sits on the edge and belongs to the higher band.
        assert_eq!(rig.mode(), Mode::new("eco"));
        assert_eq!(ctx.store().latest_price().unwrap().price, 20.0);
        assert_eq!(events(&ctx, EventCategory::Energy).len(), 1);
    }

    #[tokio::test]
    async fn energy_optimize_respects_mode_dwell() {
        let (harness, source) = optimizing(25.0);
        let rig = harness.add_device("rig-1", DeviceType::Bitaxe);
        let ctx = harness.ctx();

        energy_optimize(&ctx).await.unwrap();
        source.set(5.0);
        energy_optimize(&ctx).await.unwrap();
        assert_eq!(rig.mode(), Mode::new("eco"));
        assert_eq!(rig.set_mode_calls(), 1);
    }

    #[tokio::test]
    async fn energy_optimize_only_samples_without_auto_optimize() {
        let (harness, _) = optimizing(25.0);
        let rig = harness.add_device("rig-1", DeviceType::Bitaxe);
        let ctx = harness.ctx();
        ctx.store().put_settings(Settings::default());

        energy_optimize(&ctx).await.unwrap();
        assert_eq!(rig.set_mode_calls(), 0);
        assert_eq!(ctx.store().latest_price().map(|p| p.price), Some(25.0));
    }

    #[tokio::test]
    async fn price_rules_see_sampled_price() {
        let (harness, _) = optimizing(25.0);
        let rig = harness.add_device("rig-1", DeviceType::Bitaxe);
        let ctx = harness.ctx();
        ctx.rules().set_auto_optimize(false).unwrap();
        ctx.rules()
            .create(AutomationRule::new(
                "expensive",
                TriggerType::PriceThreshold,
                json!({"above": 20.0}),
                ActionType::ApplyMode,
                json!({"mode": "eco"}),
            ))
            .unwrap();

        energy_optimize(&ctx).await.unwrap();
        assert_eq!(rig.set_mode_calls(), 0);

        rule_sweep(&ctx).await.unwrap();
        assert_eq!(rig.set_mode_calls(), 1);
        assert_eq!(rig.mode(), Mode::new("eco"));
    }

    #[tokio::test]
    async fn uncovered_price_falls_back_with_warning() {
        let (harness, _) = optimizing(-3.0);
        let rig = harness.add_device("rig-1", DeviceType::Bitaxe);
        let ctx = harness.ctx();

        energy_optimize(&ctx).await.unwrap();
        assert_eq!(rig.mode(), Mode::new("turbo"));
        let warnings = events(&ctx, EventCategory::Config);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].severity, Severity::Warning);
    }

    fn pool_harness(adjust: impl FnOnce(&mut crate::context::ContextParts)) -> Harness {
        let harness = Harness::with_parts(adjust);
        let mut main = Pool::new("main", "stratum+tcp://pool.local", 3333);
        main.priority = 0;
        let mut backup = Pool::new("backup", "stratum+tcp://backup.local", 3333);
        backup.priority = 1;
        harness.add_pool(main);
        harness.add_pool(backup);
        harness
            .probe()
            .set("backup", ProbeOutcome::reachable(Duration::from_millis(20)));
        harness
    }

    #[tokio::test]
    async fn failing_pool_fails_over_after_three_ticks() {
        let harness = pool_harness(|_| {});
        let rig = harness.add_device("rig-1", DeviceType::Bitaxe);
        let ctx = harness.ctx();
        poll_telemetry(&ctx).await.unwrap();

        pool_check(&ctx).await.unwrap();
        pool_check(&ctx).await.unwrap();
        assert_eq!(rig.switch_pool_calls(), 0);

        pool_check(&ctx).await.unwrap();
        assert_eq!(rig.switch_pool_calls(), 1);
        assert_eq!(rig.pool().as_deref(), Some("stratum+tcp://backup.local:3333"));

        // Telemetry still shows the old pool; the next tick must not switch again.
        pool_check(&ctx).await.unwrap();
        assert_eq!(rig.switch_pool_calls(), 1);

        harness.settle().await;
        assert_eq!(harness.notifier().messages().len(), 1);
    }

    #[tokio::test]
    async fn recovery_before_threshold_prevents_failover() {
        let harness = pool_harness(|parts| parts.pool.window = 1);
        let rig = harness.add_device("rig-1", DeviceType::Bitaxe);
        let ctx = harness.ctx();
        poll_telemetry(&ctx).await.unwrap();

        pool_check(&ctx).await.unwrap();
        pool_check(&ctx).await.unwrap();
        harness
            .probe()
            .set("main", ProbeOutcome::reachable(Duration::from_millis(10)));
        pool_check(&ctx).await.unwrap();
        harness.probe().set("main", ProbeOutcome::unreachable());
        pool_check(&ctx).await.unwrap();
        pool_check(&ctx).await.unwrap();

        assert_eq!(rig.switch_pool_calls(), 0);
        assert_eq!(ctx.store().pool_health(&"main".into()).len(), 5);
    }

    #[tokio::test]
    async fn pool_recovers_only_when_reachable_again() {
        let harness = pool_harness(|parts| parts.pool.window = 1);
        let rig = harness.add_device("rig-1", DeviceType::Bitaxe);
        let ctx = harness.ctx();
        poll_telemetry(&ctx).await.unwrap();
        for _ in 0..3 {
            pool_check(&ctx).await.unwrap();
        }
        assert_eq!(rig.switch_pool_calls(), 1);

        // Nothing hashes on main any more, but it is still down.
        poll_telemetry(&ctx).await.unwrap();
        pool_check(&ctx).await.unwrap();
        let recovered = |ctx: &FleetContext| {
            events(ctx, EventCategory::Pool)
                .iter()
                .filter(|e| e.message.contains("recovered"))
                .count()
        };
        assert_eq!(recovered(&ctx), 0);
        assert!(ctx.pools().status(&"main".into()).failing);

        harness
            .probe()
            .set("main", ProbeOutcome::reachable(Duration::from_millis(10)));
        pool_check(&ctx).await.unwrap();
        assert_eq!(recovered(&ctx), 1);
        assert!(!ctx.pools().status(&"main".into()).failing);
    }

    #[tokio::test]
    async fn idle_pool_never_fails_over() {
        let harness = pool_harness(|_| {});
        let ctx = harness.ctx();
        for _ in 0..5 {
            pool_check(&ctx).await.unwrap();
        }
        assert!(!ctx.pools().status(&"main".into()).failing);
        assert!(events(&ctx, EventCategory::Pool).is_empty());
    }

    #[tokio::test]
    async fn manual_failover_moves_device() {
        let harness = pool_harness(|_| {});
        let rig = harness.add_device("rig-1", DeviceType::Bitaxe);
        let ctx = harness.ctx();
        let id = DeviceId::new("rig-1");

        assert!(failover_device(&ctx, &id).await.is_err());
        poll_telemetry(&ctx).await.unwrap();
        assert_eq!(
            failover_device(&ctx, &id).await.unwrap(),
            PoolSwitch::Switched
        );
        assert_eq!(rig.pool().as_deref(), Some("stratum+tcp://backup.local:3333"));
        assert!(
            failover_device(&ctx, &DeviceId::new("ghost"))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn rule_sweep_runs_matching_rules() {
        let harness = Harness::new();
        harness.add_device("rig-1", DeviceType::Bitaxe);
        let ctx = harness.ctx();
        ctx.rules()
            .create(AutomationRule::new(
                "heartbeat",
                TriggerType::TimeWindow,
                json!({"start": "00:00", "end": "00:00"}),
                ActionType::LogEvent,
                json!({"message": "tick"}),
            ))
            .unwrap();

        rule_sweep(&ctx).await.unwrap();
        let audited = events(&ctx, EventCategory::Rule);
        assert_eq!(audited.len(), 1);
        assert!(audited[0].message.contains("tick"));
    }

    #[tokio::test]
    async fn discovery_adds_unknown_hosts_disabled() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let harness = Harness::with_parts(|parts| {
            parts.discovery.ranges = vec!["127.0.0.1".to_string()];
            parts.discovery.port = port;
        });
        let ctx = harness.ctx();

        discovery_scan(&ctx).await.unwrap();
        discovery_scan(&ctx).await.unwrap();

        let devices = ctx.store().devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id.as_str(), "discovered-127-0-0-1");
        assert!(!devices[0].enabled);
        assert_eq!(events(&ctx, EventCategory::Discovery).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn register_all_schedules_every_job() {
        let harness = Harness::new();
        let ctx = harness.ctx();
        let scheduler = Scheduler::new(Arc::new(MemoryStore::default()));

        register_all(&scheduler, &ctx, &JobIntervals::default()).unwrap();
        let mut expected: Vec<String> = JOB_NAMES.iter().map(|n| n.to_string()).collect();
        expected.sort();
        assert_eq!(scheduler.names(), expected);
        assert_eq!(scheduler.interval(DISCOVERY_SCAN), None);
        assert_eq!(
            scheduler.interval(TELEMETRY_POLL),
            Some(Duration::from_secs(30))
        );

        scheduler.run_now(DISCOVERY_SCAN).await.unwrap();
        scheduler.shutdown().await;
    }
}
