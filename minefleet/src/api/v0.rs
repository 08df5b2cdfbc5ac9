//! API v0 endpoints.
//!
//! Version 0 signals an unstable API; breaking changes are expected.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use utoipa::IntoParams;
use utoipa_axum::{router::OpenApiRouter, routes};

use super::ApiError;
use super::server::SharedState;
use crate::api_client::types::{
    DeviceState, EventRecord, FailoverResult, HealthState, JobState, PoolState, RulePatch,
    SettingsPatch, SettingsState,
};
use crate::context::{FleetContext, PoolSwitch};
use crate::energy::EnergyBand;
use crate::jobs;
use crate::rules::AutomationRule;
use crate::scheduler::SchedulerError;
use crate::store::Settings;
use crate::types::{Device, DeviceId, Event};

const DEFAULT_EVENT_LIMIT: usize = 100;

/// Build the v0 API routes with OpenAPI metadata.
pub fn routes() -> OpenApiRouter<SharedState> {
    OpenApiRouter::new()
        .routes(routes!(health))
        .routes(routes!(get_devices))
        .routes(routes!(failover_device))
        .routes(routes!(restart_device))
        .routes(routes!(get_events))
        .routes(routes!(get_pools))
        .routes(routes!(get_bands, put_bands))
        .routes(routes!(get_jobs))
        .routes(routes!(run_job))
        .routes(routes!(get_settings, patch_settings))
        .routes(routes!(get_rules, create_rule))
        .routes(routes!(patch_rule))
}

fn device_state(ctx: &FleetContext, device: Device) -> DeviceState {
    let store = ctx.store();
    let status = store.device_status(&device.id);
    let latest = store.latest_telemetry(&device.id);
    let health = store.latest_health(&device.id).map(|verdict| HealthState {
        score: verdict.score,
        reasons: verdict.reasons.iter().map(|r| r.code.to_string()).collect(),
        suggested_actions: verdict
            .suggested_actions
            .iter()
            .map(ToString::to_string)
            .collect(),
    });

    DeviceState {
        id: device.id.to_string(),
        name: device.name,
        device_type: device.device_type.to_string(),
        address: device.address,
        enabled: device.enabled,
        current_mode: device.current_mode.map(|m| m.to_string()),
        online: status.map(|s| s.online),
        hashrate_ghs: latest.as_ref().map(|s| s.hashrate_ghs),
        temperature_c: latest.as_ref().and_then(|s| s.temperature_c),
        pool: latest.and_then(|s| s.pool_in_use),
        health,
    }
}

fn event_record(event: Event) -> EventRecord {
    EventRecord {
        timestamp: event.timestamp.format(&Rfc3339).unwrap_or_default(),
        category: event.category.to_string(),
        severity: event.severity.to_string(),
        device_id: event.device_id.map(|id| id.to_string()),
        message: event.message,
        details: event.details,
    }
}

fn settings_state(settings: Settings) -> SettingsState {
    SettingsState {
        auto_optimize: settings.auto_optimize,
        utc_offset_minutes: settings.utc_offset_minutes,
    }
}

fn job_state(state: &SharedState, name: &str) -> JobState {
    JobState {
        name: name.to_string(),
        interval_secs: state.scheduler.interval(name).map(|i| i.as_secs()),
        running: state.scheduler.is_running(name),
    }
}

/// Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = OK, description = "Server is running", body = String),
    ),
)]
async fn health() -> &'static str {
    "OK"
}

/// Return all devices with their latest telemetry and verdict.
#[utoipa::path(
    get,
    path = "/devices",
    tag = "devices",
    responses(
        (status = OK, description = "Managed devices", body = Vec<DeviceState>),
    ),
)]
async fn get_devices(State(state): State<SharedState>) -> Json<Vec<DeviceState>> {
    let ctx = &state.ctx;
    Json(
        ctx.store()
            .devices()
            .into_iter()
            .map(|device| device_state(ctx, device))
            .collect(),
    )
}

/// Move a device off its current pool to the best failover candidate.
#[utoipa::path(
    post,
    path = "/devices/{id}/failover",
    tag = "devices",
    params(
        ("id" = String, Path, description = "Device id"),
    ),
    responses(
        (status = OK, description = "Failover result", body = FailoverResult),
        (status = NOT_FOUND, description = "Device not found"),
        (status = CONFLICT, description = "No pool to fail over from or to"),
    ),
)]
async fn failover_device(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<FailoverResult>, ApiError> {
    let device_id = DeviceId::new(id);
    if state.ctx.store().device(&device_id).is_none() {
        return Err((StatusCode::NOT_FOUND, format!("device {device_id} not found")));
    }
    let outcome = jobs::failover_device(&state.ctx, &device_id)
        .await
        .map_err(|e| (StatusCode::CONFLICT, format!("{e:#}")))?;
    let outcome = match outcome {
        PoolSwitch::Switched => "switched",
        PoolSwitch::Unchanged => "unchanged",
        PoolSwitch::Unverified => "unverified",
    };
    Ok(Json(FailoverResult {
        device_id: device_id.to_string(),
        outcome: outcome.to_string(),
    }))
}

/// Restart a device.
#[utoipa::path(
    post,
    path = "/devices/{id}/restart",
    tag = "devices",
    params(
        ("id" = String, Path, description = "Device id"),
    ),
    responses(
        (status = NO_CONTENT, description = "Device restarted"),
        (status = NOT_FOUND, description = "Device not found"),
        (status = BAD_GATEWAY, description = "Device did not accept the restart"),
    ),
)]
async fn restart_device(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.ctx.restart(&DeviceId::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct EventQuery {
    /// Most recent entries to return (default 100).
    limit: Option<usize>,
    /// Only entries about this device.
    device: Option<String>,
}

/// Return recent audit events, oldest first.
#[utoipa::path(
    get,
    path = "/events",
    tag = "events",
    params(EventQuery),
    responses(
        (status = OK, description = "Audit events", body = Vec<EventRecord>),
    ),
)]
async fn get_events(
    State(state): State<SharedState>,
    Query(query): Query<EventQuery>,
) -> Json<Vec<EventRecord>> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    let mut events: Vec<Event> = state
        .ctx
        .store()
        .events()
        .into_iter()
        .filter(|e| match &query.device {
            Some(device) => e.device_id.as_ref().is_some_and(|id| id.as_str() == device),
            None => true,
        })
        .collect();
    let skip = events.len().saturating_sub(limit);
    events.drain(..skip);
    Json(events.into_iter().map(event_record).collect())
}

/// Return all pools with their rolling health.
#[utoipa::path(
    get,
    path = "/pools",
    tag = "pools",
    responses(
        (status = OK, description = "Pools", body = Vec<PoolState>),
    ),
)]
async fn get_pools(State(state): State<SharedState>) -> Json<Vec<PoolState>> {
    let ctx = &state.ctx;
    Json(
        ctx.store()
            .pools()
            .into_iter()
            .map(|pool| {
                let status = ctx.pools().status(&pool.id);
                PoolState {
                    id: pool.id.to_string(),
                    url: pool.url,
                    port: pool.port,
                    priority: pool.priority,
                    enabled: pool.enabled,
                    rolling_score: status.rolling_score,
                    reachable: status.reachable,
                    in_use_by: status.in_use_by.iter().map(ToString::to_string).collect(),
                    failing: status.failing,
                }
            })
            .collect(),
    )
}

#[utoipa::path(
    get,
    path = "/bands",
    tag = "energy",
    responses(
        (status = OK, description = "Energy band table", body = Vec<EnergyBand>),
    ),
)]
async fn get_bands(State(state): State<SharedState>) -> Json<Vec<EnergyBand>> {
    Json(state.ctx.store().bands())
}

/// Replace the energy band table. Gaps and overlaps are accepted and
/// returned as warnings.
#[utoipa::path(
    put,
    path = "/bands",
    tag = "energy",
    request_body = Vec<EnergyBand>,
    responses(
        (status = OK, description = "Table stored; warnings about its coverage", body = Vec<String>),
    ),
)]
async fn put_bands(
    State(state): State<SharedState>,
    Json(bands): Json<Vec<EnergyBand>>,
) -> Json<Vec<String>> {
    let issues = state.ctx.replace_bands(bands);
    Json(issues.iter().map(ToString::to_string).collect())
}

/// Return the scheduled jobs.
#[utoipa::path(
    get,
    path = "/jobs",
    tag = "jobs",
    responses(
        (status = OK, description = "Jobs", body = Vec<JobState>),
    ),
)]
async fn get_jobs(State(state): State<SharedState>) -> Json<Vec<JobState>> {
    Json(
        state
            .scheduler
            .names()
            .iter()
            .map(|name| job_state(&state, name))
            .collect(),
    )
}

/// Run a job now and wait for it to finish.
#[utoipa::path(
    post,
    path = "/jobs/{name}/run",
    tag = "jobs",
    params(
        ("name" = String, Path, description = "Job name"),
    ),
    responses(
        (status = OK, description = "Job finished", body = JobState),
        (status = NOT_FOUND, description = "No such job"),
        (status = CONFLICT, description = "Job is already running"),
        (status = INTERNAL_SERVER_ERROR, description = "Job failed"),
        (status = SERVICE_UNAVAILABLE, description = "Shutting down"),
    ),
)]
async fn run_job(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Json<JobState>, ApiError> {
    state.scheduler.run_now(&name).await.map_err(|e| {
        let status = match e {
            SchedulerError::UnknownJob(_) => StatusCode::NOT_FOUND,
            SchedulerError::Busy(_) | SchedulerError::AlreadyScheduled(_) => StatusCode::CONFLICT,
            SchedulerError::ZeroInterval(_) => StatusCode::BAD_REQUEST,
            SchedulerError::Failed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            SchedulerError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, e.to_string())
    })?;
    Ok(Json(job_state(&state, &name)))
}

#[utoipa::path(
    get,
    path = "/settings",
    tag = "settings",
    responses(
        (status = OK, description = "Fleet settings", body = SettingsState),
    ),
)]
async fn get_settings(State(state): State<SharedState>) -> Json<SettingsState> {
    Json(settings_state(state.ctx.store().settings()))
}

/// Apply partial updates to the fleet settings.
#[utoipa::path(
    patch,
    path = "/settings",
    tag = "settings",
    request_body = SettingsPatch,
    responses(
        (status = OK, description = "Updated settings", body = SettingsState),
        (status = CONFLICT, description = "An enabled price-threshold rule competes with auto-optimization"),
    ),
)]
async fn patch_settings(
    State(state): State<SharedState>,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<SettingsState>, ApiError> {
    let settings = state.ctx.rules().update_settings(|settings| {
        if let Some(auto_optimize) = patch.auto_optimize {
            settings.auto_optimize = auto_optimize;
        }
        if let Some(offset) = patch.utc_offset_minutes {
            settings.utc_offset_minutes = offset;
        }
    })?;
    Ok(Json(settings_state(settings)))
}

/// Return all rules in evaluation order.
#[utoipa::path(
    get,
    path = "/rules",
    tag = "rules",
    responses(
        (status = OK, description = "Automation rules", body = Vec<AutomationRule>),
    ),
)]
async fn get_rules(State(state): State<SharedState>) -> Json<Vec<AutomationRule>> {
    Json(state.ctx.store().rules())
}

#[utoipa::path(
    post,
    path = "/rules",
    tag = "rules",
    request_body = AutomationRule,
    responses(
        (status = CREATED, description = "Rule created", body = AutomationRule),
        (status = BAD_REQUEST, description = "Malformed trigger or action config"),
        (status = CONFLICT, description = "Name taken, or conflicts with auto-optimization"),
    ),
)]
async fn create_rule(
    State(state): State<SharedState>,
    Json(rule): Json<AutomationRule>,
) -> Result<(StatusCode, Json<AutomationRule>), ApiError> {
    let rule = state.ctx.rules().create(rule)?;
    Ok((StatusCode::CREATED, Json(rule)))
}

/// Enable, disable or reprioritize a rule.
#[utoipa::path(
    patch,
    path = "/rules/{name}",
    tag = "rules",
    params(
        ("name" = String, Path, description = "Rule name"),
    ),
    request_body = RulePatch,
    responses(
        (status = OK, description = "Updated rule", body = AutomationRule),
        (status = NOT_FOUND, description = "Rule not found"),
        (status = CONFLICT, description = "Conflicts with auto-optimization"),
    ),
)]
async fn patch_rule(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Json(patch): Json<RulePatch>,
) -> Result<Json<AutomationRule>, ApiError> {
    let rules = state.ctx.rules();
    let mut rule = state
        .ctx
        .store()
        .rule(&name)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("rule {name} not found")))?;
    if let Some(enabled) = patch.enabled {
        rule.enabled = enabled;
    }
    if let Some(priority) = patch.priority {
        rule.priority = priority;
    }
    Ok(Json(rules.update(rule)?))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use http::{Request, Response};
    use http_body_util::BodyExt;
    use serde::de::DeserializeOwned;
    use serde_json::{Value, json};
    use tokio::sync::Notify;
    use tower::ServiceExt;

    use super::*;
    use crate::api::build_router;
    use crate::scheduler::{Scheduler, job_fn};
    use crate::testing::Harness;
    use crate::types::DeviceType;

    fn state(harness: &Harness) -> SharedState {
        let ctx = harness.ctx();
        SharedState {
            scheduler: Arc::new(Scheduler::new(ctx.store().clone())),
            ctx,
        }
    }

    async fn send(
        state: &SharedState,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> Response<Body> {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();
        build_router(state.clone()).oneshot(request).await.unwrap()
    }

    async fn json_body<T: DeserializeOwned>(response: Response<Body>) -> T {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let harness = Harness::new();
        let response = send(&state(&harness), "GET", "/api/v0/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn devices_include_latest_observations() {
        let harness = Harness::new();
        harness.add_device("rig-1", DeviceType::Bitaxe);
        let state = state(&harness);
        jobs::poll_telemetry(&state.ctx).await.unwrap();

        let response = send(&state, "GET", "/api/v0/devices", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let devices: Vec<DeviceState> = json_body(response).await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "rig-1");
        assert_eq!(devices[0].device_type, "bitaxe");
        assert_eq!(devices[0].online, Some(true));
        assert_eq!(devices[0].hashrate_ghs, Some(1100.0));
        assert!(devices[0].health.is_none());
    }

    #[tokio::test]
    async fn settings_conflict_is_409_and_not_applied() {
        let harness = Harness::new();
        let state = state(&harness);
        let create = send(
            &state,
            "POST",
            "/api/v0/rules",
            Some(json!({
                "name": "expensive",
                "trigger_type": "price-threshold",
                "trigger_config": {"above": 30.0},
                "action_type": "log-event"
            })),
        )
        .await;
        assert_eq!(create.status(), StatusCode::CREATED);

        let response = send(
            &state,
            "PATCH",
            "/api/v0/settings",
            Some(json!({"auto_optimize": true})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(!state.ctx.store().settings().auto_optimize);

        // Disabling the rule clears the way.
        let response = send(
            &state,
            "PATCH",
            "/api/v0/rules/expensive",
            Some(json!({"enabled": false})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = send(
            &state,
            "PATCH",
            "/api/v0/settings",
            Some(json!({"auto_optimize": true})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let settings: SettingsState = json_body(response).await;
        assert!(settings.auto_optimize);

        // And now re-enabling the rule is the conflict.
        let response = send(
            &state,
            "PATCH",
            "/api/v0/rules/expensive",
            Some(json!({"enabled": true})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(!state.ctx.store().rule("expensive").unwrap().enabled);
    }

    #[tokio::test]
    async fn malformed_rule_is_400() {
        let harness = Harness::new();
        let response = send(
            &state(&harness),
            "POST",
            "/api/v0/rules",
            Some(json!({
                "name": "bad",
                "trigger_type": "time-window",
                "trigger_config": {"start": "25:00", "end": "06:00"},
                "action_type": "log-event"
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_rule_is_404() {
        let harness = Harness::new();
        let response = send(
            &state(&harness),
            "PATCH",
            "/api/v0/rules/ghost",
            Some(json!({"enabled": false})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn run_job_reports_busy_and_unknown() {
        let harness = Harness::new();
        let state = state(&harness);
        let release = Arc::new(Notify::new());
        let gate = release.clone();
        state
            .scheduler
            .register(
                "slow",
                job_fn(move || {
                    let gate = gate.clone();
                    async move {
                        gate.notified().await;
                        Ok(())
                    }
                }),
            )
            .unwrap();

        let first = {
            let scheduler = state.scheduler.clone();
            tokio::spawn(async move { scheduler.run_now("slow").await })
        };
        while !state.scheduler.is_running("slow") {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let response = send(&state, "POST", "/api/v0/jobs/slow/run", None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let response = send(&state, "POST", "/api/v0/jobs/nope/run", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        release.notify_one();
        first.await.unwrap().unwrap();
        assert!(!state.scheduler.is_running("slow"));
    }

    #[tokio::test]
    async fn run_job_runs_the_job() {
        let harness = Harness::new();
        harness.add_device("rig-1", DeviceType::Bitaxe);
        let state = state(&harness);
        let ctx = state.ctx.clone();
        state
            .scheduler
            .register(
                jobs::TELEMETRY_POLL,
                job_fn(move || {
                    let ctx = ctx.clone();
                    async move { jobs::poll_telemetry(&ctx).await }
                }),
            )
            .unwrap();

        let response = send(&state, "POST", "/api/v0/jobs/telemetry-poll/run", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let job: JobState = json_body(response).await;
        assert_eq!(job.name, "telemetry-poll");
        assert!(!job.running);
        assert!(
            state
                .ctx
                .store()
                .latest_telemetry(&DeviceId::new("rig-1"))
                .is_some()
        );
    }

    #[tokio::test]
    async fn failover_of_unknown_device_is_404() {
        let harness = Harness::new();
        let response = send(&state(&harness), "POST", "/api/v0/devices/ghost/failover", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn failover_without_known_pool_is_409() {
        let harness = Harness::new();
        harness.add_device("rig-1", DeviceType::Bitaxe);
        let response = send(&state(&harness), "POST", "/api/v0/devices/rig-1/failover", None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn restart_reaches_the_device() {
        let harness = Harness::new();
        let rig = harness.add_device("rig-1", DeviceType::Bitaxe);
        let state = state(&harness);

        let response = send(&state, "POST", "/api/v0/devices/rig-1/restart", None).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(rig.restarts(), 1);

        let response = send(&state, "POST", "/api/v0/devices/ghost/restart", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn band_table_is_replaced_with_warnings() {
        let harness = Harness::new();
        let state = state(&harness);
        let bands = json!([
            {"name": "cheap", "sort_order": 1, "max_price": 10.0, "modes": {"bitaxe": "turbo"}},
            {"name": "dear", "sort_order": 2, "min_price": 12.0, "modes": {"bitaxe": "eco"}},
        ]);

        let response = send(&state, "PUT", "/api/v0/bands", Some(bands)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let warnings: Vec<String> = json_body(response).await;
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("[10, 12)"), "{warnings:?}");

        let response = send(&state, "GET", "/api/v0/bands", None).await;
        let stored: Vec<EnergyBand> = json_body(response).await;
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn events_are_filtered_and_limited() {
        let harness = Harness::new();
        let rig = harness.add_device("rig-1", DeviceType::Bitaxe);
        harness.add_device("rig-2", DeviceType::Bitaxe);
        let state = state(&harness);
        rig.set_online(false);
        jobs::poll_telemetry(&state.ctx).await.unwrap();
        for i in 0..3 {
            state.ctx.record(Event::new(
                crate::types::EventCategory::Config,
                crate::types::Severity::Info,
                format!("note {i}"),
            ));
        }

        let response = send(&state, "GET", "/api/v0/events?limit=2", None).await;
        let events: Vec<EventRecord> = json_body(response).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].message, "note 2");

        let response = send(&state, "GET", "/api/v0/events?device=rig-1", None).await;
        let events: Vec<EventRecord> = json_body(response).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, "warning");
    }

    #[tokio::test]
    async fn openapi_document_is_served() {
        let harness = Harness::new();
        let response = send(&state(&harness), "GET", "/api/v0/openapi.json", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let doc: Value = json_body(response).await;
        assert!(doc["paths"]["/api/v0/devices"].is_object());
    }
}
