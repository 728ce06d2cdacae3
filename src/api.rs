//! REST surface under `/api/v1`.
//!
//! Thin handlers over the engines: every response uses the uniform
//! envelope, request ids come from middleware, and the optional API key is
//! enforced for the whole surface.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, Request, State};
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::client::ClientFactory;
use crate::config::AppConfig;
use crate::device_config;
use crate::discovery;
use crate::drift_scheduler::DriftScheduler;
use crate::error::{Error, Result};
use crate::metrics::Collector;
use crate::model::{ConfigTemplate, DriftSchedule, NewDevice};
use crate::plugins::{ImportOptions, PluginType};
use crate::response::{generate_request_id, ApiResponse, ApiResult, RequestId};
use crate::store::{DeviceUpdate, SharedStore};
use crate::sync::{SourceSpec, SyncEngine};
use crate::template::TemplateEngine;
use crate::websocket::{self, Hub};

pub struct AppState {
    pub store: SharedStore,
    pub config: Arc<AppConfig>,
    pub factory: Arc<ClientFactory>,
    pub templates: Arc<TemplateEngine>,
    pub scheduler: Arc<DriftScheduler>,
    pub sync: Arc<SyncEngine>,
    pub collector: Arc<Collector>,
    pub hub: Arc<Hub>,
    pub started_at: Instant,
}

type St = State<Arc<AppState>>;

fn ok<T: Serialize>(rid: &RequestId, data: T) -> ApiResult<T> {
    ApiResult(Ok(ApiResponse::ok(data, &rid.0)))
}

fn reply<T: Serialize>(rid: &RequestId, result: Result<T>) -> ApiResult<T> {
    match result {
        Ok(data) => ok(rid, data),
        Err(err) => ApiResult(Err((err, rid.0.clone()))),
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        // ── Devices ─────────────────────────────────────
        .route("/devices", get(list_devices).post(create_device))
        .route("/devices/:id", get(get_device).put(update_device).delete(delete_device))
        .route("/devices/:id/control", post(control_device))
        // ── Device configuration ────────────────────────
        .route("/devices/:id/config", get(get_stored_config).put(put_stored_config))
        .route("/devices/:id/config/current", get(get_current_config))
        .route("/devices/:id/config/normalized", get(get_normalized_config))
        .route("/devices/:id/config/typed", get(get_typed_config))
        .route("/devices/:id/config/import", post(import_config_from_device))
        .route("/devices/:id/config/status", get(config_status))
        .route("/devices/:id/config/export", post(export_config_to_device))
        .route("/devices/:id/config/drift", get(device_drift))
        .route("/devices/:id/config/apply-template", post(apply_template))
        .route("/devices/:id/config/history", get(config_history))
        // ── Discovery ───────────────────────────────────
        .route("/discovery/scan", post(discovery_scan))
        .route("/discovery/results", get(discovery_results))
        // ── Templates ───────────────────────────────────
        .route("/templates", get(list_templates).post(create_template))
        .route("/templates/examples", get(template_examples))
        .route("/templates/:id", get(get_template).put(update_template).delete(delete_template))
        // ── Drift schedules & reports ───────────────────
        .route("/config/drift-schedules", get(list_schedules).post(create_schedule))
        .route(
            "/config/drift-schedules/:id",
            get(get_schedule).put(update_schedule).delete(delete_schedule),
        )
        .route("/config/drift-schedules/:id/toggle", post(toggle_schedule))
        .route("/config/drift-schedules/:id/run", post(run_schedule_now))
        .route("/drift-reports", get(list_drift_reports))
        .route("/drift-trends", get(drift_trends))
        .route("/drift-trends/:id/resolve", post(resolve_drift))
        // ── Bulk operations ─────────────────────────────
        .route("/config/bulk-import", post(bulk_import_configs))
        .route("/config/bulk-export", post(bulk_export_configs))
        .route("/config/bulk-drift-detect", post(bulk_drift_detect))
        .route("/config/bulk-drift-detect-enhanced", post(bulk_drift_detect_enhanced))
        // ── Sync ────────────────────────────────────────
        .route("/export/history", get(export_history))
        .route("/export/:plugin", post(run_export))
        .route("/export/:plugin/preview", post(preview_export))
        .route("/import/history", get(import_history))
        .route("/import/:plugin", post(run_import))
        // ── Metrics ─────────────────────────────────────
        .route("/metrics", get(current_metrics))
        .route("/metrics/prometheus", get(prometheus_metrics))
        .route("/metrics/dashboard", get(metrics_dashboard))
        // ── Plugins ─────────────────────────────────────
        .route("/plugins", get(list_plugins))
        .route("/plugins/:name", get(get_plugin))
        .route("/plugins/:name/test", post(test_plugin))
        .with_state(state.clone());

    let v1 = api
        .merge(websocket::router(state.hub.clone()))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    let root = Router::new().route("/health", get(health)).with_state(state);

    Router::new()
        .nest("/api/v1", v1)
        .merge(root)
        .layer(middleware::from_fn(inject_request_id))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

// ── Middleware ──────────────────────────────────────────

async fn inject_request_id(mut req: Request, next: Next) -> Response {
    let rid = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(generate_request_id);
    req.extensions_mut().insert(RequestId(rid.clone()));
    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&rid) {
        resp.headers_mut().insert("x-request-id", value);
    }
    resp
}

async fn require_api_key(State(state): St, req: Request, next: Next) -> Response {
    let Some(expected) = &state.config.auth.api_key else {
        return next.run(req).await;
    };
    let supplied = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if supplied == Some(expected.as_str()) {
        return next.run(req).await;
    }
    let rid = req
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_else(generate_request_id);
    let err = Error::AuthFailed("missing or invalid API key".into());
    (err.status(), Json(ApiResponse::from_error(&err, &rid))).into_response()
}

// ── Health ──────────────────────────────────────────────

async fn health(State(state): St, Extension(rid): Extension<RequestId>) -> ApiResult<Value> {
    let store_ok = state.store.ping().is_ok();
    ok(
        &rid,
        json!({
            "status": if store_ok { "ok" } else { "degraded" },
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "ws_connections": state.hub.connection_count(),
        }),
    )
}

// ── Devices ─────────────────────────────────────────────

async fn list_devices(State(state): St, Extension(rid): Extension<RequestId>) -> ApiResult<Value> {
    match state.store.list_devices() {
        Ok(devices) => {
            let meta = crate::response::Meta {
                count: Some(devices.len()),
                total_count: Some(devices.len()),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
                ..Default::default()
            };
            ApiResult(Ok(ApiResponse::ok_with_meta(json!({"devices": devices}), meta, &rid.0)))
        }
        Err(err) => ApiResult(Err((err, rid.0.clone()))),
    }
}

async fn create_device(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Json(body): Json<NewDevice>,
) -> ApiResult<crate::model::Device> {
    reply(&rid, state.store.insert_device(&body))
}

async fn get_device(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> ApiResult<crate::model::Device> {
    reply(&rid, state.store.get_device(id))
}

async fn update_device(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
    Json(body): Json<DeviceUpdate>,
) -> ApiResult<crate::model::Device> {
    reply(&rid, state.store.update_device(id, &body))
}

async fn delete_device(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> ApiResult<Value> {
    reply(&rid, state.store.delete_device(id).map(|deleted| json!({"deleted": deleted})))
}

#[derive(Debug, Deserialize)]
struct ControlRequest {
    action: String,
    #[serde(default)]
    channel: u32,
    #[serde(default)]
    params: Value,
}

async fn control_device(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
    Json(body): Json<ControlRequest>,
) -> ApiResult<Value> {
    let outcome = async {
        let device = state.store.get_device(id)?;
        // Config-mutating calls on one device are serialized.
        let permit = state.factory.device_permit(id);
        let _held = permit
            .acquire()
            .await
            .map_err(|_| Error::Internal("device permit closed".into()))?;
        let client = state.factory.connect(&device.ip).await?;
        let ch = body.channel;
        let p = &body.params;

        match body.action.as_str() {
            "switch" => {
                let on = p.get("on").and_then(Value::as_bool).unwrap_or(true);
                client.set_switch(ch, on).await?;
            }
            "brightness" => {
                let level = p.get("brightness").and_then(Value::as_u64).unwrap_or(100) as u8;
                client.set_brightness(ch, level).await?;
            }
            "color" => {
                let rgb = |k: &str| p.get(k).and_then(Value::as_u64).unwrap_or(0) as u8;
                client.set_color(ch, rgb("r"), rgb("g"), rgb("b")).await?;
            }
            "color_temp" => {
                let kelvin = p.get("kelvin").and_then(Value::as_u64).unwrap_or(3000) as u32;
                client.set_color_temp(ch, kelvin).await?;
            }
            "white" => {
                let level = p.get("brightness").and_then(Value::as_u64).unwrap_or(100) as u8;
                client.set_white(ch, level).await?;
            }
            "cover_open" => client.open_cover(ch).await?,
            "cover_close" => client.close_cover(ch).await?,
            "cover_stop" => client.stop_cover(ch).await?,
            "cover_position" => {
                let pos = p.get("position").and_then(Value::as_u64).unwrap_or(0) as u8;
                client.set_cover_position(ch, pos).await?;
            }
            "reboot" => client.reboot().await?,
            "factory_reset" => client.factory_reset().await?,
            "check_update" => {
                let update = client.check_update().await?;
                return Ok(json!({"action": body.action, "update": update}));
            }
            "update" => client.perform_update().await?,
            other => {
                return Err(Error::Validation(format!("unknown action '{}'", other)));
            }
        }
        Ok(json!({"action": body.action, "channel": ch, "ok": true}))
    }
    .await;
    reply(&rid, outcome)
}

// ── Device configuration ────────────────────────────────

async fn get_stored_config(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> ApiResult<Value> {
    let outcome = (|| {
        let device = state.store.get_device(id)?;
        let typed = device
            .desired_config
            .as_ref()
            .map(device_config::raw_to_typed)
            .transpose()?;
        Ok(json!({
            "device_id": id,
            "desired_config": device.desired_config,
            "typed": typed,
            "applied": device.applied,
        }))
    })();
    reply(&rid, outcome)
}

async fn put_stored_config(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
    Json(body): Json<Value>,
) -> ApiResult<Value> {
    let outcome = (|| {
        state.store.get_device(id)?;
        // Round-tripping through the typed model rejects non-object
        // bodies while preserving unknown keys verbatim.
        let typed = device_config::raw_to_typed(&body)?;
        let canonical = device_config::typed_to_raw(&typed)?;
        state.store.set_desired_config(id, &canonical)?;
        state.store.append_config_history(id, &canonical, "user")?;
        Ok(json!({"device_id": id, "stored": true}))
    })();
    reply(&rid, outcome)
}

async fn device_client(
    state: &AppState,
    id: i64,
) -> Result<(crate::model::Device, Box<dyn crate::client::Client>)> {
    let device = state.store.get_device(id)?;
    if device.ip.is_empty() {
        return Err(Error::DeviceUnreachable(format!("device {} has no ip", id)));
    }
    let client = state.factory.connect(&device.ip).await?;
    Ok((device, client))
}

async fn get_current_config(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> ApiResult<Value> {
    let outcome = async {
        let (_, client) = device_client(&state, id).await?;
        client.get_config().await
    }
    .await;
    reply(&rid, outcome)
}

async fn get_normalized_config(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> ApiResult<Value> {
    let outcome = async {
        let (_, client) = device_client(&state, id).await?;
        let live = client.get_config().await?;
        Ok(crate::drift::normalize(&live))
    }
    .await;
    reply(&rid, outcome)
}

async fn get_typed_config(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> ApiResult<Value> {
    let outcome = async {
        let (_, client) = device_client(&state, id).await?;
        let live = client.get_config().await?;
        let typed = device_config::normalize_device_config(&live, client.generation());
        Ok(json!({
            "typed": typed,
            "schema": device_config::schema(),
        }))
    }
    .await;
    reply(&rid, outcome)
}

async fn import_config_from_device(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> ApiResult<Value> {
    let outcome = async {
        let (_, client) = device_client(&state, id).await?;
        let live = client.get_config().await?;
        state.store.set_desired_config(id, &live)?;
        state.store.set_device_settings(id, &live)?;
        state.store.set_applied(id, true)?;
        state.store.append_config_history(id, &live, "device")?;
        Ok(json!({"device_id": id, "imported": true}))
    }
    .await;
    reply(&rid, outcome)
}

async fn config_status(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> ApiResult<Value> {
    let outcome = (|| {
        let device = state.store.get_device(id)?;
        let reports = state.store.list_drift_reports(Some(id), false, 1)?;
        Ok(json!({
            "device_id": id,
            "has_desired_config": device.desired_config.is_some(),
            "applied": device.applied,
            "last_drift_report": reports.first(),
        }))
    })();
    reply(&rid, outcome)
}

async fn export_config_to_device(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> ApiResult<Value> {
    let outcome = async {
        let device = state.store.get_device(id)?;
        let desired = device
            .desired_config
            .clone()
            .ok_or_else(|| Error::Validation(format!("device {} has no desired config", id)))?;

        let permit = state.factory.device_permit(id);
        let _held = permit
            .acquire()
            .await
            .map_err(|_| Error::Internal("device permit closed".into()))?;
        let client = state.factory.connect(&device.ip).await?;
        client.set_config(&desired).await?;
        state.store.set_applied(id, true)?;
        Ok(json!({"device_id": id, "applied": true}))
    }
    .await;
    reply(&rid, outcome)
}

async fn device_drift(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> ApiResult<Value> {
    let outcome = async {
        let device = state.store.get_device(id)?;
        match state.scheduler.detect_device(&device, None).await? {
            Some(report) => Ok(serde_json::to_value(report)?),
            None => Err(Error::Validation(format!("device {} has no desired config", id))),
        }
    }
    .await;
    reply(&rid, outcome)
}

#[derive(Debug, Deserialize)]
struct ApplyTemplateRequest {
    template_id: i64,
}

async fn apply_template(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
    Json(body): Json<ApplyTemplateRequest>,
) -> ApiResult<Value> {
    let outcome = (|| {
        let device = state.store.get_device(id)?;
        let rendered = state.templates.render_for_device(&state.store, body.template_id, &device)?;
        let config: Value = serde_json::from_str(&rendered).map_err(|e| {
            Error::Template(format!("template did not render valid JSON: {}", e))
        })?;
        state.store.set_desired_config(id, &config)?;
        state.store.append_config_history(id, &config, "template")?;
        Ok(json!({
            "device_id": id,
            "template_id": body.template_id,
            "desired_config": config,
        }))
    })();
    reply(&rid, outcome)
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn config_history(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Value> {
    reply(
        &rid,
        state
            .store
            .list_config_history(id, query.limit)
            .map(|entries| json!({"device_id": id, "history": entries})),
    )
}

// ── Discovery ───────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
struct ScanRequest {
    cidr: Option<String>,
    timeout_secs: Option<u64>,
}

async fn discovery_scan(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    body: Option<Json<ScanRequest>>,
) -> ApiResult<Value> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let outcome = async {
        let networks = match request.cidr {
            Some(cidr) => vec![cidr],
            None => state.config.discovery.networks.clone(),
        };
        if networks.is_empty() {
            return Err(Error::Validation(
                "no cidr given and no networks configured".into(),
            ));
        }
        let timeout = std::time::Duration::from_secs(request.timeout_secs.unwrap_or(30));
        let opts = state.config.discovery_options();
        let outcome = discovery::combined_discovery(&networks, &opts, timeout).await;
        let persisted = discovery::persist_results(&state.store, &outcome)?;
        Ok(json!({
            "found": outcome.found.len(),
            "persisted": persisted,
            "devices": outcome.found,
            "errors": outcome.errors,
        }))
    }
    .await;
    reply(&rid, outcome)
}

async fn discovery_results(
    State(state): St,
    Extension(rid): Extension<RequestId>,
) -> ApiResult<Value> {
    reply(
        &rid,
        state
            .store
            .list_discovered(Utc::now())
            .map(|records| json!({"results": records, "count": records.len()})),
    )
}

// ── Templates ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TemplateBody {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    device_type: String,
    #[serde(default)]
    generation: Option<u8>,
    #[serde(default)]
    parent_id: Option<i64>,
    #[serde(default)]
    variables: serde_json::Map<String, Value>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    is_default: bool,
}

impl TemplateBody {
    fn into_template(self, id: i64) -> ConfigTemplate {
        ConfigTemplate {
            id,
            name: self.name,
            description: self.description,
            device_type: self.device_type,
            generation: self.generation,
            parent_id: self.parent_id,
            variables: self.variables,
            body: self.body,
            is_default: self.is_default,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

async fn list_templates(State(state): St, Extension(rid): Extension<RequestId>) -> ApiResult<Value> {
    reply(
        &rid,
        state
            .store
            .list_templates()
            .map(|templates| json!({"templates": templates, "count": templates.len()})),
    )
}

async fn create_template(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Json(body): Json<TemplateBody>,
) -> ApiResult<ConfigTemplate> {
    let outcome = (|| {
        crate::template::validate_body(&body.body)?;
        if let Some(parent_id) = body.parent_id {
            state.store.get_template(parent_id)?;
        }
        state.store.insert_template(&body.into_template(0))
    })();
    reply(&rid, outcome)
}

async fn get_template(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> ApiResult<ConfigTemplate> {
    reply(&rid, state.store.get_template(id))
}

async fn update_template(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
    Json(body): Json<TemplateBody>,
) -> ApiResult<ConfigTemplate> {
    let outcome = (|| {
        crate::template::validate_body(&body.body)?;
        let updated = body.into_template(id);
        let saved = state.store.update_template(&updated)?;
        // Updating a parent link may close a loop; verify it resolves.
        crate::template::resolve_chain(&state.store, id)?;
        Ok(saved)
    })();
    reply(&rid, outcome)
}

async fn delete_template(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> ApiResult<Value> {
    reply(&rid, state.store.delete_template(id).map(|deleted| json!({"deleted": deleted})))
}

async fn template_examples(Extension(rid): Extension<RequestId>) -> ApiResult<Value> {
    ok(
        &rid,
        json!([
            {
                "name": "secure-wifi",
                "description": "Station WiFi with auth enforced",
                "variables": {"ssid": "string", "timezone": "string"},
                "body": "{\"wifi\": {\"sta\": {\"ssid\": \"{{ ssid }}\", \"enable\": true}}, \"sys\": {\"location\": {\"tz\": \"{{ timezone | default('UTC') }}\"}}}"
            },
            {
                "name": "relay-defaults",
                "description": "Relay with auto-off safeguard",
                "variables": {"auto_off_secs": "number"},
                "body": "{\"switch:0\": {\"auto_off\": true, \"auto_off_delay\": {{ auto_off_secs | default(300) }}}}"
            }
        ]),
    )
}

// ── Drift schedules & reports ───────────────────────────

#[derive(Debug, Deserialize)]
struct ScheduleBody {
    #[serde(default)]
    name: String,
    cron: String,
    #[serde(default = "default_selector")]
    selector: String,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_selector() -> String {
    "all".to_string()
}

fn default_true() -> bool {
    true
}

impl ScheduleBody {
    fn into_schedule(self, id: i64) -> DriftSchedule {
        DriftSchedule {
            id,
            name: self.name,
            cron: self.cron,
            selector: self.selector,
            enabled: self.enabled,
            last_run: None,
            next_run: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

async fn list_schedules(State(state): St, Extension(rid): Extension<RequestId>) -> ApiResult<Value> {
    reply(
        &rid,
        state
            .store
            .list_drift_schedules()
            .map(|schedules| json!({"schedules": schedules, "count": schedules.len()})),
    )
}

async fn create_schedule(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Json(body): Json<ScheduleBody>,
) -> ApiResult<DriftSchedule> {
    let outcome = (|| {
        let next = crate::drift_scheduler::next_occurrence(&body.cron)?;
        let saved = state.store.insert_drift_schedule(&body.into_schedule(0))?;
        state.store.set_schedule_runs(saved.id, None, Some(next))?;
        state.store.get_drift_schedule(saved.id)
    })();
    reply(&rid, outcome)
}

async fn get_schedule(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> ApiResult<DriftSchedule> {
    reply(&rid, state.store.get_drift_schedule(id))
}

async fn update_schedule(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
    Json(body): Json<ScheduleBody>,
) -> ApiResult<DriftSchedule> {
    let outcome = (|| {
        let next = crate::drift_scheduler::next_occurrence(&body.cron)?;
        let saved = state.store.update_drift_schedule(&body.into_schedule(id))?;
        state.store.set_schedule_runs(id, saved.last_run, Some(next))?;
        state.store.get_drift_schedule(id)
    })();
    reply(&rid, outcome)
}

async fn delete_schedule(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> ApiResult<Value> {
    reply(
        &rid,
        state.store.delete_drift_schedule(id).map(|deleted| json!({"deleted": deleted})),
    )
}

async fn toggle_schedule(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> ApiResult<DriftSchedule> {
    let outcome = (|| {
        let schedule = state.store.get_drift_schedule(id)?;
        state.store.set_schedule_enabled(id, !schedule.enabled)?;
        state.store.get_drift_schedule(id)
    })();
    reply(&rid, outcome)
}

async fn run_schedule_now(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
) -> ApiResult<crate::drift_scheduler::RunSummary> {
    let outcome = async {
        let schedule = state.store.get_drift_schedule(id)?;
        state.scheduler.run_schedule(&schedule).await
    }
    .await;
    reply(&rid, outcome)
}

#[derive(Debug, Deserialize, Default)]
struct DriftReportQuery {
    device_id: Option<i64>,
    #[serde(default)]
    unresolved_only: bool,
    #[serde(default = "default_limit")]
    limit: usize,
}

async fn list_drift_reports(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Query(query): Query<DriftReportQuery>,
) -> ApiResult<Value> {
    reply(
        &rid,
        state
            .store
            .list_drift_reports(query.device_id, query.unresolved_only, query.limit)
            .map(|reports| json!({"reports": reports, "count": reports.len()})),
    )
}

async fn drift_trends(State(state): St, Extension(rid): Extension<RequestId>) -> ApiResult<Value> {
    let outcome = (|| {
        let buckets = state.store.drift_trends(30)?;
        let (total, unresolved) = state.store.drift_counts()?;
        Ok(json!({"days": buckets, "total": total, "unresolved": unresolved}))
    })();
    reply(&rid, outcome)
}

#[derive(Debug, Deserialize, Default)]
struct ResolveRequest {
    #[serde(default)]
    note: String,
}

async fn resolve_drift(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<i64>,
    body: Option<Json<ResolveRequest>>,
) -> ApiResult<Value> {
    let note = body.map(|Json(b)| b.note).unwrap_or_default();
    let outcome = (|| {
        let resolved = state.store.resolve_drift_report(id, &note)?;
        if !resolved {
            return Err(Error::NotFound { resource: "drift report", id: id.to_string() });
        }
        Ok(json!({"report_id": id, "resolved": true}))
    })();
    reply(&rid, outcome)
}

// ── Bulk operations ─────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
struct BulkRequest {
    #[serde(default)]
    device_ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
struct BulkItemOutcome {
    device_id: i64,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<Value>,
}

fn bulk_targets(state: &AppState, requested: &[i64]) -> Result<Vec<crate::model::Device>> {
    if requested.is_empty() {
        state.store.list_devices()
    } else {
        requested.iter().map(|id| state.store.get_device(*id)).collect()
    }
}

/// Bulk operations never roll back completed items; each device reports
/// its own outcome and the response stays 2xx.
async fn bulk_drift_detect(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    body: Option<Json<BulkRequest>>,
) -> ApiResult<Value> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let outcome = async {
        let devices = bulk_targets(&state, &request.device_ids)?;
        let mut items = Vec::new();
        for device in devices {
            let item = match state.scheduler.detect_device(&device, None).await {
                Ok(Some(report)) => BulkItemOutcome {
                    device_id: device.id,
                    success: report.error.is_none(),
                    error: report.error.clone(),
                    detail: Some(json!({"entries": report.entries.len(), "report_id": report.id})),
                },
                Ok(None) => BulkItemOutcome {
                    device_id: device.id,
                    success: true,
                    error: None,
                    detail: Some(json!({"skipped": "no desired config"})),
                },
                Err(e) => BulkItemOutcome {
                    device_id: device.id,
                    success: false,
                    error: Some(e.to_string()),
                    detail: None,
                },
            };
            items.push(item);
        }
        let failed = items.iter().filter(|i| !i.success).count();
        Ok(json!({"items": items, "failed": failed}))
    }
    .await;
    reply(&rid, outcome)
}

/// Like `bulk_drift_detect`, but each item carries the full report
/// entries instead of counts.
async fn bulk_drift_detect_enhanced(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    body: Option<Json<BulkRequest>>,
) -> ApiResult<Value> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let outcome = async {
        let devices = bulk_targets(&state, &request.device_ids)?;
        let mut items = Vec::new();
        for device in devices {
            let item = match state.scheduler.detect_device(&device, None).await {
                Ok(Some(report)) => json!({
                    "device_id": device.id,
                    "device_name": device.name,
                    "success": report.error.is_none(),
                    "error": report.error,
                    "report": report,
                }),
                Ok(None) => json!({
                    "device_id": device.id,
                    "device_name": device.name,
                    "success": true,
                    "skipped": "no desired config",
                }),
                Err(e) => json!({
                    "device_id": device.id,
                    "device_name": device.name,
                    "success": false,
                    "error": e.to_string(),
                }),
            };
            items.push(item);
        }
        Ok(json!({"items": items}))
    }
    .await;
    reply(&rid, outcome)
}

async fn bulk_import_configs(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    body: Option<Json<BulkRequest>>,
) -> ApiResult<Value> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let outcome = async {
        let devices = bulk_targets(&state, &request.device_ids)?;
        let mut items = Vec::new();
        for device in devices {
            let result = async {
                let client = state.factory.connect(&device.ip).await?;
                let live = client.get_config().await?;
                state.store.set_desired_config(device.id, &live)?;
                state.store.set_applied(device.id, true)?;
                state.store.append_config_history(device.id, &live, "device")?;
                Ok::<(), Error>(())
            }
            .await;
            items.push(BulkItemOutcome {
                device_id: device.id,
                success: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
                detail: None,
            });
        }
        let failed = items.iter().filter(|i| !i.success).count();
        Ok(json!({"items": items, "failed": failed}))
    }
    .await;
    reply(&rid, outcome)
}

async fn bulk_export_configs(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    body: Option<Json<BulkRequest>>,
) -> ApiResult<Value> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let outcome = async {
        let devices = bulk_targets(&state, &request.device_ids)?;
        let mut items = Vec::new();
        for device in devices {
            let result = async {
                let desired = device.desired_config.clone().ok_or_else(|| {
                    Error::Validation(format!("device {} has no desired config", device.id))
                })?;
                let client = state.factory.connect(&device.ip).await?;
                client.set_config(&desired).await?;
                state.store.set_applied(device.id, true)?;
                Ok::<(), Error>(())
            }
            .await;
            items.push(BulkItemOutcome {
                device_id: device.id,
                success: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
                detail: None,
            });
        }
        let failed = items.iter().filter(|i| !i.success).count();
        Ok(json!({"items": items, "failed": failed}))
    }
    .await;
    reply(&rid, outcome)
}

// ── Sync ────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
struct ExportRequest {
    #[serde(default)]
    config: Value,
}

async fn run_export(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(plugin): Path<String>,
    body: Option<Json<ExportRequest>>,
) -> ApiResult<crate::plugins::ExportResult> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    reply(&rid, state.sync.export(&plugin, request.config, "api").await)
}

async fn preview_export(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(plugin): Path<String>,
    body: Option<Json<ExportRequest>>,
) -> ApiResult<crate::plugins::PreviewResult> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    reply(&rid, state.sync.preview(&plugin, request.config).await)
}

#[derive(Debug, Deserialize)]
struct ImportRequest {
    source: SourceSpec,
    #[serde(default)]
    config: Value,
    #[serde(default)]
    options: ImportOptions,
}

async fn run_import(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(plugin): Path<String>,
    Json(body): Json<ImportRequest>,
) -> ApiResult<crate::plugins::ImportResult> {
    reply(
        &rid,
        state
            .sync
            .import(&plugin, &body.source, body.config, &body.options, "api")
            .await,
    )
}

async fn export_history(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Value> {
    reply(
        &rid,
        state
            .store
            .list_sync_history("export", query.limit)
            .map(|entries| json!({"history": entries})),
    )
}

async fn import_history(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Value> {
    reply(
        &rid,
        state
            .store
            .list_sync_history("import", query.limit)
            .map(|entries| json!({"history": entries})),
    )
}

// ── Metrics ─────────────────────────────────────────────

async fn current_metrics(State(state): St, Extension(rid): Extension<RequestId>) -> ApiResult<Value> {
    let snapshot = state.collector.sample();
    reply(&rid, serde_json::to_value(snapshot).map_err(Into::into))
}

async fn prometheus_metrics(State(state): St) -> Response {
    state.collector.sample();
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.collector.prometheus_text(),
    )
        .into_response()
}

async fn metrics_dashboard(
    State(state): St,
    Extension(rid): Extension<RequestId>,
) -> ApiResult<Value> {
    let mut dashboard = state.collector.dashboard();
    if let Value::Object(map) = &mut dashboard {
        map.insert("ws_connections".into(), json!(state.hub.connection_count()));
        map.insert("subscribers".into(), json!(state.hub.subscriber_stats()));
    }
    ok(&rid, dashboard)
}

// ── Plugins ─────────────────────────────────────────────

async fn list_plugins(State(state): St, Extension(rid): Extension<RequestId>) -> ApiResult<Value> {
    let plugins: Vec<Value> = state
        .sync
        .registry()
        .list()
        .into_iter()
        .map(|(plugin_type, info)| json!({"type": plugin_type, "info": info}))
        .collect();
    let health = state.sync.registry().health_check().await;
    ok(&rid, json!({"plugins": plugins, "health": health}))
}

async fn get_plugin(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(name): Path<String>,
) -> ApiResult<Value> {
    let outcome = (|| {
        let plugin = state
            .sync
            .registry()
            .get(PluginType::Sync, &name)
            .or_else(|| state.sync.registry().get(PluginType::Backup, &name))
            .ok_or(Error::NotFound { resource: "plugin", id: name.clone() })?;
        Ok(json!({
            "info": plugin.info(),
            "config_schema": plugin.config_schema(),
            "capabilities": plugin.capabilities(),
        }))
    })();
    reply(&rid, outcome)
}

async fn test_plugin(
    State(state): St,
    Extension(rid): Extension<RequestId>,
    Path(name): Path<String>,
    body: Option<Json<Value>>,
) -> ApiResult<Value> {
    let cfg = body.map(|Json(b)| b).unwrap_or(Value::Null);
    let outcome = async {
        let plugin = state
            .sync
            .registry()
            .get(PluginType::Sync, &name)
            .or_else(|| state.sync.registry().get(PluginType::Backup, &name))
            .ok_or(Error::NotFound { resource: "plugin", id: name.clone() })?;
        let config_valid = plugin.validate_config(&cfg).err().map(|e| e.to_string());
        let health = plugin.health().await;
        Ok(json!({
            "plugin": name,
            "config_valid": config_valid.is_none(),
            "config_error": config_valid,
            "health": health,
        }))
    }
    .await;
    reply(&rid, outcome)
}
