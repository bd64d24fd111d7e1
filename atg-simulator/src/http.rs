/**
 * API REST SIMULATEUR - Surface de contrôle HTTP
 *
 * RÔLE :
 * Expose le simulateur à l'UI web et aux scripts : statut, CRUD des jauges,
 * start/stop/reset, config broker, historique, test de connectivité.
 *
 * FONCTIONNEMENT :
 * - Routeur Axum, état partagé = `Simulator` (clone bon marché)
 * - Corps JSON partiels parsés à la main : un corps vide vaut `{}` et une
 *   erreur de parsing donne `{"success": false, "message": ...}`
 * - Couche CORS ouverte (`*`) : preflight OPTIONS répondus par tower-http
 *
 * ROUTES :
 * GET  /api/status, /api/mqtt-config, /api/atgs, /api/atg/{id},
 *      /api/history, /api/test-connection
 * POST /api/start, /api/stop, /api/mqtt-config, /api/atg/add,
 *      /api/atg/remove, /api/atg/update, /api/reset
 */

use crate::config::{BrokerConfig, BrokerConfigPatch};
use crate::errors::SimError;
use crate::models::{Device, DevicePatch, HistoryEntry};
use crate::simulator::{Simulator, StatusView};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub simulator: Simulator,
}

#[derive(Debug, Deserialize, Default)]
struct IdBody {
    id: Option<String>,
}

type ApiResult = Result<Json<Value>, SimError>;

pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE]);

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/status", get(get_status))
        .route("/api/mqtt-config", get(get_mqtt_config).post(set_mqtt_config))
        .route("/api/atgs", get(list_atgs))
        .route("/api/atg/add", post(add_atg))
        .route("/api/atg/remove", post(remove_atg))
        .route("/api/atg/update", post(update_atg))
        .route("/api/atg/{id}", get(get_atg))
        .route("/api/history", get(get_history))
        .route("/api/test-connection", get(test_connection))
        .route("/api/start", post(start))
        .route("/api/stop", post(stop))
        .route("/api/reset", post(reset))
        .layer(cors)
        .with_state(app_state)
}

fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, SimError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| SimError::validation(format!("invalid request body: {e}")))
}

// GET /api/status
async fn get_status(State(app): State<AppState>) -> Json<StatusView> {
    Json(app.simulator.status())
}

// GET /api/mqtt-config
async fn get_mqtt_config(State(app): State<AppState>) -> Json<BrokerConfig> {
    Json(app.simulator.broker_config())
}

// POST /api/mqtt-config (fusion partielle)
async fn set_mqtt_config(State(app): State<AppState>, body: Bytes) -> ApiResult {
    let patch: BrokerConfigPatch = parse_body(&body)?;
    let config = app.simulator.update_broker_config(patch)?;
    Ok(Json(json!({ "success": true, "config": config })))
}

// GET /api/atgs
async fn list_atgs(State(app): State<AppState>) -> Json<Vec<Device>> {
    Json(app.simulator.devices())
}

// GET /api/atg/{id}
async fn get_atg(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Device>, (StatusCode, Json<Value>)> {
    app.simulator
        .device(&id)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, Json(json!({ "error": "ATG not found" }))))
}

// POST /api/atg/add
async fn add_atg(State(app): State<AppState>, body: Bytes) -> ApiResult {
    let patch: DevicePatch = parse_body(&body)?;
    let atg = app.simulator.add_device(patch)?;
    Ok(Json(json!({ "success": true, "atg": atg })))
}

// POST /api/atg/remove
async fn remove_atg(State(app): State<AppState>, body: Bytes) -> ApiResult {
    let IdBody { id } = parse_body(&body)?;
    let id = id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| SimError::validation("ATG ID required"))?;
    let removed = app.simulator.remove_device(&id)?;
    Ok(Json(json!({ "success": true, "message": format!("ATG {} removed", removed.name) })))
}

// POST /api/atg/update
async fn update_atg(State(app): State<AppState>, body: Bytes) -> ApiResult {
    let patch: DevicePatch = parse_body(&body)?;
    let id = patch.id.clone().ok_or_else(|| SimError::NotFound("ATG".into()))?;
    let atg = app.simulator.update_device(&id, patch)?;
    Ok(Json(json!({ "success": true, "atg": atg })))
}

// GET /api/history (dernière page)
async fn get_history(State(app): State<AppState>) -> Json<Vec<HistoryEntry>> {
    Json(app.simulator.history())
}

// GET /api/test-connection (sonde TCP brute)
async fn test_connection(State(app): State<AppState>) -> Json<Value> {
    let success = app.simulator.probe_broker().await;
    let message = if success { "Connection successful" } else { "Connection failed" };
    Json(json!({ "success": success, "message": message }))
}

// POST /api/start
async fn start(State(app): State<AppState>) -> ApiResult {
    let count = app.simulator.start().await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Simulation started for {count} ATG(s)")
    })))
}

// POST /api/stop
async fn stop(State(app): State<AppState>) -> Json<Value> {
    let sent = app.simulator.stop().await;
    Json(json!({
        "success": true,
        "message": format!("Simulation stopped. Messages sent: {sent}")
    }))
}

// POST /api/reset
async fn reset(State(app): State<AppState>) -> Json<Value> {
    app.simulator.reset().await;
    Json(json!({ "success": true, "message": "Reset complete" }))
}
