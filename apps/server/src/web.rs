use crate::config::ServerConfig;
use crate::engine::{compute_targets, EngineEffect, EngineState, OffpeakState};
use crate::history::{reading_from_slate, ReadingHistory};
use crate::intent::{AutomationSettings, UserIntent};
use crate::savings::{self, Reading, SavingsReport};
use crate::sleep::{self, CurvePoint, SleepTarget};
use crate::store::{PersistedState, Store};
use anyhow::Result;
use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Duration, Utc};
use heat_protocol::channel::Slate;
use heat_protocol::sync::{AutomationMode, SyncRequest, SyncResponse, TargetVector, SYNC_PATH};
use heat_protocol::tariff::TariffPeriod;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Everything the exchange and the user API share.
pub struct ServerState {
    pub engine: EngineState,
    pub latest: Slate,
    pub last_targets: Option<TargetVector>,
    pub last_sync: Option<DateTime<Utc>>,
    pub history: ReadingHistory,
    safety_active: bool,
}

impl ServerState {
    pub fn new(engine: EngineState, history: ReadingHistory) -> ServerState {
        ServerState {
            engine,
            latest: Slate::new(),
            last_targets: None,
            last_sync: None,
            history,
            safety_active: false,
        }
    }
}

#[derive(Clone)]
pub struct WebState {
    pub server_state: Arc<RwLock<ServerState>>,
    store: Arc<Store>,
    config: Arc<ServerConfig>,
}

impl WebState {
    pub fn new(config: ServerConfig, store: Store, engine: EngineState) -> WebState {
        let history = ReadingHistory::new(config.history.retention());
        WebState {
            server_state: Arc::new(RwLock::new(ServerState::new(engine, history))),
            store: Arc::new(store),
            config: Arc::new(config),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(e) => {
                error!("request failed: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = serde_json::json!({
            "success": false,
            "error": self.to_string(),
        });
        (status, axum::Json(body)).into_response()
    }
}

type ApiResult<T> = Result<axum::Json<T>, ApiError>;

pub fn router(state: WebState) -> Router {
    Router::new()
        .route(SYNC_PATH, post(driver_sync))
        .route("/api/status", get(get_status))
        .route("/api/target", post(set_target))
        .route("/api/power/toggle", post(toggle_power))
        .route("/api/oscillation/toggle", post(toggle_oscillation))
        .route("/api/display/toggle", post(toggle_display))
        .route("/api/plug/toggle", post(toggle_plug))
        .route("/api/battery/charge", post(set_battery_charge))
        .route("/api/settings", get(get_settings).post(update_settings))
        .route("/api/sleep", get(get_sleep).post(start_sleep))
        .route("/api/sleep/cancel", post(cancel_sleep))
        .route("/api/savings", get(get_savings))
        .route("/api/readings", get(get_readings))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn create_web_server(state: WebState) -> Result<()> {
    let listen = state.config.server.listen;
    let app = router(state);

    info!(%listen, "starting web server");
    let listener = tokio::net::TcpListener::bind(listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down web server");
        })
        .await?;
    Ok(())
}

/// Applies `f` to a copy of the engine state, persists the copy, and only then
/// makes it current. A failed write leaves memory and disk in agreement.
async fn update_engine<T>(
    state: &WebState,
    f: impl FnOnce(&mut EngineState) -> Result<T, ApiError>,
) -> Result<T, ApiError> {
    let mut server_state = state.server_state.write().await;
    let mut engine = server_state.engine.clone();
    let value = f(&mut engine)?;
    state.store.save(&PersistedState::from(&engine))?;
    server_state.engine = engine;
    Ok(value)
}

async fn driver_sync(
    State(state): State<WebState>,
    Json(request): Json<SyncRequest>,
) -> axum::Json<SyncResponse> {
    let now = Utc::now();
    let tariff = state.config.tariff();
    let mut server_state = state.server_state.write().await;

    let output = compute_targets(
        now,
        &request.channels,
        &server_state.engine,
        &state.config.engine,
        &tariff,
    );

    let mut safety_active = false;
    for effect in &output.effects {
        match effect {
            EngineEffect::ClearSleepSchedule => info!("sleep schedule expired"),
            EngineEffect::SafetyOverride { soc } => {
                safety_active = true;
                if !server_state.safety_active {
                    warn!(soc, "battery low with plug off, forcing heater off");
                }
            }
            EngineEffect::ControllerTransition { from, to } => {
                info!(?from, ?to, period = %output.targets.tariff_period, "off-peak controller transition");
            }
        }
    }
    if server_state.safety_active && !safety_active {
        info!("safety override released");
    }
    server_state.safety_active = safety_active;

    if server_state.engine.absorb(&output) {
        if let Err(e) = state.store.save(&PersistedState::from(&server_state.engine)) {
            error!("failed to persist state: {:#}", e);
        }
    }

    let reading = reading_from_slate(&request.channels, output.targets.heater_target_temp, now);
    server_state.history.record(reading);
    server_state.latest = request.channels;
    server_state.last_targets = Some(output.targets.clone());
    server_state.last_sync = Some(now);

    axum::Json(SyncResponse {
        targets: output.targets,
    })
}

#[derive(Serialize)]
pub struct StatusResponse {
    channels: Slate,
    targets: Option<TargetVector>,
    last_sync: Option<DateTime<Utc>>,
    tariff_period: TariffPeriod,
    tariff_rate: f64,
    controller: OffpeakState,
    intent: UserIntent,
    settings: AutomationSettings,
    sleep_active: bool,
}

async fn get_status(State(state): State<WebState>) -> axum::Json<StatusResponse> {
    let now = Utc::now();
    let tariff = state.config.tariff();
    let server_state = state.server_state.read().await;
    let engine = &server_state.engine;
    axum::Json(StatusResponse {
        channels: server_state.latest.clone(),
        targets: server_state.last_targets.clone(),
        last_sync: server_state.last_sync,
        tariff_period: tariff.period_at(now),
        tariff_rate: tariff.rate_at(now),
        controller: engine.controller,
        intent: engine.intent.clone(),
        settings: engine.settings,
        sleep_active: engine
            .sleep
            .as_ref()
            .map_or(false, |s| matches!(s.target_at(now), SleepTarget::Active { .. })),
    })
}

#[derive(Deserialize)]
pub struct TargetRequest {
    temp: i64,
}

async fn set_target(
    State(state): State<WebState>,
    Json(request): Json<TargetRequest>,
) -> ApiResult<serde_json::Value> {
    let temp = update_engine(&state, |engine| Ok(engine.intent.set_target_temp(request.temp))).await?;
    info!(temp, "target temperature set");
    Ok(axum::Json(serde_json::json!({ "target_temp_f": temp })))
}

async fn toggle_power(State(state): State<WebState>) -> ApiResult<serde_json::Value> {
    let on = update_engine(&state, |engine| {
        engine.intent.heater_power = !engine.intent.heater_power;
        Ok(engine.intent.heater_power)
    })
    .await?;
    Ok(axum::Json(serde_json::json!({ "power": on })))
}

async fn toggle_oscillation(State(state): State<WebState>) -> ApiResult<serde_json::Value> {
    let on = update_engine(&state, |engine| {
        engine.intent.oscillation = !engine.intent.oscillation;
        Ok(engine.intent.oscillation)
    })
    .await?;
    Ok(axum::Json(serde_json::json!({ "oscillation": on })))
}

async fn toggle_display(State(state): State<WebState>) -> ApiResult<serde_json::Value> {
    let on = update_engine(&state, |engine| {
        engine.intent.display = !engine.intent.display;
        Ok(engine.intent.display)
    })
    .await?;
    Ok(axum::Json(serde_json::json!({ "display": on })))
}

async fn toggle_plug(State(state): State<WebState>) -> ApiResult<serde_json::Value> {
    let on = update_engine(&state, |engine| {
        engine.intent.plug_on = !engine.intent.plug_on;
        Ok(engine.intent.plug_on)
    })
    .await?;
    Ok(axum::Json(serde_json::json!({ "plug_on": on })))
}

#[derive(Deserialize)]
pub struct ChargeRequest {
    watts: i64,
}

async fn set_battery_charge(
    State(state): State<WebState>,
    Json(request): Json<ChargeRequest>,
) -> ApiResult<serde_json::Value> {
    let watts = update_engine(&state, |engine| {
        engine
            .intent
            .set_battery_charge_watts(request.watts)
            .map_err(|e| ApiError::BadRequest(e.to_string()))
    })
    .await?;
    Ok(axum::Json(serde_json::json!({ "battery_charge_watts": watts })))
}

async fn get_settings(State(state): State<WebState>) -> axum::Json<AutomationSettings> {
    axum::Json(state.server_state.read().await.engine.settings)
}

#[derive(Deserialize)]
pub struct SettingsRequest {
    driver_control_enabled: Option<bool>,
    automation_mode: Option<AutomationMode>,
}

async fn update_settings(
    State(state): State<WebState>,
    Json(request): Json<SettingsRequest>,
) -> ApiResult<AutomationSettings> {
    let settings = update_engine(&state, |engine| {
        if let Some(enabled) = request.driver_control_enabled {
            engine.settings.driver_control_enabled = enabled;
        }
        if let Some(mode) = request.automation_mode {
            engine.settings.automation_mode = mode;
        }
        Ok(engine.settings)
    })
    .await?;
    info!(
        driver_control_enabled = settings.driver_control_enabled,
        automation_mode = %settings.automation_mode,
        "settings updated"
    );
    Ok(axum::Json(settings))
}

#[derive(Deserialize)]
pub struct SleepRequest {
    wake_time: String,
    curve: Vec<CurvePoint>,
}

async fn start_sleep(
    State(state): State<WebState>,
    Json(request): Json<SleepRequest>,
) -> ApiResult<serde_json::Value> {
    let tz = state.config.tariff.timezone;
    let schedule = sleep::start_sleep(Utc::now(), &request.wake_time, request.curve, &tz)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let wake_time = schedule.wake_time();
    update_engine(&state, |engine| {
        engine.sleep = Some(schedule);
        Ok(())
    })
    .await?;
    info!(%wake_time, "sleep mode started");
    Ok(axum::Json(serde_json::json!({ "status": "ok", "wake_time": wake_time })))
}

async fn cancel_sleep(State(state): State<WebState>) -> ApiResult<serde_json::Value> {
    update_engine(&state, |engine| {
        engine.sleep = None;
        Ok(())
    })
    .await?;
    info!("sleep mode cancelled");
    Ok(axum::Json(serde_json::json!({ "status": "ok" })))
}

#[derive(Serialize, Default)]
pub struct SleepStatus {
    active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    wake_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_target: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    curve: Option<Vec<CurvePoint>>,
}

async fn get_sleep(State(state): State<WebState>) -> ApiResult<SleepStatus> {
    let now = Utc::now();
    let (status, expired) = {
        let server_state = state.server_state.read().await;
        match server_state.engine.sleep.as_ref() {
            None => (SleepStatus::default(), false),
            Some(schedule) => match schedule.target_at(now) {
                SleepTarget::Active { temp_f, progress } => (
                    SleepStatus {
                        active: true,
                        start_time: Some(schedule.start_time()),
                        wake_time: Some(schedule.wake_time()),
                        current_target: Some(temp_f),
                        progress: Some(progress),
                        curve: Some(schedule.curve().to_vec()),
                    },
                    false,
                ),
                SleepTarget::Inactive => (SleepStatus::default(), true),
            },
        }
    };
    if expired {
        // A new schedule may have been started since the read lock was released.
        let cleared = update_engine(&state, |engine| {
            let still_expired = engine
                .sleep
                .as_ref()
                .map_or(false, |s| s.target_at(now) == SleepTarget::Inactive);
            if still_expired {
                engine.sleep = None;
            }
            Ok(still_expired)
        })
        .await?;
        if cleared {
            info!("sleep schedule expired");
        }
    }
    Ok(axum::Json(status))
}

#[derive(Deserialize)]
pub struct SavingsQuery {
    hours: Option<i64>,
}

#[derive(Serialize)]
pub struct SavingsResponse {
    hours: i64,
    #[serde(flatten)]
    report: SavingsReport,
}

async fn get_savings(
    State(state): State<WebState>,
    Query(query): Query<SavingsQuery>,
) -> axum::Json<SavingsResponse> {
    let config = &state.config;
    // History older than the retention window is gone.
    let max_hours = config.history.retention_hours.clamp(1, 720) as i64;
    let hours = query.hours.unwrap_or(24).clamp(1, max_hours);
    let now = Utc::now();
    let server_state = state.server_state.read().await;
    let readings = server_state.history.since(now - Duration::hours(hours));
    let report = savings::estimate(
        readings,
        config.history.poll_interval(),
        config.battery.capacity_kwh,
        &config.tariff(),
        now,
    );
    axum::Json(SavingsResponse {
        hours,
        report: report.rounded(),
    })
}

#[derive(Deserialize)]
pub struct ReadingsQuery {
    hours: Option<i64>,
    max_points: Option<usize>,
}

async fn get_readings(
    State(state): State<WebState>,
    Query(query): Query<ReadingsQuery>,
) -> axum::Json<Vec<Reading>> {
    let hours = query.hours.unwrap_or(24).clamp(1, 168);
    let max_points = query.max_points.unwrap_or(200).clamp(10, 1000);
    let since = Utc::now() - Duration::hours(hours);
    let server_state = state.server_state.read().await;
    axum::Json(server_state.history.downsampled(since, max_points))
}
