use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::db::{Db, Schedule};
use crate::device::{Device, Reconciler};
use crate::orchestrator::Orchestrator;
use crate::state::SharedState;
use crate::timecalc::{parse_time_of_day, weekday_abbrev, weekday_from_abbrev};

const INDEX_HTML: &str = include_str!("ui/index.html");

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub db: Db,
    pub orchestrator: Arc<Orchestrator>,
    pub reconciler: Arc<Reconciler>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(api_status))
        .route("/api/activity", get(api_activity))
        .route("/api/devices", get(api_devices).post(api_add_device))
        .route("/api/devices/{id}", delete(api_remove_device))
        .route("/api/schedules", get(api_schedules).post(api_save_schedule))
        .route("/api/schedules/{id}", delete(api_delete_schedule))
        .route("/api/schedules/{id}/active", post(api_set_active))
        .with_state(state)
}

type ApiError = (StatusCode, String);

fn internal(e: anyhow::Error) -> ApiError {
    error!("api error: {e:#}");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

async fn api_activity(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let entries = state.db.recent_activity(100).await.map_err(internal)?;
    Ok(Json(entries))
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct DeviceBody {
    device_id: Option<String>,
    name: String,
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

fn default_port() -> u16 {
    80
}

async fn api_devices(State(state): State<AppState>) -> Json<Vec<Device>> {
    Json(state.reconciler.list().await)
}

async fn api_add_device(
    State(state): State<AppState>,
    Json(body): Json<DeviceBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.name.trim().is_empty() || body.host.trim().is_empty() || body.port == 0 {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "name, host and a non-zero port are required".into(),
        ));
    }

    let device_id = body
        .device_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let device = Device::new(&device_id, &body.name, &body.host, body.port);
    state
        .reconciler
        .add_device(device.clone())
        .await
        .map_err(internal)?;
    Ok(Json(device))
}

async fn api_remove_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.reconciler.remove_device(&id).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(_) => Err((StatusCode::NOT_FOUND, format!("no device '{id}'"))),
    }
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ScheduleBody {
    schedule_id: Option<String>,
    device_id: String,
    name: String,
    days: Vec<String>,
    time: String,
    duration_min: i64,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

fn validate_schedule(s: &Schedule) -> Result<(), String> {
    if s.name.trim().is_empty() {
        return Err("name is empty".into());
    }
    if s.device_id.trim().is_empty() {
        return Err("device_id is empty".into());
    }
    if s.active && s.days.is_empty() {
        return Err("an active schedule needs at least one weekday".into());
    }
    for day in &s.days {
        if weekday_from_abbrev(day).is_none() {
            return Err(format!("unknown weekday '{day}' (use Mon..Sun)"));
        }
    }
    if let Err(e) = parse_time_of_day(&s.time_of_day) {
        return Err(e.to_string());
    }
    if s.duration_min <= 0 {
        return Err("duration_min must be positive".into());
    }
    Ok(())
}

#[derive(serde::Serialize)]
struct ScheduleView {
    #[serde(flatten)]
    schedule: Schedule,
    /// Human-readable next occurrence, e.g. "Mon 09:00"; null when paused.
    next_run: Option<String>,
}

async fn api_schedules(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let schedules = state.db.load_schedules().await.map_err(internal)?;
    let views: Vec<ScheduleView> = schedules
        .into_iter()
        .map(|schedule| {
            let next_run = state.orchestrator.next_fire(&schedule).map(|t| {
                format!(
                    "{} {:02}:{:02}",
                    weekday_abbrev(t.weekday()),
                    t.hour(),
                    t.minute()
                )
            });
            ScheduleView { schedule, next_run }
        })
        .collect();
    Ok(Json(views))
}

/// Create or edit a schedule.  Edits always go disarm-then-arm so two
/// chains can never overlap for one schedule id.
async fn api_save_schedule(
    State(state): State<AppState>,
    Json(body): Json<ScheduleBody>,
) -> Result<impl IntoResponse, ApiError> {
    let schedule = Schedule {
        schedule_id: body
            .schedule_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        device_id: body.device_id,
        name: body.name,
        days: body.days,
        time_of_day: body.time,
        duration_min: body.duration_min,
        active: body.active,
    };
    validate_schedule(&schedule).map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e))?;

    state.db.upsert_schedule(&schedule).await.map_err(internal)?;
    state.orchestrator.disarm(&schedule.schedule_id);
    state.orchestrator.arm(&schedule);

    info!(schedule = %schedule.schedule_id, "schedule saved");
    Ok(Json(schedule))
}

async fn api_delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.disarm(&id);
    let deleted = state.db.delete_schedule(&id).await.map_err(internal)?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((StatusCode::NOT_FOUND, format!("no schedule '{id}'")))
    }
}

#[derive(Deserialize)]
struct ActiveBody {
    active: bool,
}

async fn api_set_active(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ActiveBody>,
) -> Result<impl IntoResponse, ApiError> {
    let updated = state
        .db
        .set_schedule_active(&id, body.active)
        .await
        .map_err(internal)?;
    if !updated {
        return Err((StatusCode::NOT_FOUND, format!("no schedule '{id}'")));
    }

    if body.active {
        if let Some(schedule) = state.db.get_schedule(&id).await.map_err(internal)? {
            state.orchestrator.disarm(&id);
            state.orchestrator.arm(&schedule);
        }
    } else {
        state.orchestrator.disarm(&id);
    }
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!("web ui listening on http://{addr}");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
