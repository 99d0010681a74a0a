//! Lamp device simulator: serves the same REST API as a real UV
//! sterilizer so the hub can be exercised end-to-end on a laptop.

mod sim;

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::State;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sim::{Scenario, TankSim};

/// How often the tank simulation advances.
const SIM_STEP_SECS: u64 = 5;

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct DeviceState {
    device_id: String,
    name: String,
    uv_on: bool,
    sim: TankSim,
}

type Shared = Arc<Mutex<DeviceState>>;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct StatusBody {
    #[serde(rename = "uvLightOn")]
    uv_light_on: bool,
    status: &'static str,
    timestamp: i64,
}

#[derive(Serialize)]
struct SwitchBody {
    success: bool,
    #[serde(rename = "uvLightOn")]
    uv_light_on: bool,
    timestamp: i64,
}

#[derive(Serialize)]
struct SensorsBody {
    temperature_c: f32,
    ph: f32,
    ph_voltage: f32,
    turbidity_raw: i32,
}

#[derive(Serialize)]
struct InfoBody {
    device: &'static str,
    device_id: String,
    device_name: String,
    version: &'static str,
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Env config
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8088);
    let device_id = env::var("DEVICE_ID").unwrap_or_else(|_| "sim-lamp-1".to_string());
    let name = env::var("DEVICE_NAME").unwrap_or_else(|_| "Simulated Lamp".to_string());
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());

    let state: Shared = Arc::new(Mutex::new(DeviceState {
        device_id,
        name,
        uv_on: false,
        sim: TankSim::new(scenario),
    }));

    // Advance the tank simulation in the background.
    let sim_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(SIM_STEP_SECS));
        loop {
            ticker.tick().await;
            let mut st = sim_state.lock().await;
            let uv_on = st.uv_on;
            st.sim.step(uv_on);
        }
    });

    let app = Router::new()
        .route("/api/status", get(api_status))
        .route("/api/on", post(api_on))
        .route("/api/off", post(api_off))
        .route("/api/sensors", get(api_sensors))
        .route("/api/info", get(api_info))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(?scenario, "device simulator listening on http://{addr}");

    axum::serve(listener, app).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn api_status(State(state): State<Shared>) -> Json<StatusBody> {
    let st = state.lock().await;
    Json(StatusBody {
        uv_light_on: st.uv_on,
        status: if st.uv_on { "on" } else { "off" },
        timestamp: now_unix(),
    })
}

async fn api_on(State(state): State<Shared>) -> Json<SwitchBody> {
    let mut st = state.lock().await;
    st.uv_on = true;
    info!("UV lamp ON");
    Json(SwitchBody {
        success: true,
        uv_light_on: true,
        timestamp: now_unix(),
    })
}

async fn api_off(State(state): State<Shared>) -> Json<SwitchBody> {
    let mut st = state.lock().await;
    st.uv_on = false;
    info!("UV lamp OFF");
    Json(SwitchBody {
        success: true,
        uv_light_on: false,
        timestamp: now_unix(),
    })
}

async fn api_sensors(State(state): State<Shared>) -> Json<SensorsBody> {
    let st = state.lock().await;
    let (temperature_c, ph) = st.sim.read();
    Json(SensorsBody {
        temperature_c,
        ph,
        ph_voltage: st.sim.ph_voltage(),
        turbidity_raw: fastrand::i32(180..260),
    })
}

async fn api_info(State(state): State<Shared>) -> Json<InfoBody> {
    let st = state.lock().await;
    Json(InfoBody {
        device: "uv-sterilizer",
        device_id: st.device_id.clone(),
        device_name: st.name.clone(),
        version: VERSION,
    })
}
