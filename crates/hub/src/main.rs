mod api;
mod config;
mod cycle;
mod db;
mod device;
mod engine;
mod notify;
mod orchestrator;
mod poller;
mod state;
mod timecalc;
mod web;

use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use time::UtcOffset;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use api::HttpDeviceClient;
use cycle::CycleExecutor;
use db::Db;
use device::Reconciler;
use engine::{TimerEngine, WorkEngine};
use notify::ActivityNotifier;
use orchestrator::Orchestrator;
use state::SystemState;
use web::AppState;

/// How many times the engine re-runs a failed cycle or turn-off task.
const TASK_MAX_ATTEMPTS: u32 = 3;
const TASK_RETRY_BASE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url =
        env::var("DB_URL").unwrap_or_else(|_| "sqlite:uvclean.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let poll_interval_s: u64 = env::var("POLL_INTERVAL_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(60);

    // Recurrences are wall-clock; fall back to UTC when the platform
    // refuses to expose the local offset.
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed devices + schedules) ──────────────────────
    if Path::new(&config_path).exists() {
        let cfg = config::load(&config_path)?;
        config::apply(&cfg, &db).await?;
    } else {
        warn!(path = %config_path, "no config file found, skipping seed");
    }

    // ── Shared state (ephemeral, for the web UI) ────────────────────
    let shared = SystemState::new_shared();
    shared.write().await.record_system("hub started".to_string());

    // ── Wiring: explicit construction, no global singletons ─────────
    let reconciler = Arc::new(Reconciler::new(
        Arc::new(HttpDeviceClient::new()),
        db.clone(),
        shared.clone(),
    ));
    let known = reconciler.load_persisted().await?;
    info!(devices = known, "device records loaded");

    let engine = Arc::new(TimerEngine::new(TASK_MAX_ATTEMPTS, TASK_RETRY_BASE));
    let engine_dyn: Arc<dyn WorkEngine> = engine.clone();

    let orchestrator = Arc::new(Orchestrator::new(engine_dyn.clone(), db.clone(), offset));
    let sink = Arc::new(ActivityNotifier::new(shared.clone(), db.clone()));
    let executor = Arc::new(CycleExecutor::new(
        reconciler.clone(),
        orchestrator.clone(),
        engine_dyn,
        sink,
    ));
    engine.set_handler(executor);

    // Recompute every active schedule from the store: restart recovery
    // does not depend on the rearm call chain having completed.
    orchestrator.arm_all().await?;

    // ── Device poller ───────────────────────────────────────────────
    let poll_reconciler = Arc::clone(&reconciler);
    tokio::spawn(async move {
        poller::run(poll_reconciler, poll_interval_s).await;
    });

    // ── Web server ──────────────────────────────────────────────────
    web::serve(AppState {
        shared,
        db,
        orchestrator,
        reconciler,
    })
    .await
}
