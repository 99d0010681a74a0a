//! Device state reconciliation: the canonical view of each lamp's power
//! state and UV session bookkeeping.
//!
//! All mutation of a `Device` record goes through [`Reconciler`], which
//! serializes writes per device id (one async mutex per device) while
//! letting distinct devices proceed in parallel.  The remote lamp is the
//! source of truth; commands update state optimistically and the periodic
//! refresh reconciles any drift.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::api::DeviceApi;
use crate::db::Db;
use crate::state::{EventKind, SharedState};

// ---------------------------------------------------------------------------
// Device record
// ---------------------------------------------------------------------------

/// Last-known power state.  A tagged variant instead of independent
/// online/uv flags, so "offline but UV on" cannot be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// Never successfully polled since this record was created.
    Unknown,
    Offline,
    Online { uv_on: bool },
}

impl PowerState {
    pub fn is_online(&self) -> bool {
        matches!(self, PowerState::Online { .. })
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            PowerState::Unknown => "unknown",
            PowerState::Offline => "offline",
            PowerState::Online { uv_on: true } => "online-on",
            PowerState::Online { uv_on: false } => "online-off",
        }
    }

    pub fn from_db_str(s: &str) -> Self {
        match s {
            "offline" => PowerState::Offline,
            "online-on" => PowerState::Online { uv_on: true },
            "online-off" => PowerState::Online { uv_on: false },
            _ => PowerState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub power: PowerState,
    /// Unix seconds; set while a session is open or just closed.
    pub uv_session_start: Option<i64>,
    pub uv_session_end: Option<i64>,
    /// Cumulative lamp on-time, only ever increased by closed sessions.
    pub total_uv_secs: i64,
    pub last_seen: Option<i64>,
    pub temperature: Option<f32>,
    pub ph: Option<f32>,
    pub version: Option<String>,
}

impl Device {
    pub fn new(device_id: &str, name: &str, host: &str, port: u16) -> Self {
        Self {
            device_id: device_id.to_string(),
            name: name.to_string(),
            host: host.to_string(),
            port,
            power: PowerState::Unknown,
            uv_session_start: None,
            uv_session_end: None,
            total_uv_secs: 0,
            last_seen: None,
            temperature: None,
            ph: None,
            version: None,
        }
    }

    /// A UV session is open once a start is recorded without a matching end.
    /// This survives offline gaps: a lamp that drops off the network mid-
    /// session still closes its session at the first refresh reporting it off.
    pub fn session_open(&self) -> bool {
        self.uv_session_start.is_some() && self.uv_session_end.is_none()
    }

    /// Off→on transition.  Duplicate delivery is a no-op on the session
    /// bookkeeping: an already-open session keeps its original start.
    fn apply_uv_on(&mut self, now: i64) -> bool {
        let transitioned = !self.session_open();
        if transitioned {
            self.uv_session_start = Some(now);
            self.uv_session_end = None;
        }
        self.power = PowerState::Online { uv_on: true };
        self.last_seen = Some(now);
        transitioned
    }

    /// On→off transition.  Closing an already-closed session neither moves
    /// the end marker nor double-counts on-time.
    fn apply_uv_off(&mut self, now: i64) -> Option<i64> {
        let closed = if self.session_open() {
            let start = self.uv_session_start.unwrap_or(now);
            let secs = (now - start).max(0);
            self.uv_session_end = Some(now);
            self.total_uv_secs += secs;
            Some(secs)
        } else {
            None
        };
        self.power = PowerState::Online { uv_on: false };
        self.last_seen = Some(now);
        closed
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler {
    api: Arc<dyn DeviceApi>,
    db: Db,
    shared: SharedState,
    slots: RwLock<HashMap<String, Arc<Mutex<Device>>>>,
}

impl Reconciler {
    pub fn new(api: Arc<dyn DeviceApi>, db: Db, shared: SharedState) -> Self {
        Self {
            api,
            db,
            shared,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Load every persisted device record into memory.  Called once at boot.
    pub async fn load_persisted(&self) -> Result<usize> {
        let devices = self.db.load_devices().await?;
        let count = devices.len();
        let mut slots = self.slots.write().await;
        for device in devices {
            self.shared.write().await.record_device(device.clone());
            slots.insert(device.device_id.clone(), Arc::new(Mutex::new(device)));
        }
        Ok(count)
    }

    /// Register (or replace) a device record and persist it.
    pub async fn add_device(&self, device: Device) -> Result<()> {
        self.db.upsert_device(&device).await?;
        self.shared.write().await.record_device(device.clone());
        self.slots
            .write()
            .await
            .insert(device.device_id.clone(), Arc::new(Mutex::new(device)));
        Ok(())
    }

    pub async fn remove_device(&self, device_id: &str) -> Result<()> {
        let removed = self.slots.write().await.remove(device_id);
        if removed.is_none() {
            bail!("unknown device '{device_id}'");
        }
        self.db.delete_device(device_id).await?;
        self.shared.write().await.remove_device(device_id);
        Ok(())
    }

    pub async fn get(&self, device_id: &str) -> Option<Device> {
        let slot = self.slot(device_id).await?;
        let device = slot.lock().await.clone();
        Some(device)
    }

    pub async fn list(&self) -> Vec<Device> {
        let slots: Vec<_> = self.slots.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(slot.lock().await.clone());
        }
        out
    }

    pub async fn device_ids(&self) -> Vec<String> {
        self.slots.read().await.keys().cloned().collect()
    }

    async fn slot(&self, device_id: &str) -> Option<Arc<Mutex<Device>>> {
        self.slots.read().await.get(device_id).cloned()
    }

    /// Poll the device's status and sensor endpoints and fold the result
    /// into the stored record.  An unreachable device is an expected,
    /// recoverable condition: it flips the record to `Offline` (logging a
    /// connection event only on the edge) and touches nothing else.
    pub async fn refresh(&self, device_id: &str) -> Result<()> {
        let Some(slot) = self.slot(device_id).await else {
            bail!("unknown device '{device_id}'");
        };
        let mut dev = slot.lock().await;

        match self.api.status(&dev.host, dev.port).await {
            Ok(status) => {
                let now = now_unix();
                let came_online = !dev.power.is_online();

                let was_on = dev.session_open();
                if status.uv_light_on && !was_on {
                    dev.apply_uv_on(now);
                    self.record_event(
                        &dev,
                        EventKind::Uv,
                        format!("{}: UV light reported ON", dev.name),
                    )
                    .await;
                } else if !status.uv_light_on && was_on {
                    let secs = dev.apply_uv_off(now).unwrap_or(0);
                    self.record_event(
                        &dev,
                        EventKind::Uv,
                        format!("{}: UV light reported OFF after {secs}s", dev.name),
                    )
                    .await;
                } else {
                    dev.power = PowerState::Online {
                        uv_on: status.uv_light_on,
                    };
                    dev.last_seen = Some(now);
                }

                if came_online {
                    self.record_event(
                        &dev,
                        EventKind::Connection,
                        format!("{} is now online", dev.name),
                    )
                    .await;
                }

                // Sensor readings and firmware info are best-effort extras.
                if let Ok(readings) = self.api.sensors(&dev.host, dev.port).await {
                    dev.temperature = readings.temperature_c;
                    dev.ph = readings.ph;
                }
                if dev.version.is_none() {
                    if let Ok(info) = self.api.info(&dev.host, dev.port).await {
                        dev.version = info.version;
                        if let Some(name) = info.device_name {
                            if !name.is_empty() {
                                dev.name = name;
                            }
                        }
                    }
                }

                self.persist(&dev).await;
            }
            Err(e) => {
                debug!(device = %device_id, "poll failed: {e}");
                if dev.power != PowerState::Offline {
                    self.record_event(
                        &dev,
                        EventKind::Connection,
                        format!("{} went offline", dev.name),
                    )
                    .await;
                    dev.power = PowerState::Offline;
                    self.persist(&dev).await;
                }
            }
        }
        Ok(())
    }

    /// Issue the remote on command.  Returns whether the command succeeded;
    /// on failure the stored state is left untouched and the caller picks
    /// the retry policy.
    pub async fn turn_on(&self, device_id: &str) -> bool {
        let Some(slot) = self.slot(device_id).await else {
            warn!(device = %device_id, "turn_on: unknown device");
            return false;
        };
        let mut dev = slot.lock().await;

        match self.api.turn_on(&dev.host, dev.port).await {
            Ok(()) => {
                let now = now_unix();
                if dev.apply_uv_on(now) {
                    self.record_event(
                        &dev,
                        EventKind::Uv,
                        format!("{}: UV light turned ON", dev.name),
                    )
                    .await;
                }
                self.persist(&dev).await;
                true
            }
            Err(e) => {
                warn!(device = %device_id, "turn_on failed: {e}");
                false
            }
        }
    }

    /// Issue the remote off command and close the UV session on success.
    pub async fn turn_off(&self, device_id: &str) -> bool {
        let Some(slot) = self.slot(device_id).await else {
            warn!(device = %device_id, "turn_off: unknown device");
            return false;
        };
        let mut dev = slot.lock().await;

        match self.api.turn_off(&dev.host, dev.port).await {
            Ok(()) => {
                let now = now_unix();
                if let Some(secs) = dev.apply_uv_off(now) {
                    self.record_event(
                        &dev,
                        EventKind::Uv,
                        format!("{}: UV light turned OFF after {secs}s", dev.name),
                    )
                    .await;
                }
                self.persist(&dev).await;
                true
            }
            Err(e) => {
                warn!(device = %device_id, "turn_off failed: {e}");
                false
            }
        }
    }

    async fn persist(&self, dev: &Device) {
        if let Err(e) = self.db.upsert_device(dev).await {
            warn!(device = %dev.device_id, "persist failed: {e}");
        }
        self.shared.write().await.record_device(dev.clone());
    }

    async fn record_event(&self, dev: &Device, kind: EventKind, detail: String) {
        self.shared
            .write()
            .await
            .push_event(kind.clone(), detail.clone());
        if let Err(e) = self
            .db
            .insert_activity(
                now_unix(),
                Some(dev.device_id.as_str()),
                None,
                kind.as_str(),
                &detail,
            )
            .await
        {
            warn!(device = %dev.device_id, "activity log write failed: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{DeviceApiError, DeviceInfo, SensorReadings, StatusResponse};
    use crate::state::SystemState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Scripted device API: fixed answers, switchable reachability.
    struct FakeApi {
        reachable: AtomicBool,
        uv_on: AtomicBool,
        accept_commands: AtomicBool,
    }

    impl FakeApi {
        fn new() -> Self {
            Self {
                reachable: AtomicBool::new(true),
                uv_on: AtomicBool::new(false),
                accept_commands: AtomicBool::new(true),
            }
        }

        fn set_reachable(&self, v: bool) {
            self.reachable.store(v, Ordering::SeqCst);
        }

        fn set_uv_on(&self, v: bool) {
            self.uv_on.store(v, Ordering::SeqCst);
        }

        fn set_accept_commands(&self, v: bool) {
            self.accept_commands.store(v, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), DeviceApiError> {
            if self.reachable.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(DeviceApiError::Unreachable("connection refused".into()))
            }
        }
    }

    #[async_trait]
    impl DeviceApi for FakeApi {
        async fn status(&self, _: &str, _: u16) -> Result<StatusResponse, DeviceApiError> {
            self.check()?;
            Ok(StatusResponse {
                uv_light_on: self.uv_on.load(Ordering::SeqCst),
            })
        }

        async fn turn_on(&self, _: &str, _: u16) -> Result<(), DeviceApiError> {
            self.check()?;
            if !self.accept_commands.load(Ordering::SeqCst) {
                return Err(DeviceApiError::Rejected("http status 500".into()));
            }
            self.uv_on.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn turn_off(&self, _: &str, _: u16) -> Result<(), DeviceApiError> {
            self.check()?;
            if !self.accept_commands.load(Ordering::SeqCst) {
                return Err(DeviceApiError::Rejected("http status 500".into()));
            }
            self.uv_on.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn sensors(&self, _: &str, _: u16) -> Result<SensorReadings, DeviceApiError> {
            self.check()?;
            Ok(SensorReadings {
                temperature_c: Some(25.5),
                ph: Some(7.2),
            })
        }

        async fn info(&self, _: &str, _: u16) -> Result<DeviceInfo, DeviceApiError> {
            self.check()?;
            Ok(DeviceInfo {
                device_name: Some("Tank Lamp".into()),
                version: Some("1.4.2".into()),
            })
        }
    }

    async fn setup() -> (Arc<FakeApi>, Reconciler) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let shared = SystemState::new_shared();
        let api = Arc::new(FakeApi::new());
        let rec = Reconciler::new(api.clone(), db, shared);
        rec.add_device(Device::new("d1", "Tank 1", "127.0.0.1", 8080))
            .await
            .unwrap();
        (api, rec)
    }

    // -- session transitions (pure) ------------------------------------------

    #[test]
    fn session_opens_once() {
        let mut d = Device::new("d1", "Tank", "h", 80);
        assert!(d.apply_uv_on(1000));
        assert!(!d.apply_uv_on(1050)); // duplicate delivery
        assert_eq!(d.uv_session_start, Some(1000));
        assert!(d.session_open());
        assert_eq!(d.power, PowerState::Online { uv_on: true });
    }

    #[test]
    fn session_close_accrues_duration_once() {
        let mut d = Device::new("d1", "Tank", "h", 80);
        d.apply_uv_on(1000);
        assert_eq!(d.apply_uv_off(2800), Some(1800));
        assert_eq!(d.total_uv_secs, 1800);
        assert_eq!(d.uv_session_start, Some(1000));
        assert_eq!(d.uv_session_end, Some(2800));

        // Second close is a no-op on an already-off device.
        assert_eq!(d.apply_uv_off(3000), None);
        assert_eq!(d.total_uv_secs, 1800);
        assert_eq!(d.uv_session_end, Some(2800));
    }

    #[test]
    fn close_without_open_session_is_noop() {
        let mut d = Device::new("d1", "Tank", "h", 80);
        assert_eq!(d.apply_uv_off(500), None);
        assert_eq!(d.total_uv_secs, 0);
        assert_eq!(d.power, PowerState::Online { uv_on: false });
    }

    #[test]
    fn total_uv_time_is_monotonic_across_sessions() {
        let mut d = Device::new("d1", "Tank", "h", 80);
        d.apply_uv_on(100);
        d.apply_uv_off(160);
        d.apply_uv_on(1000);
        d.apply_uv_off(1030);
        assert_eq!(d.total_uv_secs, 90);
    }

    #[test]
    fn power_state_db_round_trip() {
        for p in [
            PowerState::Unknown,
            PowerState::Offline,
            PowerState::Online { uv_on: true },
            PowerState::Online { uv_on: false },
        ] {
            assert_eq!(PowerState::from_db_str(p.as_db_str()), p);
        }
    }

    // -- turn_on / turn_off ---------------------------------------------------

    #[tokio::test]
    async fn turn_on_then_off_bookkeeps_session() {
        let (_api, rec) = setup().await;

        assert!(rec.turn_on("d1").await);
        let d = rec.get("d1").await.unwrap();
        assert_eq!(d.power, PowerState::Online { uv_on: true });
        assert!(d.session_open());

        assert!(rec.turn_off("d1").await);
        let d = rec.get("d1").await.unwrap();
        assert_eq!(d.power, PowerState::Online { uv_on: false });
        assert!(!d.session_open());
        assert!(d.uv_session_end.is_some());
    }

    #[tokio::test]
    async fn duplicate_turn_on_keeps_original_session_start() {
        let (_api, rec) = setup().await;
        assert!(rec.turn_on("d1").await);
        let start = rec.get("d1").await.unwrap().uv_session_start;

        assert!(rec.turn_on("d1").await); // re-delivery
        let d = rec.get("d1").await.unwrap();
        assert_eq!(d.uv_session_start, start);
        assert_eq!(d.power, PowerState::Online { uv_on: true });
    }

    #[tokio::test]
    async fn duplicate_turn_off_does_not_double_count() {
        let (_api, rec) = setup().await;
        rec.turn_on("d1").await;
        rec.turn_off("d1").await;
        let total = rec.get("d1").await.unwrap().total_uv_secs;

        rec.turn_off("d1").await;
        assert_eq!(rec.get("d1").await.unwrap().total_uv_secs, total);
    }

    #[tokio::test]
    async fn failed_command_leaves_state_unchanged() {
        let (api, rec) = setup().await;
        api.set_accept_commands(false);

        assert!(!rec.turn_on("d1").await);
        let d = rec.get("d1").await.unwrap();
        assert_eq!(d.power, PowerState::Unknown);
        assert!(d.uv_session_start.is_none());
    }

    #[tokio::test]
    async fn command_to_unknown_device_fails() {
        let (_api, rec) = setup().await;
        assert!(!rec.turn_on("ghost").await);
        assert!(!rec.turn_off("ghost").await);
    }

    // -- refresh --------------------------------------------------------------

    #[tokio::test]
    async fn refresh_picks_up_remote_on_transition() {
        let (api, rec) = setup().await;
        api.set_uv_on(true);

        rec.refresh("d1").await.unwrap();
        let d = rec.get("d1").await.unwrap();
        assert_eq!(d.power, PowerState::Online { uv_on: true });
        assert!(d.session_open());
        assert_eq!(d.temperature, Some(25.5));
        assert_eq!(d.ph, Some(7.2));
        assert_eq!(d.version.as_deref(), Some("1.4.2"));
    }

    #[tokio::test]
    async fn refresh_closes_session_on_remote_off() {
        let (api, rec) = setup().await;
        rec.turn_on("d1").await;

        api.set_uv_on(false); // lamp turned off out-of-band
        rec.refresh("d1").await.unwrap();
        let d = rec.get("d1").await.unwrap();
        assert!(!d.session_open());
        assert_eq!(d.power, PowerState::Online { uv_on: false });
    }

    #[tokio::test]
    async fn unreachable_refresh_marks_offline_once() {
        let (api, rec) = setup().await;
        rec.refresh("d1").await.unwrap(); // online
        rec.turn_on("d1").await;

        api.set_reachable(false);
        rec.refresh("d1").await.unwrap();
        rec.refresh("d1").await.unwrap(); // still unreachable
        rec.refresh("d1").await.unwrap();

        let d = rec.get("d1").await.unwrap();
        assert_eq!(d.power, PowerState::Offline);
        // UV fields untouched by offline polls.
        assert!(d.session_open());

        // Exactly one offline edge recorded despite three failed polls.
        let st = rec.shared.read().await;
        let offline_events = st
            .events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::Connection) && e.detail.contains("offline"))
            .count();
        assert_eq!(offline_events, 1);
    }

    #[tokio::test]
    async fn session_survives_offline_gap() {
        let (api, rec) = setup().await;
        rec.turn_on("d1").await;

        api.set_reachable(false);
        rec.refresh("d1").await.unwrap();

        // Lamp comes back reporting off: the stale session closes now.
        api.set_reachable(true);
        api.set_uv_on(false);
        rec.refresh("d1").await.unwrap();

        let d = rec.get("d1").await.unwrap();
        assert!(!d.session_open());
        assert_eq!(d.power, PowerState::Online { uv_on: false });
    }

    #[tokio::test]
    async fn remove_device_forgets_it() {
        let (_api, rec) = setup().await;
        rec.remove_device("d1").await.unwrap();
        assert!(rec.get("d1").await.is_none());
        assert!(rec.remove_device("d1").await.is_err());
    }
}
