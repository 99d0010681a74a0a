use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::device::Device;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub devices: HashMap<String, Device>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Connection,
    Uv,
    Schedule,
    Error,
    System,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connection => "connection",
            EventKind::Uv => "uv",
            EventKind::Schedule => "schedule",
            EventKind::Error => "error",
            EventKind::System => "system",
        }
    }
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub devices: HashMap<String, Device>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            devices: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn new_shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Replace the snapshot of one device.
    pub fn record_device(&mut self, device: Device) {
        self.devices.insert(device.device_id.clone(), device);
    }

    pub fn remove_device(&mut self, device_id: &str) {
        self.devices.remove(device_id);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            devices: self.devices.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    pub fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_snapshot_replaces_previous() {
        let mut st = SystemState::new();
        st.record_device(Device::new("d1", "Tank 1", "h", 80));
        let mut updated = Device::new("d1", "Tank 1 renamed", "h", 80);
        updated.total_uv_secs = 42;
        st.record_device(updated);

        assert_eq!(st.devices.len(), 1);
        assert_eq!(st.devices["d1"].name, "Tank 1 renamed");
        assert_eq!(st.devices["d1"].total_uv_secs, 42);
    }

    #[test]
    fn event_ring_is_bounded() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 25) {
            st.push_event(EventKind::System, format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        // Oldest entries evicted first.
        assert_eq!(st.events.front().unwrap().detail, "event 25");
    }

    #[test]
    fn status_snapshot_reverses_events() {
        let mut st = SystemState::new();
        st.push_event(EventKind::System, "first".into());
        st.push_event(EventKind::Schedule, "second".into());

        let status = st.to_status();
        assert_eq!(status.events[0].detail, "second");
        assert_eq!(status.events[1].detail, "first");
    }
}
