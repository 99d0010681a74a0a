//! User-facing notices for scheduled cleaning cycles.  The sink is
//! fire-and-forget: delivery problems are logged and swallowed, never
//! propagated into the task chain.

use async_trait::async_trait;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use tracing::{info, warn};

use crate::db::Db;
use crate::state::{EventKind, SharedState};

const HHMM: &[BorrowedFormatItem<'static>] = format_description!("[hour]:[minute]");

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn advance_notice(
        &self,
        schedule_id: &str,
        name: &str,
        duration_min: i64,
        start_unix: i64,
    );
    async fn started(&self, schedule_id: &str, name: &str);
    async fn completed(&self, schedule_id: &str, name: &str);
    async fn error(&self, schedule_id: &str, name: &str, message: &str);
}

/// Default sink: structured log line + shared-state event + persisted
/// activity entry.
pub struct ActivityNotifier {
    shared: SharedState,
    db: Db,
    /// Wall-clock offset captured at construction, for rendering start times.
    offset: UtcOffset,
}

impl ActivityNotifier {
    pub fn new(shared: SharedState, db: Db) -> Self {
        let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
        Self { shared, db, offset }
    }

    fn render_time(&self, unix: i64) -> String {
        OffsetDateTime::from_unix_timestamp(unix)
            .map(|t| t.to_offset(self.offset))
            .ok()
            .and_then(|t| t.format(HHMM).ok())
            .unwrap_or_else(|| "??:??".to_string())
    }

    async fn record(&self, kind: EventKind, schedule_id: &str, detail: String) {
        self.shared
            .write()
            .await
            .push_event(kind.clone(), detail.clone());

        let ts = OffsetDateTime::now_utc().unix_timestamp();
        if let Err(e) = self
            .db
            .insert_activity(ts, None, Some(schedule_id), kind.as_str(), &detail)
            .await
        {
            warn!(schedule = %schedule_id, "activity log write failed: {e}");
        }
    }
}

#[async_trait]
impl NotificationSink for ActivityNotifier {
    async fn advance_notice(
        &self,
        schedule_id: &str,
        name: &str,
        duration_min: i64,
        start_unix: i64,
    ) {
        let at = self.render_time(start_unix);
        info!(schedule = %schedule_id, %name, %at, duration_min, "cleaning starts soon");
        self.record(
            EventKind::Schedule,
            schedule_id,
            format!("{name} will start at {at} and run for {duration_min} minutes"),
        )
        .await;
    }

    async fn started(&self, schedule_id: &str, name: &str) {
        info!(schedule = %schedule_id, %name, "cleaning started");
        self.record(EventKind::Schedule, schedule_id, format!("{name} started"))
            .await;
    }

    async fn completed(&self, schedule_id: &str, name: &str) {
        info!(schedule = %schedule_id, %name, "cleaning complete");
        self.record(
            EventKind::Schedule,
            schedule_id,
            format!("{name} finished successfully"),
        )
        .await;
    }

    async fn error(&self, schedule_id: &str, name: &str, message: &str) {
        warn!(schedule = %schedule_id, %name, %message, "cleaning error");
        self.record(EventKind::Error, schedule_id, format!("{name}: {message}"))
            .await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SystemState;

    async fn notifier() -> (SharedState, Db, ActivityNotifier) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let shared = SystemState::new_shared();
        let n = ActivityNotifier::new(shared.clone(), db.clone());
        (shared, db, n)
    }

    #[tokio::test]
    async fn notices_land_in_event_ring_and_activity_log() {
        let (shared, db, n) = notifier().await;

        n.started("s1", "Morning clean").await;
        n.completed("s1", "Morning clean").await;
        n.error("s1", "Morning clean", "lamp unreachable").await;

        let st = shared.read().await;
        assert_eq!(st.events.len(), 3);
        assert!(matches!(st.events[0].kind, EventKind::Schedule));
        assert!(matches!(st.events[2].kind, EventKind::Error));
        drop(st);

        let log = db.recent_activity(10).await.unwrap();
        assert_eq!(log.len(), 3);
        assert!(log.iter().all(|e| e.schedule_id.as_deref() == Some("s1")));
        assert!(log.iter().any(|e| e.detail.contains("lamp unreachable")));
    }

    #[tokio::test]
    async fn advance_notice_mentions_duration() {
        let (shared, _db, n) = notifier().await;
        n.advance_notice("s1", "Morning clean", 30, 1_700_000_000)
            .await;

        let st = shared.read().await;
        assert!(st.events[0].detail.contains("30 minutes"));
        assert!(st.events[0].detail.contains("Morning clean"));
    }
}
