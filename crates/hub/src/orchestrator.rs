//! Recurring-schedule orchestration: turns one-shot delayed tasks into an
//! indefinitely recurring weekly job.
//!
//! Arming a schedule first cancels its queued chain, then enqueues an
//! advance-notice task and a run-cycle task for the next occurrence.  The
//! cycle executor re-invokes [`Orchestrator::rearm_after_cycle`] once a
//! cycle has run, and `arm_all` repeats the computation from persisted
//! definitions at every boot, so a crash between cycle and rearm cannot
//! permanently silence a schedule.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, info, warn};

use crate::cycle::TaskPayload;
use crate::db::{Db, Schedule};
use crate::engine::WorkEngine;
use crate::timecalc::{next_run_time, parse_time_of_day};

/// How long before the fire time the advance notice goes out.
const ADVANCE_NOTICE: Duration = Duration::from_secs(5 * 60);

/// Tag for the armed {advance-notice, run-cycle} pair.  Re-arming cancels
/// this scope only, leaving a pending turn-off from the occurrence that is
/// currently running untouched.
pub fn chain_tag(schedule_id: &str) -> String {
    format!("chain/{schedule_id}")
}

/// Tag for the turn-off task of a running occurrence.  Cancelled together
/// with the chain on disarm, so deleting a schedule removes every task it
/// ever queued.
pub fn turnoff_tag(schedule_id: &str) -> String {
    format!("off/{schedule_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmOutcome {
    Armed,
    /// Inactive schedule or no weekdays selected.
    SkippedInactive,
    /// Computed fire time was not in the future (stale definition).
    SkippedStale,
    /// Unparsable time of day; config validation should have caught it.
    SkippedInvalid,
}

pub struct Orchestrator {
    engine: Arc<dyn WorkEngine>,
    db: Db,
    offset: UtcOffset,
}

impl Orchestrator {
    pub fn new(engine: Arc<dyn WorkEngine>, db: Db, offset: UtcOffset) -> Self {
        Self { engine, db, offset }
    }

    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }

    /// Cancel the queued chain for this schedule and, when it is active,
    /// enqueue the next occurrence's tasks.
    pub fn arm(&self, schedule: &Schedule) -> ArmOutcome {
        self.arm_at(schedule, self.now())
    }

    /// `arm` with an explicit clock, the actual decision logic.
    pub fn arm_at(&self, schedule: &Schedule, now: OffsetDateTime) -> ArmOutcome {
        // Idempotent: cancelling an empty tag is fine, and doing it first
        // guarantees no second chain survives an edit race.
        self.engine.cancel_by_tag(&chain_tag(&schedule.schedule_id));

        let weekdays = schedule.weekdays();
        if !schedule.active || weekdays.is_empty() {
            debug!(schedule = %schedule.schedule_id, "inactive or day-less, not arming");
            return ArmOutcome::SkippedInactive;
        }

        let hm = match parse_time_of_day(&schedule.time_of_day) {
            Ok(hm) => hm,
            Err(e) => {
                warn!(schedule = %schedule.schedule_id, "not arming: {e}");
                return ArmOutcome::SkippedInvalid;
            }
        };
        let fire_at = match next_run_time(&weekdays, hm, now) {
            Ok(t) => t,
            Err(e) => {
                warn!(schedule = %schedule.schedule_id, "not arming: {e}");
                return ArmOutcome::SkippedInvalid;
            }
        };

        if fire_at <= now {
            // Arming inside (or past) the fire minute would start a cycle
            // immediately off stale input; the next edit or boot re-arms.
            warn!(
                schedule = %schedule.schedule_id,
                %fire_at,
                "fire time not in the future, not arming"
            );
            return ArmOutcome::SkippedStale;
        }

        let delay = Duration::from_secs((fire_at - now).whole_seconds().max(0) as u64);
        let notice_delay = delay.saturating_sub(ADVANCE_NOTICE);
        let tag = chain_tag(&schedule.schedule_id);

        self.engine.enqueue(
            notice_delay,
            &tag,
            TaskPayload::AdvanceNotice {
                schedule_id: schedule.schedule_id.clone(),
                schedule_name: schedule.name.clone(),
                duration_min: schedule.duration_min,
                start_unix: fire_at.unix_timestamp(),
            },
        );
        self.engine.enqueue(
            delay,
            &tag,
            TaskPayload::RunCycle {
                schedule_id: schedule.schedule_id.clone(),
                device_id: schedule.device_id.clone(),
                schedule_name: schedule.name.clone(),
                duration_min: schedule.duration_min,
            },
        );

        info!(
            schedule = %schedule.schedule_id,
            name = %schedule.name,
            %fire_at,
            delay_secs = delay.as_secs(),
            "schedule armed"
        );
        ArmOutcome::Armed
    }

    /// Next occurrence for display purposes; `None` when the schedule is
    /// inactive, day-less, or malformed.
    pub fn next_fire(&self, schedule: &Schedule) -> Option<OffsetDateTime> {
        if !schedule.active {
            return None;
        }
        let weekdays = schedule.weekdays();
        if weekdays.is_empty() {
            return None;
        }
        let hm = parse_time_of_day(&schedule.time_of_day).ok()?;
        next_run_time(&weekdays, hm, self.now()).ok()
    }

    /// Cancel everything queued for this schedule: the armed chain and any
    /// pending turn-off.  Used on delete and deactivate.
    pub fn disarm(&self, schedule_id: &str) {
        self.engine.cancel_by_tag(&chain_tag(schedule_id));
        self.engine.cancel_by_tag(&turnoff_tag(schedule_id));
        info!(schedule = %schedule_id, "schedule disarmed");
    }

    /// Re-arm from the schedule's current persisted definition after a
    /// cycle has run.  A deleted schedule is a no-op; `arm` itself skips a
    /// deactivated one.
    pub async fn rearm_after_cycle(&self, schedule_id: &str) -> Result<()> {
        match self.db.get_schedule(schedule_id).await? {
            Some(schedule) => {
                self.arm(&schedule);
            }
            None => {
                debug!(schedule = %schedule_id, "schedule gone, not rearming");
            }
        }
        Ok(())
    }

    /// Arm every active schedule from persisted definitions.  Runs at boot
    /// so restarts recover chains the in-process engine lost.
    pub async fn arm_all(&self) -> Result<usize> {
        let schedules = self.db.list_active_schedules().await?;
        let mut armed = 0;
        for schedule in &schedules {
            if self.arm(schedule) == ArmOutcome::Armed {
                armed += 1;
            }
        }
        info!(total = schedules.len(), armed, "armed schedules from store");
        Ok(armed)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
