//! Cleaning cycle task bodies: what runs when a scheduled fire time
//! arrives.  One executor handles all three task kinds; the engine may
//! re-deliver any of them, so every body leans on the reconciler's
//! diff-against-stored-state idempotence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::device::Reconciler;
use crate::engine::{TaskHandler, TaskOutcome, WorkEngine};
use crate::notify::NotificationSink;
use crate::orchestrator::{turnoff_tag, Orchestrator};

/// Unit of work queued on the engine.  Carries everything the body needs
/// so a task survives schedule edits made after it was enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskPayload {
    AdvanceNotice {
        schedule_id: String,
        schedule_name: String,
        duration_min: i64,
        start_unix: i64,
    },
    RunCycle {
        schedule_id: String,
        device_id: String,
        schedule_name: String,
        duration_min: i64,
    },
    TurnOff {
        schedule_id: String,
        device_id: String,
        schedule_name: String,
    },
}

pub struct CycleExecutor {
    reconciler: Arc<Reconciler>,
    orchestrator: Arc<Orchestrator>,
    engine: Arc<dyn WorkEngine>,
    sink: Arc<dyn NotificationSink>,
}

impl CycleExecutor {
    pub fn new(
        reconciler: Arc<Reconciler>,
        orchestrator: Arc<Orchestrator>,
        engine: Arc<dyn WorkEngine>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            reconciler,
            orchestrator,
            engine,
            sink,
        }
    }

    /// Arm the next occurrence from the persisted definition.  The cycle
    /// outcome never depends on this succeeding; `arm_all` at boot is the
    /// backstop if it doesn't.
    async fn rearm(&self, schedule_id: &str) {
        if let Err(e) = self.orchestrator.rearm_after_cycle(schedule_id).await {
            warn!(schedule = %schedule_id, "rearm after cycle failed: {e}");
        }
    }

    async fn run_cycle(
        &self,
        schedule_id: &str,
        device_id: &str,
        schedule_name: &str,
        duration_min: i64,
        last_attempt: bool,
    ) -> TaskOutcome {
        if self.reconciler.get(device_id).await.is_none() {
            // Terminal for this cycle, but the schedule itself survives: a
            // re-added device picks the recurrence back up next week.
            self.sink
                .error(schedule_id, schedule_name, "device not found")
                .await;
            self.rearm(schedule_id).await;
            return TaskOutcome::Done;
        }

        self.sink.started(schedule_id, schedule_name).await;

        if !self.reconciler.turn_on(device_id).await {
            self.sink
                .error(schedule_id, schedule_name, "failed to start UV cleaning")
                .await;
            if last_attempt {
                // Give up on this occurrence, keep the recurrence alive.
                self.rearm(schedule_id).await;
            }
            return TaskOutcome::Retry;
        }

        self.engine.enqueue(
            Duration::from_secs(duration_min.max(0) as u64 * 60),
            &turnoff_tag(schedule_id),
            TaskPayload::TurnOff {
                schedule_id: schedule_id.to_string(),
                device_id: device_id.to_string(),
                schedule_name: schedule_name.to_string(),
            },
        );

        // Arm next week's occurrence now rather than waiting for turn-off.
        self.rearm(schedule_id).await;
        TaskOutcome::Done
    }

    async fn run_turn_off(
        &self,
        schedule_id: &str,
        device_id: &str,
        schedule_name: &str,
    ) -> TaskOutcome {
        if self.reconciler.turn_off(device_id).await {
            self.sink.completed(schedule_id, schedule_name).await;
            TaskOutcome::Done
        } else {
            self.sink
                .error(schedule_id, schedule_name, "failed to turn off UV light")
                .await;
            TaskOutcome::Retry
        }
    }
}

#[async_trait]
impl TaskHandler for CycleExecutor {
    async fn run(&self, payload: &TaskPayload, attempt: u32, last_attempt: bool) -> TaskOutcome {
        debug!(?payload, attempt, "task body running");
        match payload {
            TaskPayload::AdvanceNotice {
                schedule_id,
                schedule_name,
                duration_min,
                start_unix,
            } => {
                self.sink
                    .advance_notice(schedule_id, schedule_name, *duration_min, *start_unix)
                    .await;
                TaskOutcome::Done
            }
            TaskPayload::RunCycle {
                schedule_id,
                device_id,
                schedule_name,
                duration_min,
            } => {
                self.run_cycle(
                    schedule_id,
                    device_id,
                    schedule_name,
                    *duration_min,
                    last_attempt,
                )
                .await
            }
            TaskPayload::TurnOff {
                schedule_id,
                device_id,
                schedule_name,
            } => self.run_turn_off(schedule_id, device_id, schedule_name).await,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
