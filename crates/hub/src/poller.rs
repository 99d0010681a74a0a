//! Periodic device refresh: polls every known lamp through the reconciler
//! so the stored state tracks reality even when no cycle is running.
//! Intended to be `tokio::spawn`-ed from main.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::device::Reconciler;

pub async fn run(reconciler: Arc<Reconciler>, interval_secs: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));

    info!(interval_secs, "device poller started");

    loop {
        ticker.tick().await;
        for device_id in reconciler.device_ids().await {
            if let Err(e) = reconciler.refresh(&device_id).await {
                warn!(device = %device_id, "refresh failed: {e}");
            }
        }
    }
}
