use crate::entry::Window;
use crate::store::EventStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

pub const DEFAULT_EVICT_INTERVAL: Duration = Duration::from_secs(1);

/// One eviction pass relative to `now`.
pub async fn sweep(store: &EventStore, window: Window, now: DateTime<Utc>) -> usize {
    store.evict_older_than(window.cutoff(now)).await
}

/// Runs [`sweep`] every `period` until the returned handle is aborted.
pub fn spawn_evictor(store: Arc<EventStore>, window: Window, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(window_secs = window.as_secs(), ?period, "evictor started");
        loop {
            ticker.tick().await;
            let removed = sweep(&store, window, Utc::now()).await;
            if removed > 0 {
                debug!(removed, "evicted stale entries");
            }
        }
    })
}
