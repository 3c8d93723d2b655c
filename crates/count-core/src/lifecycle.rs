use crate::entry::Window;
use crate::log::DurableLog;
use crate::store::EventStore;
use chrono::Utc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Written(usize),
    Failed,
    TimedOut,
}

/// Seeds `store` with the log's records for the current window. Never fails:
/// a broken or slow log leaves the store empty.
pub async fn bootstrap(
    store: &EventStore,
    log: &dyn DurableLog,
    window: Window,
    limit: Duration,
) -> usize {
    let now = Utc::now();
    match timeout(limit, log.query_range(window.cutoff(now), now)).await {
        Ok(Ok(entries)) => {
            let count = entries.len();
            store.load(entries).await;
            info!(count, "entries recovered from durable log");
            count
        }
        Ok(Err(err)) => {
            warn!(%err, "could not read durable log, starting with an empty window");
            0
        }
        Err(_) => {
            warn!(?limit, "durable log read timed out, starting with an empty window");
            0
        }
    }
}

/// Writes entries the log has not seen yet. Best effort.
pub async fn flush(store: &EventStore, log: &dyn DurableLog, limit: Duration) -> FlushOutcome {
    let pending = store.pending().await;
    match timeout(limit, log.append_all(&pending.entries)).await {
        Ok(Ok(written)) => {
            store.mark_persisted(&pending.keys).await;
            info!(written, "cache flushed to durable log");
            FlushOutcome::Written(written)
        }
        Ok(Err(err)) => {
            error!(%err, lost = pending.len(), "could not save cache to durable log");
            FlushOutcome::Failed
        }
        Err(_) => {
            error!(?limit, lost = pending.len(), "durable log write timed out");
            FlushOutcome::TimedOut
        }
    }
}

pub async fn release(log: &dyn DurableLog, limit: Duration) {
    match timeout(limit, log.close()).await {
        Ok(Ok(())) => info!("durable log closed"),
        Ok(Err(err)) => warn!(%err, "error closing durable log"),
        Err(_) => warn!(?limit, "closing durable log timed out"),
    }
}
