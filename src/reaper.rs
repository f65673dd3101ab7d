use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{now_ms, Engine};
use crate::model::Ms;
use crate::observability::{RESERVATIONS_EXPIRED_TOTAL, RESERVATIONS_PURGED_TOTAL};

/// Background task that persists lapsed holds as `expired` and purges
/// terminal records past the retention window.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        reap_once(&engine, now_ms()).await;
    }
}

/// One reaper pass. Returns (expired, purged).
pub async fn reap_once(engine: &Engine, now: Ms) -> (usize, usize) {
    let mut expired = 0;
    for id in engine.collect_expirable(now) {
        match engine.expire(id, now).await {
            Ok(resource_id) => {
                info!("expired reservation {id} on {resource_id}");
                expired += 1;
            }
            // confirmed, cancelled or purged since the scan
            Err(e) => debug!("reaper skip {id}: {e}"),
        }
    }

    let mut purged = 0;
    for id in engine.collect_purgeable(now, engine.config.retention_ms) {
        match engine.purge(id, now).await {
            Ok(resource_id) => {
                debug!("purged reservation {id} on {resource_id}");
                purged += 1;
            }
            Err(e) => debug!("reaper purge skip {id}: {e}"),
        }
    }

    metrics::counter!(RESERVATIONS_EXPIRED_TOTAL).increment(expired as u64);
    metrics::counter!(RESERVATIONS_PURGED_TOTAL, "source" => "reaper").increment(purged as u64);
    (expired, purged)
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
