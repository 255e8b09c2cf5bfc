use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::date_of;
use crate::engine::Engine;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const COMPACT_INTERVAL: Duration = Duration::from_secs(60);

/// Background task that expires lapsed holds and evicts past-dated ledgers.
///
/// Expiry is bookkeeping, not correctness: a lapsed hold already counts as
/// free capacity everywhere. The sweep just makes the terminal status
/// visible and durable.
pub async fn run_sweeper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let now = engine.clock.now_ms();

        match engine.expire_sweep(now).await {
            Ok(0) => {}
            Ok(expired) => debug!(expired, "sweeper expired lapsed holds"),
            Err(e) => warn!("sweep failed: {e}"),
        }

        let evicted = engine.evict_past_ledgers(date_of(now));
        if evicted > 0 {
            debug!(evicted, "sweeper evicted past ledgers");
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_INTERVAL);
    loop {
        interval.tick().await;
        let appends = match engine.wal_appends_since_compact().await {
            Ok(n) => n,
            Err(e) => {
                warn!("compactor failed to query WAL: {e}");
                continue;
            }
        };
        if appends < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            warn!("compaction failed: {e}");
        }
    }
}
