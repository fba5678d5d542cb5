use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, SweepReport, now_ms};
use crate::observability;

/// One expiry pass, with metrics. The sweep timestamp becomes each closed reservation's end.
pub async fn sweep_once(engine: &Engine) -> SweepReport {
    let started = Instant::now();
    let report = engine.handle_expired(now_ms()).await;
    metrics::histogram!(observability::SWEEP_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    let status = if report.failed == 0 { "ok" } else { "partial" };
    metrics::counter!(observability::SWEEPS_TOTAL, "status" => status).increment(1);
    if !report.closed.is_empty() {
        info!(closed = report.closed.len(), "expired reservations closed");
    } else {
        debug!("sweep found nothing to close");
    }
    if report.failed > 0 {
        warn!(failed = report.failed, "some expired reservations could not be closed, will retry");
    }
    report
}

/// Background task that periodically closes expired reservations. Runs until `cancel`.
pub async fn run_sweeper(engine: Arc<Engine>, period: Duration, cancel: CancellationToken) {
    info!(interval_secs = period.as_secs(), "expiry sweeper started");
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("expiry sweeper stopping");
                break;
            }
            _ = interval.tick() => {
                sweep_once(&engine).await;
            }
        }
    }
}

/// Rewrites the journal once enough appends have piled up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let appends = engine.wal_appends_since_compact().await;
                if appends < threshold {
                    continue;
                }
                match engine.compact_wal().await {
                    Ok(()) => info!(appends, "journal compacted"),
                    Err(e) => error!("journal compaction failed: {e}"),
                }
            }
        }
    }
}
