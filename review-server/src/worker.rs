//! Reconciliation worker: closes expired pending windows.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::{FinalizeOutcome, ReviewEngine};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub finalized: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Drain expired windows and finalize each request.
///
/// A failed entry goes back into the cache, already expired, so the next sweep
/// retries it.
pub async fn sweep_expired(engine: &ReviewEngine) -> SweepReport {
    let expired = engine.pending_cache().drain_expired().await;
    let mut report = SweepReport::default();
    if expired.is_empty() {
        return report;
    }

    info!("Finalizing {} expired review requests", expired.len());
    for entry in expired {
        match engine.finalize_expired(entry.review_request_id).await {
            Ok(FinalizeOutcome::Submitted(review)) => {
                info!(
                    "Review request {} submitted (ledger row {:?})",
                    review.id, review.ledger_row_id
                );
                report.finalized += 1;
            }
            Ok(FinalizeOutcome::Skipped(_)) | Ok(FinalizeOutcome::Missing) => {
                report.skipped += 1;
            }
            Err(e) => {
                error!(
                    "Error finalizing review request {}: {}",
                    entry.review_request_id, e
                );
                engine.pending_cache().reinsert(entry).await;
                report.failed += 1;
            }
        }
    }
    report
}

/// Periodic sweep task with an explicit stop.
pub struct ReconciliationWorker {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl ReconciliationWorker {
    pub fn start(engine: Arc<ReviewEngine>, period: Duration) -> Self {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Reconciliation worker started (every {:?})", period);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = sweep_expired(&engine).await;
                        if report != SweepReport::default() {
                            debug!("Sweep finished: {:?}", report);
                        }
                    }
                }
            }
            info!("Reconciliation worker stopped");
        });

        Self { shutdown, handle }
    }

    /// Signal the task and wait for any in-flight sweep to finish.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            error!("Reconciliation worker panicked: {}", e);
        }
    }
}
