//! Periodic reclamation of lapsed holds.

use std::sync::Arc;
use std::time::Duration;

use item_store::ItemStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::engine::ReservationEngine;
use crate::error::Result;

/// Returns items whose hold deadline has passed to `available`.
///
/// Each pass is a single conditional bulk update, so several sweepers (one per
/// server instance) may run against the same store at once. A failed pass is
/// logged and retried on the next tick; the lazy-expiry check in
/// [`ReservationEngine::try_reserve`] covers any gap in between.
pub struct ExpirySweeper<S: ItemStore> {
    engine: Arc<ReservationEngine<S>>,
    interval: Duration,
}

impl<S: ItemStore + 'static> ExpirySweeper<S> {
    /// Creates a sweeper that runs every `interval`.
    pub fn new(engine: Arc<ReservationEngine<S>>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// The configured period.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs one pass. Returns the number of holds released.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<u64> {
        metrics::counter!("reservation_sweeps_total").increment(1);

        match self.engine.release_expired().await {
            Ok(released) => {
                metrics::counter!("reservation_swept_items_total").increment(released);
                if released > 0 {
                    tracing::info!(released, "released expired holds");
                }
                Ok(released)
            }
            Err(e) => {
                metrics::counter!("reservation_sweep_failures_total").increment(1);
                Err(e)
            }
        }
    }

    /// Spawns the sweep loop on the current runtime.
    ///
    /// The loop stops when `shutdown` flips to true or its sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(interval_secs = self.interval.as_secs(), "expiry sweeper started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            tracing::error!(error = %e, "expiry sweep failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("expiry sweeper stopped");
        })
    }
}
