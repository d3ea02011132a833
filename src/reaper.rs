use crate::job::now_millis;
use crate::storage::JobStore;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, info, info_span, warn};

/// Deletes jobs in a final state once they fall out of the retention window.
#[derive(Debug, Clone)]
pub(crate) struct Reaper {
    stores: Vec<JobStore>,
    period: Duration,
    retention: Duration,
}

impl Reaper {
    pub(crate) fn new(stores: Vec<JobStore>, period: Duration, retention: Duration) -> Self {
        Self {
            stores,
            period,
            retention,
        }
    }

    /// Run one pass over every store. Failures are logged per store.
    pub(crate) async fn run_once(&self) -> u64 {
        let retention = i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_millis().saturating_sub(retention);

        let mut removed = 0;
        for store in &self.stores {
            match store.delete_expired(cutoff).await {
                Ok(0) => {}
                Ok(count) => {
                    info!(table = store.descriptor().table, count, "Removed expired jobs");
                    removed += count;
                }
                Err(error) => {
                    warn!(table = store.descriptor().table, "Failed to remove expired jobs: {error}");
                }
            }
        }
        removed
    }

    /// Run a pass every `period`, the first one after one full period.
    pub(crate) fn start(self) -> ReaperHandle {
        debug!(period = ?self.period, retention = ?self.retention, "Starting reaper…");
        let task = tokio::spawn(
            async move {
                // tokio intervals reject a zero period
                let period = self.period.max(Duration::from_millis(1));
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    self.run_once().await;
                }
            }
            .instrument(info_span!("reaper")),
        );
        ReaperHandle {
            handle: task.abort_handle(),
        }
    }
}

/// Handle to the periodic removal of expired jobs.
#[derive(Debug)]
pub struct ReaperHandle {
    handle: AbortHandle,
}

impl ReaperHandle {
    /// Stop the reaper. A pass in progress is abandoned, rolling back its
    /// open transaction.
    pub fn stop(&self) {
        self.handle.abort();
    }

    /// Whether the reaper task has ended.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
