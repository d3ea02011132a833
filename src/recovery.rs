use crate::scheduler::Scheduler;
use crate::storage::JobStore;
use futures_util::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};

/// Resubmit the pending jobs of every store, one task per store.
pub(crate) fn start<S: Scheduler>(stores: Vec<JobStore>, scheduler: Arc<S>) -> RecoveryHandle {
    let handles = stores
        .into_iter()
        .map(|store| {
            let scheduler = scheduler.clone();
            let span = info_span!("recovery", table = store.descriptor().table);
            tokio::spawn(
                async move {
                    match store.schedule_pending_jobs(scheduler.as_ref()).await {
                        Ok(scheduled) => scheduled,
                        Err(error) => {
                            error!("Failed to collect pending jobs: {error}");
                            0
                        }
                    }
                }
                .instrument(span),
            )
        })
        .collect();
    RecoveryHandle { handles }
}

/// Handle to a running recovery scan.
#[derive(Debug)]
pub struct RecoveryHandle {
    handles: Vec<JoinHandle<usize>>,
}

impl RecoveryHandle {
    /// Wait for the scan to finish and return the number of jobs handed to
    /// the scheduler. A stopped or panicked store scan counts as zero.
    pub async fn wait(self) -> usize {
        let mut scheduled = 0;
        for result in join_all(self.handles).await {
            match result {
                Ok(count) => scheduled += count,
                Err(error) => warn!(%error, "Recovery task did not complete"),
            }
        }
        info!(scheduled, "Pending job recovery finished");
        scheduled
    }

    /// Abandon the scan. Jobs already handed over stay with the scheduler.
    pub fn stop(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
