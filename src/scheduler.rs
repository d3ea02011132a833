use crate::job::Job;
use std::future::Future;

/// The execution engine jobs are handed to.
///
/// The store never calls this on its own; recovery uses it to resubmit jobs
/// that were persisted but never picked up.
pub trait Scheduler: Send + Sync + 'static {
    /// Take ownership of `job` and start driving it.
    fn schedule(&self, job: Job) -> impl Future<Output = anyhow::Result<()>> + Send;
}
