use crate::request::JobKind;
use thiserror::Error;

/// Errors returned by the job storage.
#[derive(Debug, Error)]
pub enum JobStoreError {
    /// Connectivity, constraint or statement failure reported by the database.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// A row referenced a state id that is not part of [`State`](crate::State).
    #[error("unknown job state id {0}")]
    UnknownState(i32),

    /// A persisted row could not be turned back into a job.
    #[error("invalid row in table `{table}`: {reason}")]
    InvalidRow {
        /// Table the row was read from.
        table: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// A job was handed to the store of another kind.
    #[error("job of kind {actual} handed to the {expected} store")]
    KindMismatch {
        /// Kind of the store.
        expected: JobKind,
        /// Kind of the job.
        actual: JobKind,
    },

    /// The scheduler refused a job handed to it.
    #[error("scheduler rejected job: {0}")]
    Scheduler(#[source] anyhow::Error),
}
