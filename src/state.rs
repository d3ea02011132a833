use crate::errors::JobStoreError;
use std::fmt;

/// Lifecycle state of a job.
///
/// The numeric ids are persisted in the `state` column of every job table and
/// in the shared `srmjobstate` lookup table, so they must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum State {
    /// Created, not yet picked up by a scheduler.
    Pending,
    /// Waiting in the scheduler's thread queue.
    TQueued,
    /// Waiting in the scheduler's priority thread queue.
    PriorityTQueued,
    /// Being executed by a scheduler thread.
    Running,
    /// Waiting in the ready queue.
    RQueued,
    /// Ready for the client, e.g. a transfer URL was handed out.
    Ready,
    /// Data is being streamed.
    Transferring,
    /// Finished successfully.
    Done,
    /// Canceled by the client or an administrator.
    Canceled,
    /// Finished with an error.
    Failed,
    /// Waiting before the next retry.
    RetryWait,
    /// Waiting for an asynchronous callback.
    AsyncWait,
    /// Running, but not occupying a scheduler thread.
    RunningWithoutThread,
    /// Restored from the database after a restart.
    Restored,
}

impl State {
    /// Every state, ordered by id.
    pub const ALL: [State; 14] = [
        State::Pending,
        State::TQueued,
        State::PriorityTQueued,
        State::Running,
        State::RQueued,
        State::Ready,
        State::Transferring,
        State::Done,
        State::Canceled,
        State::Failed,
        State::RetryWait,
        State::AsyncWait,
        State::RunningWithoutThread,
        State::Restored,
    ];

    /// States after which no further transitions are expected.
    pub const FINAL: [State; 3] = [State::Done, State::Canceled, State::Failed];

    /// The id stored in the database.
    pub fn id(self) -> i32 {
        match self {
            State::Pending => 0,
            State::TQueued => 1,
            State::PriorityTQueued => 2,
            State::Running => 3,
            State::RQueued => 4,
            State::Ready => 5,
            State::Transferring => 6,
            State::Done => 7,
            State::Canceled => 8,
            State::Failed => 9,
            State::RetryWait => 10,
            State::AsyncWait => 11,
            State::RunningWithoutThread => 12,
            State::Restored => 13,
        }
    }

    /// Resolve a persisted id.
    pub fn from_id(id: i32) -> Result<Self, JobStoreError> {
        Self::ALL
            .into_iter()
            .find(|state| state.id() == id)
            .ok_or(JobStoreError::UnknownState(id))
    }

    /// Name stored next to the id in the lookup table.
    pub fn name(self) -> &'static str {
        match self {
            State::Pending => "Pending",
            State::TQueued => "TQueued",
            State::PriorityTQueued => "PriorityTQueued",
            State::Running => "Running",
            State::RQueued => "RQueued",
            State::Ready => "Ready",
            State::Transferring => "Transferring",
            State::Done => "Done",
            State::Canceled => "Canceled",
            State::Failed => "Failed",
            State::RetryWait => "RetryWait",
            State::AsyncWait => "AsyncWait",
            State::RunningWithoutThread => "RunningWithoutThread",
            State::Restored => "Restored",
        }
    }

    /// Whether this is DONE, CANCELED or FAILED.
    pub fn is_final(self) -> bool {
        Self::FINAL.contains(&self)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Comma separated ids of the final states, for `IN (...)` clauses.
pub(crate) fn final_state_ids() -> String {
    State::FINAL
        .iter()
        .map(|state| state.id().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
