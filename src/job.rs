use crate::ids::IdGenerator;
use crate::request::{JobKind, Payload};
use crate::state::State;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// One entry of a job's audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHistory {
    id: i64,
    state: State,
    description: String,
    transition_time: i64,
    saved: bool,
}

impl JobHistory {
    pub(crate) fn new(id: i64, state: State, description: impl Into<String>, transition_time: i64) -> Self {
        Self {
            id,
            state,
            description: description.into(),
            transition_time,
            saved: false,
        }
    }

    pub(crate) fn loaded(id: i64, state: State, description: String, transition_time: i64) -> Self {
        Self {
            saved: true,
            ..Self::new(id, state, description, transition_time)
        }
    }

    /// Unique id, drawn from the long counter.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// State entered, or the state at the time of a plain event.
    pub fn state(&self) -> State {
        self.state
    }

    /// Free text attached to the transition.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// When the entry was recorded, in milliseconds since the epoch.
    pub fn transition_time(&self) -> i64 {
        self.transition_time
    }

    /// Whether the entry has been written to the history table.
    ///
    /// Saved entries are never written again.
    pub fn is_saved(&self) -> bool {
        self.saved
    }
}

/// The fields of a persisted job.
///
/// The id, the state and the history only change through
/// [`JobRecord::set_state`] and [`JobRecord::add_history_event`], which keep
/// them consistent with each other.
#[derive(Debug, Clone)]
pub struct JobRecord {
    id: i64,
    /// Follow-up job chained to this one.
    pub next_job_id: Option<i64>,
    /// Creation time in milliseconds since the epoch.
    pub creation_time: i64,
    /// Milliseconds after creation at which the job expires.
    pub lifetime: i64,
    state: State,
    /// Accumulated transition descriptions.
    pub error_message: String,
    /// Scheduler owning the job, `None` while unscheduled.
    pub scheduler_id: Option<String>,
    /// When the owning scheduler took the job.
    pub scheduler_timestamp: i64,
    /// Times the job entered [`State::RetryWait`].
    pub number_of_retries: i32,
    /// Retries allowed before the scheduler gives up.
    pub max_number_of_retries: i32,
    last_state_transition_time: i64,
    history: Vec<JobHistory>,
    /// Kind specific data.
    pub payload: Payload,
}

impl JobRecord {
    /// A new job in [`State::Pending`] with a single "created" history entry.
    pub fn new(
        id: i64,
        history_id: i64,
        payload: Payload,
        lifetime: i64,
        max_number_of_retries: i32,
    ) -> Self {
        let creation_time = now_millis();
        Self {
            id,
            next_job_id: None,
            creation_time,
            lifetime: creation_time.saturating_add(lifetime) - creation_time,
            state: State::Pending,
            error_message: String::new(),
            scheduler_id: None,
            scheduler_timestamp: 0,
            number_of_retries: 0,
            max_number_of_retries,
            last_state_transition_time: creation_time,
            history: vec![JobHistory::new(history_id, State::Pending, "created", creation_time)],
            payload,
        }
    }

    /// Rebuild a record from persisted columns. The history is attached
    /// separately.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        id: i64,
        next_job_id: Option<i64>,
        creation_time: i64,
        lifetime: i64,
        state: State,
        error_message: String,
        scheduler_id: Option<String>,
        scheduler_timestamp: i64,
        number_of_retries: i32,
        max_number_of_retries: i32,
        last_state_transition_time: i64,
        payload: Payload,
    ) -> Self {
        Self {
            id,
            next_job_id,
            creation_time,
            lifetime,
            state,
            error_message,
            scheduler_id,
            scheduler_timestamp,
            number_of_retries,
            max_number_of_retries,
            last_state_transition_time,
            history: Vec::new(),
            payload,
        }
    }

    /// Unique id of the job.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// The kind of the job.
    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Time of the last transition in milliseconds since the epoch.
    pub fn last_state_transition_time(&self) -> i64 {
        self.last_state_transition_time
    }

    /// Expiration time in milliseconds since the epoch, saturating for
    /// unbounded lifetimes.
    pub fn expiration_time(&self) -> i64 {
        self.creation_time.saturating_add(self.lifetime)
    }

    /// The lifetime as persisted: shortened so that creation time plus
    /// lifetime stays representable.
    pub(crate) fn stored_lifetime(&self) -> i64 {
        self.expiration_time() - self.creation_time
    }

    /// The audit trail, oldest first.
    pub fn history(&self) -> &[JobHistory] {
        &self.history
    }

    /// Whether the job can still make progress.
    pub fn is_active(&self) -> bool {
        !self.state.is_final()
    }

    /// Record a transition to `state`.
    ///
    /// Legality of the transition is the caller's concern.
    pub fn set_state(&mut self, history_id: i64, state: State, description: &str) {
        let time = self.next_transition_time();
        self.state = state;
        self.last_state_transition_time = time;
        self.history.push(JobHistory::new(history_id, state, description, time));
        self.append_error_message(description, time);

        if state == State::RetryWait {
            self.number_of_retries += 1;
        }
        if state.is_final() {
            self.scheduler_id = None;
        }
    }

    /// Append a history entry without changing the state.
    pub fn add_history_event(&mut self, history_id: i64, description: &str) {
        let time = now_millis();
        self.history.push(JobHistory::new(history_id, self.state, description, time));
    }

    /// Entries not yet written to the history table.
    pub(crate) fn unsaved_history(&self) -> impl Iterator<Item = &JobHistory> {
        self.history.iter().filter(|entry| !entry.saved)
    }

    /// Mark the given entries as written.
    pub(crate) fn mark_history_saved(&mut self, ids: &[i64]) {
        for entry in &mut self.history {
            if ids.contains(&entry.id) {
                entry.saved = true;
            }
        }
    }

    pub(crate) fn attach_history(&mut self, history: Vec<JobHistory>) {
        self.history = history;
    }

    fn next_transition_time(&self) -> i64 {
        now_millis().max(self.last_state_transition_time + 1)
    }

    fn append_error_message(&mut self, description: &str, time: i64) {
        if self.error_message.is_empty() {
            self.error_message.push_str(description);
            return;
        }
        let at = DateTime::<Utc>::from_timestamp_millis(time)
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| time.to_string());
        self.error_message.push_str("\nat ");
        self.error_message.push_str(&at);
        self.error_message.push_str(" appended:\n");
        self.error_message.push_str(description);
    }
}

/// A shared handle to a job.
///
/// Cloning the handle does not clone the job. Readers snapshot the record
/// under the read lock, so a concurrently mutated job never yields a torn
/// row.
#[derive(Debug, Clone)]
pub struct Job {
    id: i64,
    kind: JobKind,
    record: Arc<RwLock<JobRecord>>,
}

impl Job {
    /// Wrap a record in a shared handle.
    pub fn new(record: JobRecord) -> Self {
        Self {
            id: record.id(),
            kind: record.kind(),
            record: Arc::new(RwLock::new(record)),
        }
    }

    /// Unique id of the job.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// The kind of the job.
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Lock the record for reading.
    pub async fn read(&self) -> RwLockReadGuard<'_, JobRecord> {
        self.record.read().await
    }

    /// Lock the record for writing.
    ///
    /// The kind of the payload must not be changed.
    pub async fn write(&self) -> RwLockWriteGuard<'_, JobRecord> {
        self.record.write().await
    }

    /// A point-in-time copy of the record.
    pub async fn snapshot(&self) -> JobRecord {
        self.record.read().await.clone()
    }

    /// Record a transition, drawing the history id from `ids`.
    pub async fn set_state(&self, ids: &IdGenerator, state: State, description: &str) {
        let history_id = ids.next_long().await;
        self.record.write().await.set_state(history_id, state, description);
    }

    /// Append a history entry without changing the state.
    pub async fn add_history_event(&self, ids: &IdGenerator, description: &str) {
        let history_id = ids.next_long().await;
        self.record.write().await.add_history_event(history_id, description);
    }

    pub(crate) async fn mark_history_saved(&self, ids: &[i64]) {
        if !ids.is_empty() {
            self.record.write().await.mark_history_saved(ids);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::{GetFileRequest, ReserveSpaceRequest};

    fn record() -> JobRecord {
        JobRecord::new(7, 100, ReserveSpaceRequest::default().into(), 60_000, 3)
    }

    #[test]
    fn new_jobs_are_pending_with_one_history_entry() {
        let record = record();
        assert_eq!(record.state(), State::Pending);
        assert_eq!(record.history().len(), 1);
        assert_eq!(record.history()[0].description(), "created");
        assert!(!record.history()[0].is_saved());
        assert_eq!(record.last_state_transition_time(), record.creation_time);
    }

    #[test]
    fn unbounded_lifetimes_are_clamped_to_the_latest_expiration() {
        let mut record = JobRecord::new(7, 100, ReserveSpaceRequest::default().into(), i64::MAX, 0);
        assert_eq!(record.expiration_time(), i64::MAX);
        assert_eq!(record.creation_time + record.lifetime, i64::MAX);

        record.lifetime = i64::MAX;
        record.creation_time -= 1_000;
        assert_eq!(record.stored_lifetime(), i64::MAX - record.creation_time);
        assert_eq!(self::record().stored_lifetime(), 60_000);
    }

    #[test]
    fn transition_time_strictly_increases() {
        let mut record = record();
        let mut previous = record.last_state_transition_time();
        for (id, state) in [(101, State::TQueued), (102, State::Running), (103, State::Ready)] {
            record.set_state(id, state, "step");
            assert!(record.last_state_transition_time() > previous);
            previous = record.last_state_transition_time();
        }
        assert_eq!(record.history().len(), 4);
    }

    #[test]
    fn retry_wait_counts_retries() {
        let mut record = record();
        record.set_state(101, State::RetryWait, "busy");
        record.set_state(102, State::Running, "retrying");
        record.set_state(103, State::RetryWait, "busy again");
        assert_eq!(record.number_of_retries, 2);
    }

    #[test]
    fn final_states_release_the_scheduler() {
        let mut record = record();
        record.scheduler_id = Some("srm-1".to_string());
        record.set_state(101, State::Running, "running");
        assert_eq!(record.scheduler_id.as_deref(), Some("srm-1"));
        record.set_state(102, State::Failed, "no space");
        assert_eq!(record.scheduler_id, None);
        assert!(!record.is_active());
    }

    #[test]
    fn descriptions_accumulate_in_the_error_message() {
        let mut record = record();
        record.set_state(101, State::Running, "first");
        assert_eq!(record.error_message, "first");
        record.set_state(102, State::Failed, "second");
        assert!(record.error_message.starts_with("first\nat "));
        assert!(record.error_message.ends_with(" appended:\nsecond"));
    }

    #[test]
    fn saved_history_is_not_rewritten() {
        let mut record = record();
        record.set_state(101, State::Running, "running");
        record.mark_history_saved(&[100]);
        let unsaved: Vec<i64> = record.unsaved_history().map(JobHistory::id).collect();
        assert_eq!(unsaved, vec![101]);
    }

    #[test]
    fn history_events_keep_the_state() {
        let mut record = JobRecord::new(8, 200, GetFileRequest::new("srm://a/1").into(), 1_000, 0);
        record.add_history_event(201, "pinned");
        assert_eq!(record.state(), State::Pending);
        assert_eq!(record.history().len(), 2);
        assert_eq!(record.history()[1].state(), State::Pending);
    }
}
