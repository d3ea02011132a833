//! Persistence of the jobs of one kind.
//!
//! Every operation checks out one connection, runs inside its transaction and
//! returns the connection through [`ConnectionPool::finish`], so a failed
//! operation never leaves partial rows behind.

use crate::errors::JobStoreError;
use crate::job::{Job, JobHistory, JobRecord};
use crate::kinds::{KindDescriptor, RowReader};
use crate::pool::ConnectionPool;
use crate::request::JobKind;
use crate::scheduler::Scheduler;
use crate::schema::{SqlValue, add_argument, arguments};
use crate::state::{State, final_state_ids};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{PgConnection, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::{debug, error, info, instrument, trace};

/// Which rows of a job table to load.
#[derive(Debug, Clone)]
enum Filter {
    Id(i64),
    Parents(Vec<i64>),
    Scheduler {
        scheduler_id: Option<String>,
        state: Option<State>,
    },
    Active,
}

impl Filter {
    fn clause(&self) -> String {
        match self {
            Filter::Id(_) => "id = $1".to_string(),
            Filter::Parents(_) => "requestid = ANY($1)".to_string(),
            Filter::Scheduler {
                scheduler_id,
                state,
            } => {
                let mut clause = match scheduler_id {
                    Some(_) => "schedulerid = $1".to_string(),
                    None => "schedulerid IS NULL".to_string(),
                };
                if state.is_some() {
                    let index = if scheduler_id.is_some() { 2 } else { 1 };
                    clause.push_str(&format!(" AND state = ${index}"));
                }
                clause
            }
            Filter::Active => format!("state NOT IN ({})", final_state_ids()),
        }
    }

    fn arguments(self) -> Result<PgArguments, JobStoreError> {
        let mut arguments = PgArguments::default();
        match self {
            Filter::Id(id) => add_argument(&mut arguments, id)?,
            Filter::Parents(ids) => add_argument(&mut arguments, ids)?,
            Filter::Scheduler {
                scheduler_id,
                state,
            } => {
                if let Some(scheduler_id) = scheduler_id {
                    add_argument(&mut arguments, scheduler_id)?;
                }
                if let Some(state) = state {
                    add_argument(&mut arguments, state.id())?;
                }
            }
            Filter::Active => {}
        }
        Ok(arguments)
    }
}

/// Durable storage of the jobs of one kind.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct JobStore {
    descriptor: &'static KindDescriptor,
    pool: ConnectionPool,
    history_enabled: bool,
}

impl JobStore {
    /// A store for `kind` using `pool`. The tables must already exist.
    pub fn new(kind: JobKind, pool: ConnectionPool, history_enabled: bool) -> Self {
        Self {
            descriptor: kind.descriptor(),
            pool,
            history_enabled,
        }
    }

    /// The kind stored.
    pub fn kind(&self) -> JobKind {
        self.descriptor.kind
    }

    /// Table layout of the stored kind.
    pub fn descriptor(&self) -> &'static KindDescriptor {
        self.descriptor
    }

    /// The pool the store writes through.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Persist `job` and, for a container, its file requests.
    ///
    /// With history logging disabled only forced saves reach the database,
    /// and no history rows are written.
    ///
    /// The row is updated if it exists and inserted otherwise. Two tasks
    /// must not save the same new job concurrently.
    #[instrument(name = "jobstore.save", skip_all, fields(table = self.descriptor.table, job.id = job.id()))]
    pub async fn save(&self, job: &Job, force: bool) -> Result<(), JobStoreError> {
        if !force && !self.history_enabled {
            trace!("History logging disabled, skipping intermediate save");
            return Ok(());
        }
        self.expect_kind(self.descriptor.kind, job.kind())?;

        let record = job.snapshot().await;
        let mut children = Vec::new();
        if let Some(container) = record.payload.container() {
            for child in &container.file_requests {
                if let Some(kind) = self.descriptor.child {
                    self.expect_kind(kind, child.kind())?;
                }
                children.push((child.clone(), child.snapshot().await));
            }
        }

        let mut conn = self.pool.get_connection().await?;
        let result = self.write(&mut conn, &record, &children).await;
        let (saved, saved_children) = self.pool.finish(conn, result).await?;

        job.mark_history_saved(&saved).await;
        for ((child, _), saved) in children.iter().zip(saved_children) {
            child.mark_history_saved(&saved).await;
        }
        debug!(children = children.len(), state = %record.state(), "Job saved");
        Ok(())
    }

    async fn write(
        &self,
        conn: &mut PgConnection,
        record: &JobRecord,
        children: &[(Job, JobRecord)],
    ) -> Result<(Vec<i64>, Vec<Vec<i64>>), JobStoreError> {
        let saved = write_record(conn, self.descriptor, record, self.history_enabled).await?;

        let mut saved_children = Vec::with_capacity(children.len());
        if let Some(child) = self.descriptor.child {
            for (_, child_record) in children {
                let ids =
                    write_record(conn, child.descriptor(), child_record, self.history_enabled).await?;
                saved_children.push(ids);
            }
        }
        Ok((saved, saved_children))
    }

    /// Load one job with its history and, for a container, its protocols and
    /// file requests.
    #[instrument(name = "jobstore.get_job", skip(self), fields(table = self.descriptor.table))]
    pub async fn get_job(&self, id: i64) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.load(Filter::Id(id)).await?;
        Ok(jobs.pop())
    }

    /// Jobs owned by `scheduler_id`, or by no scheduler for `None`,
    /// optionally restricted to one state.
    #[instrument(name = "jobstore.get_jobs", skip(self), fields(table = self.descriptor.table))]
    pub async fn get_jobs(
        &self,
        scheduler_id: Option<&str>,
        state: Option<State>,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.load(Filter::Scheduler {
            scheduler_id: scheduler_id.map(str::to_string),
            state,
        })
        .await
    }

    /// Every job not in a final state.
    #[instrument(name = "jobstore.get_active_jobs", skip(self), fields(table = self.descriptor.table))]
    pub async fn get_active_jobs(&self) -> Result<Vec<Job>, JobStoreError> {
        self.load(Filter::Active).await
    }

    /// Ids of at most `max` of the latest jobs in any final state, newest first.
    pub async fn get_latest_completed_job_ids(&self, max: u32) -> Result<Vec<i64>, JobStoreError> {
        self.latest_job_ids(&State::FINAL, max).await
    }

    /// Ids of at most `max` of the latest [`State::Done`] jobs, newest first.
    pub async fn get_latest_done_job_ids(&self, max: u32) -> Result<Vec<i64>, JobStoreError> {
        self.latest_job_ids(&[State::Done], max).await
    }

    /// Ids of at most `max` of the latest [`State::Failed`] jobs, newest first.
    pub async fn get_latest_failed_job_ids(&self, max: u32) -> Result<Vec<i64>, JobStoreError> {
        self.latest_job_ids(&[State::Failed], max).await
    }

    /// Ids of at most `max` of the latest [`State::Canceled`] jobs, newest first.
    pub async fn get_latest_canceled_job_ids(&self, max: u32) -> Result<Vec<i64>, JobStoreError> {
        self.latest_job_ids(&[State::Canceled], max).await
    }

    #[instrument(name = "jobstore.latest_job_ids", skip(self), fields(table = self.descriptor.table))]
    async fn latest_job_ids(&self, states: &[State], max: u32) -> Result<Vec<i64>, JobStoreError> {
        let states = states
            .iter()
            .map(|state| state.id().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id FROM {} WHERE state IN ({states}) ORDER BY id DESC LIMIT $1",
            self.descriptor.table
        );

        let mut conn = self.pool.get_connection().await?;
        trace!("executing statement: {sql}");
        let result = sqlx::query_scalar::<_, i64>(&sql)
            .bind(i64::from(max))
            .fetch_all(&mut *conn)
            .await
            .map_err(JobStoreError::from);
        self.pool.finish(conn, result).await
    }

    /// Hand every unowned pending job to `scheduler`.
    ///
    /// The ids are collected first and the connection returned before any
    /// job is loaded. A job that fails to load or schedule is logged and
    /// skipped. Returns the number of jobs handed over.
    #[instrument(name = "jobstore.schedule_pending_jobs", skip_all, fields(table = self.descriptor.table))]
    pub async fn schedule_pending_jobs<S: Scheduler>(
        &self,
        scheduler: &S,
    ) -> Result<usize, JobStoreError> {
        let ids = self.pending_job_ids().await?;
        if ids.is_empty() {
            return Ok(0);
        }

        info!(count = ids.len(), "Scheduling pending jobs…");
        let mut scheduled = 0;
        for id in ids {
            match self.schedule_one(id, scheduler).await {
                Ok(true) => scheduled += 1,
                Ok(false) => debug!(job.id = id, "Pending job vanished before it was scheduled"),
                Err(error) => error!(job.id = id, "Failed to schedule pending job: {error}"),
            }
        }
        Ok(scheduled)
    }

    async fn pending_job_ids(&self) -> Result<Vec<i64>, JobStoreError> {
        let sql = format!(
            "SELECT id FROM {} WHERE schedulerid IS NULL AND state = $1 ORDER BY id",
            self.descriptor.table
        );
        let mut conn = self.pool.get_connection().await?;
        trace!("executing statement: {sql}");
        let result = sqlx::query_scalar::<_, i64>(&sql)
            .bind(State::Pending.id())
            .fetch_all(&mut *conn)
            .await
            .map_err(JobStoreError::from);
        self.pool.finish(conn, result).await
    }

    async fn schedule_one<S: Scheduler>(&self, id: i64, scheduler: &S) -> Result<bool, JobStoreError> {
        let Some(job) = self.get_job(id).await? else {
            return Ok(false);
        };
        scheduler.schedule(job).await.map_err(JobStoreError::Scheduler)?;
        Ok(true)
    }

    /// Delete one job. History, protocol and file request rows go with it.
    #[instrument(name = "jobstore.delete", skip(self), fields(table = self.descriptor.table))]
    pub async fn delete(&self, id: i64) -> Result<bool, JobStoreError> {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.descriptor.table);
        let mut conn = self.pool.get_connection().await?;
        trace!("executing statement: {sql}");
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(JobStoreError::from);
        let result = self.pool.finish(conn, result).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete jobs in a final state that expired before `cutoff`, in
    /// milliseconds since the epoch.
    ///
    /// Saved lifetimes are clamped so that `creationtime + lifetime` always
    /// fits a bigint.
    #[instrument(name = "jobstore.delete_expired", skip(self), fields(table = self.descriptor.table))]
    pub async fn delete_expired(&self, cutoff: i64) -> Result<u64, JobStoreError> {
        let sql = format!(
            "DELETE FROM {} WHERE creationtime + lifetime < $1 AND state IN ({})",
            self.descriptor.table,
            final_state_ids()
        );
        let mut conn = self.pool.get_connection().await?;
        trace!("executing statement: {sql}");
        let result = sqlx::query(&sql)
            .bind(cutoff)
            .execute(&mut *conn)
            .await
            .map_err(JobStoreError::from);
        let result = self.pool.finish(conn, result).await?;
        Ok(result.rows_affected())
    }

    async fn load(&self, filter: Filter) -> Result<Vec<Job>, JobStoreError> {
        let mut conn = self.pool.get_connection().await?;
        let result = self.load_with(&mut conn, filter).await;
        self.pool.finish(conn, result).await
    }

    /// Parents first, then protocols and file requests keyed on the parent
    /// ids. A failure of any query fails the whole load.
    async fn load_with(&self, conn: &mut PgConnection, filter: Filter) -> Result<Vec<Job>, JobStoreError> {
        let mut records = load_records(conn, self.descriptor, filter).await?;
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = records.iter().map(JobRecord::id).collect();

        if let Some(table) = self.descriptor.protocols_table {
            let mut protocols = load_protocols(conn, table, &ids).await?;
            for record in &mut records {
                let id = record.id();
                if let Some(container) = record.payload.container_mut() {
                    container.protocols = protocols.remove(&id).unwrap_or_default();
                }
            }
        }

        if let Some(child) = self.descriptor.child {
            let mut children: HashMap<i64, Vec<Job>> = HashMap::new();
            for child_record in load_records(conn, child.descriptor(), Filter::Parents(ids)).await? {
                if let Some(file) = child_record.payload.file() {
                    children
                        .entry(file.request_id)
                        .or_default()
                        .push(Job::new(child_record));
                }
            }
            for record in &mut records {
                let id = record.id();
                if let Some(container) = record.payload.container_mut() {
                    container.file_requests = children.remove(&id).unwrap_or_default();
                }
            }
        }

        Ok(records.into_iter().map(Job::new).collect())
    }

    fn expect_kind(&self, expected: JobKind, actual: JobKind) -> Result<(), JobStoreError> {
        if expected == actual {
            Ok(())
        } else {
            Err(JobStoreError::KindMismatch { expected, actual })
        }
    }
}

/// Values of every column but `id`, in table order.
fn row_values(record: &JobRecord) -> Vec<SqlValue> {
    let mut values = vec![
        SqlValue::BigInt(record.next_job_id),
        SqlValue::BigInt(Some(record.creation_time)),
        SqlValue::BigInt(Some(record.stored_lifetime())),
        SqlValue::Integer(Some(record.state().id())),
        SqlValue::Text(Some(record.error_message.clone())),
        SqlValue::Text(record.scheduler_id.clone()),
        SqlValue::BigInt(Some(record.scheduler_timestamp)),
        SqlValue::Integer(Some(record.number_of_retries)),
        SqlValue::Integer(Some(record.max_number_of_retries)),
        SqlValue::BigInt(Some(record.last_state_transition_time())),
    ];
    values.extend(record.payload.encode());
    values
}

/// `UPDATE` of every column but `id`, with `id` bound last.
fn update_statement(descriptor: &KindDescriptor) -> String {
    let assignments: Vec<String> = descriptor
        .columns()
        .skip(1)
        .enumerate()
        .map(|(index, column)| format!("{} = ${}", column.name, index + 1))
        .collect();
    format!(
        "UPDATE {} SET {} WHERE id = ${}",
        descriptor.table,
        assignments.join(", "),
        assignments.len() + 1
    )
}

fn insert_statement(descriptor: &KindDescriptor) -> String {
    let placeholders: Vec<String> = (1..=descriptor.columns().count())
        .map(|index| format!("${index}"))
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        descriptor.table,
        descriptor.column_list(),
        placeholders.join(", ")
    )
}

/// Update-then-insert one row and append its unsaved history.
///
/// Returns the ids of the history entries written.
async fn write_record(
    conn: &mut PgConnection,
    descriptor: &KindDescriptor,
    record: &JobRecord,
    history_enabled: bool,
) -> Result<Vec<i64>, JobStoreError> {
    let id = SqlValue::BigInt(Some(record.id()));
    let values = row_values(record);

    let update = update_statement(descriptor);
    let mut update_values = values.clone();
    update_values.push(id.clone());
    trace!("executing statement: {update}");
    let updated = sqlx::query_with::<Postgres, _>(&update, arguments(update_values)?)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    if updated == 0 {
        let insert = insert_statement(descriptor);
        let mut insert_values = vec![id];
        insert_values.extend(values);
        trace!("executing statement: {insert}");
        sqlx::query_with::<Postgres, _>(&insert, arguments(insert_values)?)
            .execute(&mut *conn)
            .await?;

        if let (Some(table), Some(container)) =
            (descriptor.protocols_table, record.payload.container())
        {
            insert_protocols(conn, table, record.id(), &container.protocols).await?;
        }
    }

    if !history_enabled {
        return Ok(Vec::new());
    }
    insert_history(conn, descriptor, record).await
}

async fn insert_protocols(
    conn: &mut PgConnection,
    table: &str,
    request_id: i64,
    protocols: &[String],
) -> Result<(), JobStoreError> {
    if protocols.is_empty() {
        return Ok(());
    }
    let mut builder =
        QueryBuilder::<Postgres>::new(format!("INSERT INTO {table} (protocol, requestid) "));
    builder.push_values(protocols, |mut row, protocol| {
        row.push_bind(protocol.clone()).push_bind(request_id);
    });
    trace!("executing statement: {}", builder.sql());
    builder.build().execute(&mut *conn).await?;
    Ok(())
}

async fn insert_history(
    conn: &mut PgConnection,
    descriptor: &KindDescriptor,
    record: &JobRecord,
) -> Result<Vec<i64>, JobStoreError> {
    let entries: Vec<&JobHistory> = record.unsaved_history().collect();
    if entries.is_empty() {
        return Ok(Vec::new());
    }

    let mut builder = QueryBuilder::<Postgres>::new(format!(
        "INSERT INTO {} (id, jobid, stateid, transitiontime, description) ",
        descriptor.history_table()
    ));
    builder.push_values(&entries, |mut row, entry| {
        row.push_bind(entry.id())
            .push_bind(record.id())
            .push_bind(entry.state().id())
            .push_bind(entry.transition_time())
            .push_bind(entry.description().to_string());
    });
    trace!("executing statement: {}", builder.sql());
    builder.build().execute(&mut *conn).await?;

    Ok(entries.iter().map(|entry| entry.id()).collect())
}

/// Rows matching `filter`, each with its history attached.
async fn load_records(
    conn: &mut PgConnection,
    descriptor: &'static KindDescriptor,
    filter: Filter,
) -> Result<Vec<JobRecord>, JobStoreError> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {} ORDER BY id",
        descriptor.column_list(),
        descriptor.table,
        filter.clause()
    );
    trace!("executing statement: {sql}");
    let rows = sqlx::query_with::<Postgres, _>(&sql, filter.arguments()?)
        .fetch_all(&mut *conn)
        .await?;
    let mut records = rows
        .iter()
        .map(|row| decode_record(descriptor, row))
        .collect::<Result<Vec<_>, _>>()?;
    if records.is_empty() {
        return Ok(records);
    }

    let ids: Vec<i64> = records.iter().map(JobRecord::id).collect();
    let mut history = load_history(conn, descriptor, &ids).await?;
    for record in &mut records {
        record.attach_history(history.remove(&record.id()).unwrap_or_default());
    }
    Ok(records)
}

fn decode_record(descriptor: &'static KindDescriptor, row: &PgRow) -> Result<JobRecord, JobStoreError> {
    let reader = RowReader::new(row, descriptor.table);
    let payload = (descriptor.decode)(&reader)?;
    Ok(JobRecord::restore(
        reader.required_bigint("id")?,
        reader.bigint("nextjobid")?,
        reader.required_bigint("creationtime")?,
        reader.bigint("lifetime")?.unwrap_or_default(),
        State::from_id(reader.required_integer("state")?)?,
        reader.text("errormessage")?.unwrap_or_default(),
        reader.text("schedulerid")?,
        reader.bigint("schedulertimestamp")?.unwrap_or_default(),
        reader.integer("numofretr")?.unwrap_or_default(),
        reader.integer("maxnumofretr")?.unwrap_or_default(),
        reader.bigint("laststatetransitiontime")?.unwrap_or_default(),
        payload,
    ))
}

async fn load_history(
    conn: &mut PgConnection,
    descriptor: &KindDescriptor,
    ids: &[i64],
) -> Result<HashMap<i64, Vec<JobHistory>>, JobStoreError> {
    let sql = format!(
        "SELECT id, jobid, stateid, transitiontime, description FROM {} \
         WHERE jobid = ANY($1) ORDER BY transitiontime, id",
        descriptor.history_table()
    );
    trace!("executing statement: {sql}");
    let rows = sqlx::query_as::<_, (i64, i64, i32, i64, Option<String>)>(&sql)
        .bind(ids)
        .fetch_all(&mut *conn)
        .await?;

    let mut history: HashMap<i64, Vec<JobHistory>> = HashMap::new();
    for (id, job_id, state, transition_time, description) in rows {
        let entry = JobHistory::loaded(
            id,
            State::from_id(state)?,
            description.unwrap_or_default(),
            transition_time,
        );
        history.entry(job_id).or_default().push(entry);
    }
    Ok(history)
}

async fn load_protocols(
    conn: &mut PgConnection,
    table: &str,
    ids: &[i64],
) -> Result<HashMap<i64, Vec<String>>, JobStoreError> {
    let sql = format!("SELECT requestid, protocol FROM {table} WHERE requestid = ANY($1)");
    trace!("executing statement: {sql}");
    let rows = sqlx::query_as::<_, (i64, Option<String>)>(&sql)
        .bind(ids)
        .fetch_all(&mut *conn)
        .await?;

    let mut protocols: HashMap<i64, Vec<String>> = HashMap::new();
    for (request_id, protocol) in rows {
        if let Some(protocol) = protocol {
            protocols.entry(request_id).or_default().push(protocol);
        }
    }
    Ok(protocols)
}
