//! Table definitions and startup schema verification.
//!
//! Every managed table is described by an ordered list of [`Column`]s. At
//! startup a table is created if it is missing; if it exists, its catalog
//! columns are compared position by position with the expected list, and on
//! any mismatch the table is dropped and created again. Rows in a recreated
//! table are lost.

use crate::errors::JobStoreError;
use crate::job::now_millis;
use crate::kinds::KindDescriptor;
use crate::state::{State, final_state_ids};
use sqlx::postgres::PgArguments;
use sqlx::{Arguments, Encode, PgConnection, Postgres, Type};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Name of the shared table mapping state ids to names.
pub const STATE_TABLE: &str = "srmjobstate";

/// SQL type of a persisted column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// 64 bit integer.
    BigInt,
    /// 32 bit integer, also used for flags.
    Integer,
    /// Bounded text.
    Varchar,
}

impl ColumnType {
    fn ddl(self) -> &'static str {
        match self {
            ColumnType::BigInt => "BIGINT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Varchar => "VARCHAR(32672)",
        }
    }

    /// The `information_schema.columns.data_type` reported for this type.
    fn catalog_name(self) -> &'static str {
        match self {
            ColumnType::BigInt => "bigint",
            ColumnType::Integer => "integer",
            ColumnType::Varchar => "character varying",
        }
    }
}

/// One column of a managed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    /// Lower case column name.
    pub name: &'static str,
    /// SQL type.
    pub ty: ColumnType,
}

impl Column {
    /// A `BIGINT` column.
    pub const fn bigint(name: &'static str) -> Self {
        Self {
            name,
            ty: ColumnType::BigInt,
        }
    }

    /// An `INTEGER` column.
    pub const fn integer(name: &'static str) -> Self {
        Self {
            name,
            ty: ColumnType::Integer,
        }
    }

    /// A `VARCHAR` column.
    pub const fn varchar(name: &'static str) -> Self {
        Self {
            name,
            ty: ColumnType::Varchar,
        }
    }
}

/// Columns shared by every job table, in table order.
pub const JOB_COLUMNS: &[Column] = &[
    Column::bigint("id"),
    Column::bigint("nextjobid"),
    Column::bigint("creationtime"),
    Column::bigint("lifetime"),
    Column::integer("state"),
    Column::varchar("errormessage"),
    Column::varchar("schedulerid"),
    Column::bigint("schedulertimestamp"),
    Column::integer("numofretr"),
    Column::integer("maxnumofretr"),
    Column::bigint("laststatetransitiontime"),
];

/// Columns of every history table, in table order.
pub const HISTORY_COLUMNS: &[Column] = &[
    Column::bigint("id"),
    Column::bigint("jobid"),
    Column::integer("stateid"),
    Column::bigint("transitiontime"),
    Column::varchar("description"),
];

const PROTOCOL_COLUMNS: &[Column] = &[Column::varchar("protocol"), Column::bigint("requestid")];

const JOB_INDEXES: &[&str] = &["nextjobid", "creationtime", "state", "schedulerid"];
const HISTORY_INDEXES: &[&str] = &["stateid", "transitiontime", "jobid"];

/// A value bound to a statement parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    /// Value of a [`ColumnType::BigInt`] column.
    BigInt(Option<i64>),
    /// Value of a [`ColumnType::Integer`] column.
    Integer(Option<i32>),
    /// Value of a [`ColumnType::Varchar`] column.
    Text(Option<String>),
}

impl SqlValue {
    /// An integer column holding a flag.
    pub fn flag(value: bool) -> Self {
        SqlValue::Integer(Some(i32::from(value)))
    }

    pub(crate) fn add_to(self, arguments: &mut PgArguments) -> Result<(), JobStoreError> {
        match self {
            SqlValue::BigInt(value) => add_argument(arguments, value),
            SqlValue::Integer(value) => add_argument(arguments, value),
            SqlValue::Text(value) => add_argument(arguments, value),
        }
    }
}

/// Append one owned statement argument.
pub(crate) fn add_argument<T>(arguments: &mut PgArguments, value: T) -> Result<(), JobStoreError>
where
    T: for<'q> Encode<'q, Postgres> + Type<Postgres> + Send + 'static,
{
    arguments.add(value).map_err(sqlx::Error::Encode)?;
    Ok(())
}

/// Arguments holding every value in order.
pub(crate) fn arguments(values: Vec<SqlValue>) -> Result<PgArguments, JobStoreError> {
    let mut arguments = PgArguments::default();
    for value in values {
        value.add_to(&mut arguments)?;
    }
    Ok(arguments)
}

#[derive(Debug, Clone)]
struct ForeignKey {
    name: String,
    column: &'static str,
    references: String,
    cascade: bool,
}

/// A table to be created or verified.
#[derive(Debug, Clone)]
pub(crate) struct TableDefinition {
    name: String,
    columns: Vec<Column>,
    primary_key: Option<&'static str>,
    foreign_keys: Vec<ForeignKey>,
}

impl TableDefinition {
    fn new(name: impl Into<String>, columns: impl IntoIterator<Item = Column>) -> Self {
        Self {
            name: name.into(),
            columns: columns.into_iter().collect(),
            primary_key: None,
            foreign_keys: Vec::new(),
        }
    }

    fn primary_key(mut self, column: &'static str) -> Self {
        self.primary_key = Some(column);
        self
    }

    fn foreign_key(mut self, suffix: &str, column: &'static str, references: &str, cascade: bool) -> Self {
        self.foreign_keys.push(ForeignKey {
            name: format!("fk_{}_{suffix}", self.name),
            column,
            references: references.to_string(),
            cascade,
        });
        self
    }

    /// Main table of a job kind.
    pub(crate) fn for_jobs(descriptor: &KindDescriptor) -> Self {
        let mut definition = Self::new(descriptor.table, descriptor.columns())
            .primary_key("id")
            .foreign_key("st", "state", STATE_TABLE, false);
        if let Some(parent) = descriptor.parent {
            definition = definition.foreign_key("rq", "requestid", parent.descriptor().table, true);
        }
        definition
    }

    /// History table of a job kind.
    pub(crate) fn for_history(descriptor: &KindDescriptor) -> Self {
        Self::new(descriptor.history_table(), HISTORY_COLUMNS.iter().copied())
            .primary_key("id")
            .foreign_key("hi", "jobid", descriptor.table, true)
    }

    /// Protocol list table of a container kind.
    pub(crate) fn for_protocols(descriptor: &KindDescriptor, table: &str) -> Self {
        Self::new(table, PROTOCOL_COLUMNS.iter().copied()).foreign_key(
            "pg",
            "requestid",
            descriptor.table,
            true,
        )
    }

    pub(crate) fn create_statement(&self) -> String {
        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|column| {
                if self.primary_key == Some(column.name) {
                    format!("{} {} NOT NULL PRIMARY KEY", column.name, column.ty.ddl())
                } else {
                    format!("{} {}", column.name, column.ty.ddl())
                }
            })
            .collect();

        for fk in &self.foreign_keys {
            let mut constraint = format!(
                "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} (id)",
                fk.name, fk.column, fk.references
            );
            if fk.cascade {
                constraint.push_str(" ON DELETE CASCADE");
            }
            parts.push(constraint);
        }

        format!("CREATE TABLE {} ({})", self.name, parts.join(", "))
    }
}

/// Why an existing table does not match its definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum SchemaMismatch {
    #[error("column #{position} is named `{actual}`, expected `{expected}`")]
    Name {
        position: usize,
        expected: &'static str,
        actual: String,
    },
    #[error("column #{position} `{column}` has type `{actual}`, expected `{expected}`")]
    Type {
        position: usize,
        column: &'static str,
        expected: &'static str,
        actual: String,
    },
    #[error("table has {actual} columns, expected {expected}")]
    Count { expected: usize, actual: usize },
}

/// Walk the expected and the catalog columns in lockstep.
pub(crate) fn compare_columns(
    expected: &[Column],
    actual: &[(String, String)],
) -> Result<(), SchemaMismatch> {
    for (index, (column, (name, data_type))) in expected.iter().zip(actual).enumerate() {
        let position = index + 1;
        if !column.name.eq_ignore_ascii_case(name) {
            return Err(SchemaMismatch::Name {
                position,
                expected: column.name,
                actual: name.clone(),
            });
        }
        if column.ty.catalog_name() != data_type {
            return Err(SchemaMismatch::Type {
                position,
                column: column.name,
                expected: column.ty.catalog_name(),
                actual: data_type.clone(),
            });
        }
    }
    if expected.len() != actual.len() {
        return Err(SchemaMismatch::Count {
            expected: expected.len(),
            actual: actual.len(),
        });
    }
    Ok(())
}

/// What [`ensure_table`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TableStatus {
    /// The table existed and matched.
    Existing,
    /// The table was missing and has been created.
    Created,
    /// The table existed, was dropped and has been created again.
    Recreated,
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TableStatus::Existing => "existing",
            TableStatus::Created => "created",
            TableStatus::Recreated => "recreated",
        })
    }
}

async fn execute(conn: &mut PgConnection, statement: &str) -> Result<u64, JobStoreError> {
    trace!("executing statement: {statement}");
    let result = sqlx::query(statement).execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

async fn table_exists(conn: &mut PgConnection, table: &str) -> Result<bool, JobStoreError> {
    let exists = sqlx::query_scalar::<_, bool>(
        r"
        SELECT EXISTS (
            SELECT 1 FROM information_schema.tables
            WHERE table_schema = current_schema() AND table_name::TEXT = $1
        )
        ",
    )
    .bind(table)
    .fetch_one(&mut *conn)
    .await?;
    Ok(exists)
}

async fn table_columns(
    conn: &mut PgConnection,
    table: &str,
) -> Result<Vec<(String, String)>, JobStoreError> {
    let columns = sqlx::query_as::<_, (String, String)>(
        r"
        SELECT column_name::TEXT, data_type::TEXT
        FROM information_schema.columns
        WHERE table_schema = current_schema() AND table_name::TEXT = $1
        ORDER BY ordinal_position
        ",
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;
    Ok(columns)
}

async fn drop_table(conn: &mut PgConnection, table: &str) -> Result<(), JobStoreError> {
    execute(conn, &format!("DROP TABLE IF EXISTS {table} CASCADE")).await?;
    Ok(())
}

/// Make sure `definition` exists, verifying its layout if `verify` is set.
///
/// With `force` an existing table is recreated unconditionally.
pub(crate) async fn ensure_table(
    conn: &mut PgConnection,
    definition: &TableDefinition,
    verify: bool,
    force: bool,
) -> Result<TableStatus, JobStoreError> {
    if !table_exists(conn, &definition.name).await? {
        debug!(table = %definition.name, "Table does not exist, creating it");
        execute(conn, &definition.create_statement()).await?;
        return Ok(TableStatus::Created);
    }

    let mismatch = if force {
        Some("recreation of a parent table".to_string())
    } else if verify {
        let actual = table_columns(conn, &definition.name).await?;
        compare_columns(&definition.columns, &actual)
            .err()
            .map(|mismatch| mismatch.to_string())
    } else {
        None
    };

    match mismatch {
        None => Ok(TableStatus::Existing),
        Some(reason) => {
            warn!(
                table = %definition.name,
                "Database table schema changed ({reason}), dropping the table and creating a new one"
            );
            drop_table(conn, &definition.name).await?;
            execute(conn, &definition.create_statement()).await?;
            Ok(TableStatus::Recreated)
        }
    }
}

/// Create single column indexes that are missing.
async fn ensure_indexes(
    conn: &mut PgConnection,
    table: &str,
    columns: &[&str],
) -> Result<(), JobStoreError> {
    for column in columns {
        let statement = format!("CREATE INDEX IF NOT EXISTS {table}_{column}_idx ON {table} ({column})");
        execute(conn, &statement).await?;
    }
    Ok(())
}

/// Create the state lookup table and insert any missing states.
pub(crate) async fn ensure_state_table(conn: &mut PgConnection) -> Result<(), JobStoreError> {
    let definition = TableDefinition::new(
        STATE_TABLE,
        [Column::integer("id"), Column::varchar("state")],
    )
    .primary_key("id");
    ensure_table(conn, &definition, false, false).await?;

    for state in State::ALL {
        sqlx::query(&format!(
            "INSERT INTO {STATE_TABLE} (id, state) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING"
        ))
        .bind(state.id())
        .bind(state.name())
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Force every in-flight job of `table` into a final state.
///
/// Jobs that were handing out data are considered done, everything else that
/// is not yet final has failed. The forced transition moves
/// `laststatetransitiontime` forward like any other. No history is written.
pub(crate) async fn clean_pending(conn: &mut PgConnection, table: &str) -> Result<u64, JobStoreError> {
    let transition = format!(
        "laststatetransitiontime = GREATEST(COALESCE(laststatetransitiontime, 0) + 1, {})",
        now_millis()
    );
    let done = execute(
        conn,
        &format!(
            "UPDATE {table} SET state = {}, {transition} WHERE state IN ({}, {})",
            State::Done.id(),
            State::Ready.id(),
            State::Transferring.id()
        ),
    )
    .await?;
    let failed = execute(
        conn,
        &format!(
            "UPDATE {table} SET state = {}, {transition} WHERE state NOT IN ({})",
            State::Failed.id(),
            final_state_ids()
        ),
    )
    .await?;

    if done + failed > 0 {
        warn!(table, done, failed, "Cleaned in-flight jobs left over from a previous run");
    }
    Ok(done + failed)
}

/// Create or verify every table belonging to one job kind.
///
/// Returns the status of the main table. With `force` the main table is
/// recreated even if it matches. Dependent history and protocol tables are
/// recreated whenever the main table is not an existing one.
pub(crate) async fn init_kind(
    conn: &mut PgConnection,
    descriptor: &KindDescriptor,
    force: bool,
    clean: bool,
) -> Result<TableStatus, JobStoreError> {
    let status = ensure_table(conn, &TableDefinition::for_jobs(descriptor), true, force).await?;
    let reset_dependents = status != TableStatus::Existing;

    let history = TableDefinition::for_history(descriptor);
    if reset_dependents {
        drop_table(conn, &history.name).await?;
    }
    ensure_table(conn, &history, false, false).await?;

    if let Some(protocols_table) = descriptor.protocols_table {
        let protocols = TableDefinition::for_protocols(descriptor, protocols_table);
        if reset_dependents {
            drop_table(conn, protocols_table).await?;
        }
        ensure_table(conn, &protocols, false, false).await?;
    }

    let mut job_indexes = JOB_INDEXES.to_vec();
    if descriptor.parent.is_some() {
        job_indexes.push("requestid");
    }
    ensure_indexes(conn, descriptor.table, &job_indexes).await?;
    execute(
        conn,
        &format!(
            "CREATE INDEX IF NOT EXISTS {0}_expirationtime_idx ON {0} ((creationtime + lifetime))",
            descriptor.table
        ),
    )
    .await?;
    ensure_indexes(conn, &history.name, HISTORY_INDEXES).await?;

    if clean {
        clean_pending(conn, descriptor.table).await?;
    }

    info!(table = descriptor.table, %status, "Job table ready");
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::JobKind;

    fn catalog(columns: &[Column]) -> Vec<(String, String)> {
        columns
            .iter()
            .map(|c| (c.name.to_string(), c.ty.catalog_name().to_string()))
            .collect()
    }

    #[test]
    fn matching_columns_pass() {
        assert_eq!(compare_columns(JOB_COLUMNS, &catalog(JOB_COLUMNS)), Ok(()));
    }

    #[test]
    fn names_are_compared_case_insensitively() {
        let mut actual = catalog(HISTORY_COLUMNS);
        actual[1].0 = "JOBID".to_string();
        assert_eq!(compare_columns(HISTORY_COLUMNS, &actual), Ok(()));
    }

    #[test]
    fn renamed_column_is_a_mismatch() {
        let mut actual = catalog(HISTORY_COLUMNS);
        actual[2].0 = "state".to_string();
        assert_eq!(
            compare_columns(HISTORY_COLUMNS, &actual),
            Err(SchemaMismatch::Name {
                position: 3,
                expected: "stateid",
                actual: "state".to_string(),
            })
        );
    }

    #[test]
    fn retyped_column_is_a_mismatch() {
        let mut actual = catalog(HISTORY_COLUMNS);
        actual[3].1 = "integer".to_string();
        assert!(matches!(
            compare_columns(HISTORY_COLUMNS, &actual),
            Err(SchemaMismatch::Type { position: 4, .. })
        ));
    }

    #[test]
    fn extra_or_missing_columns_are_a_mismatch() {
        let mut actual = catalog(HISTORY_COLUMNS);
        actual.push(("extra".to_string(), "bigint".to_string()));
        assert_eq!(
            compare_columns(HISTORY_COLUMNS, &actual),
            Err(SchemaMismatch::Count {
                expected: 5,
                actual: 6
            })
        );

        actual.truncate(4);
        assert!(matches!(
            compare_columns(HISTORY_COLUMNS, &actual),
            Err(SchemaMismatch::Count { .. })
        ));
    }

    #[test]
    fn file_request_table_cascades_from_its_container() {
        let ddl = TableDefinition::for_jobs(JobKind::GetFile.descriptor()).create_statement();
        assert!(ddl.starts_with("CREATE TABLE getfilerequests (id BIGINT NOT NULL PRIMARY KEY, nextjobid BIGINT"));
        assert!(ddl.contains("CONSTRAINT fk_getfilerequests_st FOREIGN KEY (state) REFERENCES srmjobstate (id)"));
        assert!(ddl.contains(
            "CONSTRAINT fk_getfilerequests_rq FOREIGN KEY (requestid) REFERENCES getrequests (id) ON DELETE CASCADE"
        ));
    }

    #[test]
    fn history_table_cascades_from_its_job_table() {
        let ddl = TableDefinition::for_history(JobKind::ReserveSpace.descriptor()).create_statement();
        assert_eq!(
            ddl,
            "CREATE TABLE reservespacerequestshistory (id BIGINT NOT NULL PRIMARY KEY, jobid BIGINT, \
             stateid INTEGER, transitiontime BIGINT, description VARCHAR(32672), \
             CONSTRAINT fk_reservespacerequestshistory_hi FOREIGN KEY (jobid) \
             REFERENCES reservespacerequests (id) ON DELETE CASCADE)"
        );
    }
}
