//! Registry of job kinds: table, columns and row decoding per kind.
//!
//! Behaviour that differs between kinds is looked up in a [`KindDescriptor`]
//! rather than dispatched through a trait object.

mod bring_online;
mod copy;
mod get;
mod ls;
mod put;
mod reserve_space;

pub use self::bring_online::{BringOnlineFileRequest, BringOnlineRequest};
pub use self::copy::{CopyFileRequest, CopyRequest};
pub use self::get::{GetFileRequest, GetRequest};
pub use self::ls::{LsFileRequest, LsRequest};
pub use self::put::{PutFileRequest, PutRequest};
pub use self::reserve_space::ReserveSpaceRequest;

use crate::errors::JobStoreError;
use crate::request::{FileRequestFields, JobKind, Payload, RequestFields};
use crate::schema::{Column, JOB_COLUMNS};
use sqlx::Row;
use sqlx::postgres::PgRow;

const REQUEST_COLUMNS: &[Column] = &[
    Column::bigint("credentialid"),
    Column::integer("retrydeltatime"),
    Column::integer("shouldupdateretrydeltatime"),
    Column::varchar("description"),
    Column::varchar("clienthost"),
    Column::varchar("statuscode"),
    Column::varchar("userid"),
];

const FILE_REQUEST_COLUMNS: &[Column] = &[
    Column::bigint("requestid"),
    Column::bigint("credentialid"),
    Column::varchar("statuscode"),
];

/// Which shared column group follows the common job columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BaseColumns {
    Request,
    FileRequest,
}

impl BaseColumns {
    fn columns(self) -> &'static [Column] {
        match self {
            BaseColumns::Request => REQUEST_COLUMNS,
            BaseColumns::FileRequest => FILE_REQUEST_COLUMNS,
        }
    }
}

/// Everything the store needs to know about one job kind.
#[derive(Debug)]
pub struct KindDescriptor {
    /// The kind described.
    pub kind: JobKind,
    /// Main table.
    pub table: &'static str,
    pub(crate) base: BaseColumns,
    /// Columns following the job and request/file-request columns.
    pub(crate) columns: &'static [Column],
    /// Container kind whose table the `requestid` column references.
    pub parent: Option<JobKind>,
    /// File-request kind owned by this kind.
    pub child: Option<JobKind>,
    /// Table holding the protocol list of a container.
    pub protocols_table: Option<&'static str>,
    /// Whether pending jobs of this kind are resubmitted at startup. For
    /// get, put and bring-online the file requests are resubmitted rather
    /// than their containers; ls is never resubmitted.
    pub recoverable: bool,
    pub(crate) decode: fn(&RowReader<'_>) -> Result<Payload, JobStoreError>,
}

impl KindDescriptor {
    /// Every column of the main table, in table order.
    pub fn columns(&self) -> impl Iterator<Item = Column> + '_ {
        JOB_COLUMNS
            .iter()
            .chain(self.base.columns())
            .chain(self.columns)
            .copied()
    }

    /// Comma separated column names, for `SELECT` and `INSERT` lists.
    pub(crate) fn column_list(&self) -> String {
        self.columns()
            .map(|column| column.name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Name of the history table.
    pub fn history_table(&self) -> String {
        format!("{}history", self.table)
    }
}

impl JobKind {
    /// The descriptor of this kind.
    pub fn descriptor(self) -> &'static KindDescriptor {
        match self {
            JobKind::Get => &get::GET_REQUESTS,
            JobKind::GetFile => &get::GET_FILE_REQUESTS,
            JobKind::Put => &put::PUT_REQUESTS,
            JobKind::PutFile => &put::PUT_FILE_REQUESTS,
            JobKind::Copy => &copy::COPY_REQUESTS,
            JobKind::CopyFile => &copy::COPY_FILE_REQUESTS,
            JobKind::BringOnline => &bring_online::BRING_ONLINE_REQUESTS,
            JobKind::BringOnlineFile => &bring_online::BRING_ONLINE_FILE_REQUESTS,
            JobKind::Ls => &ls::LS_REQUESTS,
            JobKind::LsFile => &ls::LS_FILE_REQUESTS,
            JobKind::ReserveSpace => &reserve_space::RESERVE_SPACE_REQUESTS,
        }
    }
}

/// Typed, named access to the columns of one row.
pub(crate) struct RowReader<'r> {
    row: &'r PgRow,
    table: &'static str,
}

impl<'r> RowReader<'r> {
    pub(crate) fn new(row: &'r PgRow, table: &'static str) -> Self {
        Self { row, table }
    }

    pub(crate) fn bigint(&self, column: &str) -> Result<Option<i64>, JobStoreError> {
        Ok(self.row.try_get(column)?)
    }

    pub(crate) fn integer(&self, column: &str) -> Result<Option<i32>, JobStoreError> {
        Ok(self.row.try_get(column)?)
    }

    pub(crate) fn text(&self, column: &str) -> Result<Option<String>, JobStoreError> {
        Ok(self.row.try_get(column)?)
    }

    pub(crate) fn flag(&self, column: &str) -> Result<bool, JobStoreError> {
        Ok(self.integer(column)?.unwrap_or_default() != 0)
    }

    pub(crate) fn required_text(&self, column: &str) -> Result<String, JobStoreError> {
        self.text(column)?.ok_or_else(|| JobStoreError::InvalidRow {
            table: self.table,
            reason: format!("column `{column}` is NULL"),
        })
    }

    pub(crate) fn required_bigint(&self, column: &str) -> Result<i64, JobStoreError> {
        self.bigint(column)?.ok_or_else(|| JobStoreError::InvalidRow {
            table: self.table,
            reason: format!("column `{column}` is NULL"),
        })
    }

    pub(crate) fn required_integer(&self, column: &str) -> Result<i32, JobStoreError> {
        self.integer(column)?.ok_or_else(|| JobStoreError::InvalidRow {
            table: self.table,
            reason: format!("column `{column}` is NULL"),
        })
    }

    pub(crate) fn request_fields(&self) -> Result<RequestFields, JobStoreError> {
        Ok(RequestFields {
            credential_id: self.bigint("credentialid")?,
            retry_delta_time: self.integer("retrydeltatime")?.unwrap_or_default(),
            should_update_retry_delta_time: self.flag("shouldupdateretrydeltatime")?,
            description: self.text("description")?,
            client_host: self.text("clienthost")?,
            status_code: self.text("statuscode")?,
            user_id: self.text("userid")?,
        })
    }

    pub(crate) fn file_fields(&self) -> Result<FileRequestFields, JobStoreError> {
        Ok(FileRequestFields {
            request_id: self.required_bigint("requestid")?,
            credential_id: self.bigint("credentialid")?,
            status_code: self.text("statuscode")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_values_match_the_declared_columns() {
        let payloads: Vec<Payload> = vec![
            GetRequest::default().into(),
            GetFileRequest::new("srm://a/1").into(),
            PutRequest::default().into(),
            PutFileRequest::new("srm://a/1").into(),
            CopyRequest::default().into(),
            CopyFileRequest::new("srm://a/1", "srm://b/1").into(),
            BringOnlineRequest::default().into(),
            BringOnlineFileRequest::new("srm://a/1").into(),
            LsRequest::default().into(),
            LsFileRequest::new("srm://a/").into(),
            ReserveSpaceRequest::default().into(),
        ];

        for payload in payloads {
            let descriptor = payload.kind().descriptor();
            assert_eq!(descriptor.kind, payload.kind());
            assert_eq!(
                payload.encode().len() + JOB_COLUMNS.len(),
                descriptor.columns().count(),
                "column count of {}",
                descriptor.table
            );
        }
    }

    #[test]
    fn parents_and_children_point_at_each_other() {
        for kind in JobKind::ALL {
            if let Some(child) = kind.child() {
                assert_eq!(child.parent(), Some(kind));
                assert!(child.descriptor().protocols_table.is_none());
            }
            if let Some(parent) = kind.parent() {
                assert_eq!(parent.child(), Some(kind));
                let position = |k| JobKind::ALL.iter().position(|other| *other == k);
                assert!(position(parent) < position(kind));
            }
        }
        assert!(!JobKind::ReserveSpace.is_container());
        assert_eq!(JobKind::ReserveSpace.parent(), None);
    }

    #[test]
    fn column_names_are_unique_per_table() {
        for kind in JobKind::ALL {
            let mut names: Vec<&str> = kind.descriptor().columns().map(|c| c.name).collect();
            let total = names.len();
            names.sort_unstable();
            names.dedup();
            assert_eq!(names.len(), total, "duplicate column in {kind}");
        }
    }
}
