use super::{BaseColumns, KindDescriptor, RowReader};
use crate::errors::JobStoreError;
use crate::request::{Container, FileRequestFields, JobKind, Payload, RequestFields};
use crate::schema::{Column, SqlValue};

/// A request to list directories.
#[derive(Debug, Clone, Default)]
pub struct LsRequest {
    /// Shared request attributes.
    pub request: RequestFields,
    /// File requests, one per listed path.
    pub container: Container,
    /// Number of entries to return.
    pub count: i32,
    /// Index of the first entry to return.
    pub offset: i32,
    /// Recursion depth.
    pub num_of_levels: i32,
    /// Whether full metadata is returned.
    pub long_format: bool,
    /// Upper bound on entries across all paths.
    pub max_num_of_results: i32,
}

impl LsRequest {
    pub(crate) fn encode(&self, values: &mut Vec<SqlValue>) {
        self.request.encode(values);
        values.extend([
            SqlValue::Integer(Some(self.count)),
            SqlValue::Integer(Some(self.offset)),
            SqlValue::Integer(Some(self.num_of_levels)),
            SqlValue::flag(self.long_format),
            SqlValue::Integer(Some(self.max_num_of_results)),
        ]);
    }
}

/// One path of an [`LsRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LsFileRequest {
    /// Shared file request attributes.
    pub file: FileRequestFields,
    /// Storage URL to list.
    pub surl: String,
}

impl LsFileRequest {
    /// A listing of the given storage URL.
    pub fn new(surl: impl Into<String>) -> Self {
        Self {
            surl: surl.into(),
            ..Self::default()
        }
    }

    pub(crate) fn encode(&self, values: &mut Vec<SqlValue>) {
        self.file.encode(values);
        values.push(SqlValue::Text(Some(self.surl.clone())));
    }
}

pub(crate) static LS_REQUESTS: KindDescriptor = KindDescriptor {
    kind: JobKind::Ls,
    table: "lsrequests",
    base: BaseColumns::Request,
    columns: &[
        Column::integer("count"),
        Column::integer("lsoffset"),
        Column::integer("numoflevels"),
        Column::integer("longformat"),
        Column::integer("maxnumofresults"),
    ],
    parent: None,
    child: Some(JobKind::LsFile),
    protocols_table: None,
    recoverable: false,
    decode: decode_request,
};

pub(crate) static LS_FILE_REQUESTS: KindDescriptor = KindDescriptor {
    kind: JobKind::LsFile,
    table: "lsfilerequests",
    base: BaseColumns::FileRequest,
    columns: &[Column::varchar("surl")],
    parent: Some(JobKind::Ls),
    child: None,
    protocols_table: None,
    recoverable: false,
    decode: decode_file_request,
};

fn decode_request(row: &RowReader<'_>) -> Result<Payload, JobStoreError> {
    Ok(Payload::Ls(LsRequest {
        request: row.request_fields()?,
        container: Container::default(),
        count: row.integer("count")?.unwrap_or_default(),
        offset: row.integer("lsoffset")?.unwrap_or_default(),
        num_of_levels: row.integer("numoflevels")?.unwrap_or_default(),
        long_format: row.flag("longformat")?,
        max_num_of_results: row.integer("maxnumofresults")?.unwrap_or_default(),
    }))
}

fn decode_file_request(row: &RowReader<'_>) -> Result<Payload, JobStoreError> {
    Ok(Payload::LsFile(LsFileRequest {
        file: row.file_fields()?,
        surl: row.required_text("surl")?,
    }))
}
