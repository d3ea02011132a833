use super::{BaseColumns, KindDescriptor, RowReader};
use crate::errors::JobStoreError;
use crate::request::{Container, FileRequestFields, JobKind, Payload, RequestFields};
use crate::schema::{Column, SqlValue};

/// A request to stage files from tape onto disk.
#[derive(Debug, Clone, Default)]
pub struct BringOnlineRequest {
    /// Shared request attributes.
    pub request: RequestFields,
    /// Protocols and file requests.
    pub container: Container,
    /// How long the staged files should stay online, in milliseconds.
    pub desired_online_lifetime: i64,
}

impl BringOnlineRequest {
    pub(crate) fn encode(&self, values: &mut Vec<SqlValue>) {
        self.request.encode(values);
        values.push(SqlValue::BigInt(Some(self.desired_online_lifetime)));
    }
}

/// One file of a [`BringOnlineRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BringOnlineFileRequest {
    /// Shared file request attributes.
    pub file: FileRequestFields,
    /// Storage URL of the file.
    pub surl: String,
    /// Storage-side identifier of the file.
    pub file_id: Option<String>,
    /// Pin keeping the file online.
    pub pin_id: Option<String>,
}

impl BringOnlineFileRequest {
    /// A file request for the given storage URL.
    pub fn new(surl: impl Into<String>) -> Self {
        Self {
            surl: surl.into(),
            ..Self::default()
        }
    }

    pub(crate) fn encode(&self, values: &mut Vec<SqlValue>) {
        self.file.encode(values);
        values.extend([
            SqlValue::Text(Some(self.surl.clone())),
            SqlValue::Text(self.file_id.clone()),
            SqlValue::Text(self.pin_id.clone()),
        ]);
    }
}

pub(crate) static BRING_ONLINE_REQUESTS: KindDescriptor = KindDescriptor {
    kind: JobKind::BringOnline,
    table: "bringonlinerequests",
    base: BaseColumns::Request,
    columns: &[Column::bigint("desiredonlinelifetime")],
    parent: None,
    child: Some(JobKind::BringOnlineFile),
    protocols_table: Some("bringonlineprotocols"),
    recoverable: false,
    decode: decode_request,
};

pub(crate) static BRING_ONLINE_FILE_REQUESTS: KindDescriptor = KindDescriptor {
    kind: JobKind::BringOnlineFile,
    table: "bringonlinefilerequests",
    base: BaseColumns::FileRequest,
    columns: &[
        Column::varchar("surl"),
        Column::varchar("fileid"),
        Column::varchar("pinid"),
    ],
    parent: Some(JobKind::BringOnline),
    child: None,
    protocols_table: None,
    recoverable: true,
    decode: decode_file_request,
};

fn decode_request(row: &RowReader<'_>) -> Result<Payload, JobStoreError> {
    Ok(Payload::BringOnline(BringOnlineRequest {
        request: row.request_fields()?,
        container: Container::default(),
        desired_online_lifetime: row.bigint("desiredonlinelifetime")?.unwrap_or_default(),
    }))
}

fn decode_file_request(row: &RowReader<'_>) -> Result<Payload, JobStoreError> {
    Ok(Payload::BringOnlineFile(BringOnlineFileRequest {
        file: row.file_fields()?,
        surl: row.required_text("surl")?,
        file_id: row.text("fileid")?,
        pin_id: row.text("pinid")?,
    }))
}
