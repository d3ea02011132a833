use super::{BaseColumns, KindDescriptor, RowReader};
use crate::errors::JobStoreError;
use crate::request::{Container, FileRequestFields, JobKind, Payload, RequestFields};
use crate::schema::{Column, SqlValue};

/// A request to upload files.
#[derive(Debug, Clone, Default)]
pub struct PutRequest {
    /// Shared request attributes.
    pub request: RequestFields,
    /// Protocols and file requests.
    pub container: Container,
}

impl PutRequest {
    pub(crate) fn encode(&self, values: &mut Vec<SqlValue>) {
        self.request.encode(values);
    }
}

/// One file of a [`PutRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutFileRequest {
    /// Shared file request attributes.
    pub file: FileRequestFields,
    /// Storage URL the file is written to.
    pub surl: String,
    /// Transfer URL handed out for the upload.
    pub turl: Option<String>,
    /// Expected size in bytes.
    pub size: Option<i64>,
    /// Storage-side identifier of the new file.
    pub file_id: Option<String>,
    /// Storage-side identifier of the parent directory.
    pub parent_file_id: Option<String>,
    /// Space reservation the upload is charged to.
    pub space_reservation_id: Option<String>,
    /// Requested retention policy.
    pub retention_policy: Option<String>,
    /// Requested access latency.
    pub access_latency: Option<String>,
}

impl PutFileRequest {
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
            SqlValue::Text(self.turl.clone()),
            SqlValue::BigInt(self.size),
            SqlValue::Text(self.file_id.clone()),
            SqlValue::Text(self.parent_file_id.clone()),
            SqlValue::Text(self.space_reservation_id.clone()),
            SqlValue::Text(self.retention_policy.clone()),
            SqlValue::Text(self.access_latency.clone()),
        ]);
    }
}

pub(crate) static PUT_REQUESTS: KindDescriptor = KindDescriptor {
    kind: JobKind::Put,
    table: "putrequests",
    base: BaseColumns::Request,
    columns: &[],
    parent: None,
    child: Some(JobKind::PutFile),
    protocols_table: Some("putprotocols"),
    recoverable: false,
    decode: decode_request,
};

pub(crate) static PUT_FILE_REQUESTS: KindDescriptor = KindDescriptor {
    kind: JobKind::PutFile,
    table: "putfilerequests",
    base: BaseColumns::FileRequest,
    columns: &[
        Column::varchar("surl"),
        Column::varchar("turl"),
        Column::bigint("size"),
        Column::varchar("fileid"),
        Column::varchar("parentfileid"),
        Column::varchar("spacereservationid"),
        Column::varchar("retentionpolicy"),
        Column::varchar("accesslatency"),
    ],
    parent: Some(JobKind::Put),
    child: None,
    protocols_table: None,
    recoverable: true,
    decode: decode_file_request,
};

fn decode_request(row: &RowReader<'_>) -> Result<Payload, JobStoreError> {
    Ok(Payload::Put(PutRequest {
        request: row.request_fields()?,
        container: Container::default(),
    }))
}

fn decode_file_request(row: &RowReader<'_>) -> Result<Payload, JobStoreError> {
    Ok(Payload::PutFile(PutFileRequest {
        file: row.file_fields()?,
        surl: row.required_text("surl")?,
        turl: row.text("turl")?,
        size: row.bigint("size")?,
        file_id: row.text("fileid")?,
        parent_file_id: row.text("parentfileid")?,
        space_reservation_id: row.text("spacereservationid")?,
        retention_policy: row.text("retentionpolicy")?,
        access_latency: row.text("accesslatency")?,
    }))
}
