use super::{BaseColumns, KindDescriptor, RowReader};
use crate::errors::JobStoreError;
use crate::request::{Container, FileRequestFields, JobKind, Payload, RequestFields};
use crate::schema::{Column, SqlValue};

/// A request to download files.
#[derive(Debug, Clone, Default)]
pub struct GetRequest {
    /// Shared request attributes.
    pub request: RequestFields,
    /// Protocols and file requests.
    pub container: Container,
}

impl GetRequest {
    pub(crate) fn encode(&self, values: &mut Vec<SqlValue>) {
        self.request.encode(values);
    }
}

/// One file of a [`GetRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetFileRequest {
    /// Shared file request attributes.
    pub file: FileRequestFields,
    /// Storage URL requested by the client.
    pub surl: String,
    /// Transfer URL handed out for the file.
    pub turl: Option<String>,
    /// Storage-side identifier of the file.
    pub file_id: Option<String>,
    /// Pin protecting the file while it is read.
    pub pin_id: Option<String>,
}

impl GetFileRequest {
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
            SqlValue::Text(self.file_id.clone()),
            SqlValue::Text(self.pin_id.clone()),
        ]);
    }
}

pub(crate) static GET_REQUESTS: KindDescriptor = KindDescriptor {
    kind: JobKind::Get,
    table: "getrequests",
    base: BaseColumns::Request,
    columns: &[],
    parent: None,
    child: Some(JobKind::GetFile),
    protocols_table: Some("getprotocols"),
    recoverable: false,
    decode: decode_request,
};

pub(crate) static GET_FILE_REQUESTS: KindDescriptor = KindDescriptor {
    kind: JobKind::GetFile,
    table: "getfilerequests",
    base: BaseColumns::FileRequest,
    columns: &[
        Column::varchar("surl"),
        Column::varchar("turl"),
        Column::varchar("fileid"),
        Column::varchar("pinid"),
    ],
    parent: Some(JobKind::Get),
    child: None,
    protocols_table: None,
    recoverable: true,
    decode: decode_file_request,
};

fn decode_request(row: &RowReader<'_>) -> Result<Payload, JobStoreError> {
    Ok(Payload::Get(GetRequest {
        request: row.request_fields()?,
        container: Container::default(),
    }))
}

fn decode_file_request(row: &RowReader<'_>) -> Result<Payload, JobStoreError> {
    Ok(Payload::GetFile(GetFileRequest {
        file: row.file_fields()?,
        surl: row.required_text("surl")?,
        turl: row.text("turl")?,
        file_id: row.text("fileid")?,
        pin_id: row.text("pinid")?,
    }))
}
