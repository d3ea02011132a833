use super::{BaseColumns, KindDescriptor, RowReader};
use crate::errors::JobStoreError;
use crate::request::{Container, FileRequestFields, JobKind, Payload, RequestFields};
use crate::schema::{Column, SqlValue};

/// A request to copy files between storage elements.
///
/// Copy requests carry no protocol list; the transfer protocol is negotiated
/// per file with the remote side.
#[derive(Debug, Clone, Default)]
pub struct CopyRequest {
    /// Shared request attributes.
    pub request: RequestFields,
    /// File requests.
    pub container: Container,
}

impl CopyRequest {
    pub(crate) fn encode(&self, values: &mut Vec<SqlValue>) {
        self.request.encode(values);
    }
}

/// One file of a [`CopyRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyFileRequest {
    /// Shared file request attributes.
    pub file: FileRequestFields,
    /// Source storage URL.
    pub from_surl: String,
    /// Destination storage URL.
    pub to_surl: String,
    /// Source transfer URL.
    pub from_turl: Option<String>,
    /// Destination transfer URL.
    pub to_turl: Option<String>,
    /// Source path, if the source is local.
    pub local_from_path: Option<String>,
    /// Destination path, if the destination is local.
    pub local_to_path: Option<String>,
    /// Size in bytes.
    pub size: Option<i64>,
    /// Storage-side identifier of the source.
    pub from_file_id: Option<String>,
    /// Storage-side identifier of the destination.
    pub to_file_id: Option<String>,
    /// Request id assigned by the remote storage element.
    pub remote_request_id: Option<String>,
    /// File id assigned by the remote storage element.
    pub remote_file_id: Option<String>,
    /// Space reservation the copy is charged to.
    pub space_reservation_id: Option<String>,
    /// Identifier of the running transfer.
    pub transfer_id: Option<String>,
}

impl CopyFileRequest {
    /// A file request copying `from_surl` to `to_surl`.
    pub fn new(from_surl: impl Into<String>, to_surl: impl Into<String>) -> Self {
        Self {
            from_surl: from_surl.into(),
            to_surl: to_surl.into(),
            ..Self::default()
        }
    }

    pub(crate) fn encode(&self, values: &mut Vec<SqlValue>) {
        self.file.encode(values);
        values.extend([
            SqlValue::Text(Some(self.from_surl.clone())),
            SqlValue::Text(Some(self.to_surl.clone())),
            SqlValue::Text(self.from_turl.clone()),
            SqlValue::Text(self.to_turl.clone()),
            SqlValue::Text(self.local_from_path.clone()),
            SqlValue::Text(self.local_to_path.clone()),
            SqlValue::BigInt(self.size),
            SqlValue::Text(self.from_file_id.clone()),
            SqlValue::Text(self.to_file_id.clone()),
            SqlValue::Text(self.remote_request_id.clone()),
            SqlValue::Text(self.remote_file_id.clone()),
            SqlValue::Text(self.space_reservation_id.clone()),
            SqlValue::Text(self.transfer_id.clone()),
        ]);
    }
}

pub(crate) static COPY_REQUESTS: KindDescriptor = KindDescriptor {
    kind: JobKind::Copy,
    table: "copyrequests",
    base: BaseColumns::Request,
    columns: &[],
    parent: None,
    child: Some(JobKind::CopyFile),
    protocols_table: None,
    recoverable: true,
    decode: decode_request,
};

pub(crate) static COPY_FILE_REQUESTS: KindDescriptor = KindDescriptor {
    kind: JobKind::CopyFile,
    table: "copyfilerequests",
    base: BaseColumns::FileRequest,
    columns: &[
        Column::varchar("fromsurl"),
        Column::varchar("tosurl"),
        Column::varchar("fromturl"),
        Column::varchar("toturl"),
        Column::varchar("localfrompath"),
        Column::varchar("localtopath"),
        Column::bigint("size"),
        Column::varchar("fromfileid"),
        Column::varchar("tofileid"),
        Column::varchar("remoterequestid"),
        Column::varchar("remotefileid"),
        Column::varchar("spacereservationid"),
        Column::varchar("transferid"),
    ],
    parent: Some(JobKind::Copy),
    child: None,
    protocols_table: None,
    recoverable: false,
    decode: decode_file_request,
};

fn decode_request(row: &RowReader<'_>) -> Result<Payload, JobStoreError> {
    Ok(Payload::Copy(CopyRequest {
        request: row.request_fields()?,
        container: Container::default(),
    }))
}

fn decode_file_request(row: &RowReader<'_>) -> Result<Payload, JobStoreError> {
    Ok(Payload::CopyFile(CopyFileRequest {
        file: row.file_fields()?,
        from_surl: row.required_text("fromsurl")?,
        to_surl: row.required_text("tosurl")?,
        from_turl: row.text("fromturl")?,
        to_turl: row.text("toturl")?,
        local_from_path: row.text("localfrompath")?,
        local_to_path: row.text("localtopath")?,
        size: row.bigint("size")?,
        from_file_id: row.text("fromfileid")?,
        to_file_id: row.text("tofileid")?,
        remote_request_id: row.text("remoterequestid")?,
        remote_file_id: row.text("remotefileid")?,
        space_reservation_id: row.text("spacereservationid")?,
        transfer_id: row.text("transferid")?,
    }))
}
