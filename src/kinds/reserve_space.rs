use super::{BaseColumns, KindDescriptor, RowReader};
use crate::errors::JobStoreError;
use crate::request::{JobKind, Payload, RequestFields};
use crate::schema::{Column, SqlValue};

/// A request to reserve storage space. Not a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReserveSpaceRequest {
    /// Shared request attributes.
    pub request: RequestFields,
    /// Requested size in bytes.
    pub size_in_bytes: i64,
    /// Lifetime of the reservation in milliseconds, independent of the job's.
    pub reservation_lifetime: i64,
    /// Token identifying the reservation once granted.
    pub space_token: Option<String>,
    /// Requested retention policy.
    pub retention_policy: Option<String>,
    /// Requested access latency.
    pub access_latency: Option<String>,
}

impl ReserveSpaceRequest {
    pub(crate) fn encode(&self, values: &mut Vec<SqlValue>) {
        self.request.encode(values);
        values.extend([
            SqlValue::BigInt(Some(self.size_in_bytes)),
            SqlValue::BigInt(Some(self.reservation_lifetime)),
            SqlValue::Text(self.space_token.clone()),
            SqlValue::Text(self.retention_policy.clone()),
            SqlValue::Text(self.access_latency.clone()),
        ]);
    }
}

pub(crate) static RESERVE_SPACE_REQUESTS: KindDescriptor = KindDescriptor {
    kind: JobKind::ReserveSpace,
    table: "reservespacerequests",
    base: BaseColumns::Request,
    columns: &[
        Column::bigint("sizeinbytes"),
        Column::bigint("reservationlifetime"),
        Column::varchar("spacetoken"),
        Column::varchar("retentionpolicy"),
        Column::varchar("accesslatency"),
    ],
    parent: None,
    child: None,
    protocols_table: None,
    recoverable: true,
    decode: decode_request,
};

fn decode_request(row: &RowReader<'_>) -> Result<Payload, JobStoreError> {
    Ok(Payload::ReserveSpace(ReserveSpaceRequest {
        request: row.request_fields()?,
        size_in_bytes: row.bigint("sizeinbytes")?.unwrap_or_default(),
        reservation_lifetime: row.bigint("reservationlifetime")?.unwrap_or_default(),
        space_token: row.text("spacetoken")?,
        retention_policy: row.text("retentionpolicy")?,
        access_latency: row.text("accesslatency")?,
    }))
}
