//! The request / file-request composition model.

use crate::job::Job;
use crate::kinds::{
    BringOnlineFileRequest, BringOnlineRequest, CopyFileRequest, CopyRequest, GetFileRequest,
    GetRequest, LsFileRequest, LsRequest, PutFileRequest, PutRequest, ReserveSpaceRequest,
};
use crate::schema::SqlValue;
use serde::Deserialize;
use std::fmt;

/// The kind of a persisted job. Each kind has its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Container of file downloads.
    Get,
    /// One file of a [`JobKind::Get`] request.
    GetFile,
    /// Container of file uploads.
    Put,
    /// One file of a [`JobKind::Put`] request.
    PutFile,
    /// Container of third party copies.
    Copy,
    /// One file of a [`JobKind::Copy`] request.
    CopyFile,
    /// Container of staging requests.
    BringOnline,
    /// One file of a [`JobKind::BringOnline`] request.
    BringOnlineFile,
    /// Container of directory listings.
    Ls,
    /// One path of a [`JobKind::Ls`] request.
    LsFile,
    /// Space reservation, not a container.
    ReserveSpace,
}

impl JobKind {
    /// Every kind, parents before their children.
    pub const ALL: [JobKind; 11] = [
        JobKind::Get,
        JobKind::GetFile,
        JobKind::Put,
        JobKind::PutFile,
        JobKind::Copy,
        JobKind::CopyFile,
        JobKind::BringOnline,
        JobKind::BringOnlineFile,
        JobKind::Ls,
        JobKind::LsFile,
        JobKind::ReserveSpace,
    ];

    /// The container kind owning jobs of this kind.
    pub fn parent(self) -> Option<JobKind> {
        self.descriptor().parent
    }

    /// The file-request kind owned by this container kind.
    pub fn child(self) -> Option<JobKind> {
        self.descriptor().child
    }

    /// Whether jobs of this kind own file requests.
    pub fn is_container(self) -> bool {
        self.child().is_some()
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Attributes shared by every client-initiated request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFields {
    /// Delegated credential, stored outside of this crate.
    pub credential_id: Option<i64>,
    /// Seconds the client should wait before polling again.
    pub retry_delta_time: i32,
    /// Whether `retry_delta_time` grows between polls.
    pub should_update_retry_delta_time: bool,
    /// Free text supplied by the client.
    pub description: Option<String>,
    /// Host the request came from.
    pub client_host: Option<String>,
    /// Protocol status code of the request.
    pub status_code: Option<String>,
    /// Owning user.
    pub user_id: Option<String>,
}

impl RequestFields {
    pub(crate) fn encode(&self, values: &mut Vec<SqlValue>) {
        values.extend([
            SqlValue::BigInt(self.credential_id),
            SqlValue::Integer(Some(self.retry_delta_time)),
            SqlValue::flag(self.should_update_retry_delta_time),
            SqlValue::Text(self.description.clone()),
            SqlValue::Text(self.client_host.clone()),
            SqlValue::Text(self.status_code.clone()),
            SqlValue::Text(self.user_id.clone()),
        ]);
    }
}

/// Attributes shared by every file request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileRequestFields {
    /// Id of the owning container request.
    pub request_id: i64,
    /// Delegated credential, stored outside of this crate.
    pub credential_id: Option<i64>,
    /// Protocol status code of this file.
    pub status_code: Option<String>,
}

impl FileRequestFields {
    pub(crate) fn encode(&self, values: &mut Vec<SqlValue>) {
        values.extend([
            SqlValue::BigInt(Some(self.request_id)),
            SqlValue::BigInt(self.credential_id),
            SqlValue::Text(self.status_code.clone()),
        ]);
    }
}

/// The parts of a container request that live outside its own row.
#[derive(Debug, Clone, Default)]
pub struct Container {
    /// Transfer protocols acceptable to the client.
    ///
    /// Only kinds with a protocol table persist this list, and the order is
    /// not preserved across a reload.
    pub protocols: Vec<String>,
    /// The owned file requests.
    pub file_requests: Vec<Job>,
}

/// Kind specific data of a job.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum Payload {
    Get(GetRequest),
    GetFile(GetFileRequest),
    Put(PutRequest),
    PutFile(PutFileRequest),
    Copy(CopyRequest),
    CopyFile(CopyFileRequest),
    BringOnline(BringOnlineRequest),
    BringOnlineFile(BringOnlineFileRequest),
    Ls(LsRequest),
    LsFile(LsFileRequest),
    ReserveSpace(ReserveSpaceRequest),
}

impl Payload {
    /// The kind this payload belongs to.
    pub fn kind(&self) -> JobKind {
        match self {
            Payload::Get(_) => JobKind::Get,
            Payload::GetFile(_) => JobKind::GetFile,
            Payload::Put(_) => JobKind::Put,
            Payload::PutFile(_) => JobKind::PutFile,
            Payload::Copy(_) => JobKind::Copy,
            Payload::CopyFile(_) => JobKind::CopyFile,
            Payload::BringOnline(_) => JobKind::BringOnline,
            Payload::BringOnlineFile(_) => JobKind::BringOnlineFile,
            Payload::Ls(_) => JobKind::Ls,
            Payload::LsFile(_) => JobKind::LsFile,
            Payload::ReserveSpace(_) => JobKind::ReserveSpace,
        }
    }

    /// Request attributes, if this is a request.
    pub fn request(&self) -> Option<&RequestFields> {
        match self {
            Payload::Get(r) => Some(&r.request),
            Payload::Put(r) => Some(&r.request),
            Payload::Copy(r) => Some(&r.request),
            Payload::BringOnline(r) => Some(&r.request),
            Payload::Ls(r) => Some(&r.request),
            Payload::ReserveSpace(r) => Some(&r.request),
            _ => None,
        }
    }

    /// File request attributes, if this is a file request.
    pub fn file(&self) -> Option<&FileRequestFields> {
        match self {
            Payload::GetFile(r) => Some(&r.file),
            Payload::PutFile(r) => Some(&r.file),
            Payload::CopyFile(r) => Some(&r.file),
            Payload::BringOnlineFile(r) => Some(&r.file),
            Payload::LsFile(r) => Some(&r.file),
            _ => None,
        }
    }

    pub(crate) fn file_mut(&mut self) -> Option<&mut FileRequestFields> {
        match self {
            Payload::GetFile(r) => Some(&mut r.file),
            Payload::PutFile(r) => Some(&mut r.file),
            Payload::CopyFile(r) => Some(&mut r.file),
            Payload::BringOnlineFile(r) => Some(&mut r.file),
            Payload::LsFile(r) => Some(&mut r.file),
            _ => None,
        }
    }

    /// Protocols and file requests, if this is a container request.
    pub fn container(&self) -> Option<&Container> {
        match self {
            Payload::Get(r) => Some(&r.container),
            Payload::Put(r) => Some(&r.container),
            Payload::Copy(r) => Some(&r.container),
            Payload::BringOnline(r) => Some(&r.container),
            Payload::Ls(r) => Some(&r.container),
            _ => None,
        }
    }

    pub(crate) fn container_mut(&mut self) -> Option<&mut Container> {
        match self {
            Payload::Get(r) => Some(&mut r.container),
            Payload::Put(r) => Some(&mut r.container),
            Payload::Copy(r) => Some(&mut r.container),
            Payload::BringOnline(r) => Some(&mut r.container),
            Payload::Ls(r) => Some(&mut r.container),
            _ => None,
        }
    }

    /// Values of every column after the common job columns, in table order.
    pub(crate) fn encode(&self) -> Vec<SqlValue> {
        let mut values = Vec::new();
        match self {
            Payload::Get(r) => r.encode(&mut values),
            Payload::GetFile(r) => r.encode(&mut values),
            Payload::Put(r) => r.encode(&mut values),
            Payload::PutFile(r) => r.encode(&mut values),
            Payload::Copy(r) => r.encode(&mut values),
            Payload::CopyFile(r) => r.encode(&mut values),
            Payload::BringOnline(r) => r.encode(&mut values),
            Payload::BringOnlineFile(r) => r.encode(&mut values),
            Payload::Ls(r) => r.encode(&mut values),
            Payload::LsFile(r) => r.encode(&mut values),
            Payload::ReserveSpace(r) => r.encode(&mut values),
        }
        values
    }
}

macro_rules! payload_from {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for Payload {
                fn from(value: $ty) -> Self {
                    Payload::$variant(value)
                }
            }
        )*
    };
}

payload_from!(
    Get(GetRequest),
    GetFile(GetFileRequest),
    Put(PutRequest),
    PutFile(PutFileRequest),
    Copy(CopyRequest),
    CopyFile(CopyFileRequest),
    BringOnline(BringOnlineRequest),
    BringOnlineFile(BringOnlineFileRequest),
    Ls(LsRequest),
    LsFile(LsFileRequest),
    ReserveSpace(ReserveSpaceRequest),
);
