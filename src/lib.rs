#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod config;
mod context;
mod errors;
mod ids;
mod job;
mod kinds;
mod pool;
mod reaper;
mod recovery;
mod request;
mod scheduler;
/// Table definitions and startup schema verification.
pub mod schema;
mod state;
mod storage;

/// Database and storage configuration.
pub use self::config::{DatabaseConfig, StoreConfig};
/// The storage context.
pub use self::context::{JobStorage, JobStorageBuilder};
/// Error type of every storage operation.
pub use self::errors::JobStoreError;
pub use self::ids::IdGenerator;
pub use self::job::{Job, JobHistory, JobRecord};
/// Per-kind request types and their table layout.
pub use self::kinds::{
    BringOnlineFileRequest, BringOnlineRequest, CopyFileRequest, CopyRequest, GetFileRequest,
    GetRequest, KindDescriptor, LsFileRequest, LsRequest, PutFileRequest, PutRequest,
    ReserveSpaceRequest,
};
pub use self::pool::{ConnectionPool, PooledConnection};
pub use self::reaper::ReaperHandle;
pub use self::recovery::RecoveryHandle;
pub use self::request::{Container, FileRequestFields, JobKind, Payload, RequestFields};
/// The execution engine jobs are handed to.
pub use self::scheduler::Scheduler;
pub use self::state::State;
pub use self::storage::JobStore;
