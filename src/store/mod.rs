//! Persistence layer — the durable pipeline state store.

pub mod libsql_backend;
pub mod migrations;
pub mod remote;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use remote::RemotePipelineStore;
pub use traits::{PipelineStore, validate_thread_id};
