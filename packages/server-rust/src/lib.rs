//! Deep Lynx server: schema-validated node upserts and the import staging
//! pipeline, backed by in-memory or `PostgreSQL` storage.

pub mod service;
pub mod storage;
pub mod traits;

pub use service::{EngineError, NodeUpsertEngine, ServerConfig};
pub use storage::StorageHandles;
pub use traits::StorageBackend;
