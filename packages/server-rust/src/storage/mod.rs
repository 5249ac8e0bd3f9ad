//! Storage layer for the Deep Lynx server.
//!
//! The per-concern traits live in [`crate::traits`]. This module provides:
//!
//! - [`StorageError`]: backend-level failure taxonomy
//! - row value types shared by services and backends ([`record`])
//! - [`engines::MemoryStore`]: concurrent in-memory backend
//! - `datastores::PostgresStore`: `PostgreSQL` backend (feature `postgres`)
//! - [`files`]: [`FileStore`](crate::traits::FileStore) implementations
//! - [`StorageHandles`]: dependency-injected bundle of trait objects

#[cfg(feature = "postgres")]
pub mod datastores;
pub mod engines;
pub mod error;
pub mod factory;
pub mod files;
pub mod record;

pub use error::*;
pub use factory::StorageHandles;
pub use record::*;
