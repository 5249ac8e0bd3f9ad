use std::path::PathBuf;
use std::time::Duration;

/// Server-level configuration.
///
/// Aggregates the engine, processing, storage and upload settings. Every
/// section has a usable [`Default`]; the binary overrides fields from
/// command-line flags and environment variables.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub engine: EngineConfig,
    pub processing: ProcessingConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
}

/// Behaviour of the node upsert engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Refuse to attach an identity key that a different node used to carry.
    pub reject_retired_identities: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reject_retired_identities: true,
        }
    }
}

/// Staged record processing.
#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    /// Claimer name recorded on staged records. Unique per process.
    pub worker_id: String,
    /// Maximum records claimed per data source per pass.
    pub batch_size: usize,
    /// Maximum records of one batch processed at the same time.
    pub concurrency: usize,
    /// Age after which an unfinished claim is considered abandoned.
    pub claim_ttl_ms: u64,
    /// Interval between automatic passes over active data sources.
    pub tick_interval_ms: u64,
}

impl ProcessingConfig {
    #[must_use]
    pub fn claim_ttl(&self) -> Duration {
        Duration::from_millis(self.claim_ttl_ms)
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            batch_size: 100,
            concurrency: 8,
            claim_ttl_ms: 300_000,
            tick_interval_ms: 60_000,
        }
    }
}

/// Where graph data and staged records live.
#[derive(Debug, Clone, Default)]
pub enum StorageKind {
    /// Process-local maps. Data is lost on exit.
    #[default]
    Memory,
    /// `PostgreSQL` through a connection pool (feature `postgres`).
    Postgres {
        url: String,
        max_connections: u32,
    },
}

/// Where uploaded file bodies go.
#[derive(Debug, Clone, Default)]
pub enum FileStoreKind {
    /// Bodies are drained and discarded.
    #[default]
    Null,
    /// Bodies are written under a directory.
    Local { root: PathBuf },
}

#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    pub kind: StorageKind,
    pub files: FileStoreKind,
}

/// Two-phase file upload.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Prefix of the synthetic property naming each uploaded file.
    pub file_field_prefix: String,
    /// Import reference recorded for uploads.
    pub reference: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            file_field_prefix: "deep-lynx-file".to_string(),
            reference: "file upload".to_string(),
        }
    }
}
