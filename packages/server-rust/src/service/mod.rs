//! Engine services.
//!
//! 1. **Configuration** (`config`): engine, processing, storage and upload settings
//! 2. **Errors** (`operation`): the categorical error surface and response envelope
//! 3. **Domain services** (`domain`): upsert engine, import coordinator, record processor
//! 4. **Background workers** (`worker`): periodic and on-demand staged record processing

pub mod config;
pub mod domain;
pub mod operation;
pub mod worker;

// Re-export key types for convenient access.
pub use config::{
    EngineConfig, FileStoreKind, ProcessingConfig, ServerConfig, StorageConfig, StorageKind,
    UploadConfig,
};
pub use domain::{
    ImportCoordinator, ImportReport, MetatypeRegistry, NodeDraft, NodeUpsertEngine,
    ProcessingReport, ProcessingRunnable, StagedRecordProcessor, UpsertAction, UpsertOutcome,
};
pub use operation::{EngineError, Envelope, ErrorBody, ErrorCode};
pub use worker::{BackgroundRunnable, BackgroundWorker, ProcessingTask, TaskSender};
