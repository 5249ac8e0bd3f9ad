//! Domain services.
//!
//! - [`upsert`]: the schema-validated node upsert engine
//! - [`identity`]: source-native identifier resolution
//! - [`metatypes`]: metatype and key management with compiled-schema caching
//! - [`coordinator`]: data sources, imports, staging and type mappings
//! - [`processor`]: staged record processing
//! - [`upload`]: two-phase multipart upload collection

pub mod coordinator;
pub mod identity;
pub mod metatypes;
pub mod processor;
pub mod upload;
pub mod upsert;

pub use coordinator::{ImportCoordinator, ImportReport};
pub use identity::{IdentityResolver, Resolution};
pub use metatypes::{MetatypeRegistry, MetatypeSchema};
pub use processor::{ProcessingReport, ProcessingRunnable, StagedRecordProcessor};
pub use upload::{upload_channel, UploadManifest, UploadPart, UploadSink, UploadTarget};
pub use upsert::{NodeDraft, NodeUpsertEngine, UpsertAction, UpsertOutcome};
