//! Row-level value types passed between services and storage backends.

use bytes::Bytes;
use deep_lynx_core::{shape_hash, ContainerId, DataSourceId, ImportId, NodeId};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// A raw payload about to be staged under an import.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStagedRecord {
    pub import_id: ImportId,
    pub data: serde_json::Value,
    pub shape_hash: String,
}

impl NewStagedRecord {
    /// Fingerprints `data` and wraps it for insertion.
    #[must_use]
    pub fn new(import_id: ImportId, data: serde_json::Value) -> Self {
        let shape_hash = shape_hash(&data);
        Self {
            import_id,
            data,
            shape_hash,
        }
    }
}

/// How a claimed staged record left the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordResolution {
    /// Upserted into `node_id`.
    Succeeded { node_id: NodeId },
    /// Permanently rejected. `errors` is stored on the record.
    Failed { errors: serde_json::Value },
}

/// Metadata accompanying an uploaded file body.
///
/// Stores key files by container, data source and owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub container_id: ContainerId,
    pub data_source_id: DataSourceId,
    /// User the upload was made by.
    pub owner_id: String,
    /// Form field the file arrived under.
    pub field_name: String,
    /// Client-supplied file name.
    pub file_name: String,
    /// Transfer encoding reported by the client, e.g. `7bit`.
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Streaming file body.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;
