//! Two-phase file upload.
//!
//! The transport feeds parts into an [`UploadSink`] as they arrive. File bodies
//! are handed to the [`FileStore`] on their own tasks and never block field
//! collection. Once the transport has seen the last part it calls
//! [`UploadSink::finish`], which delivers the collected [`UploadManifest`] to
//! the receiver returned by [`upload_channel`]. Only then does the coordinator
//! stage anything.

use std::sync::Arc;

use deep_lynx_core::{ContainerId, DataSourceId, PropertyMap};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::storage::{ByteStream, FileDescriptor};
use crate::traits::FileStore;

/// One part of a multipart upload.
pub enum UploadPart {
    Field {
        name: String,
        value: String,
    },
    File {
        field_name: String,
        file_name: String,
        encoding: Option<String>,
        content_type: Option<String>,
        body: ByteStream,
    },
}

/// Where the files of an upload belong and who sent them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub container_id: ContainerId,
    pub data_source_id: DataSourceId,
    pub owner_id: String,
}

/// Everything learned from a finished upload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadManifest {
    /// Plain form fields, by name.
    pub fields: PropertyMap,
    /// Client-supplied names of the files, in arrival order.
    pub file_names: Vec<String>,
}

impl UploadManifest {
    /// The synthetic record to stage, or `None` when no field was sent.
    ///
    /// Each file adds a `<prefix>-<index>` property holding its name.
    #[must_use]
    pub fn into_record(self, file_field_prefix: &str) -> Option<Value> {
        if self.fields.is_empty() {
            return None;
        }
        let mut record = self.fields;
        for (i, name) in self.file_names.into_iter().enumerate() {
            record.insert(format!("{file_field_prefix}-{i}"), Value::String(name));
        }
        Some(Value::Object(record))
    }
}

/// Receives upload parts and signals completion.
pub struct UploadSink {
    files: Arc<dyn FileStore>,
    target: UploadTarget,
    manifest: UploadManifest,
    done: Option<oneshot::Sender<UploadManifest>>,
}

/// Creates a sink and the receiver its manifest will arrive on.
///
/// Dropping the sink without calling [`UploadSink::finish`] closes the
/// receiver, which callers treat as an aborted upload.
#[must_use]
pub fn upload_channel(
    files: Arc<dyn FileStore>,
    target: UploadTarget,
) -> (UploadSink, oneshot::Receiver<UploadManifest>) {
    let (tx, rx) = oneshot::channel();
    (
        UploadSink {
            files,
            target,
            manifest: UploadManifest::default(),
            done: Some(tx),
        },
        rx,
    )
}

impl UploadSink {
    /// Takes one part. Files are stored in the background.
    pub fn accept(&mut self, part: UploadPart) {
        match part {
            UploadPart::Field { name, value } => {
                self.manifest.fields.insert(name, Value::String(value));
            }
            UploadPart::File {
                field_name,
                file_name,
                encoding,
                content_type,
                body,
            } => {
                self.manifest.file_names.push(file_name.clone());
                let descriptor = FileDescriptor {
                    container_id: self.target.container_id,
                    data_source_id: self.target.data_source_id,
                    owner_id: self.target.owner_id.clone(),
                    field_name,
                    file_name,
                    encoding,
                    content_type,
                };
                let files = Arc::clone(&self.files);
                tokio::spawn(async move {
                    let file = descriptor.file_name.clone();
                    match files.store_file(descriptor, body).await {
                        Ok(stored) => tracing::debug!(%file, %stored, "upload stored"),
                        Err(e) => tracing::warn!(%file, error = %e, "failed to store upload"),
                    }
                });
            }
        }
    }

    /// Signals that no more parts will arrive.
    pub fn finish(mut self) {
        if let Some(tx) = self.done.take() {
            let manifest = std::mem::take(&mut self.manifest);
            if tx.send(manifest).is_err() {
                tracing::debug!("upload receiver dropped before completion");
            }
        }
    }
}
