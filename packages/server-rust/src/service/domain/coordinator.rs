//! Data sources, imports, staging and type mappings.
//!
//! The coordinator is the write path into the staging area. It never
//! validates payloads: anything staged under an existing import is accepted
//! and waits, unprocessed, until a type mapping covers its shape.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use deep_lynx_core::{
    ContainerId, DataSource, DataSourceId, GraphId, Import, ImportId, MetatypeId, NewDataSource,
    NewTypeMapping, StagedRecord, TypeMapping, TypeMappingId,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::service::config::UploadConfig;
use crate::service::domain::upload::{upload_channel, UploadManifest, UploadSink, UploadTarget};
use crate::service::operation::EngineError;
use crate::service::worker::{ProcessingTask, TaskSender};
use crate::storage::{NewStagedRecord, StorageHandles};
use crate::traits::{
    DataSourceStore, FileStore, GraphStore, ImportStore, MetatypeStore, StagingStore,
    TypeMappingStore,
};

/// Page size used when scanning unprocessed records.
const SCAN_PAGE: usize = 100;

/// Result of starting an import.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportReport {
    pub import: Import,
    pub staged: Vec<StagedRecord>,
}

pub struct ImportCoordinator {
    data_sources: Arc<dyn DataSourceStore>,
    imports: Arc<dyn ImportStore>,
    staging: Arc<dyn StagingStore>,
    type_mappings: Arc<dyn TypeMappingStore>,
    graphs: Arc<dyn GraphStore>,
    metatypes: Arc<dyn MetatypeStore>,
    files: Arc<dyn FileStore>,
    upload: UploadConfig,
    processing: Option<TaskSender<ProcessingTask>>,
}

impl ImportCoordinator {
    #[must_use]
    pub fn new(handles: &StorageHandles, upload: UploadConfig) -> Self {
        Self {
            data_sources: Arc::clone(&handles.data_sources),
            imports: Arc::clone(&handles.imports),
            staging: Arc::clone(&handles.staging),
            type_mappings: Arc::clone(&handles.type_mappings),
            graphs: Arc::clone(&handles.graphs),
            metatypes: Arc::clone(&handles.metatypes),
            files: Arc::clone(&handles.files),
            upload,
            processing: None,
        }
    }

    /// Attach the processing worker notified when mappings change.
    #[must_use]
    pub fn with_processing(mut self, sender: TaskSender<ProcessingTask>) -> Self {
        self.processing = Some(sender);
        self
    }

    // -----------------------------------------------------------------------
    // Data sources
    // -----------------------------------------------------------------------

    /// # Errors
    ///
    /// Storage errors only.
    pub async fn create_data_source(
        &self,
        container_id: ContainerId,
        input: NewDataSource,
    ) -> Result<DataSource, EngineError> {
        let source = self
            .data_sources
            .create_data_source(container_id, input)
            .await?;
        tracing::info!(data_source_id = %source.id, %container_id, name = %source.name, "data source created");
        Ok(source)
    }

    /// Returns the stored configuration verbatim, credentials included.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown data source.
    pub async fn retrieve_data_source(&self, id: DataSourceId) -> Result<DataSource, EngineError> {
        Ok(self.data_sources.retrieve_data_source(id).await?)
    }

    /// # Errors
    ///
    /// Storage errors only.
    pub async fn list_data_sources(
        &self,
        container_id: ContainerId,
    ) -> Result<Vec<DataSource>, EngineError> {
        Ok(self.data_sources.list_data_sources(container_id).await?)
    }

    /// Enables automatic processing and requests a pass right away.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown data source.
    pub async fn set_active(&self, id: DataSourceId) -> Result<DataSource, EngineError> {
        let source = self.data_sources.set_data_source_active(id, true).await?;
        tracing::info!(data_source_id = %id, "data source activated");
        self.request_processing(id).await;
        Ok(source)
    }

    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown data source.
    pub async fn set_inactive(&self, id: DataSourceId) -> Result<DataSource, EngineError> {
        let source = self.data_sources.set_data_source_active(id, false).await?;
        tracing::info!(data_source_id = %id, "data source deactivated");
        Ok(source)
    }

    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown data source.
    pub async fn update_data_source_config(
        &self,
        id: DataSourceId,
        config: Value,
    ) -> Result<DataSource, EngineError> {
        Ok(self.data_sources.set_data_source_config(id, config).await?)
    }

    /// Permanently deletes a data source with its imports, staged records
    /// and type mappings. Nodes it produced are kept.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown data source.
    pub async fn delete_data_source(&self, id: DataSourceId) -> Result<(), EngineError> {
        self.data_sources.delete_data_source(id).await?;
        tracing::info!(data_source_id = %id, "data source deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Imports and staging
    // -----------------------------------------------------------------------

    /// Opens an import and stages `payload`, if given.
    ///
    /// A JSON array stages one record per element; any other value stages a
    /// single record.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown data source.
    pub async fn initiate_import(
        &self,
        data_source_id: DataSourceId,
        user_id: &str,
        reference: &str,
        payload: Option<Value>,
    ) -> Result<ImportReport, EngineError> {
        self.data_sources
            .retrieve_data_source(data_source_id)
            .await?;
        let import = self
            .imports
            .create_import(data_source_id, user_id, reference)
            .await?;

        let records = match payload {
            Some(Value::Array(items)) => items,
            Some(value) => vec![value],
            None => Vec::new(),
        };
        let mut staged = Vec::with_capacity(records.len());
        for data in records {
            staged.push(self.stage_record(import.id, data).await?);
        }

        tracing::info!(
            %data_source_id,
            import_id = %import.id,
            reference,
            staged = staged.len(),
            "import started"
        );
        Ok(ImportReport { import, staged })
    }

    /// Stages one raw record under an existing import. No validation.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown import.
    pub async fn stage_record(
        &self,
        import_id: ImportId,
        data: Value,
    ) -> Result<StagedRecord, EngineError> {
        self.imports.retrieve_import(import_id).await?;
        let record = self
            .staging
            .insert_staged(NewStagedRecord::new(import_id, data))
            .await?;
        metrics::counter!("deep_lynx_staged_records_total", "event" => "staged").increment(1);
        Ok(record)
    }

    /// Opens an upload into `data_source_id` on behalf of `owner_id`.
    ///
    /// Files accepted by the returned sink are stored under the data
    /// source's container. Pass the receiver to
    /// [`stage_upload`](Self::stage_upload).
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown data source.
    pub async fn open_upload(
        &self,
        data_source_id: DataSourceId,
        owner_id: &str,
    ) -> Result<(UploadSink, oneshot::Receiver<UploadManifest>), EngineError> {
        let source = self.data_sources.retrieve_data_source(data_source_id).await?;
        Ok(upload_channel(
            Arc::clone(&self.files),
            UploadTarget {
                container_id: source.container_id,
                data_source_id,
                owner_id: owner_id.to_string(),
            },
        ))
    }

    /// Waits for an upload to finish and stages its fields.
    ///
    /// Returns `None` without creating an import when no field was sent or
    /// the upload was abandoned before completion.
    ///
    /// # Errors
    ///
    /// See [`initiate_import`](Self::initiate_import).
    pub async fn stage_upload(
        &self,
        data_source_id: DataSourceId,
        user_id: &str,
        done: oneshot::Receiver<UploadManifest>,
    ) -> Result<Option<ImportReport>, EngineError> {
        let Ok(manifest) = done.await else {
            tracing::warn!(%data_source_id, "upload abandoned before completion");
            return Ok(None);
        };
        let Some(record) = manifest.into_record(&self.upload.file_field_prefix) else {
            tracing::debug!(%data_source_id, "upload carried no fields; nothing staged");
            return Ok(None);
        };
        self.initiate_import(data_source_id, user_id, &self.upload.reference, Some(record))
            .await
            .map(Some)
    }

    /// # Errors
    ///
    /// Storage errors only.
    pub async fn list_imports(
        &self,
        data_source_id: DataSourceId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Import>, EngineError> {
        Ok(self
            .imports
            .list_imports(data_source_id, offset, limit)
            .await?)
    }

    /// Unprocessed records, oldest first.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub async fn list_unprocessed(
        &self,
        data_source_id: DataSourceId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StagedRecord>, EngineError> {
        Ok(self
            .staging
            .list_unprocessed(data_source_id, offset, limit)
            .await?)
    }

    /// # Errors
    ///
    /// Storage errors only.
    pub async fn count_unprocessed(&self, data_source_id: DataSourceId) -> Result<u64, EngineError> {
        Ok(self.staging.count_unprocessed(data_source_id).await?)
    }

    /// The oldest unprocessed record whose shape has no active mapping.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub async fn first_unmapped(
        &self,
        data_source_id: DataSourceId,
    ) -> Result<Option<StagedRecord>, EngineError> {
        let mut mapped: HashMap<String, bool> = HashMap::new();
        let mut offset = 0;
        loop {
            let page = self
                .staging
                .list_unprocessed(data_source_id, offset, SCAN_PAGE)
                .await?;
            if page.is_empty() {
                return Ok(None);
            }
            offset += page.len();

            for record in page {
                let covered = match mapped.get(&record.shape_hash) {
                    Some(covered) => *covered,
                    None => {
                        let covered = self
                            .type_mappings
                            .find_type_mapping(data_source_id, &record.shape_hash)
                            .await?
                            .is_some_and(|m| m.active);
                        mapped.insert(record.shape_hash.clone(), covered);
                        covered
                    }
                };
                if !covered {
                    return Ok(Some(record));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Type mappings
    // -----------------------------------------------------------------------

    /// Maps a payload shape of a data source onto a metatype and graph, then
    /// requests processing of the data source.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] if the data source, graph or metatype is
    /// missing or lives in another container; [`EngineError::ConstraintViolation`]
    /// if the shape is already mapped.
    pub async fn create_type_mapping(
        &self,
        data_source_id: DataSourceId,
        input: NewTypeMapping,
    ) -> Result<TypeMapping, EngineError> {
        let source = self
            .data_sources
            .retrieve_data_source(data_source_id)
            .await?;
        self.check_targets(source.container_id, input.graph_id, input.metatype_id)
            .await?;

        let mapping = self
            .type_mappings
            .create_type_mapping(input.into_mapping(source.container_id, data_source_id))
            .await?;
        tracing::info!(
            type_mapping_id = %mapping.id,
            %data_source_id,
            shape_hash = %mapping.shape_hash,
            "type mapping created"
        );
        self.request_processing(data_source_id).await;
        Ok(mapping)
    }

    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown mapping.
    pub async fn retrieve_type_mapping(&self, id: TypeMappingId) -> Result<TypeMapping, EngineError> {
        Ok(self.type_mappings.retrieve_type_mapping(id).await?)
    }

    /// # Errors
    ///
    /// Storage errors only.
    pub async fn find_type_mapping(
        &self,
        data_source_id: DataSourceId,
        shape_hash: &str,
    ) -> Result<Option<TypeMapping>, EngineError> {
        Ok(self
            .type_mappings
            .find_type_mapping(data_source_id, shape_hash)
            .await?)
    }

    /// # Errors
    ///
    /// Storage errors only.
    pub async fn list_type_mappings(
        &self,
        data_source_id: DataSourceId,
    ) -> Result<Vec<TypeMapping>, EngineError> {
        Ok(self.type_mappings.list_type_mappings(data_source_id).await?)
    }

    /// Replaces a mapping's targets, identifiers and transformations, then
    /// requests processing of its data source.
    ///
    /// # Errors
    ///
    /// See [`create_type_mapping`](Self::create_type_mapping).
    pub async fn update_type_mapping(
        &self,
        id: TypeMappingId,
        input: NewTypeMapping,
    ) -> Result<TypeMapping, EngineError> {
        let existing = self.type_mappings.retrieve_type_mapping(id).await?;
        self.check_targets(existing.container_id, input.graph_id, input.metatype_id)
            .await?;

        let mapping = self
            .type_mappings
            .update_type_mapping(TypeMapping {
                shape_hash: input.shape_hash,
                metatype_id: input.metatype_id,
                graph_id: input.graph_id,
                unique_identifier_key: input.unique_identifier_key,
                composite_identifier_key: input.composite_identifier_key,
                transformations: input.transformations,
                active: input.active,
                modified_at: Utc::now(),
                ..existing
            })
            .await?;
        tracing::info!(type_mapping_id = %id, "type mapping updated");
        self.request_processing(mapping.data_source_id).await;
        Ok(mapping)
    }

    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown mapping.
    pub async fn delete_type_mapping(&self, id: TypeMappingId) -> Result<(), EngineError> {
        self.type_mappings.delete_type_mapping(id).await?;
        tracing::info!(type_mapping_id = %id, "type mapping deleted");
        Ok(())
    }

    async fn check_targets(
        &self,
        container_id: ContainerId,
        graph_id: GraphId,
        metatype_id: MetatypeId,
    ) -> Result<(), EngineError> {
        if !self.graphs.graph_exists(container_id, graph_id).await? {
            return Err(EngineError::not_found("graph", graph_id));
        }
        let metatype = self.metatypes.retrieve_metatype(metatype_id).await?;
        if metatype.container_id != container_id {
            return Err(EngineError::not_found("metatype", metatype_id));
        }
        Ok(())
    }

    async fn request_processing(&self, data_source_id: DataSourceId) {
        let Some(sender) = &self.processing else {
            return;
        };
        if let Err(e) = sender.submit(ProcessingTask::DataSource(data_source_id)).await {
            tracing::warn!(%data_source_id, error = %e, "could not request processing");
        }
    }
}
