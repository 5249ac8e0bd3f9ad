//! Turns staged records into nodes.
//!
//! A pass claims unprocessed records of one data source in batches, maps each
//! through the type mapping for its shape and hands the result to the upsert
//! engine. Records whose shape is unmapped, or whose write failed for a
//! transient reason, keep their claim until the pass ends and are then
//! released so a later pass can retry them.
//!
//! Records resolving through the same identity are applied in staging order;
//! only distinct identities run concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use deep_lynx_core::{
    DataSource, DataSourceId, GraphId, IdentityKey, MappedRecord, MappingError, StagedRecord,
    StagedRecordId, TypeMapping,
};
use futures_util::{stream, StreamExt};
use serde::Serialize;
use tracing::Instrument;

use crate::service::config::ProcessingConfig;
use crate::service::domain::upsert::{NodeDraft, NodeUpsertEngine};
use crate::service::operation::EngineError;
use crate::service::worker::{BackgroundRunnable, ProcessingTask};
use crate::storage::{RecordResolution, StorageError, StorageHandles};
use crate::traits::{DataSourceStore, StagingStore, TypeMappingStore};

/// Counts from one or more processing passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingReport {
    pub claimed: usize,
    /// Turned into a node.
    pub processed: usize,
    /// Terminally rejected; errors stored on the record.
    pub failed: usize,
    /// Handed back unprocessed.
    pub released: usize,
}

impl ProcessingReport {
    pub fn merge(&mut self, other: ProcessingReport) {
        self.claimed += other.claimed;
        self.processed += other.processed;
        self.failed += other.failed;
        self.released += other.released;
    }
}

/// What became of one claimed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Processed,
    Failed,
    /// Still claimed, to be released at the end of the pass.
    Deferred(StagedRecordId),
    /// Already finished elsewhere, or storage refused the outcome.
    Dropped,
}

pub struct StagedRecordProcessor {
    data_sources: Arc<dyn DataSourceStore>,
    staging: Arc<dyn StagingStore>,
    type_mappings: Arc<dyn TypeMappingStore>,
    engine: Arc<NodeUpsertEngine>,
    config: ProcessingConfig,
}

impl StagedRecordProcessor {
    #[must_use]
    pub fn new(
        handles: &StorageHandles,
        engine: Arc<NodeUpsertEngine>,
        config: ProcessingConfig,
    ) -> Self {
        Self {
            data_sources: Arc::clone(&handles.data_sources),
            staging: Arc::clone(&handles.staging),
            type_mappings: Arc::clone(&handles.type_mappings),
            engine,
            config,
        }
    }

    /// Runs one pass over every active data source.
    ///
    /// A failing data source is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error only if the active data sources cannot be listed.
    pub async fn process_all_active(&self) -> Result<ProcessingReport, EngineError> {
        let mut total = ProcessingReport::default();
        for source in self.data_sources.list_active_data_sources().await? {
            match self.process_source(&source).await {
                Ok(report) => total.merge(report),
                Err(e) => {
                    tracing::warn!(data_source_id = %source.id, error = %e, "processing pass failed");
                }
            }
        }
        Ok(total)
    }

    /// Runs one pass over a data source. Inactive data sources are skipped.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown data source, or a storage
    /// error while claiming.
    pub async fn process_data_source(
        &self,
        data_source_id: DataSourceId,
    ) -> Result<ProcessingReport, EngineError> {
        let source = self.data_sources.retrieve_data_source(data_source_id).await?;
        if !source.active {
            tracing::debug!(%data_source_id, "data source inactive; not processing");
            return Ok(ProcessingReport::default());
        }
        self.process_source(&source).await
    }

    async fn process_source(&self, source: &DataSource) -> Result<ProcessingReport, EngineError> {
        let span = tracing::info_span!(
            "processing_pass",
            data_source_id = %source.id,
            worker = %self.config.worker_id,
        );
        let started = Instant::now();
        let result = self.run_pass(source).instrument(span).await;
        metrics::histogram!("deep_lynx_processing_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn run_pass(&self, source: &DataSource) -> Result<ProcessingReport, EngineError> {
        let mut report = ProcessingReport::default();
        let mut mappings: HashMap<String, Option<TypeMapping>> = HashMap::new();
        let mut deferred = Vec::new();
        // Identities with a deferred record. Later records for them wait too.
        let mut held: HashSet<GroupKey> = HashSet::new();

        let outcome = loop {
            let batch = match self
                .staging
                .claim_unprocessed(
                    source.id,
                    self.config.batch_size,
                    &self.config.worker_id,
                    self.config.claim_ttl(),
                )
                .await
            {
                Ok(batch) => batch,
                Err(e) => break Err(EngineError::from(e)),
            };
            if batch.is_empty() {
                break Ok(());
            }
            report.claimed += batch.len();

            for record in &batch {
                if mappings.contains_key(&record.shape_hash) {
                    continue;
                }
                let mapping = match self
                    .type_mappings
                    .find_type_mapping(source.id, &record.shape_hash)
                    .await
                {
                    Ok(mapping) => mapping.filter(|m| m.active),
                    Err(e) => {
                        tracing::warn!(shape_hash = %record.shape_hash, error = %e, "type mapping lookup failed");
                        None
                    }
                };
                mappings.insert(record.shape_hash.clone(), mapping);
            }

            let groups = identity_groups(source.id, batch, &mappings);
            let results: Vec<(Option<GroupKey>, Vec<Disposition>)> = stream::iter(groups)
                .map(|group| {
                    let hold = group.key.as_ref().is_some_and(|k| held.contains(k));
                    self.process_group(source, group, hold)
                })
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;

            for (key, dispositions) in results {
                for disposition in dispositions {
                    match disposition {
                        Disposition::Processed => report.processed += 1,
                        Disposition::Failed => report.failed += 1,
                        Disposition::Deferred(id) => {
                            deferred.push(id);
                            if let Some(key) = &key {
                                held.insert(key.clone());
                            }
                        }
                        Disposition::Dropped => report.released += 1,
                    }
                }
            }
        };

        report.released += deferred.len();
        for id in deferred {
            if let Err(e) = self.staging.release_claim(id, &self.config.worker_id).await {
                tracing::warn!(staged_record_id = %id, error = %e, "failed to release claim");
            }
        }

        metrics::counter!("deep_lynx_staged_records_total", "event" => "processed")
            .increment(report.processed as u64);
        metrics::counter!("deep_lynx_staged_records_total", "event" => "failed")
            .increment(report.failed as u64);
        tracing::info!(
            claimed = report.claimed,
            processed = report.processed,
            failed = report.failed,
            released = report.released,
            "processing pass finished"
        );
        outcome.map(|()| report)
    }

    /// Applies a group's records one after another, in staging order.
    ///
    /// Once a record is deferred the rest of the group is deferred with it,
    /// so a newer record never lands before an older one.
    async fn process_group(
        &self,
        source: &DataSource,
        group: RecordGroup,
        hold: bool,
    ) -> (Option<GroupKey>, Vec<Disposition>) {
        let mut holding = hold;
        let mut dispositions = Vec::with_capacity(group.records.len());
        for planned in group.records {
            if holding {
                dispositions.push(Disposition::Deferred(planned.record.id));
                continue;
            }
            let disposition = self.process_record(source, planned).await;
            holding = matches!(disposition, Disposition::Deferred(_));
            dispositions.push(disposition);
        }
        (group.key, dispositions)
    }

    async fn process_record(&self, source: &DataSource, planned: PlannedRecord) -> Disposition {
        let PlannedRecord { record, plan } = planned;
        let (mapping, mapped) = match plan {
            Plan::Unmapped => {
                tracing::debug!(staged_record_id = %record.id, shape_hash = %record.shape_hash, "no active type mapping");
                return Disposition::Deferred(record.id);
            }
            Plan::Mapped { mapping, mapped } => (mapping, mapped),
        };

        let result = match mapped {
            Ok(mapped) => {
                let identity = mapped.identity(source.id);
                let draft = NodeDraft::new(
                    source.container_id,
                    mapping.graph_id,
                    mapping.metatype_id,
                    mapped.properties,
                )
                .with_identity(identity);
                self.engine.upsert(draft).await.map(|o| o.node.id)
            }
            Err(e) => Err(EngineError::from(e)),
        };

        let resolution = match result {
            Ok(node_id) => RecordResolution::Succeeded { node_id },
            Err(e) if e.is_retryable() => {
                tracing::debug!(staged_record_id = %record.id, error = %e, "retryable failure");
                return Disposition::Deferred(record.id);
            }
            Err(e) => {
                tracing::debug!(staged_record_id = %record.id, error = %e, "record rejected");
                RecordResolution::Failed {
                    errors: e.detail(),
                }
            }
        };
        let succeeded = matches!(resolution, RecordResolution::Succeeded { .. });

        match self
            .staging
            .mark_processed(record.id, &self.config.worker_id, resolution)
            .await
        {
            Ok(_) if succeeded => Disposition::Processed,
            Ok(_) => Disposition::Failed,
            Err(StorageError::AlreadyProcessed) => {
                tracing::debug!(staged_record_id = %record.id, "already processed elsewhere");
                Disposition::Dropped
            }
            Err(StorageError::Conflict { detail }) => {
                tracing::warn!(staged_record_id = %record.id, %detail, "claim lost before completion");
                Disposition::Dropped
            }
            Err(e) => {
                tracing::warn!(staged_record_id = %record.id, error = %e, "failed to record outcome");
                Disposition::Deferred(record.id)
            }
        }
    }
}

/// Graph and identity a mapped record resolves through.
type GroupKey = (GraphId, IdentityKey);

enum Plan {
    Unmapped,
    Mapped {
        mapping: TypeMapping,
        mapped: Result<MappedRecord, MappingError>,
    },
}

struct PlannedRecord {
    record: StagedRecord,
    plan: Plan,
}

/// Records of one batch that resolve through the same identity, oldest first.
/// Records without an identity form groups of one.
struct RecordGroup {
    key: Option<GroupKey>,
    records: Vec<PlannedRecord>,
}

fn identity_groups(
    data_source_id: DataSourceId,
    batch: Vec<StagedRecord>,
    mappings: &HashMap<String, Option<TypeMapping>>,
) -> Vec<RecordGroup> {
    let mut groups: Vec<RecordGroup> = Vec::new();
    let mut index: HashMap<GroupKey, usize> = HashMap::new();
    for record in batch {
        let plan = match mappings.get(&record.shape_hash).cloned().flatten() {
            Some(mapping) => Plan::Mapped {
                mapped: mapping.apply(&record.data),
                mapping,
            },
            None => Plan::Unmapped,
        };
        let key = match &plan {
            Plan::Mapped {
                mapping,
                mapped: Ok(mapped),
            } => mapped
                .identity(data_source_id)
                .resolution_key()
                .map(|k| (mapping.graph_id, k)),
            _ => None,
        };
        let planned = PlannedRecord { record, plan };
        match key {
            Some(key) => {
                if let Some(&i) = index.get(&key) {
                    groups[i].records.push(planned);
                } else {
                    index.insert(key.clone(), groups.len());
                    groups.push(RecordGroup {
                        key: Some(key),
                        records: vec![planned],
                    });
                }
            }
            None => groups.push(RecordGroup {
                key: None,
                records: vec![planned],
            }),
        }
    }
    groups
}

/// Drives a [`StagedRecordProcessor`] from a [`BackgroundWorker`](crate::service::worker::BackgroundWorker).
///
/// Each tick processes every active data source.
pub struct ProcessingRunnable {
    processor: Arc<StagedRecordProcessor>,
}

impl ProcessingRunnable {
    #[must_use]
    pub fn new(processor: Arc<StagedRecordProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl BackgroundRunnable for ProcessingRunnable {
    type Task = ProcessingTask;

    async fn run(&mut self, task: ProcessingTask) {
        let result = match task {
            ProcessingTask::DataSource(id) => self.processor.process_data_source(id).await,
            ProcessingTask::AllActive => self.processor.process_all_active().await,
        };
        if let Err(e) = result {
            tracing::warn!(?task, error = %e, "processing task failed");
        }
    }

    async fn on_tick(&mut self) {
        if let Err(e) = self.processor.process_all_active().await {
            tracing::warn!(error = %e, "periodic processing failed");
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!("processing worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use deep_lynx_core::{
        ContainerId, DataType, GraphId, Metatype, NewDataSource, NewMetatypeKey, NewTypeMapping,
    };
    use serde_json::{json, Value};

    use super::*;
    use crate::service::config::{EngineConfig, UploadConfig};
    use crate::service::domain::coordinator::ImportCoordinator;
    use crate::service::domain::metatypes::MetatypeRegistry;
    use crate::storage::engines::interleaving::interleave;

    struct Setup {
        handles: StorageHandles,
        coordinator: ImportCoordinator,
        engine: Arc<NodeUpsertEngine>,
        graph_id: GraphId,
        metatype: Metatype,
        source: DataSource,
    }

    async fn setup(active: bool) -> Setup {
        build(StorageHandles::memory(), active).await
    }

    /// A setup whose node and staging stores suspend around every call.
    async fn interleaved_setup() -> Setup {
        let mut handles = StorageHandles::memory();
        interleave(&mut handles);
        build(handles, true).await
    }

    async fn build(handles: StorageHandles, active: bool) -> Setup {
        let container_id = ContainerId::new();
        let registry = Arc::new(MetatypeRegistry::new(Arc::clone(&handles.metatypes)));
        let metatype = registry
            .create_metatype(container_id, "Flower", "")
            .await
            .unwrap();
        registry
            .add_keys(
                metatype.id,
                vec![
                    NewMetatypeKey::new("name", DataType::String, true),
                    NewMetatypeKey::new("petals", DataType::Number, false),
                ],
            )
            .await
            .unwrap();
        let graph_id = handles.graphs.create_graph(container_id).await.unwrap();
        let engine = Arc::new(NodeUpsertEngine::new(
            Arc::clone(&handles.graphs),
            Arc::clone(&handles.nodes),
            registry,
            EngineConfig::default(),
        ));
        let coordinator = ImportCoordinator::new(&handles, UploadConfig::default());
        let source = coordinator
            .create_data_source(
                container_id,
                NewDataSource {
                    name: "Garden feed".into(),
                    adapter_type: "manual".into(),
                    data_format: "json".into(),
                    config: Value::Null,
                    active,
                },
            )
            .await
            .unwrap();
        Setup {
            handles,
            coordinator,
            engine,
            graph_id,
            metatype,
            source,
        }
    }

    fn processor(s: &Setup, worker_id: &str) -> StagedRecordProcessor {
        StagedRecordProcessor::new(
            &s.handles,
            Arc::clone(&s.engine),
            ProcessingConfig {
                worker_id: worker_id.into(),
                batch_size: 2,
                ..ProcessingConfig::default()
            },
        )
    }

    async fn map_shape(s: &Setup, sample: &Value) {
        s.coordinator
            .create_type_mapping(
                s.source.id,
                NewTypeMapping::new(
                    &deep_lynx_core::shape_hash(sample),
                    s.metatype.id,
                    s.graph_id,
                    "user-1",
                )
                .with_unique_identifier("id")
                .with_transformation("label", "name")
                .with_transformation("count", "petals"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn staged_records_become_nodes() {
        let s = setup(true).await;
        let sample = json!({"id": "f-1", "label": "Daisy", "count": 5});
        let report = s
            .coordinator
            .initiate_import(
                s.source.id,
                "user-1",
                "manual upload",
                Some(json!([sample.clone(), {"id": "f-2", "label": "Rose", "count": 32}])),
            )
            .await
            .unwrap();
        map_shape(&s, &sample).await;

        let result = processor(&s, "w1")
            .process_data_source(s.source.id)
            .await
            .unwrap();
        assert_eq!(result.processed, 2);
        assert_eq!(result.failed, 0);
        assert_eq!(s.coordinator.count_unprocessed(s.source.id).await.unwrap(), 0);

        let staged = s
            .handles
            .staging
            .retrieve_staged(report.staged[0].id)
            .await
            .unwrap();
        let node = s.engine.retrieve(staged.node_id.unwrap()).await.unwrap();
        assert_eq!(node.properties["name"], json!("Daisy"));
        assert_eq!(node.properties["petals"], json!(5));
        assert_eq!(node.original_data_id.as_deref(), Some("f-1"));
        assert_eq!(node.data_source_id, Some(s.source.id));
    }

    #[tokio::test]
    async fn reimport_updates_the_same_node() {
        let s = setup(true).await;
        let sample = json!({"id": "f-1", "label": "Daisy", "count": 5});
        map_shape(&s, &sample).await;
        let p = processor(&s, "w1");

        let first = s
            .coordinator
            .initiate_import(s.source.id, "user-1", "manual upload", Some(sample))
            .await
            .unwrap();
        p.process_data_source(s.source.id).await.unwrap();
        let second = s
            .coordinator
            .initiate_import(
                s.source.id,
                "user-1",
                "manual upload",
                Some(json!({"id": "f-1", "label": "Daisy", "count": 8})),
            )
            .await
            .unwrap();
        p.process_data_source(s.source.id).await.unwrap();

        let a = s.handles.staging.retrieve_staged(first.staged[0].id).await.unwrap();
        let b = s.handles.staging.retrieve_staged(second.staged[0].id).await.unwrap();
        assert_eq!(a.node_id, b.node_id);
        let history = s.engine.history(b.node_id.unwrap()).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].node.properties["petals"], json!(8));
    }

    #[tokio::test]
    async fn unmapped_records_are_released() {
        let s = setup(true).await;
        s.coordinator
            .initiate_import(
                s.source.id,
                "user-1",
                "manual upload",
                Some(json!([{"x": 1}, {"x": 2}, {"x": 3}])),
            )
            .await
            .unwrap();

        let result = processor(&s, "w1")
            .process_data_source(s.source.id)
            .await
            .unwrap();
        assert_eq!(result.claimed, 3);
        assert_eq!(result.released, 3);
        assert_eq!(s.coordinator.count_unprocessed(s.source.id).await.unwrap(), 3);

        // Released claims are immediately claimable again.
        let again = processor(&s, "w2")
            .process_data_source(s.source.id)
            .await
            .unwrap();
        assert_eq!(again.claimed, 3);
    }

    #[tokio::test]
    async fn invalid_payload_is_marked_failed_with_errors() {
        let s = setup(true).await;
        let sample = json!({"id": "f-1", "label": "Daisy", "count": "many"});
        let report = s
            .coordinator
            .initiate_import(s.source.id, "user-1", "manual upload", Some(sample.clone()))
            .await
            .unwrap();
        map_shape(&s, &sample).await;

        let result = processor(&s, "w1")
            .process_data_source(s.source.id)
            .await
            .unwrap();
        assert_eq!(result.failed, 1);

        let staged = s
            .handles
            .staging
            .retrieve_staged(report.staged[0].id)
            .await
            .unwrap();
        assert!(staged.processed_at.is_some());
        assert!(staged.node_id.is_none());
        let errors = staged.errors.unwrap();
        assert_eq!(errors["code"], json!("validation_failed"));
    }

    #[tokio::test]
    async fn missing_identifier_is_a_terminal_failure() {
        let s = setup(true).await;
        let sample = json!({"label": "Daisy", "count": 5});
        s.coordinator
            .initiate_import(s.source.id, "user-1", "manual upload", Some(sample.clone()))
            .await
            .unwrap();
        map_shape(&s, &sample).await;

        let result = processor(&s, "w1")
            .process_data_source(s.source.id)
            .await
            .unwrap();
        assert_eq!(result.failed, 1);
        assert_eq!(s.coordinator.count_unprocessed(s.source.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn inactive_data_source_is_skipped() {
        let s = setup(false).await;
        let sample = json!({"id": "f-1", "label": "Daisy", "count": 5});
        s.coordinator
            .initiate_import(s.source.id, "user-1", "manual upload", Some(sample.clone()))
            .await
            .unwrap();
        map_shape(&s, &sample).await;

        let p = processor(&s, "w1");
        assert_eq!(
            p.process_data_source(s.source.id).await.unwrap(),
            ProcessingReport::default()
        );
        assert_eq!(p.process_all_active().await.unwrap(), ProcessingReport::default());

        s.coordinator.set_active(s.source.id).await.unwrap();
        assert_eq!(p.process_all_active().await.unwrap().processed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_processors_never_process_a_record_twice() {
        let s = interleaved_setup().await;
        let records: Vec<Value> = (0..20)
            .map(|i| json!({"id": format!("f-{i}"), "label": "Daisy", "count": i}))
            .collect();
        let sample = records[0].clone();
        let report = s
            .coordinator
            .initiate_import(s.source.id, "user-1", "manual upload", Some(Value::Array(records)))
            .await
            .unwrap();
        map_shape(&s, &sample).await;

        let a = processor(&s, "w1");
        let b = processor(&s, "w2");
        let (ra, rb) = tokio::join!(
            a.process_data_source(s.source.id),
            b.process_data_source(s.source.id)
        );
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert!(ra.claimed > 0 && rb.claimed > 0, "{ra:?} {rb:?}");
        assert_eq!(ra.claimed + rb.claimed, 20);
        assert_eq!(ra.processed + rb.processed, 20);
        assert_eq!(ra.failed + rb.failed, 0);
        assert_eq!(s.coordinator.count_unprocessed(s.source.id).await.unwrap(), 0);

        let mut nodes = std::collections::HashSet::new();
        for staged in &report.staged {
            let node_id = s
                .handles
                .staging
                .retrieve_staged(staged.id)
                .await
                .unwrap()
                .node_id
                .unwrap();
            assert_eq!(s.engine.history(node_id).await.unwrap().len(), 1);
            nodes.insert(node_id);
        }
        assert_eq!(nodes.len(), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn versions_of_one_record_apply_in_staging_order() {
        let s = interleaved_setup().await;
        let versions: Vec<Value> = [5, 8, 13]
            .iter()
            .map(|count| json!({"id": "f-1", "label": "Daisy", "count": count}))
            .collect();
        let sample = versions[0].clone();
        s.coordinator
            .initiate_import(s.source.id, "user-1", "manual upload", Some(Value::Array(versions)))
            .await
            .unwrap();
        map_shape(&s, &sample).await;

        let p = StagedRecordProcessor::new(
            &s.handles,
            Arc::clone(&s.engine),
            ProcessingConfig {
                worker_id: "w1".into(),
                batch_size: 10,
                concurrency: 8,
                ..ProcessingConfig::default()
            },
        );
        let result = p.process_data_source(s.source.id).await.unwrap();
        assert_eq!(result.processed, 3);
        assert_eq!(result.released, 0);

        let key = deep_lynx_core::IdentityHints {
            data_source_id: Some(s.source.id),
            original_data_id: Some("f-1".into()),
            composite_original_id: None,
        };
        let node_id = s
            .engine
            .resolver()
            .resolve(s.graph_id, &key)
            .await
            .unwrap()
            .unwrap();
        let petals: Vec<Value> = s
            .engine
            .history(node_id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.node.properties["petals"].clone())
            .collect();
        assert_eq!(petals, vec![json!(5), json!(8), json!(13)]);
        assert_eq!(s.engine.retrieve(node_id).await.unwrap().properties["petals"], json!(13));
    }

    #[tokio::test]
    async fn identity_groups_keep_staging_order() {
        let s = setup(true).await;
        let sample = json!({"id": "a", "label": "Daisy", "count": 1});
        let report = s
            .coordinator
            .initiate_import(
                s.source.id,
                "user-1",
                "manual upload",
                Some(json!([
                    {"id": "a", "label": "Daisy", "count": 1},
                    {"id": "b", "label": "Rose", "count": 2},
                    {"id": "a", "label": "Daisy", "count": 3},
                    {"x": 1}
                ])),
            )
            .await
            .unwrap();
        map_shape(&s, &sample).await;
        let mapping = s
            .coordinator
            .find_type_mapping(s.source.id, &deep_lynx_core::shape_hash(&sample))
            .await
            .unwrap();
        let mut mappings = HashMap::new();
        mappings.insert(mapping.as_ref().unwrap().shape_hash.clone(), mapping);

        let groups = identity_groups(s.source.id, report.staged.clone(), &mappings);
        let ids: Vec<Vec<StagedRecordId>> = groups
            .iter()
            .map(|g| g.records.iter().map(|p| p.record.id).collect())
            .collect();
        assert_eq!(
            ids,
            vec![
                vec![report.staged[0].id, report.staged[2].id],
                vec![report.staged[1].id],
                vec![report.staged[3].id],
            ]
        );
        assert!(groups[2].key.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn lost_claim_is_not_completed() {
        let s = setup(true).await;
        let sample = json!({"id": "f-1", "label": "Daisy", "count": 5});
        let report = s
            .coordinator
            .initiate_import(s.source.id, "user-1", "manual upload", Some(sample.clone()))
            .await
            .unwrap();
        map_shape(&s, &sample).await;

        // Another worker's claim is live, so this one has nothing to take over.
        let ttl = ProcessingConfig::default().claim_ttl();
        s.handles
            .staging
            .claim_unprocessed(s.source.id, 10, "w2", ttl)
            .await
            .unwrap();
        let p = processor(&s, "w1");
        assert_eq!(p.process_data_source(s.source.id).await.unwrap().claimed, 0);

        // Once it expires, w1 completes the record and w2's late outcome is refused.
        tokio::time::advance(ttl).await;
        assert_eq!(p.process_data_source(s.source.id).await.unwrap().processed, 1);
        let err = s
            .handles
            .staging
            .mark_processed(
                report.staged[0].id,
                "w2",
                RecordResolution::Failed { errors: json!("late") },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyProcessed));
    }

    #[tokio::test]
    async fn runnable_processes_requested_data_source() {
        let s = setup(true).await;
        let sample = json!({"id": "f-1", "label": "Daisy", "count": 5});
        s.coordinator
            .initiate_import(s.source.id, "user-1", "manual upload", Some(sample.clone()))
            .await
            .unwrap();
        map_shape(&s, &sample).await;

        let mut runnable = ProcessingRunnable::new(Arc::new(processor(&s, "w1")));
        runnable.run(ProcessingTask::DataSource(s.source.id)).await;
        assert_eq!(s.coordinator.count_unprocessed(s.source.id).await.unwrap(), 0);

        // Unknown data sources are logged, not fatal.
        runnable
            .run(ProcessingTask::DataSource(DataSourceId::new()))
            .await;
        runnable.on_tick().await;
    }

    #[test]
    fn reports_merge() {
        let mut total = ProcessingReport {
            claimed: 2,
            processed: 1,
            failed: 1,
            released: 0,
        };
        total.merge(ProcessingReport {
            claimed: 3,
            processed: 0,
            failed: 0,
            released: 3,
        });
        assert_eq!(total.claimed, 5);
        assert_eq!(total.released, 3);
    }
}
