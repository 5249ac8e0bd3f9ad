//! In-memory storage backend built on [`DashMap`].
//!
//! Every table is a sharded concurrent map. Cross-row invariants (one current
//! node per identity key, one mapping per shape) are enforced through index
//! maps updated with the `entry` API, so a racing writer observes an occupied
//! slot instead of creating a duplicate. No code path holds a lock on the
//! identity index while waiting for a node lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use deep_lynx_core::{
    ContainerId, DataSource, DataSourceId, GraphId, IdentityKey, Import, ImportId, Metatype,
    MetatypeId, MetatypeKey, MetatypeKeyId, NewDataSource, Node, NodeId, NodeRevision,
    StagedRecord, StagedRecordId, TypeMapping, TypeMappingId,
};
use tokio::time::Instant;

use crate::storage::{NewStagedRecord, RecordResolution, StorageError, StorageResult};
use crate::traits::{
    DataSourceStore, GraphStore, ImportStore, MetatypeStore, NodeStore, StagingStore,
    StorageBackend, TypeMappingStore,
};

struct Claim {
    claimer: String,
    claimed_at: Instant,
}

struct StagedRow {
    seq: u64,
    record: StagedRecord,
    claim: Option<Claim>,
}

impl StagedRow {
    fn claimable(&self, now: Instant, ttl: Duration) -> bool {
        self.record.is_unprocessed()
            && self
                .claim
                .as_ref()
                .is_none_or(|c| now.duration_since(c.claimed_at) >= ttl)
    }
}

/// Concurrent in-memory implementation of every storage trait.
pub struct MemoryStore {
    sequence: AtomicU64,
    graphs: DashMap<GraphId, ContainerId>,
    metatypes: DashMap<MetatypeId, Metatype>,
    keys: DashMap<MetatypeId, Vec<MetatypeKey>>,
    nodes: DashMap<NodeId, Vec<NodeRevision>>,
    current_identities: DashMap<(GraphId, IdentityKey), NodeId>,
    retired_identities: DashMap<(GraphId, IdentityKey), NodeId>,
    data_sources: DashMap<DataSourceId, DataSource>,
    imports: DashMap<ImportId, (u64, Import)>,
    staged: DashMap<StagedRecordId, StagedRow>,
    type_mappings: DashMap<TypeMappingId, TypeMapping>,
    mapping_shapes: DashMap<(DataSourceId, String), TypeMappingId>,
}

impl MemoryStore {
    /// Creates a new, empty `MemoryStore`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sequence: AtomicU64::new(0),
            graphs: DashMap::new(),
            metatypes: DashMap::new(),
            keys: DashMap::new(),
            nodes: DashMap::new(),
            current_identities: DashMap::new(),
            retired_identities: DashMap::new(),
            data_sources: DashMap::new(),
            imports: DashMap::new(),
            staged: DashMap::new(),
            type_mappings: DashMap::new(),
            mapping_shapes: DashMap::new(),
        }
    }

    fn next_seq(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Points every key at `node_id`, or leaves the index untouched and fails
    /// if another node holds one of them.
    fn reserve_identities(
        &self,
        graph_id: GraphId,
        keys: &[IdentityKey],
        node_id: NodeId,
    ) -> StorageResult<()> {
        let mut reserved = Vec::with_capacity(keys.len());
        for key in keys {
            let clash = match self.current_identities.entry((graph_id, key.clone())) {
                Entry::Occupied(e) => *e.get() != node_id,
                Entry::Vacant(v) => {
                    v.insert(node_id);
                    reserved.push(key.clone());
                    false
                }
            };
            if clash {
                self.release_identities(graph_id, &reserved, node_id);
                return Err(StorageError::unique(identity_constraint(key)));
            }
        }
        Ok(())
    }

    fn release_identities(&self, graph_id: GraphId, keys: &[IdentityKey], node_id: NodeId) {
        for key in keys {
            self.current_identities
                .remove_if(&(graph_id, key.clone()), |_, owner| *owner == node_id);
        }
    }

    fn metatype_in_use(&self, id: MetatypeId) -> bool {
        self.nodes
            .iter()
            .any(|e| e.value().iter().any(|r| r.node.metatype_id == id))
            || self.type_mappings.iter().any(|e| e.value().metatype_id == id)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn identity_constraint(key: &IdentityKey) -> &'static str {
    match key {
        IdentityKey::Original { .. } => "nodes_current_original_id",
        IdentityKey::Composite { .. } => "nodes_current_composite_id",
    }
}

fn current_of(revisions: &[NodeRevision]) -> Option<&NodeRevision> {
    revisions.last().filter(|r| r.is_current())
}

// ---------------------------------------------------------------------------
// Lifecycle and graphs
// ---------------------------------------------------------------------------

#[async_trait]
impl StorageBackend for MemoryStore {
    async fn initialize(&self) -> anyhow::Result<()> {
        tracing::debug!("memory storage ready");
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn create_graph(&self, container_id: ContainerId) -> StorageResult<GraphId> {
        let id = GraphId::new();
        self.graphs.insert(id, container_id);
        Ok(id)
    }

    async fn graph_exists(
        &self,
        container_id: ContainerId,
        graph_id: GraphId,
    ) -> StorageResult<bool> {
        Ok(self
            .graphs
            .get(&graph_id)
            .is_some_and(|c| *c.value() == container_id))
    }
}

// ---------------------------------------------------------------------------
// Metatypes
// ---------------------------------------------------------------------------

#[async_trait]
impl MetatypeStore for MemoryStore {
    async fn create_metatype(
        &self,
        container_id: ContainerId,
        name: &str,
        description: &str,
    ) -> StorageResult<Metatype> {
        let metatype = Metatype {
            id: MetatypeId::new(),
            container_id,
            name: name.to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
        };
        self.metatypes.insert(metatype.id, metatype.clone());
        Ok(metatype)
    }

    async fn retrieve_metatype(&self, id: MetatypeId) -> StorageResult<Metatype> {
        self.metatypes
            .get(&id)
            .map(|m| m.value().clone())
            .ok_or_else(|| StorageError::not_found("metatype", id))
    }

    async fn list_metatypes(&self, container_id: ContainerId) -> StorageResult<Vec<Metatype>> {
        let mut list: Vec<Metatype> = self
            .metatypes
            .iter()
            .filter(|m| m.container_id == container_id)
            .map(|m| m.value().clone())
            .collect();
        list.sort_by_key(|m| m.created_at);
        Ok(list)
    }

    async fn delete_metatype(&self, id: MetatypeId) -> StorageResult<()> {
        if self.metatype_in_use(id) {
            return Err(StorageError::ForeignKey {
                detail: format!("metatype {id} is referenced by nodes or type mappings"),
            });
        }
        self.metatypes
            .remove(&id)
            .ok_or_else(|| StorageError::not_found("metatype", id))?;
        self.keys.remove(&id);
        Ok(())
    }

    async fn add_keys(
        &self,
        metatype_id: MetatypeId,
        keys: Vec<MetatypeKey>,
    ) -> StorageResult<Vec<MetatypeKey>> {
        if !self.metatypes.contains_key(&metatype_id) {
            return Err(StorageError::not_found("metatype", metatype_id));
        }
        let mut existing = self.keys.entry(metatype_id).or_default();
        for (i, key) in keys.iter().enumerate() {
            let taken = existing
                .iter()
                .chain(&keys[..i])
                .any(|k| k.property_name == key.property_name);
            if taken {
                return Err(StorageError::unique("metatype_keys_property_name"));
            }
        }
        existing.extend(keys.iter().cloned());
        Ok(keys)
    }

    async fn list_keys(&self, metatype_id: MetatypeId) -> StorageResult<Vec<MetatypeKey>> {
        if !self.metatypes.contains_key(&metatype_id) {
            return Err(StorageError::not_found("metatype", metatype_id));
        }
        Ok(self
            .keys
            .get(&metatype_id)
            .map(|k| k.value().clone())
            .unwrap_or_default())
    }

    async fn delete_key(
        &self,
        metatype_id: MetatypeId,
        key_id: MetatypeKeyId,
    ) -> StorageResult<()> {
        let mut keys = self
            .keys
            .get_mut(&metatype_id)
            .ok_or_else(|| StorageError::not_found("metatype key", key_id))?;
        let before = keys.len();
        keys.retain(|k| k.id != key_id);
        if keys.len() == before {
            return Err(StorageError::not_found("metatype key", key_id));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

#[async_trait]
impl NodeStore for MemoryStore {
    async fn insert_node(&self, node: Node) -> StorageResult<Node> {
        if !self.metatypes.contains_key(&node.metatype_id) {
            return Err(StorageError::ForeignKey {
                detail: format!("metatype {} does not exist", node.metatype_id),
            });
        }
        if !self.graphs.contains_key(&node.graph_id) {
            return Err(StorageError::ForeignKey {
                detail: format!("graph {} does not exist", node.graph_id),
            });
        }
        if self.nodes.contains_key(&node.id) {
            return Err(StorageError::unique("nodes_pkey"));
        }

        let keys = node.identity().keys();
        self.reserve_identities(node.graph_id, &keys, node.id)?;
        for key in &keys {
            self.retired_identities
                .remove_if(&(node.graph_id, key.clone()), |_, owner| *owner == node.id);
        }

        self.nodes.insert(
            node.id,
            vec![NodeRevision {
                node: node.clone(),
                valid_from: Utc::now(),
                valid_to: None,
            }],
        );
        Ok(node)
    }

    async fn supersede_node(&self, previous: &Node, next: Node) -> StorageResult<Node> {
        let mut revisions = self
            .nodes
            .get_mut(&previous.id)
            .ok_or_else(|| StorageError::not_found("node", previous.id))?;

        if current_of(&revisions).map(|r| &r.node) != Some(previous) {
            return Err(StorageError::Conflict {
                detail: format!("node {} changed since it was read", previous.id),
            });
        }

        let old_keys = previous.identity().keys();
        let new_keys = next.identity().keys();
        let added: Vec<IdentityKey> = new_keys
            .iter()
            .filter(|k| !old_keys.contains(k))
            .cloned()
            .collect();
        let dropped: Vec<IdentityKey> = old_keys
            .into_iter()
            .filter(|k| !new_keys.contains(k))
            .collect();

        self.reserve_identities(next.graph_id, &added, next.id)?;
        self.release_identities(previous.graph_id, &dropped, previous.id);
        for key in added {
            self.retired_identities
                .remove_if(&(next.graph_id, key), |_, owner| *owner == next.id);
        }
        for key in dropped {
            self.retired_identities
                .insert((previous.graph_id, key), previous.id);
        }

        let now = Utc::now();
        if let Some(last) = revisions.last_mut() {
            last.valid_to = Some(now);
        }
        revisions.push(NodeRevision {
            node: next.clone(),
            valid_from: now,
            valid_to: None,
        });
        Ok(next)
    }

    async fn current_node(&self, id: NodeId) -> StorageResult<Option<Node>> {
        Ok(self
            .nodes
            .get(&id)
            .and_then(|revisions| current_of(&revisions).map(|r| r.node.clone())))
    }

    async fn find_current_by_identity(
        &self,
        graph_id: GraphId,
        key: &IdentityKey,
    ) -> StorageResult<Vec<Node>> {
        let owner = self
            .current_identities
            .get(&(graph_id, key.clone()))
            .map(|e| *e.value());
        let Some(owner) = owner else {
            return Ok(Vec::new());
        };
        Ok(self.current_node(owner).await?.into_iter().collect())
    }

    async fn find_retired_identity(
        &self,
        graph_id: GraphId,
        key: &IdentityKey,
    ) -> StorageResult<Option<NodeId>> {
        Ok(self
            .retired_identities
            .get(&(graph_id, key.clone()))
            .map(|e| *e.value()))
    }

    async fn history(&self, id: NodeId) -> StorageResult<Vec<NodeRevision>> {
        self.nodes
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| StorageError::not_found("node", id))
    }
}

// ---------------------------------------------------------------------------
// Data sources and imports
// ---------------------------------------------------------------------------

#[async_trait]
impl DataSourceStore for MemoryStore {
    async fn create_data_source(
        &self,
        container_id: ContainerId,
        input: NewDataSource,
    ) -> StorageResult<DataSource> {
        let now = Utc::now();
        let source = DataSource {
            id: DataSourceId::new(),
            container_id,
            name: input.name,
            adapter_type: input.adapter_type,
            data_format: input.data_format,
            config: input.config,
            active: input.active,
            created_at: now,
            modified_at: now,
        };
        self.data_sources.insert(source.id, source.clone());
        Ok(source)
    }

    async fn retrieve_data_source(&self, id: DataSourceId) -> StorageResult<DataSource> {
        self.data_sources
            .get(&id)
            .map(|d| d.value().clone())
            .ok_or_else(|| StorageError::not_found("data source", id))
    }

    async fn list_data_sources(
        &self,
        container_id: ContainerId,
    ) -> StorageResult<Vec<DataSource>> {
        let mut list: Vec<DataSource> = self
            .data_sources
            .iter()
            .filter(|d| d.container_id == container_id)
            .map(|d| d.value().clone())
            .collect();
        list.sort_by_key(|d| d.created_at);
        Ok(list)
    }

    async fn list_active_data_sources(&self) -> StorageResult<Vec<DataSource>> {
        let mut list: Vec<DataSource> = self
            .data_sources
            .iter()
            .filter(|d| d.active)
            .map(|d| d.value().clone())
            .collect();
        list.sort_by_key(|d| d.created_at);
        Ok(list)
    }

    async fn set_data_source_active(
        &self,
        id: DataSourceId,
        active: bool,
    ) -> StorageResult<DataSource> {
        let mut source = self
            .data_sources
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found("data source", id))?;
        source.active = active;
        source.modified_at = Utc::now();
        Ok(source.clone())
    }

    async fn set_data_source_config(
        &self,
        id: DataSourceId,
        config: serde_json::Value,
    ) -> StorageResult<DataSource> {
        let mut source = self
            .data_sources
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found("data source", id))?;
        source.config = config;
        source.modified_at = Utc::now();
        Ok(source.clone())
    }

    async fn delete_data_source(&self, id: DataSourceId) -> StorageResult<()> {
        self.data_sources
            .remove(&id)
            .ok_or_else(|| StorageError::not_found("data source", id))?;
        self.imports.retain(|_, (_, import)| import.data_source_id != id);
        self.staged.retain(|_, row| row.record.data_source_id != id);
        self.type_mappings.retain(|_, m| m.data_source_id != id);
        self.mapping_shapes.retain(|(ds, _), _| *ds != id);
        Ok(())
    }
}

#[async_trait]
impl ImportStore for MemoryStore {
    async fn create_import(
        &self,
        data_source_id: DataSourceId,
        created_by: &str,
        reference: &str,
    ) -> StorageResult<Import> {
        if !self.data_sources.contains_key(&data_source_id) {
            return Err(StorageError::ForeignKey {
                detail: format!("data source {data_source_id} does not exist"),
            });
        }
        let import = Import {
            id: ImportId::new(),
            data_source_id,
            created_by: created_by.to_string(),
            reference: reference.to_string(),
            created_at: Utc::now(),
        };
        self.imports
            .insert(import.id, (self.next_seq(), import.clone()));
        Ok(import)
    }

    async fn retrieve_import(&self, id: ImportId) -> StorageResult<Import> {
        self.imports
            .get(&id)
            .map(|e| e.value().1.clone())
            .ok_or_else(|| StorageError::not_found("import", id))
    }

    async fn list_imports(
        &self,
        data_source_id: DataSourceId,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<Import>> {
        let mut rows: Vec<(u64, Import)> = self
            .imports
            .iter()
            .filter(|e| e.value().1.data_source_id == data_source_id)
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, import)| import)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Staging
// ---------------------------------------------------------------------------

#[async_trait]
impl StagingStore for MemoryStore {
    async fn insert_staged(&self, record: NewStagedRecord) -> StorageResult<StagedRecord> {
        let data_source_id = self
            .imports
            .get(&record.import_id)
            .map(|e| e.value().1.data_source_id)
            .ok_or_else(|| StorageError::ForeignKey {
                detail: format!("import {} does not exist", record.import_id),
            })?;

        let staged = StagedRecord {
            id: StagedRecordId::new(),
            data_source_id,
            import_id: record.import_id,
            data: record.data,
            shape_hash: record.shape_hash,
            created_at: Utc::now(),
            processed_at: None,
            errors: None,
            node_id: None,
        };
        self.staged.insert(
            staged.id,
            StagedRow {
                seq: self.next_seq(),
                record: staged.clone(),
                claim: None,
            },
        );
        Ok(staged)
    }

    async fn retrieve_staged(&self, id: StagedRecordId) -> StorageResult<StagedRecord> {
        self.staged
            .get(&id)
            .map(|r| r.record.clone())
            .ok_or_else(|| StorageError::not_found("staged record", id))
    }

    async fn list_unprocessed(
        &self,
        data_source_id: DataSourceId,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<StagedRecord>> {
        let mut rows: Vec<(u64, StagedRecord)> = self
            .staged
            .iter()
            .filter(|r| r.record.data_source_id == data_source_id && r.record.is_unprocessed())
            .map(|r| (r.seq, r.record.clone()))
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, record)| record)
            .collect())
    }

    async fn count_unprocessed(&self, data_source_id: DataSourceId) -> StorageResult<u64> {
        let count = self
            .staged
            .iter()
            .filter(|r| r.record.data_source_id == data_source_id && r.record.is_unprocessed())
            .count();
        Ok(count as u64)
    }

    async fn claim_unprocessed(
        &self,
        data_source_id: DataSourceId,
        limit: usize,
        claimer: &str,
        ttl: Duration,
    ) -> StorageResult<Vec<StagedRecord>> {
        let now = Instant::now();
        let mut candidates: Vec<(u64, StagedRecordId)> = self
            .staged
            .iter()
            .filter(|r| r.record.data_source_id == data_source_id && r.claimable(now, ttl))
            .map(|r| (r.seq, r.record.id))
            .collect();
        candidates.sort_unstable();

        let mut claimed = Vec::with_capacity(limit.min(candidates.len()));
        for (_, id) in candidates {
            if claimed.len() >= limit {
                break;
            }
            // Re-checked under the row's write lock: another claimer may have won.
            if let Some(mut row) = self.staged.get_mut(&id) {
                if row.claimable(now, ttl) {
                    row.claim = Some(Claim {
                        claimer: claimer.to_string(),
                        claimed_at: now,
                    });
                    claimed.push(row.record.clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn release_claim(&self, id: StagedRecordId, claimer: &str) -> StorageResult<()> {
        let mut row = self
            .staged
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found("staged record", id))?;
        if row.claim.as_ref().is_some_and(|c| c.claimer == claimer) {
            row.claim = None;
        }
        Ok(())
    }

    async fn mark_processed(
        &self,
        id: StagedRecordId,
        claimer: &str,
        resolution: RecordResolution,
    ) -> StorageResult<StagedRecord> {
        let mut row = self
            .staged
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found("staged record", id))?;
        if !row.record.is_unprocessed() {
            return Err(StorageError::AlreadyProcessed);
        }
        if !row.claim.as_ref().is_some_and(|c| c.claimer == claimer) {
            return Err(StorageError::Conflict {
                detail: format!("staged record {id} is not claimed by {claimer}"),
            });
        }
        row.record.processed_at = Some(Utc::now());
        match resolution {
            RecordResolution::Succeeded { node_id } => row.record.node_id = Some(node_id),
            RecordResolution::Failed { errors } => row.record.errors = Some(errors),
        }
        row.claim = None;
        Ok(row.record.clone())
    }
}

// ---------------------------------------------------------------------------
// Type mappings
// ---------------------------------------------------------------------------

#[async_trait]
impl TypeMappingStore for MemoryStore {
    async fn create_type_mapping(&self, mapping: TypeMapping) -> StorageResult<TypeMapping> {
        if !self.data_sources.contains_key(&mapping.data_source_id) {
            return Err(StorageError::ForeignKey {
                detail: format!("data source {} does not exist", mapping.data_source_id),
            });
        }
        let slot = (mapping.data_source_id, mapping.shape_hash.clone());
        match self.mapping_shapes.entry(slot) {
            Entry::Occupied(_) => {
                return Err(StorageError::unique("type_mappings_data_source_shape"));
            }
            Entry::Vacant(v) => {
                v.insert(mapping.id);
            }
        }
        self.type_mappings.insert(mapping.id, mapping.clone());
        Ok(mapping)
    }

    async fn retrieve_type_mapping(&self, id: TypeMappingId) -> StorageResult<TypeMapping> {
        self.type_mappings
            .get(&id)
            .map(|m| m.value().clone())
            .ok_or_else(|| StorageError::not_found("type mapping", id))
    }

    async fn find_type_mapping(
        &self,
        data_source_id: DataSourceId,
        shape_hash: &str,
    ) -> StorageResult<Option<TypeMapping>> {
        let id = self
            .mapping_shapes
            .get(&(data_source_id, shape_hash.to_string()))
            .map(|e| *e.value());
        Ok(id.and_then(|id| self.type_mappings.get(&id).map(|m| m.value().clone())))
    }

    async fn list_type_mappings(
        &self,
        data_source_id: DataSourceId,
    ) -> StorageResult<Vec<TypeMapping>> {
        let mut list: Vec<TypeMapping> = self
            .type_mappings
            .iter()
            .filter(|m| m.data_source_id == data_source_id)
            .map(|m| m.value().clone())
            .collect();
        list.sort_by_key(|m| m.created_at);
        Ok(list)
    }

    async fn update_type_mapping(&self, mapping: TypeMapping) -> StorageResult<TypeMapping> {
        let previous_shape = self
            .type_mappings
            .get(&mapping.id)
            .map(|m| m.shape_hash.clone())
            .ok_or_else(|| StorageError::not_found("type mapping", mapping.id))?;

        if previous_shape != mapping.shape_hash {
            let slot = (mapping.data_source_id, mapping.shape_hash.clone());
            match self.mapping_shapes.entry(slot) {
                Entry::Occupied(_) => {
                    return Err(StorageError::unique("type_mappings_data_source_shape"));
                }
                Entry::Vacant(v) => {
                    v.insert(mapping.id);
                }
            }
            self.mapping_shapes
                .remove_if(&(mapping.data_source_id, previous_shape), |_, id| {
                    *id == mapping.id
                });
        }

        self.type_mappings.insert(mapping.id, mapping.clone());
        Ok(mapping)
    }

    async fn delete_type_mapping(&self, id: TypeMappingId) -> StorageResult<()> {
        let (_, mapping) = self
            .type_mappings
            .remove(&id)
            .ok_or_else(|| StorageError::not_found("type mapping", id))?;
        self.mapping_shapes
            .remove_if(&(mapping.data_source_id, mapping.shape_hash), |_, owner| {
                *owner == id
            });
        Ok(())
    }
}
