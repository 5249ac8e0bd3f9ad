use std::time::Duration;

use async_trait::async_trait;
use deep_lynx_core::{
    ContainerId, DataSource, DataSourceId, GraphId, IdentityKey, Import, ImportId, Metatype,
    MetatypeId, MetatypeKey, MetatypeKeyId, NewDataSource, Node, NodeId, NodeRevision,
    StagedRecord, StagedRecordId, TypeMapping, TypeMappingId,
};

use crate::storage::{
    ByteStream, FileDescriptor, NewStagedRecord, RecordResolution, StorageResult,
};

/// Lifecycle hooks of a persistence backend.
/// Implementations: `PostgreSQL` (feature `postgres`), memory (default, tests).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// One-time initialization (e.g., create tables, run migrations).
    async fn initialize(&self) -> anyhow::Result<()>;

    /// Release resources and close connections.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Graph existence. Graph lifecycle is owned elsewhere.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Register a graph. Used for bootstrapping and tests.
    async fn create_graph(&self, container_id: ContainerId) -> StorageResult<GraphId>;

    /// Whether `graph_id` exists inside `container_id`.
    async fn graph_exists(&self, container_id: ContainerId, graph_id: GraphId)
        -> StorageResult<bool>;
}

/// Metatypes and their keys.
#[async_trait]
pub trait MetatypeStore: Send + Sync {
    async fn create_metatype(
        &self,
        container_id: ContainerId,
        name: &str,
        description: &str,
    ) -> StorageResult<Metatype>;

    async fn retrieve_metatype(&self, id: MetatypeId) -> StorageResult<Metatype>;

    async fn list_metatypes(&self, container_id: ContainerId) -> StorageResult<Vec<Metatype>>;

    /// Delete a metatype and its keys.
    ///
    /// Fails with [`ForeignKey`](crate::storage::StorageError::ForeignKey)
    /// while any node revision still references it.
    async fn delete_metatype(&self, id: MetatypeId) -> StorageResult<()>;

    /// Append keys. A `property_name` already used on the metatype is a
    /// [`UniqueViolation`](crate::storage::StorageError::UniqueViolation).
    async fn add_keys(
        &self,
        metatype_id: MetatypeId,
        keys: Vec<MetatypeKey>,
    ) -> StorageResult<Vec<MetatypeKey>>;

    /// Keys in definition order.
    async fn list_keys(&self, metatype_id: MetatypeId) -> StorageResult<Vec<MetatypeKey>>;

    async fn delete_key(&self, metatype_id: MetatypeId, key_id: MetatypeKeyId)
        -> StorageResult<()>;
}

/// Versioned node rows.
///
/// Every identity key maps to at most one current node per graph. Backends
/// enforce this at write time and report a
/// [`UniqueViolation`](crate::storage::StorageError::UniqueViolation) to the
/// losing writer.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Insert the first revision of a new node.
    async fn insert_node(&self, node: Node) -> StorageResult<Node>;

    /// Close `previous` and make `next` the current revision, atomically.
    ///
    /// Fails with [`Conflict`](crate::storage::StorageError::Conflict) when
    /// `previous` is no longer the current revision.
    async fn supersede_node(&self, previous: &Node, next: Node) -> StorageResult<Node>;

    /// The current revision of a node, if it exists.
    async fn current_node(&self, id: NodeId) -> StorageResult<Option<Node>>;

    /// Current nodes carrying `key` in `graph_id`. More than one is corruption.
    async fn find_current_by_identity(
        &self,
        graph_id: GraphId,
        key: &IdentityKey,
    ) -> StorageResult<Vec<Node>>;

    /// A node whose past revisions carried `key` but whose current one does not.
    async fn find_retired_identity(
        &self,
        graph_id: GraphId,
        key: &IdentityKey,
    ) -> StorageResult<Option<NodeId>>;

    /// All revisions of a node, oldest first.
    async fn history(&self, id: NodeId) -> StorageResult<Vec<NodeRevision>>;
}

/// Data sources.
#[async_trait]
pub trait DataSourceStore: Send + Sync {
    async fn create_data_source(
        &self,
        container_id: ContainerId,
        input: NewDataSource,
    ) -> StorageResult<DataSource>;

    async fn retrieve_data_source(&self, id: DataSourceId) -> StorageResult<DataSource>;

    async fn list_data_sources(&self, container_id: ContainerId)
        -> StorageResult<Vec<DataSource>>;

    async fn list_active_data_sources(&self) -> StorageResult<Vec<DataSource>>;

    async fn set_data_source_active(&self, id: DataSourceId, active: bool)
        -> StorageResult<DataSource>;

    async fn set_data_source_config(
        &self,
        id: DataSourceId,
        config: serde_json::Value,
    ) -> StorageResult<DataSource>;

    /// Permanently delete, cascading to imports, staged records and mappings.
    async fn delete_data_source(&self, id: DataSourceId) -> StorageResult<()>;
}

/// Import runs.
#[async_trait]
pub trait ImportStore: Send + Sync {
    async fn create_import(
        &self,
        data_source_id: DataSourceId,
        created_by: &str,
        reference: &str,
    ) -> StorageResult<Import>;

    async fn retrieve_import(&self, id: ImportId) -> StorageResult<Import>;

    /// Imports of a data source, oldest first.
    async fn list_imports(
        &self,
        data_source_id: DataSourceId,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<Import>>;
}

/// Raw staged payloads and their processing lifecycle.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Store a record under an existing import.
    async fn insert_staged(&self, record: NewStagedRecord) -> StorageResult<StagedRecord>;

    async fn retrieve_staged(&self, id: StagedRecordId) -> StorageResult<StagedRecord>;

    /// Unprocessed records, in insertion order, claimed or not.
    async fn list_unprocessed(
        &self,
        data_source_id: DataSourceId,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<StagedRecord>>;

    async fn count_unprocessed(&self, data_source_id: DataSourceId) -> StorageResult<u64>;

    /// Atomically claim up to `limit` unprocessed records for `claimer`.
    ///
    /// Records with a live claim are skipped. A claim older than `ttl` is
    /// treated as abandoned and may be taken over.
    async fn claim_unprocessed(
        &self,
        data_source_id: DataSourceId,
        limit: usize,
        claimer: &str,
        ttl: Duration,
    ) -> StorageResult<Vec<StagedRecord>>;

    /// Give up a claim without processing. No-op if `claimer` no longer holds it.
    async fn release_claim(&self, id: StagedRecordId, claimer: &str) -> StorageResult<()>;

    /// Record the terminal outcome of a record claimed by `claimer`.
    ///
    /// Fails with [`AlreadyProcessed`](crate::storage::StorageError::AlreadyProcessed)
    /// if another worker finished it first, and with
    /// [`Conflict`](crate::storage::StorageError::Conflict) if `claimer` no
    /// longer holds the claim.
    async fn mark_processed(
        &self,
        id: StagedRecordId,
        claimer: &str,
        resolution: RecordResolution,
    ) -> StorageResult<StagedRecord>;
}

/// Payload shape to metatype associations.
#[async_trait]
pub trait TypeMappingStore: Send + Sync {
    /// Fails with a unique violation if the data source already maps the shape.
    async fn create_type_mapping(&self, mapping: TypeMapping) -> StorageResult<TypeMapping>;

    async fn retrieve_type_mapping(&self, id: TypeMappingId) -> StorageResult<TypeMapping>;

    async fn find_type_mapping(
        &self,
        data_source_id: DataSourceId,
        shape_hash: &str,
    ) -> StorageResult<Option<TypeMapping>>;

    async fn list_type_mappings(&self, data_source_id: DataSourceId)
        -> StorageResult<Vec<TypeMapping>>;

    /// Replace a mapping's mutable fields, keyed by `mapping.id`.
    async fn update_type_mapping(&self, mapping: TypeMapping) -> StorageResult<TypeMapping>;

    async fn delete_type_mapping(&self, id: TypeMappingId) -> StorageResult<()>;
}

/// Destination for uploaded file bodies.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Consume `body` and return the name the file was stored under.
    async fn store_file(
        &self,
        descriptor: FileDescriptor,
        body: ByteStream,
    ) -> anyhow::Result<String>;
}
