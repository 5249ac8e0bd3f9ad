//! `PostgreSQL` storage backend.
//!
//! All SQL is runtime-checked (`sqlx::query`, not `sqlx::query!`) so the crate
//! builds without a database. The schema is created idempotently by
//! [`StorageBackend::initialize`].
//!
//! Node revisions are rows; the current revision is the one with a null
//! `valid_to`. Partial unique indexes over current rows enforce one current
//! node per identity key and graph, so a losing concurrent writer sees a
//! unique violation.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deep_lynx_core::{
    ContainerId, DataSource, DataSourceId, GraphId, IdentityKey, Import, ImportId,
    KeyTransformation, Metatype, MetatypeId, MetatypeKey, MetatypeKeyId, NewDataSource, Node,
    NodeId, NodeRevision, StagedRecord, StagedRecordId, TypeMapping, TypeMappingId,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::storage::{NewStagedRecord, RecordResolution, StorageError, StorageResult};
use crate::traits::{
    DataSourceStore, GraphStore, ImportStore, MetatypeStore, NodeStore, StagingStore,
    StorageBackend, TypeMappingStore,
};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS graphs (
    id UUID PRIMARY KEY,
    container_id UUID NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS metatypes (
    id UUID PRIMARY KEY,
    container_id UUID NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS metatype_keys (
    seq BIGSERIAL,
    id UUID PRIMARY KEY,
    metatype_id UUID NOT NULL REFERENCES metatypes (id) ON DELETE CASCADE,
    property_name TEXT NOT NULL,
    definition JSONB NOT NULL,
    CONSTRAINT metatype_keys_property_name UNIQUE (metatype_id, property_name)
);

CREATE TABLE IF NOT EXISTS nodes (
    revision BIGSERIAL PRIMARY KEY,
    id UUID NOT NULL,
    container_id UUID NOT NULL,
    graph_id UUID NOT NULL REFERENCES graphs (id),
    metatype_id UUID NOT NULL REFERENCES metatypes (id),
    properties JSONB NOT NULL,
    data_source_id UUID,
    original_data_id TEXT,
    composite_original_id TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    modified_at TIMESTAMPTZ NOT NULL,
    valid_from TIMESTAMPTZ NOT NULL DEFAULT now(),
    valid_to TIMESTAMPTZ
);

CREATE UNIQUE INDEX IF NOT EXISTS nodes_current
    ON nodes (id) WHERE valid_to IS NULL;
CREATE UNIQUE INDEX IF NOT EXISTS nodes_current_original
    ON nodes (graph_id, data_source_id, original_data_id)
    WHERE valid_to IS NULL AND data_source_id IS NOT NULL AND original_data_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS nodes_current_composite
    ON nodes (graph_id, data_source_id, composite_original_id)
    WHERE valid_to IS NULL AND data_source_id IS NOT NULL AND composite_original_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS data_sources (
    id UUID PRIMARY KEY,
    container_id UUID NOT NULL,
    name TEXT NOT NULL,
    adapter_type TEXT NOT NULL,
    data_format TEXT NOT NULL,
    config JSONB NOT NULL DEFAULT 'null',
    active BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    modified_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS imports (
    seq BIGSERIAL,
    id UUID PRIMARY KEY,
    data_source_id UUID NOT NULL REFERENCES data_sources (id) ON DELETE CASCADE,
    created_by TEXT NOT NULL,
    reference TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS staged_records (
    seq BIGSERIAL,
    id UUID PRIMARY KEY,
    data_source_id UUID NOT NULL REFERENCES data_sources (id) ON DELETE CASCADE,
    import_id UUID NOT NULL REFERENCES imports (id) ON DELETE CASCADE,
    data JSONB NOT NULL,
    shape_hash TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    processed_at TIMESTAMPTZ,
    errors JSONB,
    node_id UUID,
    claimed_by TEXT,
    claimed_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS staged_records_unprocessed
    ON staged_records (data_source_id, seq) WHERE processed_at IS NULL;

CREATE TABLE IF NOT EXISTS type_mappings (
    id UUID PRIMARY KEY,
    container_id UUID NOT NULL,
    data_source_id UUID NOT NULL REFERENCES data_sources (id) ON DELETE CASCADE,
    shape_hash TEXT NOT NULL,
    metatype_id UUID NOT NULL REFERENCES metatypes (id),
    graph_id UUID NOT NULL REFERENCES graphs (id),
    unique_identifier_key TEXT,
    composite_identifier_key TEXT,
    transformations JSONB NOT NULL DEFAULT '[]',
    active BOOLEAN NOT NULL DEFAULT TRUE,
    created_by TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    modified_at TIMESTAMPTZ NOT NULL,
    CONSTRAINT type_mappings_data_source_shape UNIQUE (data_source_id, shape_hash)
);
";

const NODE_COLUMNS: &str = "id, container_id, graph_id, metatype_id, properties, \
    data_source_id, original_data_id, composite_original_id, created_at, modified_at, \
    valid_from, valid_to";

const DATA_SOURCE_COLUMNS: &str =
    "id, container_id, name, adapter_type, data_format, config, active, created_at, modified_at";

const STAGED_COLUMNS: &str =
    "seq, id, data_source_id, import_id, data, shape_hash, created_at, processed_at, errors, node_id";

const MAPPING_COLUMNS: &str = "id, container_id, data_source_id, shape_hash, metatype_id, \
    graph_id, unique_identifier_key, composite_identifier_key, transformations, active, \
    created_by, created_at, modified_at";

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn db_err(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            Some("23505") => {
                return StorageError::unique(db.constraint().unwrap_or("unknown"));
            }
            Some("23503") => {
                return StorageError::ForeignKey {
                    detail: db.message().to_string(),
                };
            }
            _ => {}
        }
    }
    StorageError::Unavailable(anyhow::Error::new(err))
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Column holding an identity key's id, and the key's data source and value.
fn identity_column(key: &IdentityKey) -> (&'static str, DataSourceId, &str) {
    match key {
        IdentityKey::Original { data_source_id, id } => ("original_data_id", *data_source_id, id),
        IdentityKey::Composite { data_source_id, id } => {
            ("composite_original_id", *data_source_id, id)
        }
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct MetatypeRow {
    id: Uuid,
    container_id: Uuid,
    name: String,
    description: String,
    created_at: DateTime<Utc>,
}

impl From<MetatypeRow> for Metatype {
    fn from(r: MetatypeRow) -> Self {
        Self {
            id: r.id.into(),
            container_id: r.container_id.into(),
            name: r.name,
            description: r.description,
            created_at: r.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct NodeRow {
    id: Uuid,
    container_id: Uuid,
    graph_id: Uuid,
    metatype_id: Uuid,
    properties: serde_json::Value,
    data_source_id: Option<Uuid>,
    original_data_id: Option<String>,
    composite_original_id: Option<String>,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
    valid_from: DateTime<Utc>,
    valid_to: Option<DateTime<Utc>>,
}

impl NodeRow {
    fn into_revision(self) -> NodeRevision {
        let valid_from = self.valid_from;
        let valid_to = self.valid_to;
        NodeRevision {
            node: self.into_node(),
            valid_from,
            valid_to,
        }
    }

    fn into_node(self) -> Node {
        Node {
            id: self.id.into(),
            container_id: self.container_id.into(),
            graph_id: self.graph_id.into(),
            metatype_id: self.metatype_id.into(),
            properties: match self.properties {
                serde_json::Value::Object(map) => map,
                _ => serde_json::Map::new(),
            },
            data_source_id: self.data_source_id.map(DataSourceId::from),
            original_data_id: self.original_data_id,
            composite_original_id: self.composite_original_id,
            created_at: self.created_at,
            modified_at: self.modified_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DataSourceRow {
    id: Uuid,
    container_id: Uuid,
    name: String,
    adapter_type: String,
    data_format: String,
    config: serde_json::Value,
    active: bool,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

impl From<DataSourceRow> for DataSource {
    fn from(r: DataSourceRow) -> Self {
        Self {
            id: r.id.into(),
            container_id: r.container_id.into(),
            name: r.name,
            adapter_type: r.adapter_type,
            data_format: r.data_format,
            config: r.config,
            active: r.active,
            created_at: r.created_at,
            modified_at: r.modified_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ImportRow {
    id: Uuid,
    data_source_id: Uuid,
    created_by: String,
    reference: String,
    created_at: DateTime<Utc>,
}

impl From<ImportRow> for Import {
    fn from(r: ImportRow) -> Self {
        Self {
            id: r.id.into(),
            data_source_id: r.data_source_id.into(),
            created_by: r.created_by,
            reference: r.reference,
            created_at: r.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct StagedRow {
    seq: i64,
    id: Uuid,
    data_source_id: Uuid,
    import_id: Uuid,
    data: serde_json::Value,
    shape_hash: String,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    errors: Option<serde_json::Value>,
    node_id: Option<Uuid>,
}

impl From<StagedRow> for StagedRecord {
    fn from(r: StagedRow) -> Self {
        Self {
            id: r.id.into(),
            data_source_id: r.data_source_id.into(),
            import_id: r.import_id.into(),
            data: r.data,
            shape_hash: r.shape_hash,
            created_at: r.created_at,
            processed_at: r.processed_at,
            errors: r.errors,
            node_id: r.node_id.map(NodeId::from),
        }
    }
}

#[derive(sqlx::FromRow)]
struct MappingRow {
    id: Uuid,
    container_id: Uuid,
    data_source_id: Uuid,
    shape_hash: String,
    metatype_id: Uuid,
    graph_id: Uuid,
    unique_identifier_key: Option<String>,
    composite_identifier_key: Option<String>,
    transformations: Json<Vec<KeyTransformation>>,
    active: bool,
    created_by: String,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

impl From<MappingRow> for TypeMapping {
    fn from(r: MappingRow) -> Self {
        Self {
            id: r.id.into(),
            container_id: r.container_id.into(),
            data_source_id: r.data_source_id.into(),
            shape_hash: r.shape_hash,
            metatype_id: r.metatype_id.into(),
            graph_id: r.graph_id.into(),
            unique_identifier_key: r.unique_identifier_key,
            composite_identifier_key: r.composite_identifier_key,
            transformations: r.transformations.0,
            active: r.active,
            created_by: r.created_by,
            created_at: r.created_at,
            modified_at: r.modified_at,
        }
    }
}

// ---------------------------------------------------------------------------
// PostgresStore
// ---------------------------------------------------------------------------

/// All storage traits over one connection pool.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Opens a pool. The schema is created by [`StorageBackend::initialize`].
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be reached.
    pub async fn connect(url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .context("failed to connect to PostgreSQL")?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_revision<'e, E>(executor: E, node: &Node) -> StorageResult<Node>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let sql = format!(
            "INSERT INTO nodes (id, container_id, graph_id, metatype_id, properties, \
             data_source_id, original_data_id, composite_original_id, created_at, modified_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING {NODE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, NodeRow>(&sql)
            .bind(node.id.0)
            .bind(node.container_id.0)
            .bind(node.graph_id.0)
            .bind(node.metatype_id.0)
            .bind(serde_json::Value::Object(node.properties.clone()))
            .bind(node.data_source_id.map(|d| d.0))
            .bind(node.original_data_id.as_deref())
            .bind(node.composite_original_id.as_deref())
            .bind(node.created_at)
            .bind(node.modified_at)
            .fetch_one(executor)
            .await
            .map_err(db_err)?;
        Ok(row.into_node())
    }

    async fn metatype_exists(&self, id: MetatypeId) -> StorageResult<bool> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM metatypes WHERE id = $1)")
            .bind(id.0)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }
}

#[async_trait]
impl StorageBackend for PostgresStore {
    async fn initialize(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("failed to create schema")?;
        tracing::info!("postgres schema ready");
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Graphs and metatypes
// ---------------------------------------------------------------------------

#[async_trait]
impl GraphStore for PostgresStore {
    async fn create_graph(&self, container_id: ContainerId) -> StorageResult<GraphId> {
        let id = GraphId::new();
        sqlx::query("INSERT INTO graphs (id, container_id) VALUES ($1, $2)")
            .bind(id.0)
            .bind(container_id.0)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(id)
    }

    async fn graph_exists(
        &self,
        container_id: ContainerId,
        graph_id: GraphId,
    ) -> StorageResult<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM graphs WHERE id = $1 AND container_id = $2)",
        )
        .bind(graph_id.0)
        .bind(container_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }
}

#[async_trait]
impl MetatypeStore for PostgresStore {
    async fn create_metatype(
        &self,
        container_id: ContainerId,
        name: &str,
        description: &str,
    ) -> StorageResult<Metatype> {
        let row = sqlx::query_as::<_, MetatypeRow>(
            "INSERT INTO metatypes (id, container_id, name, description) VALUES ($1, $2, $3, $4) \
             RETURNING id, container_id, name, description, created_at",
        )
        .bind(MetatypeId::new().0)
        .bind(container_id.0)
        .bind(name)
        .bind(description)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.into())
    }

    async fn retrieve_metatype(&self, id: MetatypeId) -> StorageResult<Metatype> {
        sqlx::query_as::<_, MetatypeRow>(
            "SELECT id, container_id, name, description, created_at FROM metatypes WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(Metatype::from)
        .ok_or_else(|| StorageError::not_found("metatype", id))
    }

    async fn list_metatypes(&self, container_id: ContainerId) -> StorageResult<Vec<Metatype>> {
        let rows = sqlx::query_as::<_, MetatypeRow>(
            "SELECT id, container_id, name, description, created_at FROM metatypes \
             WHERE container_id = $1 ORDER BY created_at",
        )
        .bind(container_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(Metatype::from).collect())
    }

    async fn delete_metatype(&self, id: MetatypeId) -> StorageResult<()> {
        let result = sqlx::query("DELETE FROM metatypes WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("metatype", id));
        }
        Ok(())
    }

    async fn add_keys(
        &self,
        metatype_id: MetatypeId,
        keys: Vec<MetatypeKey>,
    ) -> StorageResult<Vec<MetatypeKey>> {
        if !self.metatype_exists(metatype_id).await? {
            return Err(StorageError::not_found("metatype", metatype_id));
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for key in &keys {
            sqlx::query(
                "INSERT INTO metatype_keys (id, metatype_id, property_name, definition) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(key.id.0)
            .bind(metatype_id.0)
            .bind(&key.property_name)
            .bind(Json(key))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(keys)
    }

    async fn list_keys(&self, metatype_id: MetatypeId) -> StorageResult<Vec<MetatypeKey>> {
        if !self.metatype_exists(metatype_id).await? {
            return Err(StorageError::not_found("metatype", metatype_id));
        }
        let rows = sqlx::query_scalar::<_, Json<MetatypeKey>>(
            "SELECT definition FROM metatype_keys WHERE metatype_id = $1 ORDER BY seq",
        )
        .bind(metatype_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(|Json(key)| key).collect())
    }

    async fn delete_key(
        &self,
        metatype_id: MetatypeId,
        key_id: MetatypeKeyId,
    ) -> StorageResult<()> {
        let result = sqlx::query("DELETE FROM metatype_keys WHERE metatype_id = $1 AND id = $2")
            .bind(metatype_id.0)
            .bind(key_id.0)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("metatype key", key_id));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

#[async_trait]
impl NodeStore for PostgresStore {
    async fn insert_node(&self, node: Node) -> StorageResult<Node> {
        Self::insert_revision(&self.pool, &node).await
    }

    async fn supersede_node(&self, previous: &Node, next: Node) -> StorageResult<Node> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE id = $1 AND valid_to IS NULL FOR UPDATE"
        );
        let current = sqlx::query_as::<_, NodeRow>(&sql)
            .bind(previous.id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StorageError::not_found("node", previous.id))?
            .into_node();
        if current != *previous {
            return Err(StorageError::Conflict {
                detail: format!("node {} changed since it was read", previous.id),
            });
        }

        sqlx::query("UPDATE nodes SET valid_to = now() WHERE id = $1 AND valid_to IS NULL")
            .bind(previous.id.0)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let stored = Self::insert_revision(&mut *tx, &next).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(stored)
    }

    async fn current_node(&self, id: NodeId) -> StorageResult<Option<Node>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = $1 AND valid_to IS NULL");
        let row = sqlx::query_as::<_, NodeRow>(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(NodeRow::into_node))
    }

    async fn find_current_by_identity(
        &self,
        graph_id: GraphId,
        key: &IdentityKey,
    ) -> StorageResult<Vec<Node>> {
        let (column, data_source_id, value) = identity_column(key);
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM nodes \
             WHERE graph_id = $1 AND data_source_id = $2 AND {column} = $3 AND valid_to IS NULL"
        );
        let rows = sqlx::query_as::<_, NodeRow>(&sql)
            .bind(graph_id.0)
            .bind(data_source_id.0)
            .bind(value)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(NodeRow::into_node).collect())
    }

    async fn find_retired_identity(
        &self,
        graph_id: GraphId,
        key: &IdentityKey,
    ) -> StorageResult<Option<NodeId>> {
        let (column, data_source_id, value) = identity_column(key);
        let sql = format!(
            "SELECT h.id FROM nodes h \
             WHERE h.graph_id = $1 AND h.data_source_id = $2 AND h.{column} = $3 \
               AND h.valid_to IS NOT NULL \
               AND NOT EXISTS ( \
                   SELECT 1 FROM nodes c \
                   WHERE c.id = h.id AND c.valid_to IS NULL \
                     AND c.graph_id = $1 AND c.data_source_id = $2 AND c.{column} = $3) \
             ORDER BY h.valid_to DESC LIMIT 1"
        );
        let id = sqlx::query_scalar::<_, Uuid>(&sql)
            .bind(graph_id.0)
            .bind(data_source_id.0)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(id.map(NodeId::from))
    }

    async fn history(&self, id: NodeId) -> StorageResult<Vec<NodeRevision>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = $1 ORDER BY revision");
        let rows = sqlx::query_as::<_, NodeRow>(&sql)
            .bind(id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        if rows.is_empty() {
            return Err(StorageError::not_found("node", id));
        }
        Ok(rows.into_iter().map(NodeRow::into_revision).collect())
    }
}

// ---------------------------------------------------------------------------
// Data sources and imports
// ---------------------------------------------------------------------------

#[async_trait]
impl DataSourceStore for PostgresStore {
    async fn create_data_source(
        &self,
        container_id: ContainerId,
        input: NewDataSource,
    ) -> StorageResult<DataSource> {
        let sql = format!(
            "INSERT INTO data_sources (id, container_id, name, adapter_type, data_format, config, active) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {DATA_SOURCE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, DataSourceRow>(&sql)
            .bind(DataSourceId::new().0)
            .bind(container_id.0)
            .bind(&input.name)
            .bind(&input.adapter_type)
            .bind(&input.data_format)
            .bind(&input.config)
            .bind(input.active)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.into())
    }

    async fn retrieve_data_source(&self, id: DataSourceId) -> StorageResult<DataSource> {
        let sql = format!("SELECT {DATA_SOURCE_COLUMNS} FROM data_sources WHERE id = $1");
        sqlx::query_as::<_, DataSourceRow>(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(DataSource::from)
            .ok_or_else(|| StorageError::not_found("data source", id))
    }

    async fn list_data_sources(
        &self,
        container_id: ContainerId,
    ) -> StorageResult<Vec<DataSource>> {
        let sql = format!(
            "SELECT {DATA_SOURCE_COLUMNS} FROM data_sources WHERE container_id = $1 ORDER BY created_at"
        );
        let rows = sqlx::query_as::<_, DataSourceRow>(&sql)
            .bind(container_id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(DataSource::from).collect())
    }

    async fn list_active_data_sources(&self) -> StorageResult<Vec<DataSource>> {
        let sql = format!(
            "SELECT {DATA_SOURCE_COLUMNS} FROM data_sources WHERE active ORDER BY created_at"
        );
        let rows = sqlx::query_as::<_, DataSourceRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(DataSource::from).collect())
    }

    async fn set_data_source_active(
        &self,
        id: DataSourceId,
        active: bool,
    ) -> StorageResult<DataSource> {
        let sql = format!(
            "UPDATE data_sources SET active = $2, modified_at = now() WHERE id = $1 \
             RETURNING {DATA_SOURCE_COLUMNS}"
        );
        sqlx::query_as::<_, DataSourceRow>(&sql)
            .bind(id.0)
            .bind(active)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(DataSource::from)
            .ok_or_else(|| StorageError::not_found("data source", id))
    }

    async fn set_data_source_config(
        &self,
        id: DataSourceId,
        config: serde_json::Value,
    ) -> StorageResult<DataSource> {
        let sql = format!(
            "UPDATE data_sources SET config = $2, modified_at = now() WHERE id = $1 \
             RETURNING {DATA_SOURCE_COLUMNS}"
        );
        sqlx::query_as::<_, DataSourceRow>(&sql)
            .bind(id.0)
            .bind(config)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(DataSource::from)
            .ok_or_else(|| StorageError::not_found("data source", id))
    }

    async fn delete_data_source(&self, id: DataSourceId) -> StorageResult<()> {
        let result = sqlx::query("DELETE FROM data_sources WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("data source", id));
        }
        Ok(())
    }
}

#[async_trait]
impl ImportStore for PostgresStore {
    async fn create_import(
        &self,
        data_source_id: DataSourceId,
        created_by: &str,
        reference: &str,
    ) -> StorageResult<Import> {
        let row = sqlx::query_as::<_, ImportRow>(
            "INSERT INTO imports (id, data_source_id, created_by, reference) VALUES ($1, $2, $3, $4) \
             RETURNING id, data_source_id, created_by, reference, created_at",
        )
        .bind(ImportId::new().0)
        .bind(data_source_id.0)
        .bind(created_by)
        .bind(reference)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.into())
    }

    async fn retrieve_import(&self, id: ImportId) -> StorageResult<Import> {
        sqlx::query_as::<_, ImportRow>(
            "SELECT id, data_source_id, created_by, reference, created_at FROM imports WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(Import::from)
        .ok_or_else(|| StorageError::not_found("import", id))
    }

    async fn list_imports(
        &self,
        data_source_id: DataSourceId,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<Import>> {
        let rows = sqlx::query_as::<_, ImportRow>(
            "SELECT id, data_source_id, created_by, reference, created_at FROM imports \
             WHERE data_source_id = $1 ORDER BY seq LIMIT $2 OFFSET $3",
        )
        .bind(data_source_id.0)
        .bind(to_i64(limit))
        .bind(to_i64(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(Import::from).collect())
    }
}

// ---------------------------------------------------------------------------
// Staging
// ---------------------------------------------------------------------------

#[async_trait]
impl StagingStore for PostgresStore {
    async fn insert_staged(&self, record: NewStagedRecord) -> StorageResult<StagedRecord> {
        let sql = format!(
            "INSERT INTO staged_records (id, data_source_id, import_id, data, shape_hash) \
             SELECT $1, i.data_source_id, i.id, $3, $4 FROM imports i WHERE i.id = $2 \
             RETURNING {STAGED_COLUMNS}"
        );
        sqlx::query_as::<_, StagedRow>(&sql)
            .bind(StagedRecordId::new().0)
            .bind(record.import_id.0)
            .bind(&record.data)
            .bind(&record.shape_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(StagedRecord::from)
            .ok_or_else(|| StorageError::ForeignKey {
                detail: format!("import {} does not exist", record.import_id),
            })
    }

    async fn retrieve_staged(&self, id: StagedRecordId) -> StorageResult<StagedRecord> {
        let sql = format!("SELECT {STAGED_COLUMNS} FROM staged_records WHERE id = $1");
        sqlx::query_as::<_, StagedRow>(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(StagedRecord::from)
            .ok_or_else(|| StorageError::not_found("staged record", id))
    }

    async fn list_unprocessed(
        &self,
        data_source_id: DataSourceId,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<StagedRecord>> {
        let sql = format!(
            "SELECT {STAGED_COLUMNS} FROM staged_records \
             WHERE data_source_id = $1 AND processed_at IS NULL \
             ORDER BY seq LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query_as::<_, StagedRow>(&sql)
            .bind(data_source_id.0)
            .bind(to_i64(limit))
            .bind(to_i64(offset))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(StagedRecord::from).collect())
    }

    async fn count_unprocessed(&self, data_source_id: DataSourceId) -> StorageResult<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM staged_records WHERE data_source_id = $1 AND processed_at IS NULL",
        )
        .bind(data_source_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn claim_unprocessed(
        &self,
        data_source_id: DataSourceId,
        limit: usize,
        claimer: &str,
        ttl: Duration,
    ) -> StorageResult<Vec<StagedRecord>> {
        // CTE + FOR UPDATE SKIP LOCKED: concurrent claimers never block on,
        // or take, each other's rows.
        let sql = format!(
            "WITH claimable AS ( \
                 SELECT id FROM staged_records \
                 WHERE data_source_id = $1 AND processed_at IS NULL \
                   AND (claimed_at IS NULL OR claimed_at < now() - make_interval(secs => $4)) \
                 ORDER BY seq LIMIT $2 \
                 FOR UPDATE SKIP LOCKED) \
             UPDATE staged_records s SET claimed_by = $3, claimed_at = now() \
             FROM claimable c WHERE s.id = c.id \
             RETURNING {}",
            STAGED_COLUMNS
                .split(", ")
                .map(|c| format!("s.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut rows = sqlx::query_as::<_, StagedRow>(&sql)
            .bind(data_source_id.0)
            .bind(to_i64(limit))
            .bind(claimer)
            .bind(ttl.as_secs_f64())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.sort_by_key(|r| r.seq);
        Ok(rows.into_iter().map(StagedRecord::from).collect())
    }

    async fn release_claim(&self, id: StagedRecordId, claimer: &str) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE staged_records SET claimed_by = NULL, claimed_at = NULL \
             WHERE id = $1 AND claimed_by = $2",
        )
        .bind(id.0)
        .bind(claimer)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            // Only an unknown record is an error; a lost claim is not.
            self.retrieve_staged(id).await?;
        }
        Ok(())
    }

    async fn mark_processed(
        &self,
        id: StagedRecordId,
        claimer: &str,
        resolution: RecordResolution,
    ) -> StorageResult<StagedRecord> {
        let (node_id, errors) = match resolution {
            RecordResolution::Succeeded { node_id } => (Some(node_id.0), None),
            RecordResolution::Failed { errors } => (None, Some(errors)),
        };
        let sql = format!(
            "UPDATE staged_records \
             SET processed_at = now(), node_id = $2, errors = $3, claimed_by = NULL, claimed_at = NULL \
             WHERE id = $1 AND processed_at IS NULL AND claimed_by = $4 \
             RETURNING {STAGED_COLUMNS}"
        );
        let row = sqlx::query_as::<_, StagedRow>(&sql)
            .bind(id.0)
            .bind(node_id)
            .bind(errors)
            .bind(claimer)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        if let Some(row) = row {
            return Ok(row.into());
        }

        let processed = sqlx::query_scalar::<_, bool>(
            "SELECT processed_at IS NOT NULL FROM staged_records WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match processed {
            None => Err(StorageError::not_found("staged record", id)),
            Some(true) => Err(StorageError::AlreadyProcessed),
            Some(false) => Err(StorageError::Conflict {
                detail: format!("staged record {id} is not claimed by {claimer}"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Type mappings
// ---------------------------------------------------------------------------

#[async_trait]
impl TypeMappingStore for PostgresStore {
    async fn create_type_mapping(&self, mapping: TypeMapping) -> StorageResult<TypeMapping> {
        let sql = format!(
            "INSERT INTO type_mappings ({MAPPING_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             RETURNING {MAPPING_COLUMNS}"
        );
        let row = sqlx::query_as::<_, MappingRow>(&sql)
            .bind(mapping.id.0)
            .bind(mapping.container_id.0)
            .bind(mapping.data_source_id.0)
            .bind(&mapping.shape_hash)
            .bind(mapping.metatype_id.0)
            .bind(mapping.graph_id.0)
            .bind(mapping.unique_identifier_key.as_deref())
            .bind(mapping.composite_identifier_key.as_deref())
            .bind(Json(&mapping.transformations))
            .bind(mapping.active)
            .bind(&mapping.created_by)
            .bind(mapping.created_at)
            .bind(mapping.modified_at)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.into())
    }

    async fn retrieve_type_mapping(&self, id: TypeMappingId) -> StorageResult<TypeMapping> {
        let sql = format!("SELECT {MAPPING_COLUMNS} FROM type_mappings WHERE id = $1");
        sqlx::query_as::<_, MappingRow>(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(TypeMapping::from)
            .ok_or_else(|| StorageError::not_found("type mapping", id))
    }

    async fn find_type_mapping(
        &self,
        data_source_id: DataSourceId,
        shape_hash: &str,
    ) -> StorageResult<Option<TypeMapping>> {
        let sql = format!(
            "SELECT {MAPPING_COLUMNS} FROM type_mappings WHERE data_source_id = $1 AND shape_hash = $2"
        );
        let row = sqlx::query_as::<_, MappingRow>(&sql)
            .bind(data_source_id.0)
            .bind(shape_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(TypeMapping::from))
    }

    async fn list_type_mappings(
        &self,
        data_source_id: DataSourceId,
    ) -> StorageResult<Vec<TypeMapping>> {
        let sql = format!(
            "SELECT {MAPPING_COLUMNS} FROM type_mappings WHERE data_source_id = $1 ORDER BY created_at"
        );
        let rows = sqlx::query_as::<_, MappingRow>(&sql)
            .bind(data_source_id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(TypeMapping::from).collect())
    }

    async fn update_type_mapping(&self, mapping: TypeMapping) -> StorageResult<TypeMapping> {
        let sql = format!(
            "UPDATE type_mappings SET shape_hash = $2, metatype_id = $3, graph_id = $4, \
             unique_identifier_key = $5, composite_identifier_key = $6, transformations = $7, \
             active = $8, modified_at = $9 \
             WHERE id = $1 RETURNING {MAPPING_COLUMNS}"
        );
        sqlx::query_as::<_, MappingRow>(&sql)
            .bind(mapping.id.0)
            .bind(&mapping.shape_hash)
            .bind(mapping.metatype_id.0)
            .bind(mapping.graph_id.0)
            .bind(mapping.unique_identifier_key.as_deref())
            .bind(mapping.composite_identifier_key.as_deref())
            .bind(Json(&mapping.transformations))
            .bind(mapping.active)
            .bind(mapping.modified_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(TypeMapping::from)
            .ok_or_else(|| StorageError::not_found("type mapping", mapping.id))
    }

    async fn delete_type_mapping(&self, id: TypeMappingId) -> StorageResult<()> {
        let result = sqlx::query("DELETE FROM type_mappings WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("type mapping", id));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// These run against a live database named by `DEEP_LYNX_TEST_DATABASE_URL`
/// and return early when it is unset.
#[cfg(test)]
mod tests {
    use deep_lynx_core::{DataType, NewMetatypeKey, PropertyMap};
    use serde_json::json;

    use super::*;

    async fn store() -> Option<PostgresStore> {
        let url = std::env::var("DEEP_LYNX_TEST_DATABASE_URL").ok()?;
        let store = PostgresStore::connect(&url, 4).await.unwrap();
        store.initialize().await.unwrap();
        Some(store)
    }

    fn node(container_id: ContainerId, graph_id: GraphId, metatype_id: MetatypeId) -> Node {
        let now = Utc::now();
        Node {
            id: NodeId::new(),
            container_id,
            graph_id,
            metatype_id,
            properties: PropertyMap::new(),
            data_source_id: Some(DataSourceId::new()),
            original_data_id: Some("orig-1".into()),
            composite_original_id: None,
            created_at: now,
            modified_at: now,
        }
    }

    #[tokio::test]
    async fn identity_is_unique_among_current_rows() {
        let Some(store) = store().await else { return };
        let container_id = ContainerId::new();
        let graph_id = store.create_graph(container_id).await.unwrap();
        let metatype = store
            .create_metatype(container_id, "Thing", "")
            .await
            .unwrap();

        let first = store
            .insert_node(node(container_id, graph_id, metatype.id))
            .await
            .unwrap();
        let mut rival = node(container_id, graph_id, metatype.id);
        rival.data_source_id = first.data_source_id;
        let err = store.insert_node(rival).await.unwrap_err();
        assert!(matches!(err, StorageError::UniqueViolation { .. }));

        let mut next = first.clone();
        next.original_data_id = Some("orig-2".into());
        next.modified_at = Utc::now();
        store.supersede_node(&first, next).await.unwrap();

        let key = first.identity().resolution_key().unwrap();
        assert!(store
            .find_current_by_identity(graph_id, &key)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store.find_retired_identity(graph_id, &key).await.unwrap(),
            Some(first.id)
        );
        assert_eq!(store.history(first.id).await.unwrap().len(), 2);

        let stale = store.supersede_node(&first, first.clone()).await.unwrap_err();
        assert!(matches!(stale, StorageError::Conflict { .. }));
    }

    #[tokio::test]
    async fn keys_round_trip_and_reject_duplicates() {
        let Some(store) = store().await else { return };
        let metatype = store
            .create_metatype(ContainerId::new(), "Flower", "")
            .await
            .unwrap();
        let key = NewMetatypeKey::new("color", DataType::Enumeration, true)
            .with_options(&["red", "blue"])
            .into_key(metatype.id);
        store.add_keys(metatype.id, vec![key.clone()]).await.unwrap();
        assert_eq!(store.list_keys(metatype.id).await.unwrap(), vec![key]);

        let dup = NewMetatypeKey::new("color", DataType::String, false).into_key(metatype.id);
        let err = store.add_keys(metatype.id, vec![dup]).await.unwrap_err();
        assert!(matches!(err, StorageError::UniqueViolation { .. }));
    }

    #[tokio::test]
    async fn claims_skip_live_claims_and_processing_is_final() {
        let Some(store) = store().await else { return };
        let source = store
            .create_data_source(
                ContainerId::new(),
                NewDataSource {
                    name: "feed".into(),
                    adapter_type: "manual".into(),
                    data_format: "json".into(),
                    config: json!({}),
                    active: true,
                },
            )
            .await
            .unwrap();
        let import = store
            .create_import(source.id, "user-1", "manual upload")
            .await
            .unwrap();
        for i in 0..3 {
            store
                .insert_staged(NewStagedRecord::new(import.id, json!({"i": i})))
                .await
                .unwrap();
        }

        let ttl = Duration::from_secs(300);
        let a = store.claim_unprocessed(source.id, 2, "a", ttl).await.unwrap();
        let b = store.claim_unprocessed(source.id, 2, "b", ttl).await.unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 1);
        assert!(a.iter().all(|r| r.id != b[0].id));

        let node_id = NodeId::new();
        let foreign = store
            .mark_processed(a[0].id, "b", RecordResolution::Succeeded { node_id })
            .await
            .unwrap_err();
        assert!(matches!(foreign, StorageError::Conflict { .. }));
        store
            .mark_processed(a[0].id, "a", RecordResolution::Succeeded { node_id })
            .await
            .unwrap();
        let again = store
            .mark_processed(a[0].id, "a", RecordResolution::Failed { errors: json!([]) })
            .await
            .unwrap_err();
        assert!(matches!(again, StorageError::AlreadyProcessed));
        assert_eq!(store.count_unprocessed(source.id).await.unwrap(), 2);

        store.delete_data_source(source.id).await.unwrap();
        assert!(matches!(
            store.retrieve_import(import.id).await.unwrap_err(),
            StorageError::NotFound { .. }
        ));
    }
}
