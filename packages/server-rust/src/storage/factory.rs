//! Dependency injection point for storage.
//!
//! [`StorageHandles`] bundles one trait object per storage concern. Services
//! take the handles they need from it; nothing reaches for a global pool.

use std::sync::Arc;

use crate::service::config::{FileStoreKind, StorageConfig, StorageKind};
use crate::storage::engines::MemoryStore;
use crate::storage::files::{LocalFileStore, NullFileStore};
use crate::traits::{
    DataSourceStore, FileStore, GraphStore, ImportStore, MetatypeStore, NodeStore, StagingStore,
    StorageBackend, TypeMappingStore,
};

/// Shared, cloneable set of storage trait objects.
#[derive(Clone)]
pub struct StorageHandles {
    pub backend: Arc<dyn StorageBackend>,
    pub graphs: Arc<dyn GraphStore>,
    pub metatypes: Arc<dyn MetatypeStore>,
    pub nodes: Arc<dyn NodeStore>,
    pub data_sources: Arc<dyn DataSourceStore>,
    pub imports: Arc<dyn ImportStore>,
    pub staging: Arc<dyn StagingStore>,
    pub type_mappings: Arc<dyn TypeMappingStore>,
    pub files: Arc<dyn FileStore>,
}

impl StorageHandles {
    /// Wires every handle to one backend that implements all storage traits.
    #[must_use]
    pub fn from_store<S>(store: Arc<S>, files: Arc<dyn FileStore>) -> Self
    where
        S: StorageBackend
            + GraphStore
            + MetatypeStore
            + NodeStore
            + DataSourceStore
            + ImportStore
            + StagingStore
            + TypeMappingStore
            + 'static,
    {
        Self {
            backend: store.clone(),
            graphs: store.clone(),
            metatypes: store.clone(),
            nodes: store.clone(),
            data_sources: store.clone(),
            imports: store.clone(),
            staging: store.clone(),
            type_mappings: store,
            files,
        }
    }

    /// A fresh in-memory backend with a discarding file store.
    #[must_use]
    pub fn memory() -> Self {
        Self::from_store(Arc::new(MemoryStore::new()), Arc::new(NullFileStore))
    }

    /// Builds and initializes the backend selected by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached or migrated, or if
    /// `PostgreSQL` is requested from a build without the `postgres` feature.
    pub async fn connect(config: &StorageConfig) -> anyhow::Result<Self> {
        let files: Arc<dyn FileStore> = match &config.files {
            FileStoreKind::Null => Arc::new(NullFileStore),
            FileStoreKind::Local { root } => Arc::new(LocalFileStore::new(root.clone())),
        };

        let handles = match &config.kind {
            StorageKind::Memory => Self::from_store(Arc::new(MemoryStore::new()), files),
            #[cfg(feature = "postgres")]
            StorageKind::Postgres {
                url,
                max_connections,
            } => {
                let store =
                    crate::storage::datastores::PostgresStore::connect(url, *max_connections)
                        .await?;
                Self::from_store(Arc::new(store), files)
            }
            #[cfg(not(feature = "postgres"))]
            StorageKind::Postgres { .. } => {
                anyhow::bail!("PostgreSQL storage requires the `postgres` feature")
            }
        };

        handles.backend.initialize().await?;
        tracing::info!(backend = backend_name(&config.kind), "storage initialized");
        Ok(handles)
    }
}

fn backend_name(kind: &StorageKind) -> &'static str {
    match kind {
        StorageKind::Memory => "memory",
        StorageKind::Postgres { .. } => "postgres",
    }
}

#[cfg(test)]
mod tests {
    use deep_lynx_core::ContainerId;

    use super::*;

    #[tokio::test]
    async fn memory_handles_share_one_backend() {
        let handles = StorageHandles::memory();
        let container_id = ContainerId::new();
        let graph_id = handles.graphs.create_graph(container_id).await.unwrap();
        assert!(handles
            .graphs
            .graph_exists(container_id, graph_id)
            .await
            .unwrap());
        assert!(!handles
            .graphs
            .graph_exists(ContainerId::new(), graph_id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn connect_defaults_to_memory() {
        let handles = StorageHandles::connect(&StorageConfig::default())
            .await
            .unwrap();
        handles.backend.close().await.unwrap();
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn postgres_without_feature_is_an_error() {
        let config = StorageConfig {
            kind: StorageKind::Postgres {
                url: "postgres://localhost/deep_lynx".into(),
                max_connections: 1,
            },
            ..StorageConfig::default()
        };
        assert!(StorageHandles::connect(&config).await.is_err());
    }
}
