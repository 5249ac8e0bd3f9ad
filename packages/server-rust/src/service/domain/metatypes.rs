//! Metatype and key management, plus the compiled-schema cache used by the
//! upsert engine.

use std::sync::Arc;

use dashmap::DashMap;
use deep_lynx_core::{
    CompiledSchema, ContainerId, Metatype, MetatypeId, MetatypeKey, MetatypeKeyId, NewMetatypeKey,
};

use crate::service::operation::EngineError;
use crate::traits::MetatypeStore;

/// A metatype's keys together with their compiled form.
pub struct MetatypeSchema {
    pub metatype: Metatype,
    keys: Vec<MetatypeKey>,
    compiled: CompiledSchema,
}

impl MetatypeSchema {
    #[must_use]
    pub fn compiled(&self) -> &CompiledSchema {
        &self.compiled
    }

    #[must_use]
    pub fn keys(&self) -> &[MetatypeKey] {
        &self.keys
    }
}

/// Creates metatypes, manages their keys and hands out compiled schemas.
///
/// Compiled schemas are cached per metatype and reused as long as the stored
/// key set is unchanged, so patterns are compiled once per key set even when
/// keys are edited by another process.
pub struct MetatypeRegistry {
    store: Arc<dyn MetatypeStore>,
    cache: DashMap<MetatypeId, Arc<MetatypeSchema>>,
}

impl MetatypeRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn MetatypeStore>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
        }
    }

    /// # Errors
    ///
    /// Storage errors only.
    pub async fn create_metatype(
        &self,
        container_id: ContainerId,
        name: &str,
        description: &str,
    ) -> Result<Metatype, EngineError> {
        let metatype = self
            .store
            .create_metatype(container_id, name, description)
            .await?;
        tracing::info!(metatype_id = %metatype.id, %container_id, name, "metatype created");
        Ok(metatype)
    }

    /// # Errors
    ///
    /// [`EngineError::NotFound`] if the metatype does not exist.
    pub async fn retrieve_metatype(&self, id: MetatypeId) -> Result<Metatype, EngineError> {
        Ok(self.store.retrieve_metatype(id).await?)
    }

    /// # Errors
    ///
    /// Storage errors only.
    pub async fn list_metatypes(
        &self,
        container_id: ContainerId,
    ) -> Result<Vec<Metatype>, EngineError> {
        Ok(self.store.list_metatypes(container_id).await?)
    }

    /// Deletes a metatype and its keys.
    ///
    /// # Errors
    ///
    /// [`EngineError::ConstraintViolation`] while nodes or type mappings still
    /// reference the metatype.
    pub async fn delete_metatype(&self, id: MetatypeId) -> Result<(), EngineError> {
        self.store.delete_metatype(id).await?;
        self.cache.remove(&id);
        tracing::info!(metatype_id = %id, "metatype deleted");
        Ok(())
    }

    /// Validates and appends key definitions.
    ///
    /// The new keys are checked together with the existing ones, so a
    /// duplicated property name is reported like any other malformed key.
    ///
    /// # Errors
    ///
    /// [`EngineError::Validation`] listing every malformed key, or
    /// [`EngineError::NotFound`] for an unknown metatype.
    pub async fn add_keys(
        &self,
        metatype_id: MetatypeId,
        definitions: Vec<NewMetatypeKey>,
    ) -> Result<Vec<MetatypeKey>, EngineError> {
        let existing = self.store.list_keys(metatype_id).await?;
        let added: Vec<MetatypeKey> = definitions
            .into_iter()
            .map(|d| d.into_key(metatype_id))
            .collect();

        let mut combined = existing;
        combined.extend(added.iter().cloned());
        CompiledSchema::compile(&combined)?;

        let stored = self.store.add_keys(metatype_id, added).await?;
        self.cache.remove(&metatype_id);
        tracing::info!(%metatype_id, count = stored.len(), "metatype keys added");
        Ok(stored)
    }

    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown metatype.
    pub async fn list_keys(&self, metatype_id: MetatypeId) -> Result<Vec<MetatypeKey>, EngineError> {
        Ok(self.store.list_keys(metatype_id).await?)
    }

    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown key.
    pub async fn delete_key(
        &self,
        metatype_id: MetatypeId,
        key_id: MetatypeKeyId,
    ) -> Result<(), EngineError> {
        self.store.delete_key(metatype_id, key_id).await?;
        self.cache.remove(&metatype_id);
        Ok(())
    }

    /// The compiled schema of a metatype that must belong to `container_id`.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] if the metatype is missing or belongs to
    /// another container; [`EngineError::Validation`] if stored keys are
    /// malformed.
    pub async fn schema(
        &self,
        container_id: ContainerId,
        metatype_id: MetatypeId,
    ) -> Result<Arc<MetatypeSchema>, EngineError> {
        let metatype = self.store.retrieve_metatype(metatype_id).await?;
        if metatype.container_id != container_id {
            return Err(EngineError::not_found("metatype", metatype_id));
        }
        let keys = self.store.list_keys(metatype_id).await?;

        let cached = self.cache.get(&metatype_id).map(|e| Arc::clone(e.value()));
        if let Some(cached) = cached.filter(|c| c.keys == keys) {
            return Ok(cached);
        }

        let compiled = CompiledSchema::compile(&keys)?;
        let schema = Arc::new(MetatypeSchema {
            metatype,
            keys,
            compiled,
        });
        self.cache.insert(metatype_id, Arc::clone(&schema));
        tracing::debug!(%metatype_id, "compiled metatype schema");
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use deep_lynx_core::DataType;
    use serde_json::json;

    use super::*;
    use crate::storage::engines::MemoryStore;

    async fn registry() -> (MetatypeRegistry, Metatype) {
        let registry = MetatypeRegistry::new(Arc::new(MemoryStore::new()));
        let metatype = registry
            .create_metatype(ContainerId::new(), "Flower", "a plant")
            .await
            .unwrap();
        (registry, metatype)
    }

    #[tokio::test]
    async fn malformed_keys_are_rejected_before_storage() {
        let (registry, metatype) = registry().await;
        let err = registry
            .add_keys(
                metatype.id,
                vec![
                    NewMetatypeKey::new("color", DataType::Enumeration, true),
                    NewMetatypeKey::new("count", DataType::Number, false).with_default(json!("x")),
                ],
            )
            .await
            .unwrap_err();
        let EngineError::Validation(failure) = err else {
            panic!("expected validation failure");
        };
        assert_eq!(failure.errors.len(), 2);
        assert!(registry.list_keys(metatype.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_of_existing_key_is_a_validation_failure() {
        let (registry, metatype) = registry().await;
        registry
            .add_keys(
                metatype.id,
                vec![NewMetatypeKey::new("flower", DataType::String, true)],
            )
            .await
            .unwrap();
        let err = registry
            .add_keys(
                metatype.id,
                vec![NewMetatypeKey::new("flower", DataType::Number, false)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn schema_is_cached_until_keys_change() {
        let (registry, metatype) = registry().await;
        registry
            .add_keys(
                metatype.id,
                vec![NewMetatypeKey::new("flower", DataType::String, true)],
            )
            .await
            .unwrap();

        let first = registry
            .schema(metatype.container_id, metatype.id)
            .await
            .unwrap();
        let second = registry
            .schema(metatype.container_id, metatype.id)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let added = registry
            .add_keys(
                metatype.id,
                vec![NewMetatypeKey::new("petals", DataType::Number, false)],
            )
            .await
            .unwrap();
        let third = registry
            .schema(metatype.container_id, metatype.id)
            .await
            .unwrap();
        assert_eq!(third.keys().len(), 2);

        registry.delete_key(metatype.id, added[0].id).await.unwrap();
        let fourth = registry
            .schema(metatype.container_id, metatype.id)
            .await
            .unwrap();
        assert_eq!(fourth.keys().len(), 1);
    }

    #[tokio::test]
    async fn schema_from_other_container_is_not_found() {
        let (registry, metatype) = registry().await;
        let err = registry
            .schema(ContainerId::new(), metatype.id)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }
}
