//! Resolution of source-native identifiers to existing nodes.

use std::sync::Arc;

use deep_lynx_core::{GraphId, IdentityHints, IdentityKey, NodeId};

use crate::service::operation::EngineError;
use crate::traits::NodeStore;

/// Who, if anyone, holds an identity key in a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A current node carries the key.
    Current(NodeId),
    /// No current node carries it, but this node's history does.
    Retired(NodeId),
    Unknown,
}

/// Maps `(data source, original id)` style hints onto node ids.
pub struct IdentityResolver {
    nodes: Arc<dyn NodeStore>,
}

impl IdentityResolver {
    #[must_use]
    pub fn new(nodes: Arc<dyn NodeStore>) -> Self {
        Self { nodes }
    }

    /// The current node matching `hints`, if any.
    ///
    /// The original id is consulted when present, otherwise the composite id.
    /// Hints without a data source never match.
    ///
    /// # Errors
    ///
    /// [`EngineError::DuplicateCurrent`] when more than one current node
    /// carries the key, or a storage error.
    pub async fn resolve(
        &self,
        graph_id: GraphId,
        hints: &IdentityHints,
    ) -> Result<Option<NodeId>, EngineError> {
        match hints.resolution_key() {
            Some(key) => self.current_owner(graph_id, &key).await,
            None => Ok(None),
        }
    }

    /// Like [`resolve`](Self::resolve) for a single key, also reporting retired
    /// ownership.
    ///
    /// # Errors
    ///
    /// See [`resolve`](Self::resolve).
    pub async fn lookup(
        &self,
        graph_id: GraphId,
        key: &IdentityKey,
    ) -> Result<Resolution, EngineError> {
        if let Some(owner) = self.current_owner(graph_id, key).await? {
            return Ok(Resolution::Current(owner));
        }
        Ok(self
            .nodes
            .find_retired_identity(graph_id, key)
            .await?
            .map_or(Resolution::Unknown, Resolution::Retired))
    }

    /// Ensures every key in `hints` is free for `claimant`.
    ///
    /// `claimant` is the node being updated, or `None` for a new node. A key
    /// held by a different current node, or retired under a different node
    /// when `reject_retired` is set, is an identity conflict.
    ///
    /// # Errors
    ///
    /// [`EngineError::IdentityConflict`] naming the first contested key.
    pub async fn ensure_claimable(
        &self,
        graph_id: GraphId,
        hints: &IdentityHints,
        claimant: Option<NodeId>,
        reject_retired: bool,
    ) -> Result<(), EngineError> {
        for key in hints.keys() {
            let owner = match self.lookup(graph_id, &key).await? {
                Resolution::Current(owner) => Some(owner),
                Resolution::Retired(owner) if reject_retired => Some(owner),
                Resolution::Retired(_) | Resolution::Unknown => None,
            };
            if let Some(owner) = owner.filter(|o| Some(*o) != claimant) {
                tracing::debug!(%key, %owner, "identity already claimed");
                return Err(EngineError::IdentityConflict { key, owner });
            }
        }
        Ok(())
    }

    async fn current_owner(
        &self,
        graph_id: GraphId,
        key: &IdentityKey,
    ) -> Result<Option<NodeId>, EngineError> {
        let matches = self.nodes.find_current_by_identity(graph_id, key).await?;
        match matches.as_slice() {
            [] => Ok(None),
            [node] => Ok(Some(node.id)),
            _ => {
                tracing::error!(%key, %graph_id, count = matches.len(), "duplicate current nodes");
                Err(EngineError::DuplicateCurrent { key: key.clone() })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;
    use deep_lynx_core::{ContainerId, DataSourceId, MetatypeId, Node, NodeRevision, PropertyMap};

    use super::*;
    use crate::storage::{StorageError, StorageResult};

    /// Returns a fixed answer for every identity lookup.
    struct FixedNodes {
        current: Vec<NodeId>,
        retired: Option<NodeId>,
    }

    fn node(id: NodeId) -> Node {
        let now = Utc::now();
        Node {
            id,
            container_id: ContainerId::new(),
            graph_id: GraphId::new(),
            metatype_id: MetatypeId::new(),
            properties: PropertyMap::new(),
            data_source_id: None,
            original_data_id: None,
            composite_original_id: None,
            created_at: now,
            modified_at: now,
        }
    }

    #[async_trait]
    impl NodeStore for FixedNodes {
        async fn insert_node(&self, node: Node) -> StorageResult<Node> {
            Ok(node)
        }

        async fn supersede_node(&self, _previous: &Node, next: Node) -> StorageResult<Node> {
            Ok(next)
        }

        async fn current_node(&self, _id: NodeId) -> StorageResult<Option<Node>> {
            Ok(None)
        }

        async fn find_current_by_identity(
            &self,
            _graph_id: GraphId,
            _key: &IdentityKey,
        ) -> StorageResult<Vec<Node>> {
            Ok(self.current.iter().copied().map(node).collect())
        }

        async fn find_retired_identity(
            &self,
            _graph_id: GraphId,
            _key: &IdentityKey,
        ) -> StorageResult<Option<NodeId>> {
            Ok(self.retired)
        }

        async fn history(&self, id: NodeId) -> StorageResult<Vec<NodeRevision>> {
            Err(StorageError::not_found("node", id))
        }
    }

    fn resolver(current: Vec<NodeId>, retired: Option<NodeId>) -> IdentityResolver {
        IdentityResolver::new(Arc::new(FixedNodes { current, retired }))
    }

    fn hints() -> IdentityHints {
        IdentityHints {
            data_source_id: Some(DataSourceId::new()),
            original_data_id: Some("x".into()),
            composite_original_id: None,
        }
    }

    #[tokio::test]
    async fn no_hints_never_match() {
        let r = resolver(vec![NodeId::new()], None);
        assert_eq!(
            r.resolve(GraphId::new(), &IdentityHints::default())
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn single_current_match_resolves() {
        let id = NodeId::new();
        let r = resolver(vec![id], None);
        assert_eq!(r.resolve(GraphId::new(), &hints()).await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn duplicate_current_is_fatal() {
        let r = resolver(vec![NodeId::new(), NodeId::new()], None);
        let err = r.resolve(GraphId::new(), &hints()).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateCurrent { .. }));
    }

    #[tokio::test]
    async fn retired_key_blocks_other_nodes() {
        let owner = NodeId::new();
        let r = resolver(Vec::new(), Some(owner));
        let graph_id = GraphId::new();

        assert_eq!(r.resolve(graph_id, &hints()).await.unwrap(), None);
        let err = r
            .ensure_claimable(graph_id, &hints(), None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IdentityConflict { owner: o, .. } if o == owner));

        r.ensure_claimable(graph_id, &hints(), Some(owner), true)
            .await
            .unwrap();
        r.ensure_claimable(graph_id, &hints(), None, false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn current_key_of_another_node_conflicts() {
        let owner = NodeId::new();
        let r = resolver(vec![owner], None);
        let err = r
            .ensure_claimable(GraphId::new(), &hints(), Some(NodeId::new()), true)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IdentityConflict { .. }));
    }
}
