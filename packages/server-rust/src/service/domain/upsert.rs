//! The schema-validated node upsert engine.
//!
//! `create` and `update` are the primitive operations; `upsert` only decides
//! which of the two applies. Validation always happens before any write, and
//! a failed call leaves storage untouched.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use deep_lynx_core::{
    ContainerId, GraphId, IdentityHints, MetatypeId, Node, NodeId, NodeRevision, PropertyMap,
};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::service::config::EngineConfig;
use crate::service::domain::identity::IdentityResolver;
use crate::service::domain::metatypes::MetatypeRegistry;
use crate::service::operation::EngineError;
use crate::traits::{GraphStore, NodeStore};

/// Caller-supplied node content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDraft {
    /// Target of an explicit update.
    #[serde(default)]
    pub node_id: Option<NodeId>,
    pub container_id: ContainerId,
    pub graph_id: GraphId,
    pub metatype_id: MetatypeId,
    #[serde(default)]
    pub properties: PropertyMap,
    #[serde(default)]
    pub identity: IdentityHints,
    /// Overrides the modification timestamp of an update.
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

impl NodeDraft {
    #[must_use]
    pub fn new(
        container_id: ContainerId,
        graph_id: GraphId,
        metatype_id: MetatypeId,
        properties: PropertyMap,
    ) -> Self {
        Self {
            node_id: None,
            container_id,
            graph_id,
            metatype_id,
            properties,
            identity: IdentityHints::default(),
            modified_at: None,
        }
    }

    #[must_use]
    pub fn with_identity(mut self, identity: IdentityHints) -> Self {
        self.identity = identity;
        self
    }

    #[must_use]
    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    Created,
    Updated,
}

impl UpsertAction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub node: Node,
    pub action: UpsertAction,
}

/// Validates drafts against their metatype and writes versioned nodes.
pub struct NodeUpsertEngine {
    graphs: Arc<dyn GraphStore>,
    nodes: Arc<dyn NodeStore>,
    metatypes: Arc<MetatypeRegistry>,
    resolver: IdentityResolver,
    config: EngineConfig,
}

impl NodeUpsertEngine {
    #[must_use]
    pub fn new(
        graphs: Arc<dyn GraphStore>,
        nodes: Arc<dyn NodeStore>,
        metatypes: Arc<MetatypeRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            graphs,
            resolver: IdentityResolver::new(Arc::clone(&nodes)),
            nodes,
            metatypes,
            config,
        }
    }

    #[must_use]
    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    /// Validates `draft` and inserts it as a new node.
    ///
    /// # Errors
    ///
    /// [`EngineError::Validation`] for a bad payload, [`EngineError::NotFound`]
    /// for a missing graph or metatype, [`EngineError::IdentityConflict`] when
    /// an identity key belongs (or belonged) to another node, and
    /// [`EngineError::ConstraintViolation`] when a concurrent writer claimed
    /// the identity first.
    pub async fn create(&self, draft: NodeDraft) -> Result<Node, EngineError> {
        let span = upsert_span("create", &draft);
        let result = self.create_inner(draft).instrument(span).await;
        record_outcome(result.as_ref().map(|_| UpsertAction::Created));
        result
    }

    /// Validates `draft` and supersedes the current revision of `node_id`.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] if the node has no current revision in the
    /// draft's graph, [`EngineError::MetatypeReassignment`] if the draft names
    /// another metatype, plus the errors of [`create`](Self::create).
    pub async fn update(&self, node_id: NodeId, draft: NodeDraft) -> Result<Node, EngineError> {
        let span = upsert_span("update", &draft);
        let result = self.update_inner(node_id, draft).instrument(span).await;
        record_outcome(result.as_ref().map(|_| UpsertAction::Updated));
        result
    }

    /// Updates the node named by the draft or matched by its identity hints,
    /// otherwise creates one.
    ///
    /// # Errors
    ///
    /// See [`create`](Self::create) and [`update`](Self::update).
    pub async fn upsert(&self, draft: NodeDraft) -> Result<UpsertOutcome, EngineError> {
        let target = match draft.node_id {
            Some(id) => Some(id),
            None => self.resolver.resolve(draft.graph_id, &draft.identity).await?,
        };
        match target {
            Some(id) => Ok(UpsertOutcome {
                node: self.update(id, draft).await?,
                action: UpsertAction::Updated,
            }),
            None => Ok(UpsertOutcome {
                node: self.create(draft).await?,
                action: UpsertAction::Created,
            }),
        }
    }

    /// Current revision of a node.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] if the node does not exist.
    pub async fn retrieve(&self, node_id: NodeId) -> Result<Node, EngineError> {
        self.nodes
            .current_node(node_id)
            .await?
            .ok_or_else(|| EngineError::not_found("node", node_id))
    }

    /// Every revision of a node, oldest first.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] if the node does not exist.
    pub async fn history(&self, node_id: NodeId) -> Result<Vec<NodeRevision>, EngineError> {
        Ok(self.nodes.history(node_id).await?)
    }

    async fn create_inner(&self, draft: NodeDraft) -> Result<Node, EngineError> {
        self.ensure_graph(draft.container_id, draft.graph_id).await?;
        let schema = self
            .metatypes
            .schema(draft.container_id, draft.metatype_id)
            .await?;
        let properties = schema.compiled().validate(&draft.properties)?;

        self.resolver
            .ensure_claimable(
                draft.graph_id,
                &draft.identity,
                None,
                self.config.reject_retired_identities,
            )
            .await?;

        let now = Utc::now();
        let node = Node {
            id: NodeId::new(),
            container_id: draft.container_id,
            graph_id: draft.graph_id,
            metatype_id: draft.metatype_id,
            properties,
            data_source_id: draft.identity.data_source_id,
            original_data_id: draft.identity.original_data_id,
            composite_original_id: draft.identity.composite_original_id,
            created_at: now,
            modified_at: draft.modified_at.unwrap_or(now),
        };
        let node = self.nodes.insert_node(node).await?;
        tracing::debug!(node_id = %node.id, "node created");
        Ok(node)
    }

    async fn update_inner(&self, node_id: NodeId, draft: NodeDraft) -> Result<Node, EngineError> {
        let current = self
            .nodes
            .current_node(node_id)
            .await?
            .filter(|n| n.graph_id == draft.graph_id && n.container_id == draft.container_id)
            .ok_or_else(|| EngineError::not_found("node", node_id))?;
        if current.metatype_id != draft.metatype_id {
            return Err(EngineError::MetatypeReassignment { node_id });
        }

        let schema = self
            .metatypes
            .schema(current.container_id, current.metatype_id)
            .await?;
        let properties = schema.compiled().validate(&draft.properties)?;

        let identity = IdentityHints {
            data_source_id: draft.identity.data_source_id.or(current.data_source_id),
            original_data_id: draft
                .identity
                .original_data_id
                .or_else(|| current.original_data_id.clone()),
            composite_original_id: draft
                .identity
                .composite_original_id
                .or_else(|| current.composite_original_id.clone()),
        };
        self.resolver
            .ensure_claimable(
                current.graph_id,
                &identity,
                Some(node_id),
                self.config.reject_retired_identities,
            )
            .await?;

        let next = Node {
            properties,
            data_source_id: identity.data_source_id,
            original_data_id: identity.original_data_id,
            composite_original_id: identity.composite_original_id,
            modified_at: draft.modified_at.unwrap_or_else(Utc::now),
            ..current.clone()
        };
        let node = self.nodes.supersede_node(&current, next).await?;
        tracing::debug!(node_id = %node.id, "node updated");
        Ok(node)
    }

    async fn ensure_graph(
        &self,
        container_id: ContainerId,
        graph_id: GraphId,
    ) -> Result<(), EngineError> {
        if self.graphs.graph_exists(container_id, graph_id).await? {
            Ok(())
        } else {
            Err(EngineError::not_found("graph", graph_id))
        }
    }
}

fn upsert_span(op: &'static str, draft: &NodeDraft) -> tracing::Span {
    tracing::info_span!(
        "node_upsert",
        op,
        container_id = %draft.container_id,
        graph_id = %draft.graph_id,
        metatype_id = %draft.metatype_id,
    )
}

fn record_outcome(result: Result<UpsertAction, &EngineError>) {
    match result {
        Ok(action) => {
            metrics::counter!("deep_lynx_node_upserts_total", "action" => action.as_str())
                .increment(1);
        }
        Err(err) => {
            metrics::counter!("deep_lynx_node_upserts_total", "outcome" => err.code().as_str())
                .increment(1);
            tracing::debug!(error = %err, "node write rejected");
        }
    }
}
