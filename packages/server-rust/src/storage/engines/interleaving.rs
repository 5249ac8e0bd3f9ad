//! Store wrappers that hand control back to the scheduler around every call.
//!
//! The in-memory backend never suspends, so without these a concurrent test
//! would run each caller to completion before the next one is polled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deep_lynx_core::{
    DataSourceId, GraphId, IdentityKey, Node, NodeId, NodeRevision, StagedRecord, StagedRecordId,
};
use tokio::task::yield_now;

use crate::storage::{NewStagedRecord, RecordResolution, StorageHandles, StorageResult};
use crate::traits::{NodeStore, StagingStore};

pub struct Interleaving<T: ?Sized>(Arc<T>);

/// Replaces the node and staging handles with interleaving wrappers.
pub fn interleave(handles: &mut StorageHandles) {
    handles.nodes = Arc::new(Interleaving(Arc::clone(&handles.nodes)));
    handles.staging = Arc::new(Interleaving(Arc::clone(&handles.staging)));
}

/// Interleaving wrapper for a bare node store.
pub fn interleaved_nodes(nodes: Arc<dyn NodeStore>) -> Arc<dyn NodeStore> {
    Arc::new(Interleaving(nodes))
}

async fn around<F: std::future::Future>(call: F) -> F::Output {
    yield_now().await;
    let out = call.await;
    yield_now().await;
    out
}

#[async_trait]
impl NodeStore for Interleaving<dyn NodeStore> {
    async fn insert_node(&self, node: Node) -> StorageResult<Node> {
        around(self.0.insert_node(node)).await
    }

    async fn supersede_node(&self, previous: &Node, next: Node) -> StorageResult<Node> {
        around(self.0.supersede_node(previous, next)).await
    }

    async fn current_node(&self, id: NodeId) -> StorageResult<Option<Node>> {
        around(self.0.current_node(id)).await
    }

    async fn find_current_by_identity(
        &self,
        graph_id: GraphId,
        key: &IdentityKey,
    ) -> StorageResult<Vec<Node>> {
        around(self.0.find_current_by_identity(graph_id, key)).await
    }

    async fn find_retired_identity(
        &self,
        graph_id: GraphId,
        key: &IdentityKey,
    ) -> StorageResult<Option<NodeId>> {
        around(self.0.find_retired_identity(graph_id, key)).await
    }

    async fn history(&self, id: NodeId) -> StorageResult<Vec<NodeRevision>> {
        around(self.0.history(id)).await
    }
}

#[async_trait]
impl StagingStore for Interleaving<dyn StagingStore> {
    async fn insert_staged(&self, record: NewStagedRecord) -> StorageResult<StagedRecord> {
        around(self.0.insert_staged(record)).await
    }

    async fn retrieve_staged(&self, id: StagedRecordId) -> StorageResult<StagedRecord> {
        around(self.0.retrieve_staged(id)).await
    }

    async fn list_unprocessed(
        &self,
        data_source_id: DataSourceId,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<StagedRecord>> {
        around(self.0.list_unprocessed(data_source_id, offset, limit)).await
    }

    async fn count_unprocessed(&self, data_source_id: DataSourceId) -> StorageResult<u64> {
        around(self.0.count_unprocessed(data_source_id)).await
    }

    async fn claim_unprocessed(
        &self,
        data_source_id: DataSourceId,
        limit: usize,
        claimer: &str,
        ttl: Duration,
    ) -> StorageResult<Vec<StagedRecord>> {
        around(self.0.claim_unprocessed(data_source_id, limit, claimer, ttl)).await
    }

    async fn release_claim(&self, id: StagedRecordId, claimer: &str) -> StorageResult<()> {
        around(self.0.release_claim(id, claimer)).await
    }

    async fn mark_processed(
        &self,
        id: StagedRecordId,
        claimer: &str,
        resolution: RecordResolution,
    ) -> StorageResult<StagedRecord> {
        around(self.0.mark_processed(id, claimer, resolution)).await
    }
}
