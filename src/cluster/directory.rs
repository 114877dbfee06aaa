use crate::actor::IndexedActorRef;
use crate::bucket::IndexBucketRef;
use crate::config::IndexMetadata;
use crate::core::{ActorKey, Result, SiloId};
use crate::storage::StateStore;
use crate::workflow::{QueueAddress, WorkflowQueue};
use async_trait::async_trait;
use std::sync::Arc;

/// How queue handlers reach actors and indexes.
#[async_trait]
pub trait IndexingDirectory: Send + Sync {
    /// Resolves an actor, activating it if needed.
    async fn actor_ref(&self, actor: &ActorKey) -> Result<Arc<dyn IndexedActorRef>>;

    async fn index_ref(&self, index_name: &str) -> Result<Arc<dyn IndexBucketRef>>;

    async fn index_metadata(&self, index_name: &str) -> Option<IndexMetadata>;
}

/// How actors reach workflow queues.
#[async_trait]
pub trait QueueDirectory: Send + Sync {
    /// Address of the queue serving `actor` for `interface` on `silo`.
    fn queue_address_for(&self, interface: &str, actor: &ActorKey, silo: &SiloId) -> QueueAddress;

    /// Returns the live queue instance at `address`, activating it on its
    /// silo if needed.
    ///
    /// # Errors
    ///
    /// Returns `IndexError::QueueUnavailable` when the owning silo cannot be
    /// reached.
    async fn queue(&self, address: &QueueAddress) -> Result<Arc<WorkflowQueue>>;

    /// Store holding queue state, used to reincarnate unreachable queues.
    fn state_store(&self) -> Arc<dyn StateStore>;
}
