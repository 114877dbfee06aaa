pub mod indexed_actor;
pub mod state;

pub use indexed_actor::IndexedActor;
pub use state::IndexedActorState;

use crate::core::{ActorKey, Result, WorkflowId};
use async_trait::async_trait;
use std::collections::BTreeSet;

/// What a queue handler needs from an indexed actor. Both calls are
/// idempotent.
#[async_trait]
pub trait IndexedActorRef: Send + Sync {
    fn key(&self) -> &ActorKey;

    async fn get_active_workflow_ids(&self) -> Result<BTreeSet<WorkflowId>>;

    async fn remove_from_active_workflow_ids(&self, ids: BTreeSet<WorkflowId>) -> Result<()>;
}
