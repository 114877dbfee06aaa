use crate::core::{ActorKey, WorkflowId};
use crate::update::PropertyMap;
use crate::workflow::QueueAddress;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

const ACTOR_STORAGE_PREFIX: &str = "actor";

/// Durable indexing state of one actor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedActorState {
    /// Current values of the indexed properties.
    pub properties: PropertyMap,
    /// Workflows enqueued by this actor and not yet confirmed applied. Only
    /// maintained under the fault-tolerant scheme.
    #[serde(default)]
    pub active_workflows: BTreeSet<WorkflowId>,
    /// Per interface, the queues the actor has enqueued to since its last
    /// recovery.
    #[serde(default)]
    pub workflow_queues: BTreeMap<String, BTreeSet<QueueAddress>>,
}

impl IndexedActorState {
    pub fn storage_key(actor_type: &str, actor: &ActorKey) -> String {
        format!("{}/{}/{}", ACTOR_STORAGE_PREFIX, actor_type, actor)
    }

    pub fn has_active_workflows(&self) -> bool {
        !self.active_workflows.is_empty()
    }

    /// Removes the given ids. Returns true when the set changed.
    pub fn release(&mut self, ids: &BTreeSet<WorkflowId>) -> bool {
        let before = self.active_workflows.len();
        self.active_workflows.retain(|id| !ids.contains(id));
        before != self.active_workflows.len()
    }
}
