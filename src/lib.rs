// ============================================================================
// actor-index: workflow-maintained secondary hash indexes over actors
// ============================================================================

pub mod actor;
pub mod bucket;
pub mod cluster;
pub mod config;
pub mod core;
pub mod storage;
pub mod update;
pub mod workflow;

// Re-export main types for convenience
pub use actor::{IndexedActor, IndexedActorRef, IndexedActorState};
pub use bucket::{HashIndex, IndexBucketRef, IndexStatus, TentativeOperation};
pub use cluster::{IndexingCluster, IndexingDirectory, QueueDirectory};
pub use config::{
    ActorTypeDefinition, ConsistencyScheme, IndexDefinition, IndexMetadata, IndexRegistry,
    IndexedInterfaceDefinition, IndexingConfig, WorkflowRetryPolicy,
};
pub use crate::core::{ActorKey, IndexError, IndexValue, Result, SiloId, WorkflowId};
pub use storage::{ETag, FileStateStore, InMemoryStateStore, PersistentState, StateStore};
pub use update::{MemberUpdate, OperationType, PropertyChange, PropertyMap, UpdateMode};
pub use workflow::{
    PendingWorkflows, QueueAddress, QueueId, ReincarnatedWorkflowQueue, WorkflowQueue,
    WorkflowQueueEntry, WorkflowRecord,
};
