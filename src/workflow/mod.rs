pub mod address;
pub mod handler;
pub mod queue;
pub mod record;
pub mod recovery;

pub use address::{QUEUE_KEY_SEPARATOR, QueueAddress, QueueId, partition_for};
pub use handler::WorkflowQueueHandler;
pub use queue::{PendingWorkflows, WorkflowQueue};
pub use record::{WorkflowQueueEntry, WorkflowRecord, WorkflowRecordNode};
pub use recovery::{ReincarnatedWorkflowQueue, RecoveredWorkflows, recover_active_workflows};
