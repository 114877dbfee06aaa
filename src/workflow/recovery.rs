use super::address::QueueAddress;
use super::queue::PendingWorkflows;
use super::record::{WorkflowQueueEntry, WorkflowRecord};
use crate::cluster::QueueDirectory;
use crate::core::{ActorKey, IndexError, Result, SiloId, WorkflowId};
use crate::storage::{PersistentState, StateStore};
use async_trait::async_trait;
use log::warn;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{Level, event};

/// Read/remove access to the durable state of a queue whose silo is gone.
///
/// Built from the dead queue's storage key and bound to that state by an
/// explicit `initialize` call; it never drains.
pub struct ReincarnatedWorkflowQueue {
    address: QueueAddress,
    store: Arc<dyn StateStore>,
    entry: Mutex<Option<PersistentState<WorkflowQueueEntry>>>,
}

impl ReincarnatedWorkflowQueue {
    /// # Errors
    ///
    /// Returns `IndexError::MalformedQueueKey` when `key` is not a queue
    /// state key.
    pub fn from_storage_key(key: &str, store: Arc<dyn StateStore>) -> Result<Self> {
        let address = QueueAddress::from_storage_key(key)?;
        Ok(Self {
            address,
            store,
            entry: Mutex::new(None),
        })
    }

    /// Loads the durable state. Calling it again is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        let mut entry = self.entry.lock().await;
        if entry.is_none() {
            let loaded: PersistentState<WorkflowQueueEntry> =
                PersistentState::load(self.store.clone(), self.address.storage_key()).await?;
            event!(
                Level::INFO,
                queue = %self.address,
                pending = loaded.state().record_count(),
                "reincarnated workflow queue"
            );
            *entry = Some(loaded);
        }
        Ok(())
    }

    fn not_initialized(&self) -> IndexError {
        IndexError::Execution(format!(
            "reincarnated queue {} used before initialize",
            self.address
        ))
    }
}

#[async_trait]
impl PendingWorkflows for ReincarnatedWorkflowQueue {
    fn address(&self) -> &QueueAddress {
        &self.address
    }

    async fn get_remaining_workflows_in(
        &self,
        active: &BTreeSet<WorkflowId>,
    ) -> Result<Vec<WorkflowRecord>> {
        let entry = self.entry.lock().await;
        let entry = entry.as_ref().ok_or_else(|| self.not_initialized())?;
        Ok(entry.state().records_in(active))
    }

    async fn remove_all_from_queue(&self, records: &[WorkflowRecord]) -> Result<()> {
        let ids: BTreeSet<WorkflowId> = records.iter().map(WorkflowRecord::workflow_id).collect();
        let mut entry = self.entry.lock().await;
        let entry = entry.as_mut().ok_or_else(|| self.not_initialized())?;
        if entry.state_mut().remove_all(&ids) == 0 {
            return Ok(());
        }
        if let Err(err) = entry.write().await {
            entry.refresh().await?;
            return Err(err);
        }
        Ok(())
    }
}

/// Result of reconciling an actor's active workflows on activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveredWorkflows {
    /// Ids confirmed to be still queued somewhere; the pruned active set.
    pub outstanding: BTreeSet<WorkflowId>,
    /// Per interface, the queues that now hold the outstanding records.
    pub queues: BTreeMap<String, BTreeSet<QueueAddress>>,
}

/// Finds which of `active` are still queued, moves them to the queue the
/// actor maps to on `silo`, and reports the ids that remain outstanding.
///
/// `previous` lists, per indexed interface, every queue the actor has
/// enqueued to since its last recovery.
pub async fn recover_active_workflows(
    queues: &dyn QueueDirectory,
    actor: &ActorKey,
    silo: &SiloId,
    active: &BTreeSet<WorkflowId>,
    previous: &BTreeMap<String, BTreeSet<QueueAddress>>,
) -> Result<RecoveredWorkflows> {
    let mut recovered = RecoveredWorkflows::default();
    if active.is_empty() {
        return Ok(recovered);
    }

    for (interface, old_addresses) in previous {
        let address = queues.queue_address_for(interface, actor, silo);
        let queue = queues.queue(&address).await?;
        let mut found_here = false;

        for old in old_addresses {
            if *old == address {
                let remaining = queue.get_remaining_workflows_in(active).await?;
                if !remaining.is_empty() {
                    // nudge: a parked queue restarts from its head
                    queue.add_all_to_queue(Vec::new()).await?;
                    recovered
                        .outstanding
                        .extend(remaining.iter().map(WorkflowRecord::workflow_id));
                    found_here = true;
                }
                continue;
            }

            let old_queue = open_previous_queue(queues, old).await?;
            let remaining = old_queue.get_remaining_workflows_in(active).await?;
            if remaining.is_empty() {
                continue;
            }

            event!(
                Level::INFO,
                actor = %actor,
                from = %old,
                to = %address,
                handed_off = remaining.len(),
                "handing off outstanding workflows"
            );
            recovered
                .outstanding
                .extend(remaining.iter().map(WorkflowRecord::workflow_id));
            queue.add_all_to_queue(remaining.clone()).await?;
            found_here = true;

            tokio::spawn(async move {
                if let Err(err) = old_queue.remove_all_from_queue(&remaining).await {
                    warn!(
                        "failed to remove handed-off workflows: queue='{}' error='{}'",
                        old_queue.address(),
                        err
                    );
                }
            });
        }

        if found_here {
            recovered
                .queues
                .entry(interface.clone())
                .or_default()
                .insert(address);
        }
    }

    Ok(recovered)
}

/// The live queue at `address` when its silo answers, else a reincarnation
/// of its durable state.
async fn open_previous_queue(
    queues: &dyn QueueDirectory,
    address: &QueueAddress,
) -> Result<Arc<dyn PendingWorkflows>> {
    match queues.queue(address).await {
        Ok(queue) => Ok(queue as Arc<dyn PendingWorkflows>),
        Err(err) => {
            event!(
                Level::WARN,
                queue = %address,
                error = %err,
                "previous workflow queue unreachable, reincarnating"
            );
            let reincarnated = ReincarnatedWorkflowQueue::from_storage_key(
                &address.storage_key(),
                queues.state_store(),
            )?;
            reincarnated.initialize().await?;
            Ok(Arc::new(reincarnated))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStateStore;
    use crate::update::{MemberUpdate, UpdateMode};
    use crate::workflow::QueueId;

    fn record(actor: &str) -> WorkflowRecord {
        let mut updates = BTreeMap::new();
        updates.insert(
            "by_name".to_string(),
            MemberUpdate::insert(actor, UpdateMode::NonTentative),
        );
        WorkflowRecord::new(ActorKey::new(actor), "IPlayer", updates)
    }

    #[tokio::test]
    async fn reincarnated_queue_reads_and_trims_durable_state() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let address = QueueAddress::new(SiloId::new("dead"), QueueId::new("IPlayer", 2));
        let (r1, r2) = (record("a"), record("b"));

        let mut durable: PersistentState<WorkflowQueueEntry> =
            PersistentState::load(store.clone(), address.storage_key())
                .await
                .unwrap();
        durable.state_mut().append(r1.clone());
        durable.state_mut().append(r2.clone());
        durable.state_mut().append_punctuation("IPlayer-2").unwrap();
        durable.write().await.unwrap();

        let queue =
            ReincarnatedWorkflowQueue::from_storage_key(&address.storage_key(), store.clone())
                .unwrap();
        assert_eq!(queue.address(), &address);

        let active: BTreeSet<_> = [r1.workflow_id()].into_iter().collect();
        assert!(queue.get_remaining_workflows_in(&active).await.is_err());

        queue.initialize().await.unwrap();
        assert_eq!(queue.get_remaining_workflows_in(&active).await.unwrap(), vec![r1.clone()]);

        queue.remove_all_from_queue(&[r1]).await.unwrap();
        durable.refresh().await.unwrap();
        assert_eq!(durable.state().records().cloned().collect::<Vec<_>>(), vec![r2]);
    }

    #[test]
    fn reincarnation_rejects_foreign_keys() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        assert!(matches!(
            ReincarnatedWorkflowQueue::from_storage_key("actor/Player/p1", store),
            Err(IndexError::MalformedQueueKey(_))
        ));
    }
}
