use super::address::QueueAddress;
use super::handler::WorkflowQueueHandler;
use super::record::{WorkflowQueueEntry, WorkflowRecord};
use crate::cluster::IndexingDirectory;
use crate::config::WorkflowRetryPolicy;
use crate::core::{IndexError, Result, WorkflowId};
use crate::storage::{PersistentState, StateStore};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, watch};
use tracing::{Level, event};

/// Read/remove access to the pending records of a queue, live or
/// reincarnated. Recovery only needs these two calls.
#[async_trait]
pub trait PendingWorkflows: Send + Sync {
    fn address(&self) -> &QueueAddress;

    async fn get_remaining_workflows_in(
        &self,
        active: &BTreeSet<WorkflowId>,
    ) -> Result<Vec<WorkflowRecord>>;

    async fn remove_all_from_queue(&self, records: &[WorkflowRecord]) -> Result<()>;
}

struct QueueInner {
    entry: PersistentState<WorkflowQueueEntry>,
    draining: bool,
}

/// Durable FIFO of pending index updates for one (interface, partition) on
/// one silo.
///
/// The first append to an idle queue starts a drain task that runs
/// `WorkflowQueueHandler` segment by segment until the queue is empty.
pub struct WorkflowQueue {
    address: QueueAddress,
    fault_tolerant: bool,
    retry: WorkflowRetryPolicy,
    directory: Arc<dyn IndexingDirectory>,
    retired: AtomicBool,
    idle: watch::Sender<bool>,
    inner: Mutex<QueueInner>,
    this: Weak<WorkflowQueue>,
}

impl WorkflowQueue {
    /// Activates the queue from its durable state. Fault-tolerant queues
    /// resume draining whatever their previous incarnation left behind.
    pub async fn activate(
        address: QueueAddress,
        fault_tolerant: bool,
        retry: WorkflowRetryPolicy,
        directory: Arc<dyn IndexingDirectory>,
        store: Arc<dyn StateStore>,
    ) -> Result<Arc<Self>> {
        let key = address.storage_key();
        let entry = if fault_tolerant {
            PersistentState::load(store, key).await?
        } else {
            PersistentState::detached(store, key)
        };
        let (idle, _) = watch::channel(true);

        let queue = Arc::new_cyclic(|this| Self {
            address,
            fault_tolerant,
            retry,
            directory,
            retired: AtomicBool::new(false),
            idle,
            inner: Mutex::new(QueueInner {
                entry,
                draining: false,
            }),
            this: this.clone(),
        });

        let resumed = {
            let mut inner = queue.inner.lock().await;
            queue.start_drain_if_idle(&mut inner)
        };
        if resumed {
            event!(
                Level::INFO,
                queue = %queue.address,
                "workflow queue resumed pending work"
            );
        }
        Ok(queue)
    }

    pub fn is_fault_tolerant(&self) -> bool {
        self.fault_tolerant
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Drops this incarnation: further calls fail with
    /// `IndexError::QueueUnavailable` and the drain task stops at its next
    /// step. Durable state is left as is.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.idle.send_replace(true);
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_retired() {
            return Err(IndexError::QueueUnavailable(self.address.to_string()));
        }
        Ok(())
    }

    pub async fn add_to_queue(&self, record: WorkflowRecord) -> Result<()> {
        self.add_all_to_queue(vec![record]).await
    }

    /// Appends records followed by one punctuation and makes sure a drain is
    /// running. An empty call only nudges an idle queue that still has work.
    pub async fn add_all_to_queue(&self, records: Vec<WorkflowRecord>) -> Result<()> {
        self.ensure_alive()?;
        let mut inner = self.inner.lock().await;

        if !records.is_empty() {
            let appended = records.len();
            for record in records {
                inner.entry.state_mut().append(record);
            }
            inner
                .entry
                .state_mut()
                .append_punctuation(&self.address.queue.key())?;

            if let Err(err) = self.persist(&mut inner).await {
                inner.entry.refresh().await?;
                return Err(err);
            }
            event!(
                Level::DEBUG,
                queue = %self.address,
                appended,
                "workflow records queued"
            );
        }

        self.start_drain_if_idle(&mut inner);
        Ok(())
    }

    /// Called by the handler after it finished the head segment. Removes that
    /// segment and returns the next one, or marks the queue idle.
    pub async fn give_more_workflows_or_set_as_idle(&self) -> Result<Option<Vec<WorkflowRecord>>> {
        self.ensure_alive()?;
        let mut inner = self.inner.lock().await;

        let removed = inner.entry.state_mut().remove_first_segment();
        if let Err(err) = self.persist(&mut inner).await {
            inner.entry.refresh().await?;
            return Err(err);
        }
        event!(
            Level::DEBUG,
            queue = %self.address,
            removed = removed.len(),
            "workflow segment consumed"
        );

        match self.next_segment(&mut inner).await? {
            Some(segment) => Ok(Some(segment)),
            None => {
                self.set_idle(&mut inner);
                Ok(None)
            }
        }
    }

    /// Stops draining without consuming the head segment; the next append
    /// restarts from it.
    pub async fn park(&self) {
        let mut inner = self.inner.lock().await;
        self.set_idle(&mut inner);
        event!(
            Level::WARN,
            queue = %self.address,
            pending = inner.entry.state().record_count(),
            "workflow queue parked after failed batch"
        );
    }

    /// Resolves once the queue has no drain running.
    pub async fn wait_until_idle(&self) {
        let mut idle = self.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }

    pub async fn is_idle(&self) -> bool {
        !self.inner.lock().await.draining
    }

    pub async fn snapshot(&self) -> WorkflowQueueEntry {
        self.inner.lock().await.entry.state().clone()
    }

    /// Drops empty head segments (left behind by removals) and returns the
    /// first segment that still has records.
    async fn next_segment(&self, inner: &mut QueueInner) -> Result<Option<Vec<WorkflowRecord>>> {
        if inner.entry.state_mut().drop_empty_head_segments() {
            if let Err(err) = self.persist(inner).await {
                inner.entry.refresh().await?;
                return Err(err);
            }
        }
        let segment = inner.entry.state().first_segment();
        Ok((!segment.is_empty()).then_some(segment))
    }

    fn start_drain_if_idle(&self, inner: &mut QueueInner) -> bool {
        if inner.draining || self.is_retired() {
            return false;
        }
        // the durable copy keeps any empty head segments until the next write
        inner.entry.state_mut().drop_empty_head_segments();
        let segment = inner.entry.state().first_segment();
        if segment.is_empty() {
            return false;
        }
        let Some(queue) = self.this.upgrade() else {
            return false;
        };

        inner.draining = true;
        self.idle.send_replace(false);

        let handler = WorkflowQueueHandler::new(
            queue,
            self.directory.clone(),
            self.fault_tolerant,
            self.retry.clone(),
        );
        tokio::spawn(handler.handle_workflows_until_punctuation(segment));
        true
    }

    fn set_idle(&self, inner: &mut QueueInner) {
        inner.draining = false;
        self.idle.send_replace(true);
    }

    async fn persist(&self, inner: &mut QueueInner) -> Result<()> {
        if self.fault_tolerant {
            inner.entry.write().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PendingWorkflows for WorkflowQueue {
    fn address(&self) -> &QueueAddress {
        &self.address
    }

    async fn get_remaining_workflows_in(
        &self,
        active: &BTreeSet<WorkflowId>,
    ) -> Result<Vec<WorkflowRecord>> {
        self.ensure_alive()?;
        let inner = self.inner.lock().await;
        Ok(inner.entry.state().records_in(active))
    }

    async fn remove_all_from_queue(&self, records: &[WorkflowRecord]) -> Result<()> {
        self.ensure_alive()?;
        let ids: BTreeSet<WorkflowId> = records.iter().map(WorkflowRecord::workflow_id).collect();
        let mut inner = self.inner.lock().await;
        if inner.entry.state_mut().remove_all(&ids) == 0 {
            return Ok(());
        }
        if let Err(err) = self.persist(&mut inner).await {
            inner.entry.refresh().await?;
            return Err(err);
        }
        Ok(())
    }
}
