use super::queue::{PendingWorkflows, WorkflowQueue};
use super::record::WorkflowRecord;
use crate::cluster::IndexingDirectory;
use crate::config::{IndexMetadata, WorkflowRetryPolicy};
use crate::core::{ActorKey, IndexError, Result, WorkflowId};
use crate::update::{MemberUpdate, OperationType};
use futures::future::try_join_all;
use log::warn;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{Instrument, Level, event, info_span};

type UpdatesByIndex = BTreeMap<String, BTreeMap<ActorKey, Vec<MemberUpdate>>>;

/// Drains one workflow queue: applies each punctuated segment to the index
/// buckets, then asks the queue for the next one.
pub struct WorkflowQueueHandler {
    queue: Arc<WorkflowQueue>,
    directory: Arc<dyn IndexingDirectory>,
    fault_tolerant: bool,
    retry: WorkflowRetryPolicy,
}

impl WorkflowQueueHandler {
    pub fn new(
        queue: Arc<WorkflowQueue>,
        directory: Arc<dyn IndexingDirectory>,
        fault_tolerant: bool,
        retry: WorkflowRetryPolicy,
    ) -> Self {
        Self {
            queue,
            directory,
            fault_tolerant,
            retry,
        }
    }

    /// Runs until the queue reports it is idle, the queue is retired, or a
    /// batch keeps failing after every retry. In the last case the batch stays
    /// at the head of the queue and the queue is parked.
    pub async fn handle_workflows_until_punctuation(self, batch: Vec<WorkflowRecord>) {
        let span = info_span!(
            "workflow.queue.drain",
            queue = %self.queue.address(),
            fault_tolerant = self.fault_tolerant
        );
        self.drain(batch).instrument(span).await
    }

    async fn drain(self, mut batch: Vec<WorkflowRecord>) {
        loop {
            if self.queue.is_retired() {
                event!(Level::DEBUG, "queue retired, drain stopped");
                return;
            }

            event!(Level::DEBUG, batch = batch.len(), "processing workflow batch");
            if let Err(err) = self.with_retry("apply batch", || self.process_batch(&batch)).await {
                event!(
                    Level::ERROR,
                    error = %err,
                    batch = batch.len(),
                    "workflow batch failed, parking queue"
                );
                self.queue.park().await;
                return;
            }

            let next = self
                .with_retry("fetch next batch", || {
                    self.queue.give_more_workflows_or_set_as_idle()
                })
                .await;
            match next {
                Ok(Some(more)) => batch = more,
                Ok(None) => {
                    event!(Level::DEBUG, "workflow queue drained");
                    return;
                }
                Err(err) => {
                    event!(Level::ERROR, error = %err, "could not advance workflow queue");
                    self.queue.park().await;
                    return;
                }
            }
        }
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_err: Option<IndexError> = None;

        for attempt in 1..=max_attempts {
            if self.queue.is_retired() {
                return Err(IndexError::QueueUnavailable(self.queue.address().to_string()));
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let transient = err.is_transient();
                    event!(
                        Level::WARN,
                        error = %err,
                        attempt,
                        max_attempts,
                        transient,
                        "{} failed",
                        what
                    );
                    last_err = Some(err);
                    if !transient {
                        break;
                    }
                }
            }
            if attempt < max_attempts {
                sleep(self.retry.backoff_for(attempt)).await;
            }
        }

        Err(last_err.unwrap_or_else(|| IndexError::Execution(format!("{} failed", what))))
    }

    async fn process_batch(&self, batch: &[WorkflowRecord]) -> Result<()> {
        let active = if self.fault_tolerant {
            self.fetch_active_workflow_ids(batch).await?
        } else {
            BTreeSet::new()
        };

        let (updates_by_index, metadata) = self.group_updates(batch, &active).await?;

        let origin = &self.queue.address().silo;
        let applications = updates_by_index.into_iter().map(|(index_name, updates)| {
            let directory = self.directory.clone();
            let metadata = metadata.get(&index_name).cloned();
            async move {
                let metadata =
                    metadata.ok_or_else(|| IndexError::IndexNotFound(index_name.clone()))?;
                let bucket = directory.index_ref(&index_name).await?;
                let all_applied = bucket
                    .apply_index_update_batch(
                        &index_name,
                        updates,
                        metadata.unique,
                        &metadata,
                        origin,
                    )
                    .await?;
                if !all_applied {
                    event!(
                        Level::WARN,
                        index = %index_name,
                        "some queued updates were rejected by the uniqueness constraint"
                    );
                }
                Ok::<_, IndexError>(())
            }
        });
        try_join_all(applications).await?;

        if self.fault_tolerant {
            self.release_active_workflow_ids(batch, &active);
        }
        Ok(())
    }

    /// Active workflow ids of every actor referenced by the batch, restricted
    /// to the batch.
    async fn fetch_active_workflow_ids(
        &self,
        batch: &[WorkflowRecord],
    ) -> Result<BTreeSet<WorkflowId>> {
        let actors: BTreeSet<&ActorKey> = batch.iter().map(WorkflowRecord::actor).collect();
        let fetches = actors.into_iter().map(|actor| async move {
            let actor_ref = self.directory.actor_ref(actor).await?;
            actor_ref.get_active_workflow_ids().await
        });
        let sets = try_join_all(fetches).await?;

        let batch_ids: BTreeSet<WorkflowId> =
            batch.iter().map(WorkflowRecord::workflow_id).collect();
        Ok(sets
            .into_iter()
            .flatten()
            .filter(|id| batch_ids.contains(id))
            .collect())
    }

    async fn group_updates(
        &self,
        batch: &[WorkflowRecord],
        active: &BTreeSet<WorkflowId>,
    ) -> Result<(UpdatesByIndex, BTreeMap<String, IndexMetadata>)> {
        let mut updates_by_index: UpdatesByIndex = BTreeMap::new();
        let mut metadata: BTreeMap<String, IndexMetadata> = BTreeMap::new();

        for record in batch {
            let confirmed = !self.fault_tolerant || active.contains(&record.workflow_id());
            for (index_name, update) in record.updates() {
                if update.operation() == OperationType::None {
                    continue;
                }
                if !metadata.contains_key(index_name) {
                    let found = self
                        .directory
                        .index_metadata(index_name)
                        .await
                        .ok_or_else(|| IndexError::IndexNotFound(index_name.to_string()))?;
                    metadata.insert(index_name.to_string(), found);
                }
                let unique = metadata.get(index_name).is_some_and(|m| m.unique);

                let update = if confirmed {
                    update.clone()
                } else if unique {
                    // the write never committed; undo its reservation
                    update.reversed_tentative()
                } else {
                    continue;
                };
                updates_by_index
                    .entry(index_name.to_string())
                    .or_default()
                    .entry(record.actor().clone())
                    .or_default()
                    .push(update);
            }
            if !confirmed {
                event!(
                    Level::DEBUG,
                    workflow = %record.workflow_id(),
                    actor = %record.actor(),
                    "workflow not active on its actor, reversing tentative updates"
                );
            }
        }

        Ok((updates_by_index, metadata))
    }

    /// Fire-and-forget removal of consumed ids from each actor's active set.
    fn release_active_workflow_ids(&self, batch: &[WorkflowRecord], active: &BTreeSet<WorkflowId>) {
        let mut consumed: BTreeMap<ActorKey, BTreeSet<WorkflowId>> = BTreeMap::new();
        for record in batch {
            if active.contains(&record.workflow_id()) {
                consumed
                    .entry(record.actor().clone())
                    .or_default()
                    .insert(record.workflow_id());
            }
        }

        for (actor, ids) in consumed {
            let directory = self.directory.clone();
            tokio::spawn(async move {
                let removal = async {
                    let actor_ref = directory.actor_ref(&actor).await?;
                    actor_ref.remove_from_active_workflow_ids(ids).await
                };
                if let Err(err) = removal.await {
                    warn!(
                        "failed to release active workflow ids: actor='{}' error='{}'",
                        actor, err
                    );
                }
            });
        }
    }
}
