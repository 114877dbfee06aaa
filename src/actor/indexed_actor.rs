use super::IndexedActorRef;
use super::state::IndexedActorState;
use crate::cluster::{IndexingDirectory, QueueDirectory};
use crate::config::ActorTypeDefinition;
use crate::core::{ActorKey, IndexError, IndexValue, Result, SiloId, WorkflowId};
use crate::storage::{PersistentState, StateStore};
use crate::update::{
    IndexUpdates, MemberUpdate, PropertyChange, PropertyMap, UpdateMode, active_index_updates,
    fold_changes,
};
use crate::workflow::{WorkflowRecord, recover_active_workflows};
use async_trait::async_trait;
use log::warn;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{Level, event};

type InterfaceUpdates = Vec<(String, IndexUpdates)>;

/// One incarnation of an indexed actor on a silo.
///
/// Every call is a turn: it takes the actor lock, activates the actor if this
/// is the first turn, and holds the lock until its state write is done. A
/// queue handler asking for the active set therefore never sees a write
/// halfway through.
pub struct IndexedActor {
    key: ActorKey,
    actor_type: Arc<ActorTypeDefinition>,
    silo: SiloId,
    store: Arc<dyn StateStore>,
    queues: Arc<dyn QueueDirectory>,
    indexes: Arc<dyn IndexingDirectory>,
    retired: AtomicBool,
    inner: Mutex<Option<PersistentState<IndexedActorState>>>,
}

impl IndexedActor {
    pub fn new(
        key: ActorKey,
        actor_type: Arc<ActorTypeDefinition>,
        silo: SiloId,
        store: Arc<dyn StateStore>,
        queues: Arc<dyn QueueDirectory>,
        indexes: Arc<dyn IndexingDirectory>,
    ) -> Self {
        Self {
            key,
            actor_type,
            silo,
            store,
            queues,
            indexes,
            retired: AtomicBool::new(false),
            inner: Mutex::new(None),
        }
    }

    pub fn silo(&self) -> &SiloId {
        &self.silo
    }

    pub fn actor_type(&self) -> &ActorTypeDefinition {
        &self.actor_type
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_retired() {
            return Err(IndexError::ActorUnavailable(format!(
                "{} on {}",
                self.key, self.silo
            )));
        }
        Ok(())
    }

    /// Runs activation if it has not run yet.
    pub async fn activate(&self) -> Result<()> {
        let mut slot = self.inner.lock().await;
        self.activated(&mut slot).await?;
        Ok(())
    }

    /// Graceful deactivation: active indexes drop the actor, then this
    /// incarnation stops accepting calls.
    pub async fn deactivate(&self) -> Result<()> {
        let mut slot = self.inner.lock().await;
        if let Some(state) = slot.as_ref() {
            let updates = self.active_index_updates(&state.state().properties, false);
            let mut scratch = state.state().clone();
            self.apply_index_updates(&mut scratch, updates).await?;
        }
        *slot = None;
        self.retired.store(true, Ordering::SeqCst);
        event!(Level::DEBUG, actor = %self.key, silo = %self.silo, "actor deactivated");
        Ok(())
    }

    /// Drops this incarnation without any cleanup.
    pub fn crash(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub async fn properties(&self) -> Result<PropertyMap> {
        let mut slot = self.inner.lock().await;
        let state = self.activated(&mut slot).await?;
        Ok(state.state().properties.clone())
    }

    pub async fn property(&self, name: &str) -> Result<Option<IndexValue>> {
        Ok(self.properties().await?.get(name).cloned())
    }

    pub async fn set_property(
        &self,
        property: impl Into<String>,
        value: impl Into<IndexValue>,
    ) -> Result<()> {
        self.write_properties(vec![PropertyChange::set(property, value)])
            .await
    }

    /// Applies a sequence of property changes as one write. Index updates for
    /// the same index are folded into a single net update.
    ///
    /// Eager types update their indexes before the state write. Lazy types
    /// reserve unique values tentatively, enqueue one workflow record per
    /// touched interface, then write their state; fault-tolerant types also
    /// record the workflow ids as active in that same write.
    ///
    /// # Errors
    ///
    /// Returns `IndexError::UniquenessConstraintViolated` when a unique index
    /// already holds the new value for another actor; the state is left
    /// unchanged. Storage and queue failures are returned as is.
    pub async fn write_properties(&self, changes: Vec<PropertyChange>) -> Result<()> {
        let mut slot = self.inner.lock().await;
        let state = self.activated(&mut slot).await?;

        let mode = if self.actor_type.scheme.is_transactional() {
            UpdateMode::Transactional
        } else {
            UpdateMode::NonTentative
        };
        let current = state.state().properties.clone();

        let mut updates: InterfaceUpdates = Vec::new();
        for iface in &self.actor_type.interfaces {
            let (_, iface_updates) = fold_changes(iface, &current, &changes, mode)?;
            if !iface_updates.is_empty() {
                updates.push((iface.name.clone(), iface_updates));
            }
        }

        let mut next = state.state().clone();
        for change in &changes {
            match &change.value {
                Some(value) => {
                    next.properties.insert(change.property.clone(), value.clone());
                }
                None => {
                    next.properties.remove(&change.property);
                }
            }
        }

        self.apply_index_updates(&mut next, updates.clone()).await?;

        let previous = std::mem::replace(state.state_mut(), next);
        if let Err(err) = state.write().await {
            *state.state_mut() = previous;
            if self.actor_type.is_eager() {
                let applied: Vec<(String, MemberUpdate)> = updates
                    .into_iter()
                    .flat_map(|(_, iface_updates)| iface_updates)
                    .collect();
                self.undo_eager(&applied).await;
            }
            return Err(err);
        }

        event!(
            Level::DEBUG,
            actor = %self.key,
            changes = changes.len(),
            active_workflows = state.state().active_workflows.len(),
            "actor properties written"
        );
        Ok(())
    }

    async fn activated<'a>(
        &self,
        slot: &'a mut Option<PersistentState<IndexedActorState>>,
    ) -> Result<&'a mut PersistentState<IndexedActorState>> {
        self.ensure_alive()?;
        if slot.is_none() {
            let mut state = self.load_and_recover().await?;

            let updates = self.active_index_updates(&state.state().properties, true);
            let mut scratch = state.state().clone();
            self.apply_index_updates(&mut scratch, updates).await?;
            if scratch != *state.state() {
                *state.state_mut() = scratch;
                state.write().await?;
            }

            event!(Level::DEBUG, actor = %self.key, silo = %self.silo, "actor activated");
            *slot = Some(state);
        }
        slot.as_mut()
            .ok_or_else(|| IndexError::ActorUnavailable(self.key.to_string()))
    }

    async fn load_and_recover(&self) -> Result<PersistentState<IndexedActorState>> {
        let key = IndexedActorState::storage_key(&self.actor_type.name, &self.key);
        let mut state: PersistentState<IndexedActorState> =
            PersistentState::load(self.store.clone(), key).await?;

        if !self.actor_type.scheme.is_fault_tolerant() || !state.state().has_active_workflows() {
            return Ok(state);
        }

        let active = state.state().active_workflows.clone();
        let recovered = recover_active_workflows(
            self.queues.as_ref(),
            &self.key,
            &self.silo,
            &active,
            &state.state().workflow_queues,
        )
        .await?;

        event!(
            Level::INFO,
            actor = %self.key,
            silo = %self.silo,
            active = active.len(),
            outstanding = recovered.outstanding.len(),
            "active workflows reconciled"
        );

        let changed = recovered.outstanding != active
            || recovered.queues != state.state().workflow_queues;
        if changed {
            state.state_mut().active_workflows = recovered.outstanding;
            state.state_mut().workflow_queues = recovered.queues;
            state.write().await?;
        }
        Ok(state)
    }

    fn active_index_updates(&self, properties: &PropertyMap, activating: bool) -> InterfaceUpdates {
        if !self.actor_type.scheme.supports_active_indexes() {
            return Vec::new();
        }
        self.actor_type
            .interfaces
            .iter()
            .map(|iface| {
                (
                    iface.name.clone(),
                    active_index_updates(iface, properties, activating, UpdateMode::NonTentative),
                )
            })
            .filter(|(_, updates)| !updates.is_empty())
            .collect()
    }

    /// Dispatches updates eagerly or through the workflow queues. Lazy
    /// dispatch records the enqueued workflows in `state`.
    async fn apply_index_updates(
        &self,
        state: &mut IndexedActorState,
        updates: InterfaceUpdates,
    ) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        if self.actor_type.is_eager() {
            self.apply_eagerly(&updates).await
        } else {
            self.enqueue(state, updates).await
        }
    }

    async fn apply_eagerly(&self, updates: &InterfaceUpdates) -> Result<()> {
        let mut applied: Vec<(String, MemberUpdate)> = Vec::new();
        for (_, iface_updates) in updates {
            for (index, update) in iface_updates {
                if let Err(err) = self.apply_to_index(index, update.clone()).await {
                    self.undo_eager(&applied).await;
                    return Err(err);
                }
                applied.push((index.clone(), update.clone()));
            }
        }
        Ok(())
    }

    /// Best-effort inverse of eagerly applied updates, newest first.
    async fn undo_eager(&self, applied: &[(String, MemberUpdate)]) {
        for (index, update) in applied.iter().rev() {
            let inverse = MemberUpdate::from_images(
                update.after_image().cloned(),
                update.before_image().cloned(),
                update.mode(),
            );
            if inverse.is_none() {
                continue;
            }
            if let Err(err) = self.apply_to_index(index, inverse).await {
                warn!(
                    "failed to undo eager index update: index='{}' actor='{}' error='{}'",
                    index, self.key, err
                );
            }
        }
    }

    async fn enqueue(&self, state: &mut IndexedActorState, updates: InterfaceUpdates) -> Result<()> {
        let mut reserved: Vec<(String, String, MemberUpdate)> = Vec::new();
        for (iface, iface_updates) in &updates {
            for (index, update) in iface_updates {
                if !self.is_unique(index).await? {
                    continue;
                }
                let tentative = update.with_mode(UpdateMode::Tentative);
                if let Err(err) = self.apply_to_index(index, tentative.clone()).await {
                    self.release_reservations(&reserved).await;
                    return Err(err);
                }
                reserved.push((iface.clone(), index.clone(), tentative));
            }
        }

        let fault_tolerant = self.actor_type.scheme.is_fault_tolerant();
        let mut enqueued: BTreeSet<String> = BTreeSet::new();
        for (iface, iface_updates) in updates {
            let record = WorkflowRecord::new(self.key.clone(), iface.clone(), iface_updates);
            let workflow_id: WorkflowId = record.workflow_id();
            let address = self.queues.queue_address_for(&iface, &self.key, &self.silo);

            let queued = match self.queues.queue(&address).await {
                Ok(queue) => queue.add_to_queue(record).await,
                Err(err) => Err(err),
            };
            if let Err(err) = queued {
                // reservations of queued records are settled by their handler
                let unqueued: Vec<_> = reserved
                    .into_iter()
                    .filter(|(reserved_iface, _, _)| !enqueued.contains(reserved_iface))
                    .collect();
                self.release_reservations(&unqueued).await;
                return Err(err);
            }

            event!(
                Level::TRACE,
                actor = %self.key,
                workflow = %workflow_id,
                queue = %address,
                "workflow enqueued"
            );
            if fault_tolerant {
                state.active_workflows.insert(workflow_id);
                state
                    .workflow_queues
                    .entry(iface.clone())
                    .or_default()
                    .insert(address);
            }
            enqueued.insert(iface);
        }
        Ok(())
    }

    async fn release_reservations(&self, reserved: &[(String, String, MemberUpdate)]) {
        for (_, index, tentative) in reserved.iter().rev() {
            if let Err(err) = self
                .apply_to_index(index, tentative.reversed_tentative())
                .await
            {
                warn!(
                    "failed to release tentative reservation: index='{}' actor='{}' error='{}'",
                    index, self.key, err
                );
            }
        }
    }

    async fn is_unique(&self, index: &str) -> Result<bool> {
        self.indexes
            .index_metadata(index)
            .await
            .map(|metadata| metadata.unique)
            .ok_or_else(|| IndexError::IndexNotFound(index.to_string()))
    }

    async fn apply_to_index(&self, index: &str, update: MemberUpdate) -> Result<()> {
        let metadata = self
            .indexes
            .index_metadata(index)
            .await
            .ok_or_else(|| IndexError::IndexNotFound(index.to_string()))?;
        let bucket = self.indexes.index_ref(index).await?;
        bucket
            .apply_index_update(&self.key, update, metadata.unique, &metadata, &self.silo)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl IndexedActorRef for IndexedActor {
    fn key(&self) -> &ActorKey {
        &self.key
    }

    async fn get_active_workflow_ids(&self) -> Result<BTreeSet<WorkflowId>> {
        let mut slot = self.inner.lock().await;
        let state = self.activated(&mut slot).await?;
        Ok(state.state().active_workflows.clone())
    }

    async fn remove_from_active_workflow_ids(&self, ids: BTreeSet<WorkflowId>) -> Result<()> {
        let mut slot = self.inner.lock().await;
        let state = self.activated(&mut slot).await?;

        let previous = state.state().clone();
        if !state.state_mut().release(&ids) {
            return Ok(());
        }
        if let Err(err) = state.write().await {
            *state.state_mut() = previous;
            return Err(err);
        }
        Ok(())
    }
}
