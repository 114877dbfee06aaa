pub mod directory;

pub use directory::{IndexingDirectory, QueueDirectory};

use crate::actor::{IndexedActor, IndexedActorRef};
use crate::bucket::{HashIndex, IndexBucketRef};
use crate::config::{ActorTypeDefinition, IndexMetadata, IndexRegistry, IndexingConfig};
use crate::core::{ActorKey, IndexError, IndexValue, Result, SiloId};
use crate::storage::StateStore;
use crate::workflow::{QueueAddress, QueueId, WorkflowQueue, partition_for};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{Level, event};

const PLACEMENT_SALT: &str = "placement";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SiloStatus {
    Up,
    Down,
}

struct ActorSlot {
    actor_type: String,
    silo: Option<SiloId>,
    live: Option<Arc<IndexedActor>>,
}

struct ClusterInner {
    config: IndexingConfig,
    store: Arc<dyn StateStore>,
    registry: Mutex<IndexRegistry>,
    indexes: Mutex<HashMap<String, Arc<HashIndex>>>,
    silos: Mutex<BTreeMap<SiloId, SiloStatus>>,
    queues: Mutex<HashMap<QueueAddress, Arc<WorkflowQueue>>>,
    actors: Mutex<HashMap<ActorKey, ActorSlot>>,
    this: Weak<ClusterInner>,
}

/// In-process host for indexed actors, their workflow queues and the hash
/// indexes, spread over named silos that can be killed and revived.
///
/// All silos share one state store, so anything written durably survives a
/// silo kill. Actor keys are unique across actor types.
#[derive(Clone)]
pub struct IndexingCluster {
    inner: Arc<ClusterInner>,
}

impl IndexingCluster {
    /// # Errors
    ///
    /// Returns `IndexError::Configuration` when `config` does not validate.
    pub fn new(config: IndexingConfig, store: Arc<dyn StateStore>) -> Result<Self> {
        config.validate()?;
        let inner = Arc::new_cyclic(|this| ClusterInner {
            config,
            store,
            registry: Mutex::new(IndexRegistry::new()),
            indexes: Mutex::new(HashMap::new()),
            silos: Mutex::new(BTreeMap::new()),
            queues: Mutex::new(HashMap::new()),
            actors: Mutex::new(HashMap::new()),
            this: this.clone(),
        });
        Ok(Self { inner })
    }

    pub fn config(&self) -> &IndexingConfig {
        &self.inner.config
    }

    pub fn state_store(&self) -> Arc<dyn StateStore> {
        self.inner.store.clone()
    }

    /// Registers an actor type and opens one hash index per declared index.
    pub async fn register_actor_type(&self, actor_type: ActorTypeDefinition) -> Result<()> {
        let registered = {
            let mut registry = self.inner.registry.lock().await;
            registry.register(actor_type, self.inner.config.default_bucket_capacity)?
        };

        let mut indexes = self.inner.indexes.lock().await;
        for (iface, idx) in registered.indexes() {
            let metadata = IndexMetadata {
                index_name: idx.name.clone(),
                interface_name: iface.name.clone(),
                actor_type: registered.name.clone(),
                unique: idx.unique,
                bucket_capacity: idx
                    .bucket_capacity
                    .unwrap_or(self.inner.config.default_bucket_capacity),
            };
            let index = HashIndex::open(metadata, self.inner.store.clone()).await?;
            indexes.insert(idx.name.clone(), Arc::new(index));
        }

        event!(
            Level::INFO,
            actor_type = %registered.name,
            scheme = ?registered.scheme,
            indexes = registered.indexes().count(),
            "actor type registered"
        );
        Ok(())
    }

    /// Adds a silo, or brings a killed one back up.
    pub async fn add_silo(&self, silo: impl Into<SiloId>) -> Result<()> {
        let silo = silo.into();
        if silo.as_str().trim().is_empty() || silo.as_str().contains('/') {
            return Err(IndexError::Configuration(format!(
                "silo id '{}' must be non-empty and must not contain '/'",
                silo
            )));
        }
        self.inner
            .silos
            .lock()
            .await
            .insert(silo.clone(), SiloStatus::Up);
        event!(Level::INFO, silo = %silo, "silo up");
        Ok(())
    }

    /// Takes a silo down abruptly: its queue instances are retired and its
    /// actors crash. Durable state stays in the store.
    pub async fn kill_silo(&self, silo: &SiloId) -> Result<()> {
        {
            let mut silos = self.inner.silos.lock().await;
            let status = silos
                .get_mut(silo)
                .ok_or_else(|| IndexError::Configuration(format!("unknown silo '{}'", silo)))?;
            *status = SiloStatus::Down;
        }

        let retired: Vec<Arc<WorkflowQueue>> = {
            let mut queues = self.inner.queues.lock().await;
            let doomed: Vec<QueueAddress> = queues
                .keys()
                .filter(|address| &address.silo == silo)
                .cloned()
                .collect();
            doomed
                .iter()
                .filter_map(|address| queues.remove(address))
                .collect()
        };
        for queue in &retired {
            queue.retire();
        }

        let mut crashed = 0usize;
        {
            let mut actors = self.inner.actors.lock().await;
            for slot in actors.values_mut() {
                let on_silo = slot.live.as_ref().is_some_and(|live| live.silo() == silo);
                if on_silo {
                    if let Some(live) = slot.live.take() {
                        live.crash();
                        crashed += 1;
                    }
                }
            }
        }

        event!(
            Level::WARN,
            silo = %silo,
            queues = retired.len(),
            actors = crashed,
            "silo killed"
        );
        Ok(())
    }

    pub async fn live_silos(&self) -> Vec<SiloId> {
        self.inner.live_silos().await
    }

    /// Returns the live incarnation of an actor, activating it on its silo
    /// (or on a placed silo when it has none or that silo is down).
    ///
    /// # Errors
    ///
    /// Returns `IndexError::Configuration` when the actor type is unknown or
    /// the key is already bound to a different type.
    pub async fn actor(&self, actor_type: &str, key: impl Into<ActorKey>) -> Result<Arc<IndexedActor>> {
        let key = key.into();
        self.inner.bind_actor(actor_type, &key, None).await?;
        let actor = self.inner.live_actor(&key).await?;
        actor.activate().await?;
        Ok(actor)
    }

    /// Like `actor`, but places the actor on `silo` when it is not already
    /// live somewhere.
    pub async fn actor_on(
        &self,
        actor_type: &str,
        key: impl Into<ActorKey>,
        silo: &SiloId,
    ) -> Result<Arc<IndexedActor>> {
        let key = key.into();
        self.inner
            .bind_actor(actor_type, &key, Some(silo.clone()))
            .await?;
        let actor = self.inner.live_actor(&key).await?;
        actor.activate().await?;
        Ok(actor)
    }

    /// Gracefully deactivates the actor and moves its placement to `silo`.
    /// The next call activates it there.
    pub async fn move_actor(&self, key: &ActorKey, silo: &SiloId) -> Result<()> {
        let live = {
            let mut actors = self.inner.actors.lock().await;
            let slot = actors
                .get_mut(key)
                .ok_or_else(|| IndexError::ActorUnavailable(key.to_string()))?;
            slot.silo = Some(silo.clone());
            slot.live.take()
        };
        if let Some(live) = live {
            live.deactivate().await?;
        }
        event!(Level::INFO, actor = %key, silo = %silo, "actor moved");
        Ok(())
    }

    pub async fn deactivate_actor(&self, key: &ActorKey) -> Result<()> {
        let live = {
            let mut actors = self.inner.actors.lock().await;
            actors.get_mut(key).and_then(|slot| slot.live.take())
        };
        if let Some(live) = live {
            live.deactivate().await?;
        }
        Ok(())
    }

    /// Drops the actor's live incarnation without deactivation.
    pub async fn crash_actor(&self, key: &ActorKey) {
        let live = {
            let mut actors = self.inner.actors.lock().await;
            actors.get_mut(key).and_then(|slot| slot.live.take())
        };
        if let Some(live) = live {
            live.crash();
            event!(Level::WARN, actor = %key, silo = %live.silo(), "actor crashed");
        }
    }

    pub async fn index(&self, index_name: &str) -> Result<Arc<HashIndex>> {
        self.inner.index(index_name).await
    }

    /// Actors whose indexed value under `index_name` is `key`.
    pub async fn lookup(
        &self,
        index_name: &str,
        key: impl Into<IndexValue>,
    ) -> Result<BTreeSet<ActorKey>> {
        self.inner.index(index_name).await?.lookup(&key.into()).await
    }

    /// The live queue instance at `address`, activating it if needed.
    pub async fn queue(&self, address: &QueueAddress) -> Result<Arc<WorkflowQueue>> {
        QueueDirectory::queue(self.inner.as_ref(), address).await
    }

    pub fn queue_address_for(&self, interface: &str, actor: &ActorKey, silo: &SiloId) -> QueueAddress {
        self.inner.queue_address_for(interface, actor, silo)
    }

    pub async fn live_queues(&self) -> Vec<Arc<WorkflowQueue>> {
        self.inner.queues.lock().await.values().cloned().collect()
    }

    /// Waits until every live queue has been idle across two consecutive
    /// checks, giving spawned follow-up tasks a chance to run in between.
    pub async fn wait_for_quiescence(&self) {
        let mut settled = 0;
        while settled < 2 {
            let queues = self.live_queues().await;
            let mut all_idle = true;
            for queue in &queues {
                if !queue.is_idle().await {
                    all_idle = false;
                    queue.wait_until_idle().await;
                }
            }
            settled = if all_idle { settled + 1 } else { 0 };
            sleep(Duration::from_millis(2)).await;
        }
    }

    /// Retires every queue and actor and drops them, breaking the reference
    /// cycles between them and the cluster.
    pub async fn shutdown(&self) {
        let queues: Vec<_> = self.inner.queues.lock().await.drain().map(|(_, q)| q).collect();
        for queue in queues {
            queue.retire();
        }
        let actors: Vec<_> = self.inner.actors.lock().await.drain().map(|(_, s)| s).collect();
        for live in actors.into_iter().filter_map(|slot| slot.live) {
            live.crash();
        }
    }
}

impl ClusterInner {
    fn strong(&self) -> Result<Arc<ClusterInner>> {
        self.this
            .upgrade()
            .ok_or_else(|| IndexError::Execution("cluster has been dropped".to_string()))
    }

    async fn live_silos(&self) -> Vec<SiloId> {
        self.silos
            .lock()
            .await
            .iter()
            .filter(|(_, status)| **status == SiloStatus::Up)
            .map(|(silo, _)| silo.clone())
            .collect()
    }

    async fn is_up(&self, silo: &SiloId) -> bool {
        self.silos.lock().await.get(silo) == Some(&SiloStatus::Up)
    }

    async fn index(&self, index_name: &str) -> Result<Arc<HashIndex>> {
        self.indexes
            .lock()
            .await
            .get(index_name)
            .cloned()
            .ok_or_else(|| IndexError::IndexNotFound(index_name.to_string()))
    }

    async fn bind_actor(
        &self,
        actor_type: &str,
        key: &ActorKey,
        silo: Option<SiloId>,
    ) -> Result<()> {
        if self.registry.lock().await.actor_type(actor_type).is_none() {
            return Err(IndexError::Configuration(format!(
                "actor type '{}' is not registered",
                actor_type
            )));
        }
        let mut actors = self.actors.lock().await;
        let slot = actors.entry(key.clone()).or_insert_with(|| ActorSlot {
            actor_type: actor_type.to_string(),
            silo: None,
            live: None,
        });
        if slot.actor_type != actor_type {
            return Err(IndexError::Configuration(format!(
                "actor '{}' is a '{}', not a '{}'",
                key, slot.actor_type, actor_type
            )));
        }
        if let Some(silo) = silo {
            if slot.live.is_none() {
                slot.silo = Some(silo);
            }
        }
        Ok(())
    }

    /// The actor's live incarnation, creating one on a live silo if needed.
    /// Activation itself runs on the actor's first turn.
    async fn live_actor(&self, key: &ActorKey) -> Result<Arc<IndexedActor>> {
        let live_silos = self.live_silos().await;
        let mut actors = self.actors.lock().await;
        let slot = actors
            .get_mut(key)
            .ok_or_else(|| IndexError::ActorUnavailable(format!("unknown actor '{}'", key)))?;

        if let Some(live) = slot.live.as_ref().filter(|live| !live.is_retired()) {
            return Ok(live.clone());
        }

        let silo = match slot.silo.as_ref().filter(|silo| live_silos.contains(silo)) {
            Some(silo) => silo.clone(),
            None => {
                if live_silos.is_empty() {
                    return Err(IndexError::ActorUnavailable(format!(
                        "no live silo to place '{}'",
                        key
                    )));
                }
                let pick = partition_for(PLACEMENT_SALT, key, live_silos.len() as u32) as usize;
                live_silos[pick].clone()
            }
        };

        let actor_type = self
            .registry
            .lock()
            .await
            .actor_type(&slot.actor_type)
            .ok_or_else(|| IndexError::Configuration(slot.actor_type.clone()))?;
        let this = self.strong()?;
        let actor = Arc::new(IndexedActor::new(
            key.clone(),
            actor_type,
            silo.clone(),
            self.store.clone(),
            this.clone(),
            this,
        ));
        slot.silo = Some(silo.clone());
        slot.live = Some(actor.clone());
        event!(Level::DEBUG, actor = %key, silo = %silo, "actor placed");
        Ok(actor)
    }

    fn queue_address_for(&self, interface: &str, actor: &ActorKey, silo: &SiloId) -> QueueAddress {
        QueueAddress::new(
            silo.clone(),
            QueueId::for_actor(interface, actor, self.config.queues_per_interface),
        )
    }
}

#[async_trait]
impl IndexingDirectory for ClusterInner {
    async fn actor_ref(&self, actor: &ActorKey) -> Result<Arc<dyn IndexedActorRef>> {
        let live = self.live_actor(actor).await?;
        Ok(live as Arc<dyn IndexedActorRef>)
    }

    async fn index_ref(&self, index_name: &str) -> Result<Arc<dyn IndexBucketRef>> {
        let index = self.index(index_name).await?;
        Ok(index as Arc<dyn IndexBucketRef>)
    }

    async fn index_metadata(&self, index_name: &str) -> Option<IndexMetadata> {
        self.registry
            .lock()
            .await
            .index_metadata(index_name)
            .cloned()
    }
}

#[async_trait]
impl QueueDirectory for ClusterInner {
    fn queue_address_for(&self, interface: &str, actor: &ActorKey, silo: &SiloId) -> QueueAddress {
        ClusterInner::queue_address_for(self, interface, actor, silo)
    }

    async fn queue(&self, address: &QueueAddress) -> Result<Arc<WorkflowQueue>> {
        if !self.is_up(&address.silo).await {
            return Err(IndexError::QueueUnavailable(address.to_string()));
        }

        let owner = self
            .registry
            .lock()
            .await
            .interface_owner(address.queue.interface())
            .ok_or_else(|| {
                IndexError::Configuration(format!(
                    "interface '{}' is not registered",
                    address.queue.interface()
                ))
            })?;

        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get(address).filter(|queue| !queue.is_retired()) {
            return Ok(queue.clone());
        }

        let directory: Arc<dyn IndexingDirectory> = self.strong()?;
        let queue = WorkflowQueue::activate(
            address.clone(),
            owner.scheme.is_fault_tolerant(),
            self.config.retry.clone(),
            directory,
            self.store.clone(),
        )
        .await?;
        queues.insert(address.clone(), queue.clone());
        event!(Level::DEBUG, queue = %address, "workflow queue activated");
        Ok(queue)
    }

    fn state_store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }
}
