pub mod entry;
pub mod single;
pub mod state;

pub use entry::{HashIndexBucketEntry, TentativeOperation};
pub use single::{ActorBucketState, HashIndexBucket};
pub use state::{BucketApply, BucketOutcome, BucketUpdate, HashIndexBucketState, IndexStatus};

use crate::config::IndexMetadata;
use crate::core::{ActorKey, IndexError, IndexValue, Result, SiloId};
use crate::storage::StateStore;
use crate::update::{MemberUpdate, UpdateMode};
use async_trait::async_trait;
use log::warn;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{Level, event};

/// Downstream contract of the index-maintenance pipeline. Both apply calls
/// must be safe to re-invoke after a partial failure.
#[async_trait]
pub trait IndexBucketRef: Send + Sync {
    /// Applies every update of every actor, in per-actor order.
    ///
    /// Returns `false` when some update was rejected by the uniqueness
    /// constraint; the remaining updates are still applied.
    async fn apply_index_update_batch(
        &self,
        index_name: &str,
        updates: BTreeMap<ActorKey, Vec<MemberUpdate>>,
        is_unique: bool,
        metadata: &IndexMetadata,
        origin: &SiloId,
    ) -> Result<bool>;

    /// Applies a single update and surfaces uniqueness violations as errors.
    async fn apply_index_update(
        &self,
        actor: &ActorKey,
        update: MemberUpdate,
        is_unique: bool,
        metadata: &IndexMetadata,
        origin: &SiloId,
    ) -> Result<bool>;

    /// Actors visible under `key`.
    async fn lookup(&self, key: &IndexValue) -> Result<BTreeSet<ActorKey>>;
}

/// A hash index: a chain of buckets for one index name.
pub struct HashIndex {
    metadata: Arc<IndexMetadata>,
    root: Arc<HashIndexBucket>,
    deleted_during_construction: Mutex<BTreeSet<(IndexValue, ActorKey)>>,
}

impl HashIndex {
    pub async fn open(metadata: IndexMetadata, store: Arc<dyn StateStore>) -> Result<Self> {
        let metadata = Arc::new(metadata);
        let root = HashIndexBucket::open(metadata.clone(), store, 0).await?;
        Ok(Self {
            metadata,
            root,
            deleted_during_construction: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    /// Applies one update to the chain. An `Update` is applied as its insert
    /// half followed by its delete half, because the before and after keys
    /// can live in different buckets: the insert half finds (and checks) the
    /// after key wherever it lives, and a replay finds both halves settled.
    async fn apply_to_chain(
        &self,
        actor: &ActorKey,
        update: &MemberUpdate,
        unique: bool,
    ) -> Result<()> {
        match update.halves() {
            Some((insert, delete)) => {
                self.apply_along_chain(actor, &insert, unique).await?;
                self.apply_along_chain(actor, &delete, unique).await
            }
            None => self.apply_along_chain(actor, update, unique).await,
        }
    }

    async fn apply_along_chain(
        &self,
        actor: &ActorKey,
        update: &MemberUpdate,
        unique: bool,
    ) -> Result<()> {
        let mut bucket = self.root.clone();
        loop {
            let applied = bucket.apply_local(actor, update, unique).await?;
            match applied.outcome {
                BucketOutcome::Applied => {
                    if applied.deleted_while_unavailable {
                        if let Some(before) = update.before_image() {
                            self.deleted_during_construction
                                .lock()
                                .await
                                .insert((before.clone(), actor.clone()));
                        }
                    }
                    return Ok(());
                }
                BucketOutcome::RouteToNextBucket => {
                    bucket = bucket.next_or_create().await?;
                }
            }
        }
    }

    async fn buckets(&self) -> Result<Vec<Arc<HashIndexBucket>>> {
        let mut buckets = vec![self.root.clone()];
        let mut current = self.root.clone();
        while let Some(next) = current.next().await? {
            buckets.push(next.clone());
            current = next;
        }
        Ok(buckets)
    }

    pub async fn status(&self) -> IndexStatus {
        self.root.status().await
    }

    pub async fn bucket_count(&self) -> Result<usize> {
        Ok(self.buckets().await?.len())
    }

    pub async fn snapshot(&self) -> Result<Vec<ActorBucketState>> {
        let mut states = Vec::new();
        for bucket in self.buckets().await? {
            states.push(bucket.snapshot().await);
        }
        Ok(states)
    }

    /// Marks the whole chain as under construction.
    pub async fn begin_construction(&self) -> Result<()> {
        for bucket in self.buckets().await? {
            bucket.set_status(IndexStatus::UnderConstruction).await?;
        }
        Ok(())
    }

    /// Inserts a value discovered by an index builder. Values deleted by a
    /// writer since construction began are skipped so the builder cannot
    /// resurrect them.
    pub async fn insert_during_construction(
        &self,
        actor: &ActorKey,
        key: IndexValue,
    ) -> Result<bool> {
        let deleted = self
            .deleted_during_construction
            .lock()
            .await
            .contains(&(key.clone(), actor.clone()));
        if deleted {
            event!(
                Level::DEBUG,
                index = %self.metadata.index_name,
                actor = %actor,
                "skipping builder insert deleted during construction"
            );
            return Ok(false);
        }
        let update = MemberUpdate::insert(key, UpdateMode::NonTentative);
        self.apply_to_chain(actor, &update, self.metadata.unique)
            .await?;
        Ok(true)
    }

    /// Ends construction: every bucket becomes available and the recorded
    /// deletes are forgotten.
    pub async fn mark_available(&self) -> Result<()> {
        for bucket in self.buckets().await? {
            bucket.set_status(IndexStatus::Available).await?;
        }
        self.deleted_during_construction.lock().await.clear();
        Ok(())
    }

    fn check_index_name(&self, index_name: &str) -> Result<()> {
        if index_name != self.metadata.index_name {
            return Err(IndexError::IndexNotFound(format!(
                "{} (bucket chain belongs to '{}')",
                index_name, self.metadata.index_name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl IndexBucketRef for HashIndex {
    async fn apply_index_update_batch(
        &self,
        index_name: &str,
        updates: BTreeMap<ActorKey, Vec<MemberUpdate>>,
        is_unique: bool,
        _metadata: &IndexMetadata,
        origin: &SiloId,
    ) -> Result<bool> {
        self.check_index_name(index_name)?;

        let mut all_applied = true;
        for (actor, actor_updates) in &updates {
            for update in actor_updates {
                match self.apply_to_chain(actor, update, is_unique).await {
                    Ok(()) => {}
                    Err(err @ IndexError::UniquenessConstraintViolated { .. }) => {
                        all_applied = false;
                        warn!(
                            "index batch update rejected: index='{}' actor='{}' update='{}' origin='{}' error='{}'",
                            index_name, actor, update, origin, err
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(all_applied)
    }

    async fn apply_index_update(
        &self,
        actor: &ActorKey,
        update: MemberUpdate,
        is_unique: bool,
        metadata: &IndexMetadata,
        origin: &SiloId,
    ) -> Result<bool> {
        self.check_index_name(&metadata.index_name)?;
        event!(
            Level::TRACE,
            index = %metadata.index_name,
            actor = %actor,
            origin = %origin,
            update = %update,
            "applying index update"
        );
        self.apply_to_chain(actor, &update, is_unique).await?;
        Ok(true)
    }

    async fn lookup(&self, key: &IndexValue) -> Result<BTreeSet<ActorKey>> {
        let mut found = BTreeSet::new();
        for bucket in self.buckets().await? {
            found.extend(bucket.lookup_local(key).await);
        }
        Ok(found)
    }
}
