use super::state::{BucketApply, BucketOutcome, HashIndexBucketState, IndexStatus};
use crate::config::IndexMetadata;
use crate::core::{ActorKey, IndexValue, Result};
use crate::storage::{PersistentState, StateStore};
use crate::update::MemberUpdate;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{Level, event};

pub type ActorBucketState = HashIndexBucketState<IndexValue, ActorKey>;

struct BucketInner {
    state: PersistentState<ActorBucketState>,
    next: Option<Arc<HashIndexBucket>>,
}

/// One durable bucket of a hash index chain.
///
/// All mutation happens inside the bucket's lock. A failed write reloads the
/// last durable state so the update can be retried from scratch.
pub struct HashIndexBucket {
    key: String,
    sequence: u32,
    metadata: Arc<IndexMetadata>,
    store: Arc<dyn StateStore>,
    inner: Mutex<BucketInner>,
}

impl HashIndexBucket {
    pub(crate) fn storage_key(index_name: &str, sequence: u32) -> String {
        format!("index-bucket/{}/{}", index_name, sequence)
    }

    pub(crate) async fn open(
        metadata: Arc<IndexMetadata>,
        store: Arc<dyn StateStore>,
        sequence: u32,
    ) -> Result<Arc<Self>> {
        let key = Self::storage_key(&metadata.index_name, sequence);
        let state = PersistentState::load(store.clone(), key.clone()).await?;
        Ok(Arc::new(Self {
            key,
            sequence,
            metadata,
            store,
            inner: Mutex::new(BucketInner { state, next: None }),
        }))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub(crate) async fn apply_local(
        &self,
        actor: &ActorKey,
        update: &MemberUpdate,
        unique: bool,
    ) -> Result<BucketApply> {
        let mut inner = self.inner.lock().await;
        let previous = inner.state.state().clone();
        let applied = inner.state.state_mut().apply(
            &self.metadata.index_name,
            actor,
            update.into(),
            unique,
            self.metadata.bucket_capacity,
        )?;

        if applied.outcome == BucketOutcome::Applied {
            if let Err(err) = inner.state.write_or_revert(previous).await {
                event!(
                    Level::WARN,
                    bucket = %self.key,
                    error = %err,
                    "bucket write failed, update not applied"
                );
                return Err(err);
            }
        }
        Ok(applied)
    }

    /// Returns the chained bucket, creating and linking it when this bucket
    /// has none yet.
    pub(crate) async fn next_or_create(&self) -> Result<Arc<HashIndexBucket>> {
        let mut inner = self.inner.lock().await;
        if let Some(next) = inner.next.as_ref() {
            return Ok(next.clone());
        }

        let sequence = self.sequence.saturating_add(1);
        if inner.state.state().next_bucket.is_none() {
            let status = inner.state.state().status;
            inner.state.state_mut().next_bucket =
                Some(Self::storage_key(&self.metadata.index_name, sequence));
            if let Err(err) = inner.state.write().await {
                inner.state.refresh().await?;
                return Err(err);
            }
            event!(
                Level::DEBUG,
                bucket = %self.key,
                sequence,
                "chained a new index bucket"
            );
            let next = Self::open(self.metadata.clone(), self.store.clone(), sequence).await?;
            next.set_status(status).await?;
            inner.next = Some(next.clone());
            return Ok(next);
        }

        let next = Self::open(self.metadata.clone(), self.store.clone(), sequence).await?;
        inner.next = Some(next.clone());
        Ok(next)
    }

    /// The chained bucket, if one has been linked.
    pub(crate) async fn next(&self) -> Result<Option<Arc<HashIndexBucket>>> {
        let linked = self.inner.lock().await.state.state().next_bucket.is_some();
        if linked {
            Ok(Some(self.next_or_create().await?))
        } else {
            Ok(None)
        }
    }

    pub(crate) async fn lookup_local(&self, key: &IndexValue) -> BTreeSet<ActorKey> {
        self.inner.lock().await.state.state().lookup(key)
    }

    pub(crate) async fn status(&self) -> IndexStatus {
        self.inner.lock().await.state.state().status
    }

    pub(crate) async fn set_status(&self, status: IndexStatus) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state.state().status == status {
            return Ok(());
        }
        inner.state.state_mut().status = status;
        if let Err(err) = inner.state.write().await {
            inner.state.refresh().await?;
            return Err(err);
        }
        Ok(())
    }

    pub(crate) async fn snapshot(&self) -> ActorBucketState {
        self.inner.lock().await.state.state().clone()
    }
}
