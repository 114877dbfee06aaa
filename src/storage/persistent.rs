use super::{ETag, StateStore};
use crate::core::{IndexError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// A typed durable state bound to one store key. Tracks the etag of the last
/// read or write so every write is an optimistic upsert.
pub struct PersistentState<T> {
    key: String,
    store: Arc<dyn StateStore>,
    state: T,
    etag: Option<ETag>,
}

impl<T> PersistentState<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Reads the state stored under `key`, or starts from `T::default()`
    /// when nothing has been written yet.
    pub async fn load(store: Arc<dyn StateStore>, key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let (state, etag) = match store.read(&key).await? {
            Some(stored) => (serde_json::from_value(stored.value)?, Some(stored.etag)),
            None => (T::default(), None),
        };
        Ok(Self {
            key,
            store,
            state,
            etag,
        })
    }

    /// A handle that starts from `T::default()` without reading the store,
    /// for state that is only written when durability is wanted.
    pub fn detached(store: Arc<dyn StateStore>, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            store,
            state: T::default(),
            etag: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn etag(&self) -> Option<ETag> {
        self.etag
    }

    pub fn state(&self) -> &T {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut T {
        &mut self.state
    }

    /// Persists the current state.
    ///
    /// # Errors
    ///
    /// Returns `IndexError::EtagMismatch` when another writer has changed the
    /// stored state since it was last read or written through this handle.
    pub async fn write(&mut self) -> Result<()> {
        let value = serde_json::to_value(&self.state)?;
        let etag = self.store.upsert(&self.key, value, self.etag).await?;
        self.etag = Some(etag);
        Ok(())
    }

    /// Persists the current state. When the write fails the in-memory state
    /// goes back to `previous`, or is re-read when another writer changed the
    /// stored state, so no unpersisted change stays visible.
    pub async fn write_or_revert(&mut self, previous: T) -> Result<()> {
        match self.write().await {
            Ok(()) => Ok(()),
            Err(err @ IndexError::EtagMismatch { .. }) => {
                self.refresh().await?;
                Err(err)
            }
            Err(err) => {
                self.state = previous;
                Err(err)
            }
        }
    }

    /// Discards in-memory changes and re-reads the stored state.
    pub async fn refresh(&mut self) -> Result<()> {
        match self.store.read(&self.key).await? {
            Some(stored) => {
                self.state = serde_json::from_value(stored.value)?;
                self.etag = Some(stored.etag);
            }
            None => {
                self.state = T::default();
                self.etag = None;
            }
        }
        Ok(())
    }
}
