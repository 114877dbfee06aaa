use super::{ETag, StateStore, StoredState, check_etag};
use crate::core::{IndexError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// In-memory state store, shared by cloning.
///
/// Can be switched offline to simulate a storage outage.
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    entries: Arc<Mutex<HashMap<String, StoredState>>>,
    offline: Arc<AtomicBool>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every read and write fails with `IndexError::Storage`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn keys(&self) -> Vec<String> {
        let entries = self.entries.lock().await;
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn ensure_online(&self, key: &str) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(IndexError::Storage(format!(
                "state store is offline (key '{}')",
                key
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn read(&self, key: &str) -> Result<Option<StoredState>> {
        self.ensure_online(key)?;
        let entries = self.entries.lock().await;
        Ok(entries.get(key).cloned())
    }

    async fn upsert(
        &self,
        key: &str,
        value: serde_json::Value,
        expected: Option<ETag>,
    ) -> Result<ETag> {
        self.ensure_online(key)?;
        let mut entries = self.entries.lock().await;
        let actual = entries.get(key).map(|stored| stored.etag);
        check_etag(key, expected, actual)?;

        let etag = actual.map(ETag::next).unwrap_or_else(ETag::initial);
        entries.insert(key.to_string(), StoredState { etag, value });
        Ok(etag)
    }
}
