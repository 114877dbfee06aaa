pub mod file;
pub mod memory;
pub mod persistent;

pub use file::FileStateStore;
pub use memory::InMemoryStateStore;
pub use persistent::PersistentState;

use crate::core::{IndexError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Version tag of a stored state, used for optimistic concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ETag(u64);

impl ETag {
    pub fn initial() -> Self {
        Self(1)
    }

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "W/{}", self.0)
    }
}

/// A stored document together with its current version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredState {
    pub etag: ETag,
    pub value: serde_json::Value,
}

/// Durable key/value storage with upsert-with-etag semantics.
///
/// `upsert` with `expected = None` only succeeds when the key does not exist
/// yet; with `Some(etag)` it only succeeds when the stored version still
/// matches. Either way a mismatch yields `IndexError::EtagMismatch`.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<StoredState>>;

    async fn upsert(
        &self,
        key: &str,
        value: serde_json::Value,
        expected: Option<ETag>,
    ) -> Result<ETag>;
}

pub(crate) fn check_etag(key: &str, expected: Option<ETag>, actual: Option<ETag>) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(IndexError::EtagMismatch {
            key: key.to_string(),
            expected: expected.map(ETag::value),
            actual: actual.map(ETag::value),
        })
    }
}
