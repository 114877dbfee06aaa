use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Pending, reader-invisible change recorded on a bucket entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TentativeOperation {
    #[default]
    None,
    Delete,
    Insert,
}

/// Value set stored under one key of a hash index bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "V: Serialize + Ord",
    deserialize = "V: Deserialize<'de> + Ord"
))]
pub struct HashIndexBucketEntry<V> {
    values: BTreeSet<V>,
    tentative: TentativeOperation,
}

impl<V: Ord> Default for HashIndexBucketEntry<V> {
    fn default() -> Self {
        Self {
            values: BTreeSet::new(),
            tentative: TentativeOperation::None,
        }
    }
}

impl<V: Ord + Clone> HashIndexBucketEntry<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self) -> &BTreeSet<V> {
        &self.values
    }

    pub fn contains(&self, value: &V) -> bool {
        self.values.contains(value)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn tentative(&self) -> TentativeOperation {
        self.tentative
    }

    pub fn is_tentative(&self) -> bool {
        self.tentative != TentativeOperation::None
    }

    /// Values a reader may observe. A tentative insert is not visible yet; a
    /// tentative delete is still visible until confirmed.
    pub fn visible_values(&self) -> BTreeSet<V> {
        match self.tentative {
            TentativeOperation::Insert => BTreeSet::new(),
            _ => self.values.clone(),
        }
    }

    pub fn add(&mut self, value: V, tentative: bool) {
        self.values.insert(value);
        if tentative {
            self.set_tentative_insert();
        } else {
            self.clear_tentative();
        }
    }

    /// A tentative remove keeps the value and marks it as pending deletion.
    pub fn remove(&mut self, value: &V, tentative: bool) {
        if tentative {
            self.set_tentative_delete();
        } else {
            self.values.remove(value);
            self.clear_tentative();
        }
    }

    pub fn set_tentative_insert(&mut self) {
        self.tentative = TentativeOperation::Insert;
    }

    pub fn set_tentative_delete(&mut self) {
        self.tentative = TentativeOperation::Delete;
    }

    pub fn clear_tentative(&mut self) {
        self.tentative = TentativeOperation::None;
    }
}
