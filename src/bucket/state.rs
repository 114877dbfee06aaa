use super::entry::{HashIndexBucketEntry, TentativeOperation};
use crate::core::{IndexError, IndexValue, Result};
use crate::update::{MemberUpdate, OperationType};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IndexStatus {
    UnderConstruction,
    #[default]
    Available,
}

/// Durable state of one bucket in a hash index chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize + Ord, V: Serialize + Ord",
    deserialize = "K: Deserialize<'de> + Ord, V: Deserialize<'de> + Ord"
))]
pub struct HashIndexBucketState<K, V> {
    #[serde(serialize_with = "entries_as_pairs", deserialize_with = "entries_from_pairs")]
    entries: BTreeMap<K, HashIndexBucketEntry<V>>,
    pub status: IndexStatus,
    /// Store key of the chained bucket, set once this bucket has filled up.
    pub next_bucket: Option<String>,
}

impl<K: Ord, V: Ord> Default for HashIndexBucketState<K, V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            status: IndexStatus::Available,
            next_bucket: None,
        }
    }
}

fn entries_as_pairs<S, K, V>(
    entries: &BTreeMap<K, HashIndexBucketEntry<V>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
    K: Serialize + Ord,
    V: Serialize + Ord,
{
    serializer.collect_seq(entries.iter())
}

fn entries_from_pairs<'de, D, K, V>(
    deserializer: D,
) -> std::result::Result<BTreeMap<K, HashIndexBucketEntry<V>>, D::Error>
where
    D: Deserializer<'de>,
    K: Deserialize<'de> + Ord,
    V: Deserialize<'de> + Ord,
{
    let pairs = Vec::<(K, HashIndexBucketEntry<V>)>::deserialize(deserializer)?;
    Ok(pairs.into_iter().collect())
}

/// The images of one update as seen by a bucket.
#[derive(Debug, Clone, Copy)]
pub struct BucketUpdate<'a, K> {
    pub operation: OperationType,
    pub before: Option<&'a K>,
    pub after: Option<&'a K>,
    pub tentative: bool,
    pub reverse_tentative: bool,
}

impl<'a> From<&'a MemberUpdate> for BucketUpdate<'a, IndexValue> {
    fn from(update: &'a MemberUpdate) -> Self {
        Self {
            operation: update.operation(),
            before: update.before_image(),
            after: update.after_image(),
            tentative: update.mode().is_tentative(),
            reverse_tentative: update.is_reverse_tentative(),
        }
    }
}

/// What a bucket did with an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketOutcome {
    Applied,
    /// The update belongs to the chained bucket.
    RouteToNextBucket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketApply {
    pub outcome: BucketOutcome,
    /// A value was deleted while the index was still under construction.
    pub deleted_while_unavailable: bool,
}

impl BucketApply {
    fn applied() -> Self {
        Self {
            outcome: BucketOutcome::Applied,
            deleted_while_unavailable: false,
        }
    }

    fn next_bucket() -> Self {
        Self {
            outcome: BucketOutcome::RouteToNextBucket,
            deleted_while_unavailable: false,
        }
    }
}

impl<K, V> HashIndexBucketState<K, V>
where
    K: Ord + Clone + Display,
    V: Ord + Clone + Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, key: &K) -> Option<&HashIndexBucketEntry<V>> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&K, &HashIndexBucketEntry<V>)> {
        self.entries.iter()
    }

    /// Values visible to readers under `key`.
    pub fn lookup(&self, key: &K) -> BTreeSet<V> {
        self.entries
            .get(key)
            .map(HashIndexBucketEntry::visible_values)
            .unwrap_or_default()
    }

    /// Applies one update for `value` to this bucket.
    ///
    /// `capacity` bounds the number of keys this bucket creates; new keys
    /// beyond it are routed to the chained bucket. Once a bucket has a
    /// successor, an `Update` is only applied here when its after key is
    /// local; a chain applies updates as their insert and delete halves
    /// (`MemberUpdate::halves`) so each half finds its own bucket.
    ///
    /// # Errors
    ///
    /// Returns `IndexError::UniquenessConstraintViolated` when `unique` is set
    /// and the target key is already held by a different value. The bucket is
    /// left unchanged in that case.
    pub fn apply(
        &mut self,
        index_name: &str,
        value: &V,
        update: BucketUpdate<'_, K>,
        unique: bool,
        capacity: usize,
    ) -> Result<BucketApply> {
        if update.reverse_tentative {
            return Ok(self.reverse_tentative(value, update));
        }

        match (update.operation, update.before, update.after) {
            (OperationType::Insert, _, Some(after)) => {
                self.insert(index_name, value, after, update.tentative, unique, capacity)
            }
            (OperationType::Delete, Some(before), _) => {
                Ok(self.delete(value, before, update.tentative))
            }
            (OperationType::Update, Some(before), Some(after)) if before == after => {
                self.insert(index_name, value, after, update.tentative, unique, capacity)
            }
            (OperationType::Update, Some(before), Some(after)) => {
                self.update(index_name, value, before, after, update.tentative, unique, capacity)
            }
            _ => Ok(BucketApply::applied()),
        }
    }

    fn insert(
        &mut self,
        index_name: &str,
        value: &V,
        after: &K,
        tentative: bool,
        unique: bool,
        capacity: usize,
    ) -> Result<BucketApply> {
        match self.entries.get_mut(after) {
            Some(entry) if entry.contains(value) => {
                if tentative {
                    entry.set_tentative_insert();
                } else {
                    entry.clear_tentative();
                }
            }
            Some(entry) => {
                if unique && !entry.is_empty() {
                    return Err(uniqueness_violation(index_name, after, entry, value));
                }
                entry.add(value.clone(), tentative);
            }
            None => {
                if self.next_bucket.is_some() || self.entries.len() >= capacity {
                    return Ok(BucketApply::next_bucket());
                }
                let mut entry = HashIndexBucketEntry::new();
                entry.add(value.clone(), tentative);
                self.entries.insert(after.clone(), entry);
            }
        }
        Ok(BucketApply::applied())
    }

    fn delete(&mut self, value: &V, before: &K, tentative: bool) -> BucketApply {
        let found = match self.entries.get_mut(before) {
            Some(entry) if entry.contains(value) => {
                entry.remove(value, tentative);
                true
            }
            _ => false,
        };

        if !found {
            return if self.next_bucket.is_some() {
                BucketApply::next_bucket()
            } else {
                BucketApply::applied()
            };
        }

        self.prune(before);
        BucketApply {
            outcome: BucketOutcome::Applied,
            deleted_while_unavailable: !tentative && self.status != IndexStatus::Available,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn update(
        &mut self,
        index_name: &str,
        value: &V,
        before: &K,
        after: &K,
        tentative: bool,
        unique: bool,
        capacity: usize,
    ) -> Result<BucketApply> {
        if let Some(entry) = self.entries.get_mut(after) {
            if entry.contains(value) {
                // membership already moved; only the flags settle
                if tentative {
                    entry.set_tentative_insert();
                } else {
                    entry.clear_tentative();
                    self.remove_from(before, value, false);
                }
                return Ok(BucketApply::applied());
            }
        }

        let before_holds_value = self
            .entries
            .get(before)
            .is_some_and(|entry| entry.contains(value));

        if !before_holds_value {
            if self.next_bucket.is_some() {
                return Ok(BucketApply::next_bucket());
            }
            return self.insert(index_name, value, after, tentative, unique, capacity);
        }

        match self.entries.get_mut(after) {
            Some(entry) => {
                if unique && !entry.is_empty() {
                    return Err(uniqueness_violation(index_name, after, entry, value));
                }
                entry.add(value.clone(), tentative);
                self.remove_from(before, value, tentative);
            }
            None if self.next_bucket.is_some() => {
                // a later bucket may hold the after key; callers split the update
                return Ok(BucketApply::next_bucket());
            }
            None => {
                // capacity is soft here: the key moves within the last bucket
                let mut entry = HashIndexBucketEntry::new();
                entry.add(value.clone(), tentative);
                self.entries.insert(after.clone(), entry);
                self.remove_from(before, value, tentative);
            }
        }
        Ok(BucketApply::applied())
    }

    /// Undoes a tentative reservation, touching only entries that still carry
    /// the matching tentative flag.
    fn reverse_tentative(&mut self, value: &V, update: BucketUpdate<'_, K>) -> BucketApply {
        let mut found = false;

        if let (OperationType::Insert | OperationType::Update, Some(after)) =
            (update.operation, update.after)
        {
            if let Some(entry) = self.entries.get_mut(after) {
                if entry.contains(value) {
                    found = true;
                    if entry.tentative() == TentativeOperation::Insert {
                        entry.remove(value, false);
                    }
                }
            }
            self.prune(after);
        }

        if let (OperationType::Delete | OperationType::Update, Some(before)) =
            (update.operation, update.before)
        {
            if let Some(entry) = self.entries.get_mut(before) {
                if entry.contains(value) {
                    found = true;
                    if entry.tentative() == TentativeOperation::Delete {
                        entry.clear_tentative();
                    }
                }
            }
        }

        if !found && self.next_bucket.is_some() {
            BucketApply::next_bucket()
        } else {
            BucketApply::applied()
        }
    }

    fn remove_from(&mut self, key: &K, value: &V, tentative: bool) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.remove(value, tentative);
        }
        self.prune(key);
    }

    fn prune(&mut self, key: &K) {
        if self.entries.get(key).is_some_and(HashIndexBucketEntry::is_empty) {
            self.entries.remove(key);
        }
    }
}

fn uniqueness_violation<K: Display, V: Ord + Clone + Display>(
    index_name: &str,
    key: &K,
    entry: &HashIndexBucketEntry<V>,
    attempted: &V,
) -> IndexError {
    let existing = entry
        .values()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    IndexError::UniquenessConstraintViolated {
        index: index_name.to_string(),
        key: key.to_string(),
        existing,
        attempted: attempted.to_string(),
    }
}
