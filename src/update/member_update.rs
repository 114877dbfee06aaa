use crate::core::{IndexError, IndexValue, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of change an update makes to one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OperationType {
    #[default]
    None,
    Insert,
    Update,
    Delete,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::None => "None",
            Self::Insert => "Insert",
            Self::Update => "Update",
            Self::Delete => "Delete",
        };
        f.write_str(name)
    }
}

/// How a bucket should treat the tentative flag of the entries it touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum UpdateMode {
    /// Reserve the change without making it visible to readers.
    Tentative,
    /// Confirm the change.
    #[default]
    NonTentative,
    /// Confirm the change inside an external transaction.
    Transactional,
}

impl UpdateMode {
    pub fn is_tentative(self) -> bool {
        matches!(self, Self::Tentative)
    }
}

/// A single index change produced by one actor write: the operation and the
/// before/after images of the indexed property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberUpdate {
    operation: OperationType,
    before: Option<IndexValue>,
    after: Option<IndexValue>,
    mode: UpdateMode,
    #[serde(default)]
    reverse_tentative: bool,
}

impl MemberUpdate {
    /// Derives the operation from a pair of images. Equal images produce
    /// `OperationType::None`.
    pub fn from_images(
        before: Option<IndexValue>,
        after: Option<IndexValue>,
        mode: UpdateMode,
    ) -> Self {
        let operation = match (&before, &after) {
            (None, None) => OperationType::None,
            (None, Some(_)) => OperationType::Insert,
            (Some(_), None) => OperationType::Delete,
            (Some(b), Some(a)) if b == a => OperationType::None,
            (Some(_), Some(_)) => OperationType::Update,
        };
        let (before, after) = if operation == OperationType::None {
            (None, None)
        } else {
            (before, after)
        };
        Self {
            operation,
            before,
            after,
            mode,
            reverse_tentative: false,
        }
    }

    pub fn none() -> Self {
        Self::from_images(None, None, UpdateMode::NonTentative)
    }

    pub fn insert(after: impl Into<IndexValue>, mode: UpdateMode) -> Self {
        Self::from_images(None, Some(after.into()), mode)
    }

    pub fn delete(before: impl Into<IndexValue>, mode: UpdateMode) -> Self {
        Self::from_images(Some(before.into()), None, mode)
    }

    pub fn update(
        before: impl Into<IndexValue>,
        after: impl Into<IndexValue>,
        mode: UpdateMode,
    ) -> Self {
        Self::from_images(Some(before.into()), Some(after.into()), mode)
    }

    pub fn operation(&self) -> OperationType {
        self.operation
    }

    pub fn before_image(&self) -> Option<&IndexValue> {
        self.before.as_ref()
    }

    pub fn after_image(&self) -> Option<&IndexValue> {
        self.after.as_ref()
    }

    pub fn mode(&self) -> UpdateMode {
        self.mode
    }

    pub fn is_none(&self) -> bool {
        self.operation == OperationType::None
    }

    /// True when this update undoes an earlier tentative reservation instead
    /// of applying a change.
    pub fn is_reverse_tentative(&self) -> bool {
        self.reverse_tentative
    }

    pub fn with_mode(&self, mode: UpdateMode) -> Self {
        Self {
            mode,
            ..self.clone()
        }
    }

    /// Builds the compensator for a tentative reservation made with the same
    /// images. Buckets only act on it while the touched entries are still
    /// tentative.
    pub fn reversed_tentative(&self) -> Self {
        Self {
            mode: UpdateMode::Tentative,
            reverse_tentative: true,
            ..self.clone()
        }
    }

    /// Splits an `Update` into its insert half (the after image) and its
    /// delete half (the before image). Both halves keep the mode and the
    /// reverse-tentative flag. Other operations have no halves.
    pub fn halves(&self) -> Option<(MemberUpdate, MemberUpdate)> {
        if self.operation != OperationType::Update {
            return Option::None;
        }
        let (before, after) = (self.before.clone()?, self.after.clone()?);
        let insert = Self {
            reverse_tentative: self.reverse_tentative,
            ..Self::insert(after, self.mode)
        };
        let delete = Self {
            reverse_tentative: self.reverse_tentative,
            ..Self::delete(before, self.mode)
        };
        Some((insert, delete))
    }

    /// Composes `self` followed by `next` into the single equivalent update.
    ///
    /// The result keeps the earliest before image and the latest after image
    /// and takes the mode of `next`.
    ///
    /// # Errors
    ///
    /// Returns `IndexError::InvalidOperationCombination` for sequences that
    /// cannot happen to one property: inserting twice, inserting over an
    /// existing value, or updating/deleting after a delete.
    pub fn combine(&self, next: &MemberUpdate) -> Result<MemberUpdate> {
        use OperationType::*;

        let combined = match (self.operation, next.operation) {
            (None, _) => return Ok(next.clone()),
            (_, None) => return Ok(self.clone()),
            (Insert, Update) => Insert,
            (Insert, Delete) => None,
            (Update, Update) => Update,
            (Update, Delete) => Delete,
            (Delete, Insert) => Update,
            (first, second) => {
                return Err(IndexError::InvalidOperationCombination(format!(
                    "{} followed by {}",
                    first, second
                )));
            }
        };

        let result = match combined {
            Insert => Self::from_images(Option::None, next.after.clone(), next.mode),
            Delete => Self::from_images(self.before.clone(), Option::None, next.mode),
            Update => Self::from_images(self.before.clone(), next.after.clone(), next.mode),
            None => Self::from_images(Option::None, Option::None, next.mode),
        };
        Ok(result)
    }
}

impl fmt::Display for MemberUpdate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let show = |v: &Option<IndexValue>| match v {
            Some(v) => v.to_string(),
            Option::None => "-".to_string(),
        };
        write!(
            f,
            "{}({} -> {}, {:?}{})",
            self.operation,
            show(&self.before),
            show(&self.after),
            self.mode,
            if self.reverse_tentative { ", reverse" } else { "" }
        )
    }
}
