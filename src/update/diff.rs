use super::member_update::{MemberUpdate, UpdateMode};
use crate::config::IndexedInterfaceDefinition;
use crate::core::{IndexValue, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Indexed properties of an actor. A missing entry is an absent image.
pub type PropertyMap = BTreeMap<String, IndexValue>;

/// Updates keyed by index name.
pub type IndexUpdates = BTreeMap<String, MemberUpdate>;

/// One step of an actor write: set or clear a property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyChange {
    pub property: String,
    pub value: Option<IndexValue>,
}

impl PropertyChange {
    pub fn set(property: impl Into<String>, value: impl Into<IndexValue>) -> Self {
        Self {
            property: property.into(),
            value: Some(value.into()),
        }
    }

    pub fn clear(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            value: None,
        }
    }
}

/// Diffs two property images into one update per changed index of the
/// interface.
pub fn diff_interface(
    iface: &IndexedInterfaceDefinition,
    before: &PropertyMap,
    after: &PropertyMap,
    mode: UpdateMode,
) -> IndexUpdates {
    iface
        .indexes
        .iter()
        .filter_map(|idx| {
            let update = MemberUpdate::from_images(
                before.get(&idx.property).cloned(),
                after.get(&idx.property).cloned(),
                mode,
            );
            (!update.is_none()).then(|| (idx.name.clone(), update))
        })
        .collect()
}

/// Applies a sequence of changes to `current` and folds the per-step index
/// updates with `MemberUpdate::combine`, yielding the new property image and
/// a single net update per index of the interface.
///
/// # Errors
///
/// Propagates combination errors; these indicate a corrupted step sequence.
pub fn fold_changes(
    iface: &IndexedInterfaceDefinition,
    current: &PropertyMap,
    changes: &[PropertyChange],
    mode: UpdateMode,
) -> Result<(PropertyMap, IndexUpdates)> {
    let mut image = current.clone();
    let mut net: IndexUpdates = BTreeMap::new();

    for change in changes {
        let mut next = image.clone();
        match &change.value {
            Some(value) => {
                next.insert(change.property.clone(), value.clone());
            }
            None => {
                next.remove(&change.property);
            }
        }

        for (index, step) in diff_interface(iface, &image, &next, mode) {
            let combined = match net.remove(&index) {
                Some(previous) => previous.combine(&step)?,
                None => step,
            };
            if !combined.is_none() {
                net.insert(index, combined);
            }
        }
        image = next;
    }

    Ok((image, net))
}

/// Updates that add an actor to (or remove it from) the active indexes of an
/// interface, used on activation and deactivation.
pub fn active_index_updates(
    iface: &IndexedInterfaceDefinition,
    properties: &PropertyMap,
    activating: bool,
    mode: UpdateMode,
) -> IndexUpdates {
    iface
        .indexes
        .iter()
        .filter(|idx| idx.active)
        .filter_map(|idx| {
            let value = properties.get(&idx.property).cloned()?;
            let update = if activating {
                MemberUpdate::from_images(None, Some(value), mode)
            } else {
                MemberUpdate::from_images(Some(value), None, mode)
            };
            Some((idx.name.clone(), update))
        })
        .collect()
}
