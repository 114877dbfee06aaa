use super::scheme::ConsistencyScheme;
use crate::core::{IndexError, Result};
use crate::workflow::address::QUEUE_KEY_SEPARATOR;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// One hash index over a single actor property.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexDefinition {
    pub name: String,
    /// Property of the actor state this index is keyed by.
    pub property: String,
    #[serde(default)]
    pub unique: bool,
    /// Applied synchronously by the writing actor instead of through a queue.
    #[serde(default)]
    pub eager: bool,
    /// Only activated actors are indexed.
    #[serde(default)]
    pub active: bool,
    /// Maximum number of keys per bucket before chaining. Falls back to
    /// `IndexingConfig::default_bucket_capacity`.
    #[serde(default)]
    pub bucket_capacity: Option<usize>,
}

impl IndexDefinition {
    pub fn new(name: impl Into<String>, property: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            property: property.into(),
            unique: false,
            eager: false,
            active: false,
            bucket_capacity: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn eager(mut self) -> Self {
        self.eager = true;
        self
    }

    pub fn active(mut self) -> Self {
        self.active = true;
        self
    }

    pub fn with_bucket_capacity(mut self, capacity: usize) -> Self {
        self.bucket_capacity = Some(capacity);
        self
    }
}

/// A group of indexes that share one workflow queue per partition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexedInterfaceDefinition {
    pub name: String,
    pub indexes: Vec<IndexDefinition>,
}

impl IndexedInterfaceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, index: IndexDefinition) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn with_indexes(mut self, indexes: Vec<IndexDefinition>) -> Self {
        self.indexes.extend(indexes);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActorTypeDefinition {
    pub name: String,
    #[serde(default)]
    pub scheme: ConsistencyScheme,
    pub interfaces: Vec<IndexedInterfaceDefinition>,
}

impl ActorTypeDefinition {
    pub fn new(name: impl Into<String>, scheme: ConsistencyScheme) -> Self {
        Self {
            name: name.into(),
            scheme,
            interfaces: Vec::new(),
        }
    }

    pub fn with_interface(mut self, interface: IndexedInterfaceDefinition) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn indexes(
        &self,
    ) -> impl Iterator<Item = (&IndexedInterfaceDefinition, &IndexDefinition)> {
        self.interfaces
            .iter()
            .flat_map(|iface| iface.indexes.iter().map(move |idx| (iface, idx)))
    }

    pub fn interface(&self, name: &str) -> Option<&IndexedInterfaceDefinition> {
        self.interfaces.iter().find(|iface| iface.name == name)
    }

    pub fn is_eager(&self) -> bool {
        self.indexes().any(|(_, idx)| idx.eager)
    }
}

/// Per-index facts a bucket needs to apply updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexMetadata {
    pub index_name: String,
    pub interface_name: String,
    pub actor_type: String,
    pub unique: bool,
    pub bucket_capacity: usize,
}

/// Validated set of indexed actor types.
#[derive(Debug, Clone, Default)]
pub struct IndexRegistry {
    actor_types: HashMap<String, Arc<ActorTypeDefinition>>,
    interfaces: HashMap<String, String>,
    indexes: HashMap<String, IndexMetadata>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers an actor type.
    ///
    /// # Errors
    ///
    /// Returns `IndexError::Configuration` for duplicate or malformed names and
    /// for index layouts the type's consistency scheme forbids.
    pub fn register(
        &mut self,
        actor_type: ActorTypeDefinition,
        default_bucket_capacity: usize,
    ) -> Result<Arc<ActorTypeDefinition>> {
        if actor_type.name.trim().is_empty() {
            return Err(IndexError::Configuration(
                "actor type name must not be empty".to_string(),
            ));
        }
        if self.actor_types.contains_key(&actor_type.name) {
            return Err(IndexError::Configuration(format!(
                "actor type '{}' is already registered",
                actor_type.name
            )));
        }

        for iface in &actor_type.interfaces {
            if iface.name.trim().is_empty() || iface.name.contains(QUEUE_KEY_SEPARATOR) {
                return Err(IndexError::Configuration(format!(
                    "interface name '{}' must be non-empty and must not contain '{}'",
                    iface.name, QUEUE_KEY_SEPARATOR
                )));
            }
            if let Some(owner) = self.interfaces.get(&iface.name) {
                return Err(IndexError::Configuration(format!(
                    "interface '{}' is already registered by actor type '{}'",
                    iface.name, owner
                )));
            }
        }

        let mut pending = HashMap::new();
        for (iface, idx) in actor_type.indexes() {
            if idx.name.trim().is_empty() {
                return Err(IndexError::Configuration(format!(
                    "index on property '{}' has an empty name",
                    idx.property
                )));
            }
            if self.indexes.contains_key(&idx.name) || pending.contains_key(&idx.name) {
                return Err(IndexError::Configuration(format!(
                    "index '{}' is already registered",
                    idx.name
                )));
            }
            let bucket_capacity = idx.bucket_capacity.unwrap_or(default_bucket_capacity);
            if bucket_capacity == 0 {
                return Err(IndexError::Configuration(format!(
                    "index '{}' has a zero bucket capacity",
                    idx.name
                )));
            }
            pending.insert(
                idx.name.clone(),
                IndexMetadata {
                    index_name: idx.name.clone(),
                    interface_name: iface.name.clone(),
                    actor_type: actor_type.name.clone(),
                    unique: idx.unique,
                    bucket_capacity,
                },
            );
        }

        actor_type.scheme.validate(&actor_type)?;

        self.indexes.extend(pending);
        for iface in &actor_type.interfaces {
            self.interfaces
                .insert(iface.name.clone(), actor_type.name.clone());
        }
        let actor_type = Arc::new(actor_type);
        self.actor_types
            .insert(actor_type.name.clone(), actor_type.clone());
        Ok(actor_type)
    }

    pub fn actor_type(&self, name: &str) -> Option<Arc<ActorTypeDefinition>> {
        self.actor_types.get(name).cloned()
    }

    /// The actor type that declared `interface`.
    pub fn interface_owner(&self, interface: &str) -> Option<Arc<ActorTypeDefinition>> {
        self.interfaces
            .get(interface)
            .and_then(|owner| self.actor_type(owner))
    }

    pub fn index_metadata(&self, index_name: &str) -> Option<&IndexMetadata> {
        self.indexes.get(index_name)
    }

    pub fn index_names(&self) -> impl Iterator<Item = &str> {
        self.indexes.keys().map(String::as_str)
    }
}
