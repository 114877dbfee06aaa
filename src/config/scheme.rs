use super::registry::ActorTypeDefinition;
use crate::core::{IndexError, Result};
use serde::{Deserialize, Serialize};

/// Consistency scheme of an indexed actor type. Fixed when the type is
/// registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConsistencyScheme {
    /// Workflow indexing without active-workflow bookkeeping. Indexes may be
    /// eager or lazy.
    #[default]
    Workflow,
    /// Lazy workflow indexing that tracks every in-flight workflow in the
    /// actor's durable state and reconciles it on reactivation.
    FaultTolerantWorkflow,
    /// Workflow indexing with no durable bookkeeping; queue contents are lost
    /// with the queue instance.
    NonFaultTolerantWorkflow,
    /// Eager indexing inside an external transaction.
    Transactional,
}

impl ConsistencyScheme {
    pub fn is_fault_tolerant(self) -> bool {
        matches!(self, Self::FaultTolerantWorkflow)
    }

    pub fn is_transactional(self) -> bool {
        matches!(self, Self::Transactional)
    }

    /// Whether activation and deactivation maintain active indexes.
    pub fn supports_active_indexes(self) -> bool {
        matches!(self, Self::Workflow | Self::NonFaultTolerantWorkflow)
    }

    /// Checks an actor type's index layout against this scheme.
    ///
    /// # Errors
    ///
    /// Returns `IndexError::Configuration` when the type mixes eager and lazy
    /// indexes, declares eager indexes under a fault-tolerant scheme, declares
    /// lazy indexes under the transactional scheme, or declares active indexes
    /// where the scheme does not maintain them.
    pub fn validate(self, actor_type: &ActorTypeDefinition) -> Result<()> {
        let indexes: Vec<_> = actor_type.indexes().collect();
        if indexes.is_empty() {
            return Ok(());
        }

        let eager = indexes.iter().filter(|(_, idx)| idx.eager).count();
        if eager != 0 && eager != indexes.len() {
            return Err(IndexError::Configuration(format!(
                "actor type '{}' mixes eager and lazy indexes",
                actor_type.name
            )));
        }

        if !self.supports_active_indexes() {
            if let Some((_, idx)) = indexes.iter().find(|(_, idx)| idx.active) {
                return Err(IndexError::Configuration(format!(
                    "index '{}' of actor type '{}' is active, which {:?} does not allow",
                    idx.name, actor_type.name, self
                )));
            }
        }

        match self {
            Self::FaultTolerantWorkflow if eager != 0 => Err(IndexError::Configuration(format!(
                "actor type '{}' uses {:?} and cannot declare eager indexes",
                actor_type.name, self
            ))),
            Self::Transactional if eager == 0 => Err(IndexError::Configuration(format!(
                "actor type '{}' uses {:?} and requires eager indexes",
                actor_type.name, self
            ))),
            _ => Ok(()),
        }
    }
}
