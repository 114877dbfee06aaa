pub mod policy;
pub mod registry;
pub mod scheme;

pub use policy::{IndexingConfig, WorkflowRetryPolicy};
pub use registry::{
    ActorTypeDefinition, IndexDefinition, IndexMetadata, IndexRegistry,
    IndexedInterfaceDefinition,
};
pub use scheme::ConsistencyScheme;
