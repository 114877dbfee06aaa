pub mod error;
pub mod types;
pub mod value;

pub use error::{IndexError, Result};
pub use types::{ActorKey, SiloId, WorkflowId};
pub use value::IndexValue;
