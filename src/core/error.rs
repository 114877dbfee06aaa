use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("Uniqueness constraint violated on index '{index}': key {key} is held by '{existing}', rejected '{attempted}'")]
    UniquenessConstraintViolated {
        index: String,
        key: String,
        existing: String,
        attempted: String,
    },

    #[error("Invalid operation combination: {0}")]
    InvalidOperationCombination(String),

    #[error("Malformed workflow queue key '{0}'")]
    MalformedQueueKey(String),

    #[error("Workflow queue '{0}' already ends with a punctuation")]
    DoublePunctuation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Workflow queue '{0}' is unavailable")]
    QueueUnavailable(String),

    #[error("Actor '{0}' is unavailable")]
    ActorUnavailable(String),

    #[error("Index '{0}' not found")]
    IndexNotFound(String),

    #[error("ETag mismatch for '{key}': expected {expected:?}, found {actual:?}")]
    EtagMismatch {
        key: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Execution error: {0}")]
    Execution(String),
}

impl IndexError {
    /// Returns true for failures that a later retry of the same work can clear.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::QueueUnavailable(_)
                | Self::ActorUnavailable(_)
                | Self::EtagMismatch { .. }
                | Self::Storage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;

impl From<serde_json::Error> for IndexError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
