use thiserror::Error;

/// Errors surfaced by object storage operations.
///
/// Every variant maps onto one [`ErrorKind`]; callers that only care about the
/// category should match on [`ObjectStorageError::kind`].
#[derive(Debug, Error)]
pub enum ObjectStorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("batch operation partially failed ({} objects left behind): {reason}", .failed.len())]
    PartialBatchFailure { failed: Vec<String>, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("writer pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("object storage is shut down: {0}")]
    Shutdown(String),
}

/// Category of an [`ObjectStorageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The object was absent where presence was required.
    NotFound,
    /// Write mode conflict, e.g. a second write into a write-once backend.
    AlreadyExists,
    /// The operation has no meaning for this backend.
    Unsupported,
    /// Network, auth, or backend-side failure.
    Transport,
    /// A batch operation partially succeeded.
    PartialBatchFailure,
    /// Invalid settings or configuration.
    Configuration,
}

impl ObjectStorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::Unsupported(_) | Self::Shutdown(_) => ErrorKind::Unsupported,
            Self::PartialBatchFailure { .. } => ErrorKind::PartialBatchFailure,
            Self::Configuration(_) | Self::Serialization(_) => ErrorKind::Configuration,
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
                std::io::ErrorKind::Unsupported => ErrorKind::Unsupported,
                _ => ErrorKind::Transport,
            },
            Self::Transport(_) | Self::PoolExhausted(_) => ErrorKind::Transport,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Paths a failed batch operation left behind, empty for every other error.
    pub fn failed_paths(&self) -> &[String] {
        match self {
            Self::PartialBatchFailure { failed, .. } => failed,
            _ => &[],
        }
    }
}

pub type StorageResult<T> = Result<T, ObjectStorageError>;
