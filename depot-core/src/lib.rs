//! Core value types for the depot object storage layer.
//!
//! Everything here is backend-agnostic: object identities and metadata, the
//! read/write settings bundles, bandwidth throttling, the writer pool used for
//! multi-part uploads, configuration inputs, and the error taxonomy shared by all
//! backends.

pub mod config;
pub mod error;
pub mod object;
pub mod pool;
pub mod settings;
pub mod throttler;

pub use config::{ConfigTree, Credentials, StorageContext, STORAGE_CONTEXT_ENV};
pub use error::{ErrorKind, ObjectStorageError, StorageResult};
pub use object::{
    total_bytes_size, DataSourceDescription, DataSourceType, ObjectAttributes, ObjectMetadata,
    RelativePathWithSize, RelativePathsWithSize, StoredObject, StoredObjects, WriteMode,
};
pub use pool::{TaskHandle, WriterPool, WriterPoolConfig};
pub use settings::{
    ReadSettings, RemoteFsMethod, ThrottlerSelection, WriteSettings, DEFAULT_BUFFER_SIZE,
};
pub use throttler::{RemoteThrottlers, Throttler, ThrottlerPair};

/// Invoked exactly once with the total byte count after a write is committed.
pub type FinalizeCallback = Box<dyn FnOnce(u64) + Send + 'static>;
