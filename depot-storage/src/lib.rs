//! Object Storage Backends
//!
//! This crate provides the `ObjectStorage` contract shared by every backend,
//! the stream types it hands out, a backend registry, and the local disk,
//! in-memory and S3 implementations.

mod factory;
mod lifecycle;
mod local;
mod memory;
mod stream;
mod traits;

#[cfg(feature = "s3")]
mod s3;

// Re-exports
pub use factory::{CreateArgs, Creator, ObjectStorageFactory};
pub use lifecycle::Lifecycle;
pub use local::{LocalObjectStorage, LocalStorageConfig};
pub use memory::{InMemoryHub, InMemoryObjectStorage, InMemoryStorageConfig};
pub use stream::{ConcatReader, ThrottledReader};
pub use traits::{
    copy_through_streams, random_blob_name, remove_one_by_one, ObjectRead, ObjectStorage,
    ObjectWrite, BLOB_NAME_LENGTH,
};

#[cfg(feature = "s3")]
pub use s3::{S3ObjectStorage, S3StorageConfig};

pub use depot_core::*;
