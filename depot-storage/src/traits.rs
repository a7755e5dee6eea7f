//! Object Storage Trait Definitions
//!
//! Defines the contract every storage backend implements, the stream traits
//! returned by reads and writes, and the cross-backend copy fallback.

use crate::stream::ConcatReader;
use depot_core::{
    ConfigTree, DataSourceDescription, FinalizeCallback, ObjectAttributes, ObjectMetadata,
    ObjectStorageError, ReadSettings, RelativePathsWithSize, RemoteThrottlers, StorageContext,
    StorageResult, StoredObject, WriteMode, WriteSettings, DEFAULT_BUFFER_SIZE,
};
use rand::distributions::Uniform;
use rand::Rng;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Readable stream over one or more stored objects.
pub trait ObjectRead: Read + Seek + Send {
    /// Total size of the stream. The default seeks to the end and back.
    fn object_size(&mut self) -> io::Result<u64> {
        let position = self.stream_position()?;
        let size = self.seek(SeekFrom::End(0))?;
        self.seek(SeekFrom::Start(position))?;
        Ok(size)
    }
}

/// Writable stream into one stored object.
///
/// Nothing written becomes visible until [`ObjectWrite::finalize`] returns
/// successfully. Dropping the writer without finalizing abandons the write and
/// leaves the backend as it was.
pub trait ObjectWrite: Write + Send {
    /// Flush, durably commit the object, then run the finalize callback with the
    /// number of bytes written through this stream. Returns that count.
    fn finalize(self: Box<Self>) -> StorageResult<u64>;

    /// Bytes accepted by this stream so far.
    fn bytes_written(&self) -> u64;
}

/// Abstraction over blob stores, distributed filesystems and local disks.
///
/// Every method may fail; absence is only an error where presence is required.
/// Read, listing and metadata calls may run concurrently from any number of
/// threads. Writes to different paths are independent; writes to the same path
/// must be serialized by the caller.
pub trait ObjectStorage: Send + Sync {
    /// Name of this storage instance, for logging.
    fn name(&self) -> &str;

    fn data_source_description(&self) -> DataSourceDescription;

    /// Whether the object exists. Absence is `Ok(false)`, never `NotFound`.
    fn exists(&self, object: &StoredObject) -> StorageResult<bool>;

    /// Recursively list objects whose path starts with `prefix`.
    ///
    /// Returns at most `max_keys` entries when `max_keys > 0`; zero means
    /// unbounded. `max_keys` caps the result and is unrelated to the page size a
    /// backend uses for its own listing requests.
    fn find_all_files(
        &self,
        prefix: &str,
        _children: &mut RelativePathsWithSize,
        _max_keys: usize,
    ) -> StorageResult<()> {
        Err(ObjectStorageError::Unsupported(format!(
            "find_all_files('{prefix}') is not supported by {}",
            self.name()
        )))
    }

    /// One-level listing of `path`, using `/` as the directory delimiter.
    /// Directories are reported with a trailing `/`.
    fn get_directory_contents(
        &self,
        path: &str,
        _files: &mut RelativePathsWithSize,
        _directories: &mut Vec<String>,
    ) -> StorageResult<()> {
        Err(ObjectStorageError::Unsupported(format!(
            "get_directory_contents('{path}') is not supported by {}",
            self.name()
        )))
    }

    /// Metadata of the object at `path`; `NotFound` when absent.
    fn get_object_metadata(&self, path: &str) -> StorageResult<ObjectMetadata>;

    /// Open one object for reading. `read_hint` and `file_size` only tune
    /// buffering; wrong values never change the bytes returned.
    fn read_object(
        &self,
        object: &StoredObject,
        settings: &ReadSettings,
        read_hint: Option<usize>,
        file_size: Option<u64>,
    ) -> StorageResult<Box<dyn ObjectRead>>;

    /// Open several objects as one stream, in the given order.
    fn read_objects(
        &self,
        objects: &[StoredObject],
        settings: &ReadSettings,
        read_hint: Option<usize>,
        _file_size: Option<u64>,
    ) -> StorageResult<Box<dyn ObjectRead>> {
        let parts = objects
            .iter()
            .map(|object| {
                let size = (object.bytes_size > 0).then_some(object.bytes_size);
                self.read_object(object, settings, read_hint, size)
            })
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(Box::new(ConcatReader::new(parts)?))
    }

    /// Open an object for writing.
    ///
    /// `WriteMode::Append` fails with `Unsupported` on backends that cannot append.
    /// The finalize callback runs once, after the object is committed.
    fn write_object(
        &self,
        object: &StoredObject,
        mode: WriteMode,
        attributes: Option<ObjectAttributes>,
        finalize_callback: Option<FinalizeCallback>,
        buffer_size: usize,
        settings: &WriteSettings,
    ) -> StorageResult<Box<dyn ObjectWrite>>;

    fn is_remote(&self) -> bool;

    /// Remove an object; `NotFound` when it does not exist.
    fn remove_object(&self, object: &StoredObject) -> StorageResult<()>;

    /// Remove an object if it exists; absence is not an error.
    fn remove_object_if_exists(&self, object: &StoredObject) -> StorageResult<()>;

    /// Remove several objects. Fails with `NotFound` before deleting anything if
    /// one of them is absent. On success every object is gone.
    fn remove_objects(&self, objects: &[StoredObject]) -> StorageResult<()> {
        remove_one_by_one(self, objects, false)
    }

    /// Remove several objects, ignoring the ones already absent.
    fn remove_objects_if_exist(&self, objects: &[StoredObject]) -> StorageResult<()> {
        remove_one_by_one(self, objects, true)
    }

    /// Copy inside this storage, replacing attributes when given. The destination
    /// is either fully written or untouched.
    fn copy_object(
        &self,
        from: &StoredObject,
        to: &StoredObject,
        attributes: Option<ObjectAttributes>,
    ) -> StorageResult<()>;

    /// Copy into another storage. Streams the data through this process unless a
    /// backend overrides it with a native copy.
    fn copy_object_to_another_object_storage(
        &self,
        from: &StoredObject,
        to: &StoredObject,
        destination: &dyn ObjectStorage,
        attributes: Option<ObjectAttributes>,
    ) -> StorageResult<()> {
        copy_through_streams(self, from, to, destination, attributes)
    }

    /// Name of the filesystem cache wrapping this storage.
    fn cache_name(&self) -> StorageResult<&str> {
        Err(ObjectStorageError::Unsupported(format!(
            "{} has no filesystem cache",
            self.name()
        )))
    }

    fn startup(&self) -> StorageResult<()>;

    /// Stop accepting new operations. Idempotent, and safe to call when
    /// `startup` never ran or failed half-way.
    fn shutdown(&self);

    /// Reload backend configuration from the subtree at `prefix`. Must install
    /// throttlers through [`RemoteThrottlers::apply_remote_throttling_settings`].
    fn apply_new_settings(
        &self,
        config: &ConfigTree,
        prefix: &str,
        context: &StorageContext,
    ) -> StorageResult<()>;

    /// Bucket-like root this instance is bound to, or `""` when there is none.
    fn objects_namespace(&self) -> String;

    /// New, independent instance of the same backend bound to `new_namespace`.
    fn clone_object_storage(
        &self,
        new_namespace: &str,
        config: &ConfigTree,
        prefix: &str,
        context: &StorageContext,
    ) -> StorageResult<Box<dyn ObjectStorage>>;

    /// Blob name for a new object backing the logical `path`.
    fn generate_blob_name_for_path(&self, _path: &str) -> String {
        random_blob_name(BLOB_NAME_LENGTH)
    }

    fn unique_id(&self, path: &str) -> String {
        path.to_string()
    }

    /// Drop any locally cached copy of `path`.
    fn remove_cache_if_exists(&self, _path: &str) {}

    fn supports_cache(&self) -> bool {
        false
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn is_write_once(&self) -> bool {
        false
    }

    fn supports_parallel_write(&self) -> bool {
        false
    }

    fn adjusted_read_settings(&self, settings: &ReadSettings, _path: &str) -> ReadSettings {
        settings.clone()
    }

    fn adjusted_write_settings(&self, settings: &WriteSettings, _path: &str) -> WriteSettings {
        settings.clone()
    }

    /// Throttler slots of this instance.
    fn remote_throttlers(&self) -> &RemoteThrottlers;

    /// Settings the backend actually uses for a read. Keeps the caller's options
    /// and resolves the default throttler choice to the installed read throttler.
    fn patch_read_settings(&self, settings: &ReadSettings) -> ReadSettings {
        let mut patched = settings.clone();
        patched.throttler = settings.throttler.resolve(self.remote_throttlers().read());
        patched
    }

    fn patch_write_settings(&self, settings: &WriteSettings) -> WriteSettings {
        let mut patched = settings.clone();
        patched.throttler = settings.throttler.resolve(self.remote_throttlers().write());
        patched
    }
}

/// Length of generated blob names.
pub const BLOB_NAME_LENGTH: usize = 32;

/// `len` random lowercase ASCII letters.
pub fn random_blob_name(len: usize) -> String {
    let letters = Uniform::new_inclusive(b'a', b'z');
    rand::thread_rng()
        .sample_iter(letters)
        .take(len)
        .map(char::from)
        .collect()
}

/// Read `from` out of `source` and write it into `destination` as `to`.
pub fn copy_through_streams<S: ObjectStorage + ?Sized>(
    source: &S,
    from: &StoredObject,
    to: &StoredObject,
    destination: &dyn ObjectStorage,
    attributes: Option<ObjectAttributes>,
) -> StorageResult<()> {
    let size_hint = (from.bytes_size > 0).then_some(from.bytes_size);
    let mut reader = source.read_object(from, &ReadSettings::default(), None, size_hint)?;
    let mut writer = destination.write_object(
        to,
        WriteMode::Rewrite,
        attributes,
        None,
        DEFAULT_BUFFER_SIZE,
        &WriteSettings::default(),
    )?;
    let copied = io::copy(&mut reader, &mut writer)?;
    writer.finalize()?;
    tracing::debug!(
        source = source.name(),
        destination = destination.name(),
        from = %from,
        to = %to,
        bytes = copied,
        "copied object between storages"
    );
    Ok(())
}

/// Batch removal for backends without a native batch primitive.
pub fn remove_one_by_one<S: ObjectStorage + ?Sized>(
    storage: &S,
    objects: &[StoredObject],
    if_exists: bool,
) -> StorageResult<()> {
    if !if_exists {
        for object in objects {
            if !storage.exists(object)? {
                return Err(ObjectStorageError::NotFound(object.remote_path.clone()));
            }
        }
    }

    let mut failed = Vec::new();
    let mut last_error = None;
    for object in objects {
        if let Err(e) = storage.remove_object_if_exists(object) {
            failed.push(object.remote_path.clone());
            last_error = Some(e.to_string());
        }
    }

    match last_error {
        None => Ok(()),
        Some(reason) => Err(ObjectStorageError::PartialBatchFailure { failed, reason }),
    }
}
