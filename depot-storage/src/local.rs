//! Local Filesystem Object Storage
//!
//! Implements the ObjectStorage trait for the local filesystem.
//! Useful for development, testing, and single-node deployments.

use crate::lifecycle::Lifecycle;
use crate::stream::ThrottledReader;
use crate::traits::{random_blob_name, ObjectRead, ObjectStorage, ObjectWrite};
use chrono::{DateTime, Utc};
use depot_core::{
    ConfigTree, DataSourceDescription, DataSourceType, FinalizeCallback, ObjectAttributes,
    ObjectMetadata, ObjectStorageError, ReadSettings, RelativePathWithSize,
    RelativePathsWithSize, RemoteThrottlers, StorageContext, StorageResult, StoredObject,
    ThrottlerSelection, WriteMode, WriteSettings,
};
use metrics::{counter, Counter};
use serde::Deserialize;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use walkdir::WalkDir;

/// Prefix of in-progress writes. Reserved: keys may not use it in any segment.
const TEMP_PREFIX: &str = ".depot-tmp-";

/// Directory of the empty namespace. Reserved as a namespace name.
const DEFAULT_NAMESPACE_DIR: &str = "_default";

/// Configuration subtree of a local storage.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// Directory holding all namespaces.
    pub path: PathBuf,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Local filesystem-based object storage.
///
/// Objects of namespace `ns` live under `<base>/<ns>/`, keyed by their remote
/// path; the empty namespace uses `<base>/_default/`. Namespaces are sibling
/// directories, so no namespace can see another's objects. Writes land in a temporary file next to the target and are renamed into
/// place on finalize.
#[derive(Debug)]
pub struct LocalObjectStorage {
    name: String,
    base: PathBuf,
    namespace: String,
    root: PathBuf,
    read_only: AtomicBool,
    throttlers: RemoteThrottlers,
    lifecycle: Lifecycle,
}

impl LocalObjectStorage {
    /// Create a storage for the empty namespace under `root`.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> StorageResult<Self> {
        Self::with_namespace(name, root, "")
    }

    pub fn with_namespace(
        name: impl Into<String>,
        base: impl AsRef<Path>,
        namespace: &str,
    ) -> StorageResult<Self> {
        let base = base.as_ref().to_path_buf();
        let root = base.join(namespace_dir(namespace)?);
        fs::create_dir_all(&root)?;
        Ok(Self {
            name: name.into(),
            base,
            namespace: namespace.to_string(),
            root,
            read_only: AtomicBool::new(false),
            throttlers: RemoteThrottlers::new(),
            lifecycle: Lifecycle::new(),
        })
    }

    pub fn from_config(
        name: impl Into<String>,
        config: &ConfigTree,
        prefix: &str,
        context: &StorageContext,
    ) -> StorageResult<Self> {
        let section: LocalStorageConfig = config.deserialize(prefix)?;
        let storage = Self::with_namespace(name, &section.path, &section.namespace)?;
        storage.read_only.store(section.read_only, Ordering::SeqCst);
        storage.throttlers.apply_remote_throttling_settings(context);
        Ok(storage)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Full path for an object key.
    fn full_path(&self, remote_path: &str) -> StorageResult<PathBuf> {
        Ok(self.root.join(checked_relative(remote_path)?))
    }

    fn ensure_writable(&self, operation: &str) -> StorageResult<()> {
        self.lifecycle.ensure_running(&self.name)?;
        if self.read_only.load(Ordering::SeqCst) {
            return Err(ObjectStorageError::Unsupported(format!(
                "{operation} on read-only storage {}",
                self.name
            )));
        }
        Ok(())
    }

    /// Object key of a file below the root, with `/` separators.
    fn key_of(&self, path: &Path) -> StorageResult<String> {
        let relative = path.strip_prefix(&self.root).map_err(|e| {
            ObjectStorageError::Configuration(format!("{} outside storage root: {e}", path.display()))
        })?;
        Ok(relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"))
    }

    fn temp_path_for(target: &Path) -> PathBuf {
        let name = format!("{TEMP_PREFIX}{}", random_blob_name(16));
        match target.parent() {
            Some(parent) => parent.join(name),
            None => PathBuf::from(name),
        }
    }
}

/// Reject absolute paths and parent components so keys cannot escape the root,
/// and segments that would be mistaken for in-progress writes.
fn checked_relative(key: &str) -> StorageResult<&Path> {
    let path = Path::new(key);
    let invalid = path.components().any(|c| match c {
        Component::Normal(segment) => segment.to_string_lossy().starts_with(TEMP_PREFIX),
        Component::CurDir => false,
        _ => true,
    });
    if key.is_empty() || invalid {
        return Err(ObjectStorageError::Configuration(format!(
            "invalid object path '{key}'"
        )));
    }
    Ok(path)
}

/// Directory name of a namespace below the base path.
fn namespace_dir(namespace: &str) -> StorageResult<&str> {
    if namespace.is_empty() {
        return Ok(DEFAULT_NAMESPACE_DIR);
    }
    let components: Vec<_> = Path::new(namespace).components().collect();
    let single = matches!(components.as_slice(), [Component::Normal(_)]);
    if !single
        || namespace.contains('/')
        || namespace == DEFAULT_NAMESPACE_DIR
        || namespace.starts_with(TEMP_PREFIX)
    {
        return Err(ObjectStorageError::Configuration(format!(
            "invalid namespace '{namespace}'"
        )));
    }
    Ok(namespace)
}

/// Whether any committed object lives below `dir`.
fn holds_objects(dir: &Path) -> StorageResult<bool> {
    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = entry.map_err(|e| ObjectStorageError::Io(e.into()))?;
        if entry.file_type().is_file() && !is_temp_file(entry.path()) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with(TEMP_PREFIX))
        .unwrap_or(false)
}

fn not_found_or(err: io::Error, key: &str) -> ObjectStorageError {
    if err.kind() == io::ErrorKind::NotFound {
        ObjectStorageError::NotFound(key.to_string())
    } else {
        ObjectStorageError::Io(err)
    }
}

impl ObjectStorage for LocalObjectStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn data_source_description(&self) -> DataSourceDescription {
        DataSourceDescription::new(DataSourceType::Local, self.base.to_string_lossy())
    }

    fn exists(&self, object: &StoredObject) -> StorageResult<bool> {
        self.lifecycle.ensure_running(&self.name)?;
        Ok(self.full_path(&object.remote_path)?.is_file())
    }

    fn find_all_files(
        &self,
        prefix: &str,
        children: &mut RelativePathsWithSize,
        max_keys: usize,
    ) -> StorageResult<()> {
        self.lifecycle.ensure_running(&self.name)?;
        // Walk only the deepest directory the prefix fully names.
        let start = match prefix.rfind('/') {
            Some(idx) if idx > 0 => self.full_path(&prefix[..idx])?,
            _ => self.root.clone(),
        };
        if !start.is_dir() {
            return Ok(());
        }

        let mut found = 0usize;
        for entry in WalkDir::new(&start).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| ObjectStorageError::Io(e.into()))?;
            if !entry.file_type().is_file() || is_temp_file(entry.path()) {
                continue;
            }
            let key = self.key_of(entry.path())?;
            if !key.starts_with(prefix) {
                continue;
            }
            let size = entry.metadata().map_err(|e| ObjectStorageError::Io(e.into()))?.len();
            children.push(RelativePathWithSize::new(key, size));
            found += 1;
            if max_keys > 0 && found >= max_keys {
                break;
            }
        }
        Ok(())
    }

    fn get_directory_contents(
        &self,
        path: &str,
        files: &mut RelativePathsWithSize,
        directories: &mut Vec<String>,
    ) -> StorageResult<()> {
        self.lifecycle.ensure_running(&self.name)?;
        let trimmed = path.trim_end_matches('/');
        let dir = if trimmed.is_empty() {
            self.root.clone()
        } else {
            self.full_path(trimmed)?
        };
        if !dir.is_dir() {
            return Ok(());
        }

        let mut entries = fs::read_dir(&dir)?.collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            let file_type = entry.file_type()?;
            // Removed or abandoned writes can leave empty directories behind.
            if file_type.is_dir() && holds_objects(&path)? {
                directories.push(format!("{}/", self.key_of(&path)?));
            } else if file_type.is_file() && !is_temp_file(&path) {
                files.push(RelativePathWithSize::new(
                    self.key_of(&path)?,
                    entry.metadata()?.len(),
                ));
            }
        }
        Ok(())
    }

    fn get_object_metadata(&self, path: &str) -> StorageResult<ObjectMetadata> {
        self.lifecycle.ensure_running(&self.name)?;
        let full = self.full_path(path)?;
        let metadata = fs::metadata(&full).map_err(|e| not_found_or(e, path))?;
        if !metadata.is_file() {
            return Err(ObjectStorageError::NotFound(path.to_string()));
        }
        Ok(ObjectMetadata {
            size_bytes: metadata.len(),
            last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            attributes: None,
        })
    }

    fn read_object(
        &self,
        object: &StoredObject,
        settings: &ReadSettings,
        read_hint: Option<usize>,
        _file_size: Option<u64>,
    ) -> StorageResult<Box<dyn ObjectRead>> {
        self.lifecycle.ensure_running(&self.name)?;
        let settings = self.patch_read_settings(settings);
        let full = self.full_path(&object.remote_path)?;
        let file = File::open(&full).map_err(|e| not_found_or(e, &object.remote_path))?;
        let capacity = read_hint
            .unwrap_or(usize::MAX)
            .min(settings.effective_buffer_size())
            .max(1);
        tracing::trace!(storage = %self.name, object = %object, "opened object for read");
        Ok(Box::new(ThrottledReader::new(
            BufReader::with_capacity(capacity, file),
            settings.throttler,
            counter!("depot_read_bytes_total", "storage" => self.name.clone()),
        )))
    }

    fn write_object(
        &self,
        object: &StoredObject,
        mode: WriteMode,
        _attributes: Option<ObjectAttributes>,
        finalize_callback: Option<FinalizeCallback>,
        buffer_size: usize,
        settings: &WriteSettings,
    ) -> StorageResult<Box<dyn ObjectWrite>> {
        self.ensure_writable("write")?;
        let settings = self.patch_write_settings(settings);
        let target = self.full_path(&object.remote_path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp = Self::temp_path_for(&target);
        if mode == WriteMode::Append && target.is_file() {
            fs::copy(&target, &temp)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&temp)?;

        Ok(Box::new(LocalObjectWriter {
            file: Some(BufWriter::with_capacity(buffer_size.max(1), file)),
            temp,
            target,
            key: object.remote_path.clone(),
            bytes_written: 0,
            finalize_callback,
            throttler: settings.throttler,
            bytes_counter: counter!("depot_written_bytes_total", "storage" => self.name.clone()),
        }))
    }

    fn is_remote(&self) -> bool {
        false
    }

    fn remove_object(&self, object: &StoredObject) -> StorageResult<()> {
        self.ensure_writable("remove")?;
        let full = self.full_path(&object.remote_path)?;
        if full.is_dir() {
            return Err(ObjectStorageError::NotFound(object.remote_path.clone()));
        }
        fs::remove_file(&full).map_err(|e| not_found_or(e, &object.remote_path))?;
        counter!("depot_removed_objects_total", "storage" => self.name.clone()).increment(1);
        Ok(())
    }

    fn remove_object_if_exists(&self, object: &StoredObject) -> StorageResult<()> {
        match self.remove_object(object) {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    fn copy_object(
        &self,
        from: &StoredObject,
        to: &StoredObject,
        _attributes: Option<ObjectAttributes>,
    ) -> StorageResult<()> {
        self.ensure_writable("copy")?;
        let src = self.full_path(&from.remote_path)?;
        if !src.is_file() {
            return Err(ObjectStorageError::NotFound(from.remote_path.clone()));
        }
        let dst = self.full_path(&to.remote_path)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = Self::temp_path_for(&dst);
        let copied = fs::copy(&src, &temp).and_then(|_| fs::rename(&temp, &dst));
        if let Err(e) = copied {
            let _ = fs::remove_file(&temp);
            return Err(not_found_or(e, &from.remote_path));
        }
        Ok(())
    }

    fn startup(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.root)?;
        self.lifecycle.start();
        tracing::info!(storage = %self.name, root = %self.root.display(), "local object storage started");
        Ok(())
    }

    fn shutdown(&self) {
        if self.lifecycle.shutdown() {
            tracing::info!(storage = %self.name, "local object storage shut down");
        }
    }

    fn apply_new_settings(
        &self,
        config: &ConfigTree,
        prefix: &str,
        context: &StorageContext,
    ) -> StorageResult<()> {
        if let Some(read_only) = config.get_bool(&ConfigTree::join_key(prefix, "read_only")) {
            self.read_only.store(read_only, Ordering::SeqCst);
        }
        self.throttlers.apply_remote_throttling_settings(context);
        Ok(())
    }

    fn objects_namespace(&self) -> String {
        self.namespace.clone()
    }

    fn clone_object_storage(
        &self,
        new_namespace: &str,
        config: &ConfigTree,
        prefix: &str,
        context: &StorageContext,
    ) -> StorageResult<Box<dyn ObjectStorage>> {
        let clone = Self::with_namespace(self.name.clone(), &self.base, new_namespace)?;
        clone.set_read_only(self.is_read_only());
        clone.apply_new_settings(config, prefix, context)?;
        Ok(Box::new(clone))
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn remote_throttlers(&self) -> &RemoteThrottlers {
        &self.throttlers
    }
}

/// Writer into a temporary file that is renamed over the target on finalize.
struct LocalObjectWriter {
    file: Option<BufWriter<File>>,
    temp: PathBuf,
    target: PathBuf,
    key: String,
    bytes_written: u64,
    finalize_callback: Option<FinalizeCallback>,
    throttler: ThrottlerSelection,
    bytes_counter: Counter,
}

impl LocalObjectWriter {
    fn file_mut(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "writer already finalized"))
    }
}

impl Write for LocalObjectWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file_mut()?.write(buf)?;
        self.throttler.throttle(n as u64);
        self.bytes_counter.increment(n as u64);
        self.bytes_written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file_mut()?.flush()
    }
}

impl ObjectWrite for LocalObjectWriter {
    fn finalize(mut self: Box<Self>) -> StorageResult<u64> {
        let writer = self
            .file
            .take()
            .ok_or_else(|| ObjectStorageError::Unsupported("writer already finalized".into()))?;
        let file = writer.into_inner().map_err(|e| ObjectStorageError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.temp, &self.target)?;

        tracing::debug!(object = %self.key, bytes = self.bytes_written, "committed local object");
        if let Some(callback) = self.finalize_callback.take() {
            callback(self.bytes_written);
        }
        Ok(self.bytes_written)
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl Drop for LocalObjectWriter {
    fn drop(&mut self) {
        // Still holding the file means finalize never ran or failed: discard.
        if self.file.take().is_some() || self.temp.exists() {
            if let Err(e) = fs::remove_file(&self.temp) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(object = %self.key, error = %e, "failed to discard abandoned write");
                }
            } else {
                tracing::debug!(object = %self.key, "discarded abandoned write");
            }
        }
    }
}
