//! In-Memory Object Storage
//!
//! Keeps objects in process memory. Namespaces live in a shared [`InMemoryHub`],
//! so instances bound to the same namespace of one hub see the same objects.

use crate::lifecycle::Lifecycle;
use crate::stream::ThrottledReader;
use crate::traits::{ObjectRead, ObjectStorage, ObjectWrite};
use chrono::{DateTime, Utc};
use depot_core::{
    ConfigTree, DataSourceDescription, DataSourceType, FinalizeCallback, ObjectAttributes,
    ObjectMetadata, ObjectStorageError, ReadSettings, RelativePathWithSize,
    RelativePathsWithSize, RemoteThrottlers, StorageContext, StorageResult, StoredObject,
    ThrottlerSelection, WriteMode, WriteSettings,
};
use metrics::{counter, Counter};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::io::{self, Cursor, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone)]
struct MemoryEntry {
    data: Vec<u8>,
    last_modified: DateTime<Utc>,
    attributes: ObjectAttributes,
}

type Bucket = BTreeMap<String, MemoryEntry>;
type SharedBucket = Arc<RwLock<Bucket>>;

/// Set of named in-memory buckets shared by every storage created from it.
#[derive(Debug, Default)]
pub struct InMemoryHub {
    namespaces: Mutex<HashMap<String, SharedBucket>>,
}

impl InMemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self, namespace: &str) -> SharedBucket {
        let mut namespaces = self.namespaces.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(namespaces.entry(namespace.to_string()).or_default())
    }

    /// Number of objects currently stored in `namespace`.
    pub fn object_count(&self, namespace: &str) -> usize {
        let bucket = self.bucket(namespace);
        let count = bucket.read().unwrap_or_else(PoisonError::into_inner).len();
        count
    }
}

/// Configuration subtree of an in-memory storage.
#[derive(Debug, Clone, Deserialize)]
pub struct InMemoryStorageConfig {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub write_once: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_supports_append")]
    pub supports_append: bool,
}

fn default_supports_append() -> bool {
    true
}

pub struct InMemoryObjectStorage {
    name: String,
    namespace: String,
    hub: Arc<InMemoryHub>,
    objects: SharedBucket,
    write_once: bool,
    supports_append: bool,
    read_only: AtomicBool,
    /// Paths a batch removal refuses to delete, to exercise partial failures.
    refused_removals: Mutex<HashSet<String>>,
    throttlers: RemoteThrottlers,
    lifecycle: Lifecycle,
}

impl fmt::Debug for InMemoryObjectStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryObjectStorage")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("objects", &self.read_bucket().len())
            .field("write_once", &self.write_once)
            .field("read_only", &self.is_read_only())
            .finish()
    }
}

impl InMemoryObjectStorage {
    /// Storage over a private hub, in the empty namespace.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_hub(name, Arc::new(InMemoryHub::new()), "")
    }

    pub fn with_hub(name: impl Into<String>, hub: Arc<InMemoryHub>, namespace: &str) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.to_string(),
            objects: hub.bucket(namespace),
            hub,
            write_once: false,
            supports_append: true,
            read_only: AtomicBool::new(false),
            refused_removals: Mutex::new(HashSet::new()),
            throttlers: RemoteThrottlers::new(),
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn from_config(
        name: impl Into<String>,
        hub: Arc<InMemoryHub>,
        config: &ConfigTree,
        prefix: &str,
        context: &StorageContext,
    ) -> StorageResult<Self> {
        let section: InMemoryStorageConfig = config.deserialize(prefix)?;
        let storage = Self::with_hub(name, hub, &section.namespace)
            .with_write_once(section.write_once)
            .with_append_support(section.supports_append);
        storage.set_read_only(section.read_only);
        storage.throttlers.apply_remote_throttling_settings(context);
        Ok(storage)
    }

    pub fn with_write_once(mut self, write_once: bool) -> Self {
        self.write_once = write_once;
        self
    }

    pub fn with_append_support(mut self, supports_append: bool) -> Self {
        self.supports_append = supports_append;
        self
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn hub(&self) -> &Arc<InMemoryHub> {
        &self.hub
    }

    /// Make batch removals keep these paths and report them as failed.
    pub fn fail_batch_removal_for<I, S>(&self, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut refused = self
            .refused_removals
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        refused.clear();
        refused.extend(paths.into_iter().map(Into::into));
    }

    fn read_bucket(&self) -> RwLockReadGuard<'_, Bucket> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_bucket(&self) -> RwLockWriteGuard<'_, Bucket> {
        self.objects.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_writable(&self, operation: &str) -> StorageResult<()> {
        self.lifecycle.ensure_running(&self.name)?;
        if self.is_read_only() {
            return Err(ObjectStorageError::Unsupported(format!(
                "{operation} on read-only storage {}",
                self.name
            )));
        }
        Ok(())
    }

    fn remove_batch(&self, objects: &[StoredObject], if_exists: bool) -> StorageResult<()> {
        self.ensure_writable("remove")?;
        let refused = self
            .refused_removals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut bucket = self.write_bucket();

        if !if_exists {
            if let Some(missing) = objects.iter().find(|o| !bucket.contains_key(&o.remote_path)) {
                return Err(ObjectStorageError::NotFound(missing.remote_path.clone()));
            }
        }

        let mut failed = Vec::new();
        let mut removed = 0u64;
        for object in objects {
            if refused.contains(&object.remote_path) {
                if bucket.contains_key(&object.remote_path) && !failed.contains(&object.remote_path) {
                    failed.push(object.remote_path.clone());
                }
                continue;
            }
            if bucket.remove(&object.remote_path).is_some() {
                removed += 1;
            }
        }
        drop(bucket);
        counter!("depot_removed_objects_total", "storage" => self.name.clone()).increment(removed);

        if failed.is_empty() {
            Ok(())
        } else {
            tracing::warn!(storage = %self.name, failed = failed.len(), "batch removal left objects behind");
            Err(ObjectStorageError::PartialBatchFailure {
                failed,
                reason: "backend refused removal".to_string(),
            })
        }
    }
}

impl ObjectStorage for InMemoryObjectStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn data_source_description(&self) -> DataSourceDescription {
        DataSourceDescription::new(DataSourceType::Memory, format!("memory://{}", self.name))
    }

    fn exists(&self, object: &StoredObject) -> StorageResult<bool> {
        self.lifecycle.ensure_running(&self.name)?;
        Ok(self.read_bucket().contains_key(&object.remote_path))
    }

    fn find_all_files(
        &self,
        prefix: &str,
        children: &mut RelativePathsWithSize,
        max_keys: usize,
    ) -> StorageResult<()> {
        self.lifecycle.ensure_running(&self.name)?;
        let bucket = self.read_bucket();
        let matching = bucket
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| RelativePathWithSize::new(key.clone(), entry.data.len() as u64));
        if max_keys > 0 {
            children.extend(matching.take(max_keys));
        } else {
            children.extend(matching);
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
        let dir = match path.trim_end_matches('/') {
            "" => String::new(),
            trimmed => format!("{trimmed}/"),
        };
        let bucket = self.read_bucket();
        let mut seen = BTreeSet::new();
        for (key, entry) in bucket.range(dir.clone()..).take_while(|(k, _)| k.starts_with(&dir)) {
            match key[dir.len()..].split_once('/') {
                Some((child, _)) => {
                    seen.insert(format!("{dir}{child}/"));
                }
                None => files.push(RelativePathWithSize::new(key.clone(), entry.data.len() as u64)),
            }
        }
        directories.extend(seen);
        Ok(())
    }

    fn get_object_metadata(&self, path: &str) -> StorageResult<ObjectMetadata> {
        self.lifecycle.ensure_running(&self.name)?;
        let bucket = self.read_bucket();
        let entry = bucket
            .get(path)
            .ok_or_else(|| ObjectStorageError::NotFound(path.to_string()))?;
        Ok(ObjectMetadata {
            size_bytes: entry.data.len() as u64,
            last_modified: Some(entry.last_modified),
            attributes: Some(entry.attributes.clone()),
        })
    }

    fn read_object(
        &self,
        object: &StoredObject,
        settings: &ReadSettings,
        _read_hint: Option<usize>,
        _file_size: Option<u64>,
    ) -> StorageResult<Box<dyn ObjectRead>> {
        self.lifecycle.ensure_running(&self.name)?;
        let settings = self.patch_read_settings(settings);
        let data = self
            .read_bucket()
            .get(&object.remote_path)
            .map(|entry| entry.data.clone())
            .ok_or_else(|| ObjectStorageError::NotFound(object.remote_path.clone()))?;
        Ok(Box::new(ThrottledReader::new(
            Cursor::new(data),
            settings.throttler,
            counter!("depot_read_bytes_total", "storage" => self.name.clone()),
        )))
    }

    fn write_object(
        &self,
        object: &StoredObject,
        mode: WriteMode,
        attributes: Option<ObjectAttributes>,
        finalize_callback: Option<FinalizeCallback>,
        buffer_size: usize,
        settings: &WriteSettings,
    ) -> StorageResult<Box<dyn ObjectWrite>> {
        self.ensure_writable("write")?;
        if mode == WriteMode::Append && !self.supports_append {
            return Err(ObjectStorageError::Unsupported(format!(
                "append to {} on {}",
                object.remote_path, self.name
            )));
        }
        // Write-once objects are immutable, appends included.
        if self.write_once && self.exists(object)? {
            return Err(ObjectStorageError::AlreadyExists(object.remote_path.clone()));
        }
        let settings = self.patch_write_settings(settings);
        Ok(Box::new(MemoryObjectWriter {
            buffer: Vec::with_capacity(buffer_size.min(settings.buffer_size)),
            objects: Arc::clone(&self.objects),
            key: object.remote_path.clone(),
            mode,
            attributes: attributes.unwrap_or_default(),
            write_once: self.write_once,
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
        self.write_bucket()
            .remove(&object.remote_path)
            .ok_or_else(|| ObjectStorageError::NotFound(object.remote_path.clone()))?;
        counter!("depot_removed_objects_total", "storage" => self.name.clone()).increment(1);
        Ok(())
    }

    fn remove_object_if_exists(&self, object: &StoredObject) -> StorageResult<()> {
        match self.remove_object(object) {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    fn remove_objects(&self, objects: &[StoredObject]) -> StorageResult<()> {
        self.remove_batch(objects, false)
    }

    fn remove_objects_if_exist(&self, objects: &[StoredObject]) -> StorageResult<()> {
        self.remove_batch(objects, true)
    }

    fn copy_object(
        &self,
        from: &StoredObject,
        to: &StoredObject,
        attributes: Option<ObjectAttributes>,
    ) -> StorageResult<()> {
        self.ensure_writable("copy")?;
        let mut bucket = self.write_bucket();
        let mut entry = bucket
            .get(&from.remote_path)
            .cloned()
            .ok_or_else(|| ObjectStorageError::NotFound(from.remote_path.clone()))?;
        if self.write_once && bucket.contains_key(&to.remote_path) {
            return Err(ObjectStorageError::AlreadyExists(to.remote_path.clone()));
        }
        if let Some(attributes) = attributes {
            entry.attributes = attributes;
        }
        entry.last_modified = Utc::now();
        bucket.insert(to.remote_path.clone(), entry);
        Ok(())
    }

    fn startup(&self) -> StorageResult<()> {
        self.lifecycle.start();
        tracing::info!(storage = %self.name, namespace = %self.namespace, "in-memory object storage started");
        Ok(())
    }

    fn shutdown(&self) {
        if self.lifecycle.shutdown() {
            tracing::info!(storage = %self.name, "in-memory object storage shut down");
        }
    }

    fn apply_new_settings(
        &self,
        config: &ConfigTree,
        prefix: &str,
        context: &StorageContext,
    ) -> StorageResult<()> {
        if let Some(read_only) = config.get_bool(&ConfigTree::join_key(prefix, "read_only")) {
            self.set_read_only(read_only);
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
        let clone = Self::with_hub(self.name.clone(), Arc::clone(&self.hub), new_namespace)
            .with_write_once(self.write_once)
            .with_append_support(self.supports_append);
        clone.set_read_only(self.is_read_only());
        clone.apply_new_settings(config, prefix, context)?;
        Ok(Box::new(clone))
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn is_write_once(&self) -> bool {
        self.write_once
    }

    fn remote_throttlers(&self) -> &RemoteThrottlers {
        &self.throttlers
    }
}

/// Buffers the whole object and publishes it into the bucket on finalize.
struct MemoryObjectWriter {
    buffer: Vec<u8>,
    objects: SharedBucket,
    key: String,
    mode: WriteMode,
    attributes: ObjectAttributes,
    write_once: bool,
    finalize_callback: Option<FinalizeCallback>,
    throttler: ThrottlerSelection,
    bytes_counter: Counter,
}

impl Write for MemoryObjectWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        self.throttler.throttle(buf.len() as u64);
        self.bytes_counter.increment(buf.len() as u64);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ObjectWrite for MemoryObjectWriter {
    fn finalize(mut self: Box<Self>) -> StorageResult<u64> {
        let written = self.buffer.len() as u64;
        {
            let mut bucket = self.objects.write().unwrap_or_else(PoisonError::into_inner);
            let data = match (self.mode, bucket.get(&self.key)) {
                (_, Some(_)) if self.write_once => {
                    return Err(ObjectStorageError::AlreadyExists(self.key.clone()));
                }
                (WriteMode::Append, Some(existing)) => {
                    let mut data = existing.data.clone();
                    data.append(&mut self.buffer);
                    data
                }
                _ => std::mem::take(&mut self.buffer),
            };
            bucket.insert(
                self.key.clone(),
                MemoryEntry {
                    data,
                    last_modified: Utc::now(),
                    attributes: std::mem::take(&mut self.attributes),
                },
            );
        }

        tracing::debug!(object = %self.key, bytes = written, "committed in-memory object");
        if let Some(callback) = self.finalize_callback.take() {
            callback(written);
        }
        Ok(written)
    }

    fn bytes_written(&self) -> u64 {
        self.buffer.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn put(storage: &InMemoryObjectStorage, key: &str, data: &[u8]) -> StorageResult<u64> {
        let mut writer = storage.write_object(
            &StoredObject::new(key),
            WriteMode::Rewrite,
            None,
            None,
            64,
            &WriteSettings::default(),
        )?;
        writer.write_all(data)?;
        writer.finalize()
    }

    fn get(storage: &InMemoryObjectStorage, key: &str) -> Vec<u8> {
        let mut reader = storage
            .read_object(&StoredObject::new(key), &ReadSettings::default(), None, None)
            .unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_attributes_are_stored_and_replaced_on_copy() {
        let storage = InMemoryObjectStorage::new("mem");
        let attrs = ObjectAttributes::from([("content-type".to_string(), "text/plain".to_string())]);
        let mut writer = storage
            .write_object(
                &StoredObject::new("doc"),
                WriteMode::Rewrite,
                Some(attrs.clone()),
                None,
                64,
                &WriteSettings::default(),
            )
            .unwrap();
        writer.write_all(b"text").unwrap();
        writer.finalize().unwrap();
        assert_eq!(storage.get_object_metadata("doc").unwrap().attributes, Some(attrs));

        let replaced = ObjectAttributes::from([("owner".to_string(), "ops".to_string())]);
        storage
            .copy_object(&StoredObject::new("doc"), &StoredObject::new("doc2"), Some(replaced.clone()))
            .unwrap();
        assert_eq!(storage.get_object_metadata("doc2").unwrap().attributes, Some(replaced));
        assert_eq!(get(&storage, "doc2"), b"text");
    }

    #[test]
    fn test_write_once_rejects_second_rewrite() {
        let storage = InMemoryObjectStorage::new("mem").with_write_once(true);
        assert!(storage.is_write_once());
        put(&storage, "once", b"first").unwrap();
        let err = put(&storage, "once", b"second").unwrap_err();
        assert!(matches!(err, ObjectStorageError::AlreadyExists(_)));
        assert_eq!(get(&storage, "once"), b"first");
    }

    #[test]
    fn test_write_once_rejects_append_to_existing() {
        let storage = InMemoryObjectStorage::new("mem").with_write_once(true);
        put(&storage, "sealed", b"first").unwrap();
        let err = storage
            .write_object(&StoredObject::new("sealed"), WriteMode::Append, None, None, 8, &WriteSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, ObjectStorageError::AlreadyExists(_)));

        // An append opened before the object existed still cannot extend it.
        let mut late = storage
            .write_object(&StoredObject::new("fresh"), WriteMode::Append, None, None, 8, &WriteSettings::default())
            .unwrap();
        put(&storage, "fresh", b"base").unwrap();
        late.write_all(b"+tail").unwrap();
        assert!(matches!(late.finalize(), Err(ObjectStorageError::AlreadyExists(_))));

        assert_eq!(get(&storage, "sealed"), b"first");
        assert_eq!(get(&storage, "fresh"), b"base");
    }

    #[test]
    fn test_queries_fail_after_shutdown() {
        let storage = InMemoryObjectStorage::new("mem");
        put(&storage, "k", b"v").unwrap();
        storage.shutdown();

        let object = StoredObject::new("k");
        assert!(matches!(storage.exists(&object), Err(ObjectStorageError::Shutdown(_))));
        assert!(matches!(storage.get_object_metadata("k"), Err(ObjectStorageError::Shutdown(_))));
        let mut found = Vec::new();
        assert!(matches!(
            storage.find_all_files("", &mut found, 0),
            Err(ObjectStorageError::Shutdown(_))
        ));
        let mut dirs = Vec::new();
        assert!(matches!(
            storage.get_directory_contents("", &mut found, &mut dirs),
            Err(ObjectStorageError::Shutdown(_))
        ));
        assert!(found.is_empty());

        storage.startup().unwrap();
        assert!(storage.exists(&object).unwrap());
    }

    #[test]
    fn test_write_once_checked_again_at_finalize() {
        let storage = InMemoryObjectStorage::new("mem").with_write_once(true);
        let mut first = storage
            .write_object(&StoredObject::new("race"), WriteMode::Rewrite, None, None, 8, &WriteSettings::default())
            .unwrap();
        put(&storage, "race", b"winner").unwrap();
        first.write_all(b"loser").unwrap();
        assert!(matches!(first.finalize(), Err(ObjectStorageError::AlreadyExists(_))));
        assert_eq!(get(&storage, "race"), b"winner");
    }

    #[test]
    fn test_append_unsupported_when_disabled() {
        let storage = InMemoryObjectStorage::new("mem").with_append_support(false);
        let err = storage
            .write_object(&StoredObject::new("x"), WriteMode::Append, None, None, 8, &WriteSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, ObjectStorageError::Unsupported(_)));
    }

    #[test]
    fn test_append_concatenates() {
        let storage = InMemoryObjectStorage::new("mem");
        put(&storage, "log", b"a").unwrap();
        let mut writer = storage
            .write_object(&StoredObject::new("log"), WriteMode::Append, None, None, 8, &WriteSettings::default())
            .unwrap();
        writer.write_all(b"bc").unwrap();
        assert_eq!(writer.finalize().unwrap(), 2);
        assert_eq!(get(&storage, "log"), b"abc");
    }

    #[test]
    fn test_read_only_rejects_mutations() {
        let storage = InMemoryObjectStorage::new("mem");
        put(&storage, "keep", b"k").unwrap();
        storage.set_read_only(true);
        assert!(matches!(put(&storage, "new", b"n"), Err(ObjectStorageError::Unsupported(_))));
        assert!(matches!(
            storage.remove_object_if_exists(&StoredObject::new("keep")),
            Err(ObjectStorageError::Unsupported(_))
        ));
        assert_eq!(get(&storage, "keep"), b"k");
    }

    #[test]
    fn test_directory_contents() {
        let storage = InMemoryObjectStorage::new("mem");
        for key in ["d/one", "d/sub/two", "d/sub/three", "d/other/four", "e/five"] {
            put(&storage, key, b"..").unwrap();
        }
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        storage.get_directory_contents("d", &mut files, &mut dirs).unwrap();
        assert_eq!(files, vec![RelativePathWithSize::new("d/one", 2)]);
        assert_eq!(dirs, vec!["d/other/".to_string(), "d/sub/".to_string()]);

        let mut files = Vec::new();
        let mut dirs = Vec::new();
        storage.get_directory_contents("", &mut files, &mut dirs).unwrap();
        assert!(files.is_empty());
        assert_eq!(dirs, vec!["d/".to_string(), "e/".to_string()]);
    }

    #[test]
    fn test_hub_shares_namespace_between_instances() {
        let hub = Arc::new(InMemoryHub::new());
        let a = InMemoryObjectStorage::with_hub("a", Arc::clone(&hub), "ns1");
        let b = InMemoryObjectStorage::with_hub("b", Arc::clone(&hub), "ns1");
        let c = InMemoryObjectStorage::with_hub("c", Arc::clone(&hub), "ns2");
        put(&a, "shared", b"1").unwrap();
        assert!(b.exists(&StoredObject::new("shared")).unwrap());
        assert!(!c.exists(&StoredObject::new("shared")).unwrap());
        assert_eq!(hub.object_count("ns1"), 1);
        assert_eq!(hub.object_count("ns2"), 0);
    }

    #[test]
    fn test_refused_batch_removal_reports_survivors() {
        let storage = InMemoryObjectStorage::new("mem");
        for key in ["a", "b", "c"] {
            put(&storage, key, b"x").unwrap();
        }
        storage.fail_batch_removal_for(["b"]);
        let objects: Vec<_> = ["a", "b", "c"].into_iter().map(StoredObject::new).collect();
        let err = storage.remove_objects(&objects).unwrap_err();
        assert_eq!(err.failed_paths(), ["b".to_string()]);
        assert!(!storage.exists(&objects[0]).unwrap());
        assert!(storage.exists(&objects[1]).unwrap());
        assert!(!storage.exists(&objects[2]).unwrap());

        storage.fail_batch_removal_for(Vec::<String>::new());
        storage.remove_objects_if_exist(&objects).unwrap();
        assert!(!storage.exists(&objects[1]).unwrap());
    }
}
