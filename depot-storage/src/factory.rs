//! Backend registry
//!
//! Maps the `type` key of a storage configuration section to a constructor.
//! New backends can be registered at runtime.

use crate::local::LocalObjectStorage;
use crate::memory::{InMemoryHub, InMemoryObjectStorage};
use crate::traits::ObjectStorage;
use depot_core::{
    ConfigTree, ObjectStorageError, StorageContext, StorageResult, WriterPool, WriterPoolConfig,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Everything a constructor gets to build one storage instance.
pub struct CreateArgs<'a> {
    pub name: &'a str,
    pub config: &'a ConfigTree,
    pub prefix: &'a str,
    pub context: &'a StorageContext,
    pub writer_pool: &'a Arc<WriterPool>,
}

pub type Creator =
    Arc<dyn Fn(&CreateArgs<'_>) -> StorageResult<Arc<dyn ObjectStorage>> + Send + Sync>;

pub struct ObjectStorageFactory {
    creators: BTreeMap<String, Creator>,
    writer_pool: Arc<WriterPool>,
}

impl fmt::Debug for ObjectStorageFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStorageFactory")
            .field("types", &self.creators.keys().collect::<Vec<_>>())
            .field("writer_pool", &self.writer_pool)
            .finish()
    }
}

impl ObjectStorageFactory {
    /// Empty registry handing `writer_pool` to every backend it creates.
    pub fn new(writer_pool: Arc<WriterPool>) -> Self {
        Self {
            creators: BTreeMap::new(),
            writer_pool,
        }
    }

    /// Registry with the built-in backends and a default-sized writer pool.
    pub fn with_defaults() -> StorageResult<Self> {
        let pool = Arc::new(WriterPool::new(WriterPoolConfig::default())?);
        Self::with_defaults_and_pool(pool)
    }

    pub fn with_defaults_and_pool(writer_pool: Arc<WriterPool>) -> StorageResult<Self> {
        let mut factory = Self::new(writer_pool);

        factory.register("local", |args| {
            let storage =
                LocalObjectStorage::from_config(args.name, args.config, args.prefix, args.context)?;
            Ok(Arc::new(storage) as Arc<dyn ObjectStorage>)
        })?;

        let hub = Arc::new(InMemoryHub::new());
        factory.register("memory", move |args| {
            let storage = InMemoryObjectStorage::from_config(
                args.name,
                Arc::clone(&hub),
                args.config,
                args.prefix,
                args.context,
            )?;
            Ok(Arc::new(storage) as Arc<dyn ObjectStorage>)
        })?;

        #[cfg(feature = "s3")]
        factory.register("s3", |args| {
            let storage = crate::s3::S3ObjectStorage::from_config(
                args.name,
                args.config,
                args.prefix,
                args.context,
                Arc::clone(args.writer_pool),
            )?;
            Ok(Arc::new(storage) as Arc<dyn ObjectStorage>)
        })?;

        Ok(factory)
    }

    /// Register a constructor for `type_name`. A name can only be registered once.
    pub fn register<F>(&mut self, type_name: &str, creator: F) -> StorageResult<()>
    where
        F: Fn(&CreateArgs<'_>) -> StorageResult<Arc<dyn ObjectStorage>> + Send + Sync + 'static,
    {
        if self.creators.contains_key(type_name) {
            return Err(ObjectStorageError::AlreadyExists(format!(
                "object storage type '{type_name}'"
            )));
        }
        self.creators.insert(type_name.to_string(), Arc::new(creator));
        Ok(())
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.creators.contains_key(type_name)
    }

    pub fn registered_types(&self) -> Vec<&str> {
        self.creators.keys().map(String::as_str).collect()
    }

    pub fn writer_pool(&self) -> &Arc<WriterPool> {
        &self.writer_pool
    }

    /// Build, start and configure the storage described by the subtree at `prefix`.
    pub fn create(
        &self,
        name: &str,
        config: &ConfigTree,
        prefix: &str,
        context: &StorageContext,
    ) -> StorageResult<Arc<dyn ObjectStorage>> {
        let type_key = ConfigTree::join_key(prefix, "type");
        let type_name = config.get_str(&type_key).ok_or_else(|| {
            ObjectStorageError::Configuration(format!("missing '{type_key}' for storage {name}"))
        })?;
        let creator = self.creators.get(type_name).ok_or_else(|| {
            ObjectStorageError::Configuration(format!(
                "unknown object storage type '{type_name}' for storage {name}"
            ))
        })?;

        let storage = creator(&CreateArgs {
            name,
            config,
            prefix,
            context,
            writer_pool: &self.writer_pool,
        })?;
        storage.startup()?;
        storage.apply_new_settings(config, prefix, context)?;
        tracing::info!(storage = name, kind = type_name, "created object storage");
        Ok(storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn factory() -> ObjectStorageFactory {
        let pool = WriterPool::new(WriterPoolConfig {
            max_threads: 2,
            max_queued: 2,
        })
        .unwrap();
        ObjectStorageFactory::with_defaults_and_pool(Arc::new(pool)).unwrap()
    }

    #[test]
    fn test_creates_registered_backends() {
        let temp = TempDir::new().unwrap();
        let config = ConfigTree::from_value(json!({
            "storage": {
                "disk": { "type": "local", "path": temp.path() },
                "ram": { "type": "memory", "namespace": "tests" }
            }
        }));
        let factory = factory();
        assert!(factory.is_registered("local"));
        assert!(factory.is_registered("memory"));

        let disk = factory
            .create("disk", &config, "storage.disk", &StorageContext::default())
            .unwrap();
        assert!(!disk.is_remote());
        assert_eq!(disk.name(), "disk");

        let ram = factory
            .create("ram", &config, "storage.ram", &StorageContext::default())
            .unwrap();
        assert_eq!(ram.objects_namespace(), "tests");
    }

    #[test]
    fn test_unknown_or_missing_type_is_configuration_error() {
        let config = ConfigTree::from_value(json!({
            "a": { "type": "tape" },
            "b": { "path": "/tmp" }
        }));
        let factory = factory();
        for prefix in ["a", "b"] {
            let err = factory
                .create(prefix, &config, prefix, &StorageContext::default())
                .err()
                .unwrap();
            assert!(matches!(err, ObjectStorageError::Configuration(_)));
        }
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut factory = factory();
        let err = factory
            .register("memory", |_| {
                Err(ObjectStorageError::Unsupported("never called".into()))
            })
            .unwrap_err();
        assert!(matches!(err, ObjectStorageError::AlreadyExists(_)));
    }

    #[test]
    fn test_custom_backend_is_created_and_started() {
        let mut factory = factory();
        factory
            .register("scratch", |args| {
                Ok(Arc::new(InMemoryObjectStorage::new(args.name)) as Arc<dyn ObjectStorage>)
            })
            .unwrap();
        let config = ConfigTree::from_value(json!({ "s": { "type": "scratch" } }));
        let storage = factory
            .create("scratch-1", &config, "s", &StorageContext::default())
            .unwrap();
        assert_eq!(storage.name(), "scratch-1");
        assert_eq!(factory.registered_types().len(), if cfg!(feature = "s3") { 4 } else { 3 });
    }

    #[test]
    fn test_memory_instances_share_hub() {
        let config = ConfigTree::from_value(json!({ "m": { "type": "memory", "namespace": "n" } }));
        let factory = factory();
        let ctx = StorageContext::default();
        let first = factory.create("m1", &config, "m", &ctx).unwrap();
        let second = factory.create("m2", &config, "m", &ctx).unwrap();

        let mut writer = first
            .write_object(
                &depot_core::StoredObject::new("k"),
                depot_core::WriteMode::Rewrite,
                None,
                None,
                16,
                &depot_core::WriteSettings::default(),
            )
            .unwrap();
        std::io::Write::write_all(&mut writer, b"v").unwrap();
        writer.finalize().unwrap();
        assert!(second.exists(&depot_core::StoredObject::new("k")).unwrap());
    }
}
