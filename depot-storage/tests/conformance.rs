//! Behaviour every backend must share, run against the local and in-memory storages.

use depot_storage::{
    ConfigTree, InMemoryHub, InMemoryObjectStorage, LocalObjectStorage, ObjectStorage,
    ObjectStorageError, ObjectStorageFactory, ReadSettings, StorageContext, StoredObject,
    ThrottlerSelection, WriteMode, WriteSettings,
};
use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A backend under test plus whatever keeps its medium alive.
struct Backend {
    label: &'static str,
    storage: Box<dyn ObjectStorage>,
    _dir: Option<TempDir>,
}

fn backends() -> Vec<Backend> {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let local = LocalObjectStorage::with_namespace("local", dir.path(), "main").unwrap();
    let memory = InMemoryObjectStorage::with_hub("memory", Arc::new(InMemoryHub::new()), "main");
    vec![
        Backend {
            label: "local",
            storage: Box::new(local),
            _dir: Some(dir),
        },
        Backend {
            label: "memory",
            storage: Box::new(memory),
            _dir: None,
        },
    ]
}

fn put(storage: &dyn ObjectStorage, path: &str, data: &[u8]) {
    let mut writer = storage
        .write_object(
            &StoredObject::new(path),
            WriteMode::Rewrite,
            None,
            None,
            4096,
            &WriteSettings::default(),
        )
        .unwrap();
    writer.write_all(data).unwrap();
    writer.finalize().unwrap();
}

fn get(storage: &dyn ObjectStorage, path: &str) -> Vec<u8> {
    let mut reader = storage
        .read_object(&StoredObject::new(path), &ReadSettings::default(), None, None)
        .unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).unwrap();
    out
}

#[test]
fn test_write_read_list_remove_scenario() {
    for backend in backends() {
        let storage = backend.storage.as_ref();
        let object = StoredObject::new("a/b.bin");
        let committed = Arc::new(AtomicU64::new(u64::MAX));
        let seen = Arc::clone(&committed);

        let mut writer = storage
            .write_object(
                &object,
                WriteMode::Rewrite,
                None,
                Some(Box::new(move |bytes| seen.store(bytes, Ordering::SeqCst))),
                16,
                &WriteSettings::default(),
            )
            .unwrap();
        writer.write_all(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        assert_eq!(committed.load(Ordering::SeqCst), u64::MAX, "{}", backend.label);
        assert_eq!(writer.finalize().unwrap(), 4);
        assert_eq!(committed.load(Ordering::SeqCst), 4, "{}", backend.label);

        assert_eq!(storage.get_object_metadata("a/b.bin").unwrap().size_bytes, 4);
        assert_eq!(get(storage, "a/b.bin"), [0xDE, 0xAD, 0xBE, 0xEF]);

        let mut children = Vec::new();
        storage.find_all_files("a/", &mut children, 0).unwrap();
        assert_eq!(children.len(), 1, "{}", backend.label);
        assert_eq!(children[0].relative_path, "a/b.bin");
        assert_eq!(children[0].bytes_size, 4);

        storage.remove_object(&object).unwrap();
        assert!(!storage.exists(&object).unwrap());
        let err = storage.remove_object(&object).unwrap_err();
        assert!(err.is_not_found(), "{}: {err}", backend.label);
        storage.remove_object_if_exists(&object).unwrap();
    }
}

#[test]
fn test_remove_if_exists_is_idempotent() {
    for backend in backends() {
        let storage = backend.storage.as_ref();
        let object = StoredObject::new("gone/twice");
        put(storage, "gone/twice", b"x");
        storage.remove_object_if_exists(&object).unwrap();
        storage.remove_object_if_exists(&object).unwrap();
        assert!(!storage.exists(&object).unwrap(), "{}", backend.label);
    }
}

#[test]
fn test_exists_never_reports_absence_as_error() {
    for backend in backends() {
        let storage = backend.storage.as_ref();
        assert!(!storage.exists(&StoredObject::new("missing")).unwrap());
        let err = storage.get_object_metadata("missing").unwrap_err();
        assert!(err.is_not_found(), "{}", backend.label);
        let err = storage
            .read_object(&StoredObject::new("missing"), &ReadSettings::default(), None, None)
            .err()
            .unwrap();
        assert!(err.is_not_found(), "{}", backend.label);
    }
}

#[test]
fn test_listing_is_complete_without_duplicates() {
    for backend in backends() {
        let storage = backend.storage.as_ref();
        for i in 0..120 {
            put(storage, &format!("parts/{:03}/data.bin", i), &[i as u8; 3]);
        }
        put(storage, "partsx/outside.bin", b"no");

        let mut children = Vec::new();
        storage.find_all_files("parts/", &mut children, 0).unwrap();
        let unique: HashSet<_> = children.iter().map(|c| c.relative_path.clone()).collect();
        assert_eq!(children.len(), 120, "{}", backend.label);
        assert_eq!(unique.len(), 120, "{}", backend.label);
        assert!(children.iter().all(|c| c.bytes_size == 3));

        let mut capped = Vec::new();
        storage.find_all_files("parts/", &mut capped, 7).unwrap();
        assert_eq!(capped.len(), 7, "{}", backend.label);
    }
}

#[test]
fn test_directory_contents_split_files_and_prefixes() {
    for backend in backends() {
        let storage = backend.storage.as_ref();
        put(storage, "dir/file.bin", b"12");
        put(storage, "dir/nested/deep.bin", b"3");

        let mut files = Vec::new();
        let mut directories = Vec::new();
        storage
            .get_directory_contents("dir/", &mut files, &mut directories)
            .unwrap();
        assert_eq!(files.len(), 1, "{}", backend.label);
        assert_eq!(files[0].relative_path, "dir/file.bin");
        assert_eq!(directories, vec!["dir/nested/".to_string()], "{}", backend.label);
    }
}

#[test]
fn test_directory_contents_forget_removed_and_abandoned_objects() {
    for backend in backends() {
        let storage = backend.storage.as_ref();
        put(storage, "dir/nested/deep.bin", b"gone");
        storage
            .remove_object(&StoredObject::new("dir/nested/deep.bin"))
            .unwrap();
        let abandoned = storage
            .write_object(
                &StoredObject::new("dir/abandoned/x"),
                WriteMode::Rewrite,
                None,
                None,
                16,
                &WriteSettings::default(),
            )
            .unwrap();
        drop(abandoned);

        let mut files = Vec::new();
        let mut directories = Vec::new();
        storage
            .get_directory_contents("dir/", &mut files, &mut directories)
            .unwrap();
        assert!(files.is_empty(), "{}", backend.label);
        assert!(directories.is_empty(), "{}: {directories:?}", backend.label);

        put(storage, "dir/nested/again.bin", b"back");
        storage
            .get_directory_contents("dir/", &mut files, &mut directories)
            .unwrap();
        assert_eq!(directories, vec!["dir/nested/".to_string()], "{}", backend.label);
    }
}

#[test]
fn test_batch_remove_fails_before_deleting_when_one_is_missing() {
    for backend in backends() {
        let storage = backend.storage.as_ref();
        put(storage, "batch/1", b"1");
        put(storage, "batch/2", b"2");
        let objects = vec![
            StoredObject::new("batch/1"),
            StoredObject::new("batch/missing"),
            StoredObject::new("batch/2"),
        ];

        let err = storage.remove_objects(&objects).unwrap_err();
        assert!(err.is_not_found(), "{}: {err}", backend.label);
        assert!(storage.exists(&objects[0]).unwrap());
        assert!(storage.exists(&objects[2]).unwrap());

        storage.remove_objects_if_exist(&objects).unwrap();
        for object in &objects {
            assert!(!storage.exists(object).unwrap(), "{}", backend.label);
        }

        put(storage, "batch/3", b"3");
        storage.remove_objects(&[StoredObject::new("batch/3")]).unwrap();
        assert!(!storage.exists(&StoredObject::new("batch/3")).unwrap());
    }
}

#[test]
fn test_dropped_writer_never_commits_or_calls_back() {
    for backend in backends() {
        let storage = backend.storage.as_ref();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        {
            let mut writer = storage
                .write_object(
                    &StoredObject::new("abandoned"),
                    WriteMode::Rewrite,
                    None,
                    Some(Box::new(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })),
                    16,
                    &WriteSettings::default(),
                )
                .unwrap();
            writer.write_all(b"never visible").unwrap();
            writer.flush().unwrap();
        }
        assert!(!storage.exists(&StoredObject::new("abandoned")).unwrap(), "{}", backend.label);
        assert_eq!(calls.load(Ordering::SeqCst), 0, "{}", backend.label);
    }
}

#[test]
fn test_rewrite_replaces_and_append_extends() {
    for backend in backends() {
        let storage = backend.storage.as_ref();
        put(storage, "doc", b"first");
        put(storage, "doc", b"second");
        assert_eq!(get(storage, "doc"), b"second", "{}", backend.label);

        let mut writer = storage
            .write_object(
                &StoredObject::new("doc"),
                WriteMode::Append,
                None,
                None,
                16,
                &WriteSettings::default(),
            )
            .unwrap();
        writer.write_all(b"+more").unwrap();
        writer.finalize().unwrap();
        assert_eq!(get(storage, "doc"), b"second+more", "{}", backend.label);
    }
}

#[test]
fn test_read_objects_concatenates_in_order() {
    for backend in backends() {
        let storage = backend.storage.as_ref();
        put(storage, "shard/0", b"hello ");
        put(storage, "shard/1", b"sharded ");
        put(storage, "shard/2", b"world");
        let shards = vec![
            StoredObject::with_size("shard/0", 6),
            StoredObject::with_size("shard/1", 8),
            // Advisory sizes may be wrong; the stream itself is the truth.
            StoredObject::with_size("shard/2", 999),
        ];

        let mut reader = storage
            .read_objects(&shards, &ReadSettings::default(), None, None)
            .unwrap();
        let mut all = String::new();
        reader.read_to_string(&mut all).unwrap();
        assert_eq!(all, "hello sharded world", "{}", backend.label);

        reader.seek(SeekFrom::Start(10)).unwrap();
        let mut tail = String::new();
        reader.read_to_string(&mut tail).unwrap();
        assert_eq!(tail, "ded world", "{}", backend.label);
    }
}

#[test]
fn test_copy_object_within_storage() {
    for backend in backends() {
        let storage = backend.storage.as_ref();
        put(storage, "src/item", b"copy me");
        storage
            .copy_object(&StoredObject::new("src/item"), &StoredObject::new("dst/item"), None)
            .unwrap();
        assert_eq!(get(storage, "dst/item"), b"copy me", "{}", backend.label);
        assert_eq!(get(storage, "src/item"), b"copy me", "{}", backend.label);

        let err = storage
            .copy_object(&StoredObject::new("src/none"), &StoredObject::new("dst/none"), None)
            .unwrap_err();
        assert!(err.is_not_found(), "{}", backend.label);
    }
}

#[test]
fn test_copy_between_different_backends_streams_data() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let local = LocalObjectStorage::new("local", dir.path()).unwrap();
    let memory = InMemoryObjectStorage::new("memory");

    put(&local, "from/local", b"disk bytes");
    local
        .copy_object_to_another_object_storage(
            &StoredObject::new("from/local"),
            &StoredObject::new("to/memory"),
            &memory,
            None,
        )
        .unwrap();
    assert_eq!(get(&memory, "to/memory"), b"disk bytes");

    put(&memory, "from/memory", b"ram bytes");
    memory
        .copy_object_to_another_object_storage(
            &StoredObject::new("from/memory"),
            &StoredObject::new("to/local"),
            &local,
            None,
        )
        .unwrap();
    assert_eq!(get(&local, "to/local"), b"ram bytes");
}

#[test]
fn test_clones_into_other_namespaces_are_isolated() {
    let config = ConfigTree::new();
    let context = StorageContext::default();
    for backend in backends() {
        let storage = backend.storage.as_ref();
        assert_eq!(storage.objects_namespace(), "main");
        put(storage, "shared/key", b"main");

        let other = storage
            .clone_object_storage("other", &config, "", &context)
            .unwrap();
        assert_eq!(other.objects_namespace(), "other");
        assert!(!other.exists(&StoredObject::new("shared/key")).unwrap(), "{}", backend.label);
        put(other.as_ref(), "shared/key", b"other");

        assert_eq!(get(storage, "shared/key"), b"main", "{}", backend.label);
        assert_eq!(get(other.as_ref(), "shared/key"), b"other", "{}", backend.label);

        let back = other
            .clone_object_storage("main", &config, "", &context)
            .unwrap();
        assert_eq!(get(back.as_ref(), "shared/key"), b"main", "{}", backend.label);
    }
}

#[test]
fn test_empty_namespace_is_isolated_from_its_clones() {
    let config = ConfigTree::new();
    let context = StorageContext::default();
    for backend in backends() {
        let unnamed = backend
            .storage
            .clone_object_storage("", &config, "", &context)
            .unwrap();
        assert_eq!(unnamed.objects_namespace(), "");
        let other = unnamed
            .clone_object_storage("other", &config, "", &context)
            .unwrap();

        put(other.as_ref(), "secret.bin", b"42");
        put(unnamed.as_ref(), "mine.bin", b"7");

        for key in ["secret.bin", "other/secret.bin"] {
            assert!(!unnamed.exists(&StoredObject::new(key)).unwrap(), "{}: {key}", backend.label);
        }
        assert!(!other.exists(&StoredObject::new("mine.bin")).unwrap(), "{}", backend.label);

        let mut listed = Vec::new();
        unnamed.find_all_files("", &mut listed, 0).unwrap();
        let keys: Vec<_> = listed.iter().map(|c| c.relative_path.as_str()).collect();
        assert_eq!(keys, ["mine.bin"], "{}", backend.label);

        let mut files = Vec::new();
        let mut directories = Vec::new();
        unnamed
            .get_directory_contents("", &mut files, &mut directories)
            .unwrap();
        assert!(directories.is_empty(), "{}: {directories:?}", backend.label);

        unnamed
            .remove_object_if_exists(&StoredObject::new("other/secret.bin"))
            .unwrap();
        assert_eq!(get(other.as_ref(), "secret.bin"), b"42", "{}", backend.label);
    }
}

#[test]
fn test_installed_throttlers_reach_patched_settings() {
    let context = StorageContext {
        max_remote_read_network_bandwidth: 1 << 30,
        max_remote_write_network_bandwidth: 0,
        credentials: None,
    };
    for backend in backends() {
        let storage = backend.storage.as_ref();
        storage
            .apply_new_settings(&ConfigTree::new(), "", &context)
            .unwrap();

        let read = storage.patch_read_settings(&ReadSettings::default());
        let installed = read.throttler.throttler().map(|t| t.max_speed());
        assert_eq!(installed, Some(1 << 30), "{}", backend.label);

        let disabled = storage
            .patch_read_settings(&ReadSettings::default().with_throttler(ThrottlerSelection::Disabled));
        assert!(disabled.throttler.throttler().is_none(), "{}", backend.label);

        let write = storage.patch_write_settings(&WriteSettings::default());
        assert!(write.throttler.throttler().is_none(), "{}", backend.label);

        // Throttled reads still return the same bytes.
        put(storage, "throttled", b"payload");
        assert_eq!(get(storage, "throttled"), b"payload");
    }
}

#[test]
fn test_shutdown_is_idempotent_and_blocks_new_operations() {
    for backend in backends() {
        let storage = backend.storage.as_ref();
        put(storage, "early", b"before");
        storage.shutdown();
        storage.shutdown();
        let err = storage
            .write_object(
                &StoredObject::new("late"),
                WriteMode::Rewrite,
                None,
                None,
                16,
                &WriteSettings::default(),
            )
            .err()
            .unwrap();
        assert!(matches!(err, ObjectStorageError::Shutdown(_)), "{}", backend.label);

        let queried = storage.exists(&StoredObject::new("early"));
        assert!(matches!(queried, Err(ObjectStorageError::Shutdown(_))), "{}", backend.label);
        let metadata = storage.get_object_metadata("early");
        assert!(matches!(metadata, Err(ObjectStorageError::Shutdown(_))), "{}", backend.label);
        let mut listed = Vec::new();
        let listing = storage.find_all_files("", &mut listed, 0);
        assert!(matches!(listing, Err(ObjectStorageError::Shutdown(_))), "{}", backend.label);
        let mut directories = Vec::new();
        let contents = storage.get_directory_contents("", &mut listed, &mut directories);
        assert!(matches!(contents, Err(ObjectStorageError::Shutdown(_))), "{}", backend.label);
        assert!(listed.is_empty(), "{}", backend.label);

        storage.startup().unwrap();
        assert!(storage.exists(&StoredObject::new("early")).unwrap(), "{}", backend.label);
        put(storage, "late", b"ok");
        assert!(storage.exists(&StoredObject::new("late")).unwrap());
    }
}

#[test]
fn test_generated_blob_names_and_capabilities() {
    for backend in backends() {
        let storage = backend.storage.as_ref();
        let name = storage.generate_blob_name_for_path("any/path");
        assert_eq!(name.len(), 32, "{}", backend.label);
        assert!(name.bytes().all(|b| b.is_ascii_lowercase()));
        assert!(!storage.is_remote());
        assert!(!storage.supports_cache());
        assert!(storage.cache_name().is_err());
        assert_eq!(storage.unique_id("any/path"), "any/path");
    }
}

#[test]
fn test_partial_batch_failure_names_survivors() {
    init_tracing();
    let storage = InMemoryObjectStorage::new("memory");
    for key in ["p/1", "p/2", "p/3", "p/4"] {
        put(&storage, key, b"x");
    }
    storage.fail_batch_removal_for(["p/2", "p/4"]);
    let objects: Vec<_> = ["p/1", "p/2", "p/3", "p/4"]
        .into_iter()
        .map(StoredObject::new)
        .collect();

    match storage.remove_objects(&objects) {
        Err(ObjectStorageError::PartialBatchFailure { failed, .. }) => {
            assert_eq!(failed, vec!["p/2".to_string(), "p/4".to_string()]);
        }
        other => panic!("expected partial failure, got {other:?}"),
    }
    let survivors: Vec<_> = objects
        .iter()
        .filter(|o| storage.exists(o).unwrap())
        .map(|o| o.remote_path.as_str())
        .collect();
    assert_eq!(survivors, ["p/2", "p/4"]);
}

#[test]
fn test_factory_builds_storages_from_config_file() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("storage.json");
    let disk_root = dir.path().join("disk");
    let content = serde_json::json!({
        "storage": {
            "hot": { "type": "memory", "namespace": "hot" },
            "cold": { "type": "local", "path": disk_root, "namespace": "cold" }
        }
    });
    std::fs::write(&config_path, content.to_string()).unwrap();

    let config = ConfigTree::from_path(&config_path).unwrap();
    let factory = ObjectStorageFactory::with_defaults().unwrap();
    let context = StorageContext::default();
    let hot = factory.create("hot", &config, "storage.hot", &context).unwrap();
    let cold = factory.create("cold", &config, "storage.cold", &context).unwrap();

    put(hot.as_ref(), "segment", b"hot data");
    hot.copy_object_to_another_object_storage(
        &StoredObject::new("segment"),
        &StoredObject::new("segment"),
        cold.as_ref(),
        None,
    )
    .unwrap();
    assert_eq!(get(cold.as_ref(), "segment"), b"hot data");
    assert!(disk_root.join("cold").join("segment").is_file());
}
