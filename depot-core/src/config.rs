//! Configuration inputs for backend (re)configuration.
//!
//! A [`ConfigTree`] is an already-parsed key/value tree; backends locate their
//! own subtree with a dotted prefix such as `storage.disks.s3_main`. The
//! [`StorageContext`] carries ambient settings shared by all backends.

use crate::error::{ObjectStorageError, StorageResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::Path;

/// Environment variable pointing at a JSON file with the [`StorageContext`].
pub const STORAGE_CONTEXT_ENV: &str = "DEPOT_STORAGE_CONTEXT";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigTree {
    root: Value,
}

impl ConfigTree {
    pub fn new() -> Self {
        Self::from_value(Value::Object(Default::default()))
    }

    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    pub fn from_json_str(content: &str) -> StorageResult<Self> {
        Ok(Self::from_value(serde_json::from_str(content)?))
    }

    pub fn from_path(path: impl AsRef<Path>) -> StorageResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Join a prefix and a key the way lookups expect them.
    pub fn join_key(prefix: &str, key: &str) -> String {
        match (prefix.is_empty(), key.is_empty()) {
            (true, _) => key.to_string(),
            (_, true) => prefix.to_string(),
            _ => format!("{prefix}.{key}"),
        }
    }

    /// Look up a dotted key. The empty key is the root.
    pub fn get(&self, key: &str) -> Option<&Value> {
        if key.is_empty() {
            return Some(&self.root);
        }
        key.split('.')
            .try_fold(&self.root, |node, part| node.as_object()?.get(part))
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    /// Numbers may be written either as JSON numbers or as numeric strings.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn subtree(&self, prefix: &str) -> Option<ConfigTree> {
        self.get(prefix).cloned().map(ConfigTree::from_value)
    }

    /// Deserialize the subtree at `prefix` into a typed backend config.
    pub fn deserialize<T: DeserializeOwned>(&self, prefix: &str) -> StorageResult<T> {
        let node = self.get(prefix).ok_or_else(|| {
            ObjectStorageError::Configuration(format!("missing config section '{prefix}'"))
        })?;
        serde_json::from_value(node.clone()).map_err(|e| {
            ObjectStorageError::Configuration(format!("invalid config section '{prefix}': {e}"))
        })
    }
}

/// Static credentials handed to remote backends.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Ambient settings active when a backend is created or reconfigured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageContext {
    /// Bytes per second for all remote reads of a storage instance, 0 = unlimited.
    pub max_remote_read_network_bandwidth: u64,
    /// Bytes per second for all remote writes of a storage instance, 0 = unlimited.
    pub max_remote_write_network_bandwidth: u64,
    pub credentials: Option<Credentials>,
}

impl StorageContext {
    pub fn from_path(path: impl AsRef<Path>) -> StorageResult<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn from_env_or_default() -> StorageResult<Self> {
        match std::env::var(STORAGE_CONTEXT_ENV) {
            Ok(path) => Self::from_path(path),
            Err(_) => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ConfigTree {
        ConfigTree::from_value(json!({
            "storage": {
                "disks": {
                    "main": {
                        "type": "local",
                        "path": "/var/lib/depot",
                        "list_object_keys_size": "500",
                        "read_only": "true"
                    }
                }
            }
        }))
    }

    #[test]
    fn dotted_lookup() {
        let config = sample();
        assert_eq!(config.get_str("storage.disks.main.type"), Some("local"));
        assert_eq!(config.get_u64("storage.disks.main.list_object_keys_size"), Some(500));
        assert_eq!(config.get_bool("storage.disks.main.read_only"), Some(true));
        assert!(!config.has("storage.disks.other"));
        assert!(config.get("").is_some());
    }

    #[test]
    fn join_key_handles_empty_parts() {
        assert_eq!(ConfigTree::join_key("", "type"), "type");
        assert_eq!(ConfigTree::join_key("a.b", ""), "a.b");
        assert_eq!(ConfigTree::join_key("a.b", "type"), "a.b.type");
    }

    #[test]
    fn deserialize_missing_section_is_configuration_error() {
        #[derive(Debug, Deserialize)]
        struct Section {
            #[allow(dead_code)]
            path: String,
        }
        let err = sample().deserialize::<Section>("storage.disks.nope").unwrap_err();
        assert!(matches!(err, ObjectStorageError::Configuration(_)));
        let section: Section = sample().deserialize("storage.disks.main").unwrap();
        assert_eq!(section.path, "/var/lib/depot");
    }

    #[test]
    fn context_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.json");
        std::fs::write(
            &path,
            r#"{"max_remote_read_network_bandwidth": 1048576,
                "credentials": {"access_key_id": "AK", "secret_access_key": "SK"}}"#,
        )
        .unwrap();
        let context = StorageContext::from_path(&path).unwrap();
        assert_eq!(context.max_remote_read_network_bandwidth, 1048576);
        assert_eq!(context.max_remote_write_network_bandwidth, 0);
        let debug = format!("{:?}", context.credentials.unwrap());
        assert!(!debug.contains("SK"));
    }
}
