use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Backend-specific key/value tags attached to an object at write time.
pub type ObjectAttributes = BTreeMap<String, String>;

/// One blob inside a backend namespace.
///
/// `remote_path` is the key inside the namespace. `local_path` is the logical path
/// the engine knows the object by (kept for diagnostics and cache keys, may be
/// empty). `bytes_size` is advisory: metadata queries are the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoredObject {
    pub remote_path: String,
    #[serde(default)]
    pub local_path: String,
    #[serde(default)]
    pub bytes_size: u64,
}

impl StoredObject {
    pub fn new(remote_path: impl Into<String>) -> Self {
        Self {
            remote_path: remote_path.into(),
            local_path: String::new(),
            bytes_size: 0,
        }
    }

    pub fn with_size(remote_path: impl Into<String>, bytes_size: u64) -> Self {
        Self {
            bytes_size,
            ..Self::new(remote_path)
        }
    }

    pub fn with_local_path(mut self, local_path: impl Into<String>) -> Self {
        self.local_path = local_path.into();
        self
    }
}

impl fmt::Display for StoredObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.local_path.is_empty() {
            write!(f, "{}", self.remote_path)
        } else {
            write!(f, "{} ({})", self.remote_path, self.local_path)
        }
    }
}

/// A logical file, possibly split over several backend objects, in read order.
pub type StoredObjects = Vec<StoredObject>;

/// Sum of the advisory sizes of `objects`.
pub fn total_bytes_size(objects: &[StoredObject]) -> u64 {
    objects.iter().map(|o| o.bytes_size).sum()
}

/// Listing entry returned by `find_all_files` and `get_directory_contents`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelativePathWithSize {
    pub relative_path: String,
    pub bytes_size: u64,
}

impl RelativePathWithSize {
    pub fn new(relative_path: impl Into<String>, bytes_size: u64) -> Self {
        Self {
            relative_path: relative_path.into(),
            bytes_size,
        }
    }
}

pub type RelativePathsWithSize = Vec<RelativePathWithSize>;

/// Result of a metadata query against a backend. Never cached by this layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub size_bytes: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub attributes: Option<ObjectAttributes>,
}

impl ObjectMetadata {
    pub fn with_size(size_bytes: u64) -> Self {
        Self {
            size_bytes,
            last_modified: None,
            attributes: None,
        }
    }
}

/// How `write_object` treats an existing object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Truncate or create.
    #[default]
    Rewrite,
    /// Extend an existing object; backends without append fail with `Unsupported`.
    Append,
}

/// Medium a backend stores its objects on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceType {
    Local,
    Memory,
    S3,
    Other(String),
}

impl DataSourceType {
    pub fn as_str(&self) -> &str {
        match self {
            DataSourceType::Local => "local",
            DataSourceType::Memory => "memory",
            DataSourceType::S3 => "s3",
            DataSourceType::Other(name) => name,
        }
    }
}

/// Describes where an object storage keeps its data.
///
/// Two storages with equal descriptions address the same physical data source,
/// which is what lets a backend decide whether a native copy is possible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataSourceDescription {
    pub kind: DataSourceType,
    pub description: String,
    pub is_encrypted: bool,
    pub is_cached: bool,
}

impl DataSourceDescription {
    pub fn new(kind: DataSourceType, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            is_encrypted: false,
            is_cached: false,
        }
    }
}

impl fmt::Display for DataSourceDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind.as_str(), self.description)
    }
}
