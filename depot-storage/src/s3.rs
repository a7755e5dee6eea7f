//! AWS S3 Object Storage Implementation
//!
//! The storage API is synchronous; requests are driven through a tokio runtime
//! owned by the storage and shared with its clones and streams.

use crate::lifecycle::Lifecycle;
use crate::stream::ThrottledReader;
use crate::traits::{
    copy_through_streams, random_blob_name, ObjectRead, ObjectStorage, ObjectWrite,
    BLOB_NAME_LENGTH,
};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, Delete, MetadataDirective, ObjectIdentifier,
};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use depot_core::{
    ConfigTree, DataSourceDescription, DataSourceType, FinalizeCallback, ObjectAttributes,
    ObjectMetadata, ObjectStorageError, ReadSettings, RelativePathWithSize,
    RelativePathsWithSize, RemoteThrottlers, StorageContext, StorageResult, StoredObject,
    TaskHandle, ThrottlerSelection, WriteMode, WriteSettings, WriterPool,
};
use metrics::{counter, Counter};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::runtime::Runtime;

/// Keys per `DeleteObjects` request, the service maximum.
const DELETE_BATCH_SIZE: usize = 1000;
/// Smallest part S3 accepts for every part but the last.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;
/// Bytes escaped in the copy source header; `/` keeps separating key segments.
const COPY_SOURCE_ESCAPES: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

/// Configuration subtree of an S3 storage.
#[derive(Debug, Clone, Deserialize)]
pub struct S3StorageConfig {
    pub bucket: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// Page size of listing requests, independent of any caller-side result cap.
    #[serde(default = "default_list_object_keys_size")]
    pub list_object_keys_size: i32,
    /// Overrides `WriteSettings::min_upload_part_size` when set.
    #[serde(default)]
    pub min_upload_part_size: Option<usize>,
    #[serde(default)]
    pub read_only: bool,
}

fn default_list_object_keys_size() -> i32 {
    1000
}

/// Client plus the settings it was built from; swapped as a unit on reload.
struct S3Client {
    client: Client,
    endpoint: String,
    list_object_keys_size: i32,
    min_upload_part_size: Option<usize>,
}

/// AWS S3 (or S3-compatible) object storage bound to one bucket.
pub struct S3ObjectStorage {
    name: String,
    bucket: String,
    client: RwLock<Arc<S3Client>>,
    runtime: Arc<Runtime>,
    writer_pool: Arc<WriterPool>,
    read_only: AtomicBool,
    throttlers: RemoteThrottlers,
    lifecycle: Lifecycle,
}

impl std::fmt::Debug for S3ObjectStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStorage")
            .field("name", &self.name)
            .field("bucket", &self.bucket)
            .field("endpoint", &self.client().endpoint)
            .finish()
    }
}

fn transport(err: impl std::error::Error) -> ObjectStorageError {
    ObjectStorageError::Transport(DisplayErrorContext(err).to_string())
}

fn to_io(err: ObjectStorageError) -> io::Error {
    match err {
        ObjectStorageError::Io(e) => e,
        other => io::Error::other(other.to_string()),
    }
}

impl S3ObjectStorage {
    pub fn from_config(
        name: impl Into<String>,
        config: &ConfigTree,
        prefix: &str,
        context: &StorageContext,
        writer_pool: Arc<WriterPool>,
    ) -> StorageResult<Self> {
        let runtime =
            Runtime::new().map_err(|e| ObjectStorageError::Configuration(e.to_string()))?;
        let section: S3StorageConfig = config.deserialize(prefix)?;
        Self::from_section(name.into(), section, context, Arc::new(runtime), writer_pool)
    }

    fn from_section(
        name: String,
        section: S3StorageConfig,
        context: &StorageContext,
        runtime: Arc<Runtime>,
        writer_pool: Arc<WriterPool>,
    ) -> StorageResult<Self> {
        if section.bucket.is_empty() {
            return Err(ObjectStorageError::Configuration(format!(
                "storage {name}: bucket must not be empty"
            )));
        }
        let client = build_client(&runtime, &section, context);
        let storage = Self {
            name,
            bucket: section.bucket,
            client: RwLock::new(Arc::new(client)),
            runtime,
            writer_pool,
            read_only: AtomicBool::new(section.read_only),
            throttlers: RemoteThrottlers::new(),
            lifecycle: Lifecycle::new(),
        };
        storage.throttlers.apply_remote_throttling_settings(context);
        Ok(storage)
    }

    /// Snapshot of the current client; in-flight operations keep theirs on reload.
    fn client(&self) -> Arc<S3Client> {
        Arc::clone(&self.client.read().unwrap_or_else(PoisonError::into_inner))
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

    fn head(&self, key: &str) -> StorageResult<Option<ObjectMetadata>> {
        self.lifecycle.ensure_running(&self.name)?;
        let client = self.client();
        self.runtime.block_on(async {
            match client.client.head_object().bucket(&self.bucket).key(key).send().await {
                Ok(resp) => Ok(Some(ObjectMetadata {
                    size_bytes: resp.content_length().unwrap_or(0).max(0) as u64,
                    last_modified: resp
                        .last_modified()
                        .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos())),
                    attributes: resp
                        .metadata()
                        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
                })),
                Err(e) => {
                    let err = e.into_service_error();
                    if err.is_not_found() {
                        Ok(None)
                    } else {
                        Err(transport(err))
                    }
                }
            }
        })
    }

    fn server_side_copy(
        &self,
        from: &StoredObject,
        destination_bucket: &str,
        to: &StoredObject,
        attributes: Option<ObjectAttributes>,
    ) -> StorageResult<()> {
        let client = self.client();
        let source = copy_source(&self.bucket, &from.remote_path);
        self.runtime.block_on(async {
            let mut request = client
                .client
                .copy_object()
                .bucket(destination_bucket)
                .key(&to.remote_path)
                .copy_source(source);
            if let Some(attributes) = attributes {
                request = request
                    .metadata_directive(MetadataDirective::Replace)
                    .set_metadata(Some(attributes.into_iter().collect()));
            }
            match request.send().await {
                Ok(_) => Ok(()),
                Err(e) => {
                    let err = e.into_service_error();
                    if err.code() == Some("NoSuchKey") {
                        Err(ObjectStorageError::NotFound(from.remote_path.clone()))
                    } else {
                        Err(transport(err))
                    }
                }
            }
        })?;
        tracing::debug!(from = %from, to = %to, bucket = destination_bucket, "server-side copy");
        Ok(())
    }

    fn delete_batch(&self, objects: &[StoredObject], if_exists: bool) -> StorageResult<()> {
        self.ensure_writable("remove")?;
        if !if_exists {
            for object in objects {
                if !self.exists(object)? {
                    return Err(ObjectStorageError::NotFound(object.remote_path.clone()));
                }
            }
        }

        let client = self.client();
        let mut failed = Vec::new();
        let mut reason = String::new();
        for chunk in objects.chunks(DELETE_BATCH_SIZE) {
            let identifiers = chunk
                .iter()
                .map(|o| ObjectIdentifier::builder().key(&o.remote_path).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ObjectStorageError::Configuration(e.to_string()))?;
            let delete = Delete::builder()
                .set_objects(Some(identifiers))
                .quiet(true)
                .build()
                .map_err(|e| ObjectStorageError::Configuration(e.to_string()))?;

            let response = self.runtime.block_on(
                client
                    .client
                    .delete_objects()
                    .bucket(&self.bucket)
                    .delete(delete)
                    .send(),
            );
            match response {
                Ok(resp) => {
                    for error in resp.errors() {
                        failed.push(error.key().unwrap_or_default().to_string());
                        reason = error.message().unwrap_or("delete refused").to_string();
                    }
                }
                Err(e) => {
                    // The whole request failed; nothing in this chunk is known to be gone.
                    failed.extend(chunk.iter().map(|o| o.remote_path.clone()));
                    reason = DisplayErrorContext(&e).to_string();
                }
            }
        }

        counter!("depot_removed_objects_total", "storage" => self.name.clone())
            .increment((objects.len() - failed.len().min(objects.len())) as u64);
        if failed.is_empty() {
            Ok(())
        } else {
            tracing::warn!(storage = %self.name, failed = failed.len(), %reason, "batch delete incomplete");
            Err(ObjectStorageError::PartialBatchFailure { failed, reason })
        }
    }
}

/// `x-amz-copy-source` value: the bucket followed by the URL-encoded key.
fn copy_source(bucket: &str, key: &str) -> String {
    format!("{bucket}/{}", utf8_percent_encode(key, COPY_SOURCE_ESCAPES))
}

fn build_client(runtime: &Runtime, section: &S3StorageConfig, context: &StorageContext) -> S3Client {
    let credentials = match (&section.access_key_id, &section.secret_access_key) {
        (Some(key), Some(secret)) => Some(aws_sdk_s3::config::Credentials::new(
            key.clone(),
            secret.clone(),
            None,
            None,
            "depot-config",
        )),
        _ => context.credentials.as_ref().map(|c| {
            aws_sdk_s3::config::Credentials::new(
                c.access_key_id.clone(),
                c.secret_access_key.clone(),
                c.session_token.clone(),
                None,
                "depot-context",
            )
        }),
    };

    let client = runtime.block_on(async {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &section.region {
            loader = loader.region(aws_sdk_s3::config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &section.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let Some(credentials) = credentials {
            loader = loader.credentials_provider(credentials);
        }
        let shared = loader.load().await;
        let config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(section.endpoint.is_some())
            .build();
        Client::from_conf(config)
    });

    S3Client {
        client,
        endpoint: section
            .endpoint
            .clone()
            .unwrap_or_else(|| "s3.amazonaws.com".to_string()),
        list_object_keys_size: section.list_object_keys_size.max(1),
        min_upload_part_size: section.min_upload_part_size,
    }
}

impl ObjectStorage for S3ObjectStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn data_source_description(&self) -> DataSourceDescription {
        DataSourceDescription::new(DataSourceType::S3, self.client().endpoint.clone())
    }

    fn exists(&self, object: &StoredObject) -> StorageResult<bool> {
        Ok(self.head(&object.remote_path)?.is_some())
    }

    fn find_all_files(
        &self,
        prefix: &str,
        children: &mut RelativePathsWithSize,
        max_keys: usize,
    ) -> StorageResult<()> {
        self.lifecycle.ensure_running(&self.name)?;
        let client = self.client();
        let mut found = 0usize;
        let mut continuation_token: Option<String> = None;
        loop {
            let mut page_size = client.list_object_keys_size;
            if max_keys > 0 {
                let remaining = i32::try_from(max_keys - found).unwrap_or(i32::MAX);
                page_size = page_size.min(remaining);
            }
            let mut request = client
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .max_keys(page_size);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }
            let resp = self.runtime.block_on(request.send()).map_err(transport)?;

            for object in resp.contents() {
                if let Some(key) = object.key() {
                    let size = object.size().unwrap_or(0).max(0) as u64;
                    children.push(RelativePathWithSize::new(key, size));
                    found += 1;
                    if max_keys > 0 && found >= max_keys {
                        return Ok(());
                    }
                }
            }

            match resp.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }
        tracing::trace!(storage = %self.name, prefix, found, "listed objects");
        Ok(())
    }

    fn get_directory_contents(
        &self,
        path: &str,
        files: &mut RelativePathsWithSize,
        directories: &mut Vec<String>,
    ) -> StorageResult<()> {
        self.lifecycle.ensure_running(&self.name)?;
        let prefix = match path.trim_end_matches('/') {
            "" => String::new(),
            trimmed => format!("{trimmed}/"),
        };
        let client = self.client();
        let mut continuation_token: Option<String> = None;
        loop {
            let mut request = client
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .delimiter("/")
                .max_keys(client.list_object_keys_size);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }
            let resp = self.runtime.block_on(request.send()).map_err(transport)?;

            for object in resp.contents() {
                if let Some(key) = object.key() {
                    files.push(RelativePathWithSize::new(
                        key,
                        object.size().unwrap_or(0).max(0) as u64,
                    ));
                }
            }
            directories.extend(
                resp.common_prefixes()
                    .iter()
                    .filter_map(|p| p.prefix().map(str::to_string)),
            );

            match resp.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }
        Ok(())
    }

    fn get_object_metadata(&self, path: &str) -> StorageResult<ObjectMetadata> {
        self.head(path)?
            .ok_or_else(|| ObjectStorageError::NotFound(path.to_string()))
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
        let size = self.get_object_metadata(&object.remote_path)?.size_bytes;
        let chunk_size = read_hint
            .unwrap_or(usize::MAX)
            .min(settings.effective_buffer_size())
            .max(1);
        let reader = S3ObjectReader {
            runtime: Arc::clone(&self.runtime),
            client: self.client(),
            bucket: self.bucket.clone(),
            key: object.remote_path.clone(),
            size,
            position: 0,
            buffer: Vec::new(),
            buffer_start: 0,
            chunk_size,
        };
        Ok(Box::new(ThrottledReader::new(
            reader,
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
        _buffer_size: usize,
        settings: &WriteSettings,
    ) -> StorageResult<Box<dyn ObjectWrite>> {
        self.ensure_writable("write")?;
        if mode == WriteMode::Append {
            return Err(ObjectStorageError::Unsupported(format!(
                "append to {} on S3 storage {}",
                object.remote_path, self.name
            )));
        }
        let settings = self.patch_write_settings(settings);
        let client = self.client();
        let part_size = client
            .min_upload_part_size
            .unwrap_or(settings.min_upload_part_size)
            .max(MIN_PART_SIZE);

        Ok(Box::new(S3ObjectWriter {
            target: UploadTarget {
                runtime: Arc::clone(&self.runtime),
                client,
                bucket: self.bucket.clone(),
                key: object.remote_path.clone(),
            },
            metadata: attributes.map(|a| a.into_iter().collect()),
            buffer: Vec::new(),
            part_size,
            single_part_limit: settings.max_single_part_upload_size.max(part_size),
            multipart: None,
            pool: Arc::clone(&self.writer_pool),
            pool_timeout: settings.pool_wait_timeout(),
            failure: None,
            bytes_written: 0,
            finalize_callback,
            throttler: settings.throttler,
            bytes_counter: counter!("depot_written_bytes_total", "storage" => self.name.clone()),
        }))
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn remove_object(&self, object: &StoredObject) -> StorageResult<()> {
        self.ensure_writable("remove")?;
        // DeleteObject succeeds for absent keys, so absence is checked first.
        if !self.exists(object)? {
            return Err(ObjectStorageError::NotFound(object.remote_path.clone()));
        }
        self.remove_object_if_exists(object)
    }

    fn remove_object_if_exists(&self, object: &StoredObject) -> StorageResult<()> {
        self.ensure_writable("remove")?;
        let client = self.client();
        self.runtime
            .block_on(
                client
                    .client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(&object.remote_path)
                    .send(),
            )
            .map_err(transport)?;
        counter!("depot_removed_objects_total", "storage" => self.name.clone()).increment(1);
        Ok(())
    }

    fn remove_objects(&self, objects: &[StoredObject]) -> StorageResult<()> {
        self.delete_batch(objects, false)
    }

    fn remove_objects_if_exist(&self, objects: &[StoredObject]) -> StorageResult<()> {
        self.delete_batch(objects, true)
    }

    fn copy_object(
        &self,
        from: &StoredObject,
        to: &StoredObject,
        attributes: Option<ObjectAttributes>,
    ) -> StorageResult<()> {
        self.ensure_writable("copy")?;
        self.server_side_copy(from, &self.bucket, to, attributes)
    }

    fn copy_object_to_another_object_storage(
        &self,
        from: &StoredObject,
        to: &StoredObject,
        destination: &dyn ObjectStorage,
        attributes: Option<ObjectAttributes>,
    ) -> StorageResult<()> {
        if destination.data_source_description() == self.data_source_description() {
            if destination.is_read_only() {
                return Err(ObjectStorageError::Unsupported(format!(
                    "copy into read-only storage {}",
                    destination.name()
                )));
            }
            let bucket = destination.objects_namespace();
            return self.server_side_copy(from, &bucket, to, attributes);
        }
        copy_through_streams(self, from, to, destination, attributes)
    }

    fn startup(&self) -> StorageResult<()> {
        self.lifecycle.start();
        tracing::info!(storage = %self.name, bucket = %self.bucket, "S3 object storage started");
        Ok(())
    }

    fn shutdown(&self) {
        if self.lifecycle.shutdown() {
            tracing::info!(storage = %self.name, "S3 object storage shut down");
        }
    }

    fn apply_new_settings(
        &self,
        config: &ConfigTree,
        prefix: &str,
        context: &StorageContext,
    ) -> StorageResult<()> {
        let mut section: S3StorageConfig = config.deserialize(prefix)?;
        // The bucket is fixed for the lifetime of an instance.
        section.bucket = self.bucket.clone();
        let client = build_client(&self.runtime, &section, context);
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(client);
        self.read_only.store(section.read_only, Ordering::SeqCst);
        self.throttlers.apply_remote_throttling_settings(context);
        tracing::debug!(storage = %self.name, "reloaded S3 client settings");
        Ok(())
    }

    fn objects_namespace(&self) -> String {
        self.bucket.clone()
    }

    fn clone_object_storage(
        &self,
        new_namespace: &str,
        config: &ConfigTree,
        prefix: &str,
        context: &StorageContext,
    ) -> StorageResult<Box<dyn ObjectStorage>> {
        let mut section: S3StorageConfig = config.deserialize(prefix)?;
        section.bucket = new_namespace.to_string();
        let clone = Self::from_section(
            self.name.clone(),
            section,
            context,
            Arc::clone(&self.runtime),
            Arc::clone(&self.writer_pool),
        )?;
        Ok(Box::new(clone))
    }

    /// Blob names are split after three letters to spread keys over prefixes.
    fn generate_blob_name_for_path(&self, _path: &str) -> String {
        let name = random_blob_name(BLOB_NAME_LENGTH);
        format!("{}/{}", &name[..3], &name[3..])
    }

    fn unique_id(&self, path: &str) -> String {
        format!("{}/{}", self.bucket, path)
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn supports_parallel_write(&self) -> bool {
        true
    }

    fn remote_throttlers(&self) -> &RemoteThrottlers {
        &self.throttlers
    }
}

/// Seekable reader fetching the object in ranged GETs of `chunk_size` bytes.
struct S3ObjectReader {
    runtime: Arc<Runtime>,
    client: Arc<S3Client>,
    bucket: String,
    key: String,
    size: u64,
    position: u64,
    buffer: Vec<u8>,
    buffer_start: u64,
    chunk_size: usize,
}

impl S3ObjectReader {
    fn fill(&mut self) -> io::Result<()> {
        let end = (self.position + self.chunk_size as u64).min(self.size) - 1;
        let range = format!("bytes={}-{}", self.position, end);
        let data = self.runtime.block_on(async {
            let resp = self
                .client
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .range(range)
                .send()
                .await
                .map_err(|e| io::Error::other(DisplayErrorContext(e).to_string()))?;
            let body = resp
                .body
                .collect()
                .await
                .map_err(|e| io::Error::other(e.to_string()))?;
            Ok::<_, io::Error>(body.into_bytes().to_vec())
        })?;
        self.buffer = data;
        self.buffer_start = self.position;
        Ok(())
    }
}

impl Read for S3ObjectReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.position >= self.size {
            return Ok(0);
        }
        let buffered_end = self.buffer_start + self.buffer.len() as u64;
        if self.position < self.buffer_start || self.position >= buffered_end {
            self.fill()?;
        }
        let offset = (self.position - self.buffer_start) as usize;
        let available = &self.buffer[offset.min(self.buffer.len())..];
        if available.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} shrank while being read", self.key),
            ));
        }
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for S3ObjectReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start of object"))?;
        self.position = target;
        Ok(target)
    }
}

/// Where an upload goes; cheap to clone into pool tasks.
#[derive(Clone)]
struct UploadTarget {
    runtime: Arc<Runtime>,
    client: Arc<S3Client>,
    bucket: String,
    key: String,
}

impl UploadTarget {
    fn put(&self, data: Vec<u8>, metadata: Option<HashMap<String, String>>) -> StorageResult<()> {
        self.runtime
            .block_on(
                self.client
                    .client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(&self.key)
                    .set_metadata(metadata)
                    .body(ByteStream::from(data))
                    .send(),
            )
            .map_err(transport)?;
        Ok(())
    }

    fn create_multipart(&self, metadata: Option<HashMap<String, String>>) -> StorageResult<String> {
        let resp = self
            .runtime
            .block_on(
                self.client
                    .client
                    .create_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&self.key)
                    .set_metadata(metadata)
                    .send(),
            )
            .map_err(transport)?;
        resp.upload_id().map(str::to_string).ok_or_else(|| {
            ObjectStorageError::Transport(format!("no upload id returned for {}", self.key))
        })
    }

    fn upload_part(&self, upload_id: &str, part_number: i32, data: Vec<u8>) -> StorageResult<CompletedPart> {
        let resp = self
            .runtime
            .block_on(
                self.client
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(&self.key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(data))
                    .send(),
            )
            .map_err(transport)?;
        Ok(CompletedPart::builder()
            .set_e_tag(resp.e_tag().map(str::to_string))
            .part_number(part_number)
            .build())
    }

    fn complete(&self, upload_id: &str, parts: Vec<CompletedPart>) -> StorageResult<()> {
        let upload = CompletedMultipartUpload::builder().set_parts(Some(parts)).build();
        self.runtime
            .block_on(
                self.client
                    .client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&self.key)
                    .upload_id(upload_id)
                    .multipart_upload(upload)
                    .send(),
            )
            .map_err(transport)?;
        Ok(())
    }

    fn abort(&self, upload_id: &str) -> StorageResult<()> {
        self.runtime
            .block_on(
                self.client
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&self.key)
                    .upload_id(upload_id)
                    .send(),
            )
            .map_err(transport)?;
        Ok(())
    }
}

struct MultipartUpload {
    upload_id: String,
    parts: Vec<TaskHandle<CompletedPart>>,
    completed: bool,
}

/// Buffers small objects for a single PUT; switches to a multipart upload with
/// parts running on the writer pool once the buffer outgrows the single-part limit.
struct S3ObjectWriter {
    target: UploadTarget,
    metadata: Option<HashMap<String, String>>,
    buffer: Vec<u8>,
    part_size: usize,
    single_part_limit: usize,
    multipart: Option<MultipartUpload>,
    pool: Arc<WriterPool>,
    pool_timeout: Option<std::time::Duration>,
    /// First error of a `write`; parts may be lost, so the object is never completed.
    failure: Option<String>,
    bytes_written: u64,
    finalize_callback: Option<FinalizeCallback>,
    throttler: ThrottlerSelection,
    bytes_counter: Counter,
}

impl S3ObjectWriter {
    fn submit_part(&mut self, data: Vec<u8>) -> StorageResult<()> {
        if self.multipart.is_none() {
            let upload_id = self.target.create_multipart(self.metadata.take())?;
            tracing::debug!(object = %self.target.key, %upload_id, "started multipart upload");
            self.multipart = Some(MultipartUpload {
                upload_id,
                parts: Vec::new(),
                completed: false,
            });
        }
        let Some(upload) = self.multipart.as_mut() else {
            return Ok(());
        };
        let part_number = i32::try_from(upload.parts.len() + 1)
            .map_err(|_| ObjectStorageError::Unsupported("too many upload parts".into()))?;
        let target = self.target.clone();
        let upload_id = upload.upload_id.clone();
        let handle = self.pool.schedule(
            move || target.upload_part(&upload_id, part_number, data),
            self.pool_timeout,
        )?;
        upload.parts.push(handle);
        Ok(())
    }

    fn drain_full_parts(&mut self) -> StorageResult<()> {
        let started = self.multipart.is_some();
        if !started && self.buffer.len() <= self.single_part_limit {
            return Ok(());
        }
        while self.buffer.len() >= self.part_size {
            let rest = self.buffer.split_off(self.part_size);
            let part = std::mem::replace(&mut self.buffer, rest);
            self.submit_part(part)?;
        }
        Ok(())
    }

    fn ensure_intact(&self) -> StorageResult<()> {
        match &self.failure {
            Some(reason) => Err(ObjectStorageError::Transport(format!(
                "upload of {} failed earlier: {reason}",
                self.target.key
            ))),
            None => Ok(()),
        }
    }
}

impl Write for S3ObjectWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_intact().map_err(to_io)?;
        self.buffer.extend_from_slice(buf);
        self.throttler.throttle(buf.len() as u64);
        self.bytes_counter.increment(buf.len() as u64);
        if let Err(e) = self.drain_full_parts() {
            tracing::warn!(object = %self.target.key, error = %e, "part upload could not be scheduled");
            self.failure = Some(e.to_string());
            return Err(to_io(e));
        }
        self.bytes_written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ObjectWrite for S3ObjectWriter {
    fn finalize(mut self: Box<Self>) -> StorageResult<u64> {
        self.ensure_intact()?;
        if self.multipart.is_none() {
            let data = std::mem::take(&mut self.buffer);
            self.target.put(data, self.metadata.take())?;
        } else {
            if !self.buffer.is_empty() {
                let last = std::mem::take(&mut self.buffer);
                self.submit_part(last)?;
            }
            if let Some(upload) = self.multipart.as_mut() {
                let mut parts = Vec::with_capacity(upload.parts.len());
                for handle in upload.parts.drain(..) {
                    parts.push(handle.wait()?);
                }
                self.target.complete(&upload.upload_id, parts)?;
                upload.completed = true;
            }
        }

        tracing::debug!(object = %self.target.key, bytes = self.bytes_written, "committed S3 object");
        if let Some(callback) = self.finalize_callback.take() {
            callback(self.bytes_written);
        }
        Ok(self.bytes_written)
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl Drop for S3ObjectWriter {
    fn drop(&mut self) {
        let Some(upload) = self.multipart.as_mut() else {
            return;
        };
        if upload.completed {
            return;
        }
        // Parts still uploading would otherwise outlive the abort.
        for handle in upload.parts.drain(..) {
            let _ = handle.wait();
        }
        match self.target.abort(&upload.upload_id) {
            Ok(()) => tracing::debug!(object = %self.target.key, "aborted multipart upload"),
            Err(e) => {
                tracing::warn!(object = %self.target.key, error = %e, "failed to abort multipart upload")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_defaults() {
        let config = ConfigTree::from_value(json!({ "s3": { "bucket": "data" } }));
        let section: S3StorageConfig = config.deserialize("s3").unwrap();
        assert_eq!(section.bucket, "data");
        assert_eq!(section.list_object_keys_size, 1000);
        assert!(section.endpoint.is_none());
        assert!(section.min_upload_part_size.is_none());
        assert!(!section.read_only);
    }

    #[test]
    fn test_config_requires_bucket() {
        let config = ConfigTree::from_value(json!({ "s3": { "endpoint": "http://localhost:9000" } }));
        assert!(config.deserialize::<S3StorageConfig>("s3").is_err());
    }

    fn offline_storage(pool: WriterPool) -> S3ObjectStorage {
        let section = S3StorageConfig {
            bucket: "data".into(),
            endpoint: Some("http://127.0.0.1:1".into()),
            region: Some("us-east-1".into()),
            access_key_id: Some("key".into()),
            secret_access_key: Some("secret".into()),
            list_object_keys_size: 1000,
            min_upload_part_size: None,
            read_only: false,
        };
        let runtime = Arc::new(Runtime::new().unwrap());
        S3ObjectStorage::from_section(
            "s3".into(),
            section,
            &StorageContext::default(),
            runtime,
            Arc::new(pool),
        )
        .unwrap()
    }

    #[test]
    fn test_copy_source_encodes_key() {
        assert_eq!(copy_source("data", "dir/plain-key_1.bin"), "data/dir/plain-key_1.bin");
        assert_eq!(
            copy_source("data", "dir/a b+c%d/\u{e9}t\u{e9}.bin"),
            "data/dir/a%20b%2Bc%25d/%C3%A9t%C3%A9.bin"
        );
        assert_eq!(copy_source("data", "q?x=1&y#z"), "data/q%3Fx%3D1%26y%23z");
    }

    #[test]
    fn test_queries_fail_after_shutdown_without_requests() {
        let pool = WriterPool::new(depot_core::WriterPoolConfig::default()).unwrap();
        let storage = offline_storage(pool);
        storage.shutdown();
        let object = StoredObject::new("k");
        assert!(matches!(storage.exists(&object), Err(ObjectStorageError::Shutdown(_))));
        assert!(matches!(storage.get_object_metadata("k"), Err(ObjectStorageError::Shutdown(_))));
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        assert!(matches!(
            storage.find_all_files("", &mut files, 0),
            Err(ObjectStorageError::Shutdown(_))
        ));
        assert!(matches!(
            storage.get_directory_contents("", &mut files, &mut dirs),
            Err(ObjectStorageError::Shutdown(_))
        ));
    }

    #[test]
    fn test_writer_refuses_to_commit_after_lost_part() {
        let pool = Arc::new(
            WriterPool::new(depot_core::WriterPoolConfig {
                max_threads: 1,
                max_queued: 0,
            })
            .unwrap(),
        );
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let blocker = pool
            .schedule(
                move || {
                    release_rx.recv().ok();
                    Ok(())
                },
                None,
            )
            .unwrap();

        let storage = offline_storage(WriterPool::new(depot_core::WriterPoolConfig::default()).unwrap());
        let called = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&called);
        let mut writer = Box::new(S3ObjectWriter {
            target: UploadTarget {
                runtime: Arc::clone(&storage.runtime),
                client: storage.client(),
                bucket: "data".into(),
                key: "big.bin".into(),
            },
            metadata: None,
            buffer: Vec::new(),
            part_size: 4,
            single_part_limit: 4,
            // Already started and marked completed so no request is ever sent.
            multipart: Some(MultipartUpload {
                upload_id: "upload".into(),
                parts: Vec::new(),
                completed: true,
            }),
            pool: Arc::clone(&pool),
            pool_timeout: Some(std::time::Duration::from_millis(10)),
            failure: None,
            bytes_written: 0,
            finalize_callback: Some(Box::new(move |_| seen.store(true, Ordering::SeqCst))),
            throttler: ThrottlerSelection::Disabled,
            bytes_counter: Counter::noop(),
        });

        assert!(writer.write(b"12345678").is_err());
        assert_eq!(writer.bytes_written(), 0);
        assert!(writer.write(b"9").is_err());
        assert!(matches!(writer.finalize(), Err(ObjectStorageError::Transport(_))));
        assert!(!called.load(Ordering::SeqCst));

        release_tx.send(()).unwrap();
        blocker.wait().unwrap();
    }

    #[test]
    fn test_io_errors_pass_through() {
        let err = to_io(ObjectStorageError::Io(io::Error::new(io::ErrorKind::TimedOut, "slow")));
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        let err = to_io(ObjectStorageError::PoolExhausted("full".into()));
        assert!(err.to_string().contains("full"));
    }
}
