//! A set of uniform storage abstractions over heterogeneous object stores.
//!
//! [`ObjectStore`] is a CRUD-like generic contract with five implementations:
//!   * [`local_fs`] exposes a local file system tree
//!   * [`s3_bucket`] talks to AWS S3 (and S3-compatible endpoints)
//!   * [`gcs_bucket`] talks to Google Cloud Storage over its JSON API
//!   * [`azure_blob`] talks to Azure Blob storage
//!   * [`aifs_store`] talks to an AIFS asset store over gRPC
//!
//! Callers address objects with [`ObjectUri`] values; the scheme picks the
//! backend through [`registry::StoreRegistry`]. Wire-level divergence
//! (flat vs hierarchical namespaces, copy size caps, checksum schemes) is
//! absorbed here so the transfer engine above can stay backend-agnostic.
#![deny(unsafe_code)]
#![deny(clippy::undocumented_unsafe_blocks)]

mod aifs_store;
mod azure_blob;
mod error;
mod gcs_bucket;
mod local_fs;
pub mod registry;
mod s3_bucket;
pub mod support;
pub mod uri;

use std::collections::HashMap;
use std::fmt::Debug;
use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::bail;
use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use self::aifs_store::AifsStore;
pub use self::azure_blob::AzureBlobStorage;
pub use self::gcs_bucket::GcsBucket;
pub use self::local_fs::LocalFs;
pub use self::s3_bucket::S3Bucket;
pub use self::uri::{ObjectUri, Scheme};

pub use error::{ErrorKind, StoreError, TimeoutOrCancel};

/// S3 allows at most this many parts in one multipart upload or copy.
pub const S3_MAX_PARTS: u64 = 10_000;
/// Objects above this size cannot be copied with a single `CopyObject` call.
pub const S3_MAX_SINGLE_COPY_BYTES: u64 = 5 * 1024 * 1024 * 1024;
/// Uploads above this size switch to multipart.
pub const S3_MULTIPART_THRESHOLD: u64 = 8 * 1024 * 1024;
/// GCS uploads above this size must go through a resumable session.
pub const GCS_RESUMABLE_THRESHOLD: u64 = 2 * 1024 * 1024;
/// As defined in S3 docs.
pub const MAX_KEYS_PER_DELETE: usize = 1000;

pub const DEFAULT_CONCURRENCY_LIMIT: usize = 16;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) const PREFIX_SEPARATOR: char = '/';

/// Extra set of key-value pairs that contain arbitrary metadata about the
/// storage entry. Immutable, cannot be changed once the object is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMetadata(pub HashMap<String, String>);

impl<const N: usize> From<[(&str, &str); N]> for StorageMetadata {
    fn from(arr: [(&str, &str); N]) -> Self {
        let map: HashMap<String, String> = arr
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self(map)
    }
}

/// An algorithm-tagged content checksum, rendered as `algo:hex`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Checksum {
    Blake3(String),
    Md5(String),
    Crc32c(String),
    Sha256(String),
}

impl Checksum {
    pub fn algorithm(&self) -> &'static str {
        match self {
            Checksum::Blake3(_) => "blake3",
            Checksum::Md5(_) => "md5",
            Checksum::Crc32c(_) => "crc32c",
            Checksum::Sha256(_) => "sha256",
        }
    }

    pub fn hex_digest(&self) -> &str {
        match self {
            Checksum::Blake3(d) | Checksum::Md5(d) | Checksum::Crc32c(d) | Checksum::Sha256(d) => d,
        }
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm(), self.hex_digest())
    }
}

/// What `list` and `stat` return for a single entry.
///
/// Invariant: `is_dir` iff the uri ends with `/`, and directories always
/// report `size == 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub uri: ObjectUri,
    pub name: String,
    pub size: u64,
    pub last_modified: Option<SystemTime>,
    pub is_dir: bool,
    pub etag: Option<String>,
    pub checksum: Option<Checksum>,
    pub metadata: Option<StorageMetadata>,
}

impl ObjectInfo {
    /// Synthetic entry for a directory/prefix that only exists by virtue of
    /// delimiter listing.
    pub fn synthetic_dir(uri: ObjectUri) -> Self {
        debug_assert!(uri.is_dir());
        let name = uri.name().to_string();
        ObjectInfo {
            uri,
            name,
            size: 0,
            last_modified: None,
            is_dir: true,
            etag: None,
            checksum: None,
            metadata: None,
        }
    }
}

/// We don't need callers to be able to pass arbitrary delimiters: just control
/// whether listings will use a '/' separator or not.
///
/// The WithDelimiter mode returns direct children only, with prefixes
/// surfaced as directory entries. The NoDelimiter mode returns every key
/// under the prefix, no directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingMode {
    WithDelimiter,
    NoDelimiter,
}

#[derive(Debug, Clone)]
pub struct ListOptions {
    pub mode: ListingMode,
    /// Extra name prefix filter applied within the listed directory.
    pub prefix: Option<String>,
    /// Opaque continuation token from a previous page.
    pub page_token: Option<String>,
    /// Advisory; backends may return fewer entries.
    pub page_size: Option<NonZeroU32>,
}

impl Default for ListOptions {
    fn default() -> Self {
        ListOptions {
            mode: ListingMode::WithDelimiter,
            prefix: None,
            page_token: None,
            page_size: None,
        }
    }
}

/// One page of a listing. Entries are sorted ascending by raw key bytes.
#[derive(Debug, Default)]
pub struct ListPage {
    pub items: Vec<ObjectInfo>,
    pub next_page_token: Option<String>,
}

/// Receives `(bytes_done, bytes_total)` tuples during a transfer. Values are
/// monotonically non-decreasing; a final report is always delivered on
/// completion.
pub trait ProgressSink: Send + Sync {
    fn report(&self, bytes_done: u64, bytes_total: Option<u64>);
}

/// Sink for callers that do not care.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report(&self, _bytes_done: u64, _bytes_total: Option<u64>) {}
}

/// Called with an opaque resume token as soon as a backend mints one
/// (e.g. a GCS resumable session URL), so the job layer can persist it
/// before the transfer either finishes or dies.
pub type ResumeTokenSink = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub metadata: Option<StorageMetadata>,
    /// Token from an earlier interrupted upload of the same source to the
    /// same destination.
    pub resume_token: Option<String>,
    pub resume_sink: Option<ResumeTokenSink>,
    /// Cap on concurrent part uploads within this single put.
    pub part_concurrency: Option<NonZeroUsize>,
}

impl Debug for PutOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PutOptions")
            .field("content_type", &self.content_type)
            .field("metadata", &self.metadata)
            .field("has_resume_token", &self.resume_token.is_some())
            .field("part_concurrency", &self.part_concurrency)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    pub recursive: bool,
    /// Allow recursive deletion to descend into mount points owned by a
    /// different user. Only meaningful for the file backend.
    pub allow_foreign_mounts: bool,
}

/// Storage API to manage object-store state, unaware of panes, jobs or any
/// other client context: basic CRUD operations for objects and prefixes.
///
/// Every operation observes `cancel` between wire requests and between
/// streamed chunks, and enforces the backend's per-request timeout.
#[allow(async_fn_in_trait)]
pub trait ObjectStore: Send + Sync + 'static {
    /// Lists one page of entries under `uri` (which must be a directory).
    /// Entries come back sorted ascending by name; iterate by feeding
    /// `next_page_token` back in until it is absent.
    async fn list(
        &self,
        uri: &ObjectUri,
        opts: &ListOptions,
        cancel: &CancellationToken,
    ) -> Result<ListPage, StoreError>;

    async fn stat(&self, uri: &ObjectUri, cancel: &CancellationToken)
        -> Result<ObjectInfo, StoreError>;

    /// Streams the object into `dest_path` atomically: data goes to a
    /// sibling temp file which is renamed over the target only after the
    /// stream (and checksum verification, where the backend supplies one)
    /// completed. On failure or cancellation the temp file is removed and
    /// the target path is left untouched.
    async fn get(
        &self,
        uri: &ObjectUri,
        dest_path: &Utf8Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError>;

    /// Streams the local file at `src_path` into the store.
    async fn put(
        &self,
        src_path: &Utf8Path,
        uri: &ObjectUri,
        opts: &PutOptions,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ObjectInfo, StoreError>;

    async fn delete(
        &self,
        uri: &ObjectUri,
        opts: &DeleteOptions,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError>;

    /// Same-scheme copy. Backends without a server-side path return
    /// [`ErrorKind::NotImplemented`]; the planner falls back to
    /// download-then-upload.
    async fn copy(
        &self,
        src: &ObjectUri,
        dst: &ObjectUri,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ObjectInfo, StoreError>;

    /// Copy then delete. The default suits every backend that has both.
    async fn move_object(
        &self,
        src: &ObjectUri,
        dst: &ObjectUri,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ObjectInfo, StoreError> {
        let info = self.copy(src, dst, progress, cancel).await?;
        self.delete(src, &DeleteOptions::default(), cancel).await?;
        Ok(info)
    }

    /// For flat stores this creates a zero-byte directory marker.
    async fn mkdir(&self, uri: &ObjectUri, cancel: &CancellationToken) -> Result<(), StoreError>;

    /// Never fails on absence; fails on permission or network trouble.
    async fn exists(&self, uri: &ObjectUri, cancel: &CancellationToken)
        -> Result<bool, StoreError>;
}

/// Every store, currently supported. Serves as a simple way to pass around
/// the [`ObjectStore`] without dealing with generics.
#[derive(Clone)]
pub enum GenericObjectStore {
    LocalFs(LocalFs),
    AwsS3(Arc<S3Bucket>),
    Gcs(Arc<GcsBucket>),
    AzureBlob(Arc<AzureBlobStorage>),
    Aifs(Arc<AifsStore>),
}

impl GenericObjectStore {
    pub fn scheme(&self) -> Scheme {
        match self {
            Self::LocalFs(_) => Scheme::File,
            Self::AwsS3(_) => Scheme::S3,
            Self::Gcs(_) => Scheme::Gcs,
            Self::AzureBlob(_) => Scheme::Az,
            Self::Aifs(_) => Scheme::Aifs,
        }
    }

    /// Whether the backend can bridge `src` and `dst` with a server-side
    /// copy. Buckets within one S3/GCS endpoint and containers within one
    /// Azure account can; everything else streams through the client.
    pub fn can_bridge(&self, src: &ObjectUri, dst: &ObjectUri) -> bool {
        match self {
            Self::LocalFs(_) => true,
            Self::AwsS3(_) | Self::Gcs(_) | Self::AzureBlob(_) => true,
            // Asset copies always go through the client for re-hashing.
            Self::Aifs(_) => src.authority() == dst.authority(),
        }
    }

    pub async fn list(
        &self,
        uri: &ObjectUri,
        opts: &ListOptions,
        cancel: &CancellationToken,
    ) -> Result<ListPage, StoreError> {
        match self {
            Self::LocalFs(s) => s.list(uri, opts, cancel).await,
            Self::AwsS3(s) => s.list(uri, opts, cancel).await,
            Self::Gcs(s) => s.list(uri, opts, cancel).await,
            Self::AzureBlob(s) => s.list(uri, opts, cancel).await,
            Self::Aifs(s) => s.list(uri, opts, cancel).await,
        }
    }

    pub async fn stat(
        &self,
        uri: &ObjectUri,
        cancel: &CancellationToken,
    ) -> Result<ObjectInfo, StoreError> {
        match self {
            Self::LocalFs(s) => s.stat(uri, cancel).await,
            Self::AwsS3(s) => s.stat(uri, cancel).await,
            Self::Gcs(s) => s.stat(uri, cancel).await,
            Self::AzureBlob(s) => s.stat(uri, cancel).await,
            Self::Aifs(s) => s.stat(uri, cancel).await,
        }
    }

    pub async fn get(
        &self,
        uri: &ObjectUri,
        dest_path: &Utf8Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        match self {
            Self::LocalFs(s) => s.get(uri, dest_path, progress, cancel).await,
            Self::AwsS3(s) => s.get(uri, dest_path, progress, cancel).await,
            Self::Gcs(s) => s.get(uri, dest_path, progress, cancel).await,
            Self::AzureBlob(s) => s.get(uri, dest_path, progress, cancel).await,
            Self::Aifs(s) => s.get(uri, dest_path, progress, cancel).await,
        }
    }

    pub async fn put(
        &self,
        src_path: &Utf8Path,
        uri: &ObjectUri,
        opts: &PutOptions,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ObjectInfo, StoreError> {
        match self {
            Self::LocalFs(s) => s.put(src_path, uri, opts, progress, cancel).await,
            Self::AwsS3(s) => s.put(src_path, uri, opts, progress, cancel).await,
            Self::Gcs(s) => s.put(src_path, uri, opts, progress, cancel).await,
            Self::AzureBlob(s) => s.put(src_path, uri, opts, progress, cancel).await,
            Self::Aifs(s) => s.put(src_path, uri, opts, progress, cancel).await,
        }
    }

    pub async fn delete(
        &self,
        uri: &ObjectUri,
        opts: &DeleteOptions,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        match self {
            Self::LocalFs(s) => s.delete(uri, opts, cancel).await,
            Self::AwsS3(s) => s.delete(uri, opts, cancel).await,
            Self::Gcs(s) => s.delete(uri, opts, cancel).await,
            Self::AzureBlob(s) => s.delete(uri, opts, cancel).await,
            Self::Aifs(s) => s.delete(uri, opts, cancel).await,
        }
    }

    pub async fn copy(
        &self,
        src: &ObjectUri,
        dst: &ObjectUri,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ObjectInfo, StoreError> {
        match self {
            Self::LocalFs(s) => s.copy(src, dst, progress, cancel).await,
            Self::AwsS3(s) => s.copy(src, dst, progress, cancel).await,
            Self::Gcs(s) => s.copy(src, dst, progress, cancel).await,
            Self::AzureBlob(s) => s.copy(src, dst, progress, cancel).await,
            Self::Aifs(s) => s.copy(src, dst, progress, cancel).await,
        }
    }

    pub async fn move_object(
        &self,
        src: &ObjectUri,
        dst: &ObjectUri,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ObjectInfo, StoreError> {
        match self {
            Self::LocalFs(s) => s.move_object(src, dst, progress, cancel).await,
            Self::AwsS3(s) => s.move_object(src, dst, progress, cancel).await,
            Self::Gcs(s) => s.move_object(src, dst, progress, cancel).await,
            Self::AzureBlob(s) => s.move_object(src, dst, progress, cancel).await,
            Self::Aifs(s) => s.move_object(src, dst, progress, cancel).await,
        }
    }

    pub async fn mkdir(
        &self,
        uri: &ObjectUri,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        match self {
            Self::LocalFs(s) => s.mkdir(uri, cancel).await,
            Self::AwsS3(s) => s.mkdir(uri, cancel).await,
            Self::Gcs(s) => s.mkdir(uri, cancel).await,
            Self::AzureBlob(s) => s.mkdir(uri, cancel).await,
            Self::Aifs(s) => s.mkdir(uri, cancel).await,
        }
    }

    pub async fn exists(
        &self,
        uri: &ObjectUri,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError> {
        match self {
            Self::LocalFs(s) => s.exists(uri, cancel).await,
            Self::AwsS3(s) => s.exists(uri, cancel).await,
            Self::Gcs(s) => s.exists(uri, cancel).await,
            Self::AzureBlob(s) => s.exists(uri, cancel).await,
            Self::Aifs(s) => s.exists(uri, cancel).await,
        }
    }
}

impl GenericObjectStore {
    pub fn from_config(config: &ObjectStorageConfig) -> anyhow::Result<Self> {
        let timeout = config.timeout;
        Ok(match &config.storage {
            StorageKind::LocalFs(file_config) => {
                info!("Using the local file system as an object store");
                Self::LocalFs(LocalFs::new(file_config.clone(), timeout))
            }
            StorageKind::AwsS3(s3_config) => {
                info!(
                    "Using S3 in region '{}' as an object store, endpoint: '{:?}'",
                    s3_config.region, s3_config.endpoint
                );
                Self::AwsS3(Arc::new(S3Bucket::new(s3_config, timeout)?))
            }
            StorageKind::Gcs(gcs_config) => {
                info!(
                    "Using GCS as an object store, endpoint: '{:?}'",
                    gcs_config.endpoint
                );
                Self::Gcs(Arc::new(GcsBucket::new(gcs_config, timeout)?))
            }
            StorageKind::AzureContainer(azure_config) => {
                info!(
                    "Using Azure Blob storage account '{}' as an object store",
                    azure_config.account
                );
                Self::AzureBlob(Arc::new(AzureBlobStorage::new(azure_config, timeout)?))
            }
            StorageKind::Aifs(aifs_config) => {
                info!(
                    "Using AIFS at '{}' as an object store",
                    aifs_config.endpoint
                );
                Self::Aifs(Arc::new(AifsStore::new(aifs_config, timeout)?))
            }
        })
    }
}

/// Store connection configuration, enough for creating a client for that
/// store.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ObjectStorageConfig {
    #[serde(flatten)]
    pub storage: StorageKind,
    /// A common per-request timeout, enforced after a concurrency limiter
    /// permit has been acquired.
    #[serde(
        with = "humantime_serde",
        default = "default_timeout",
        skip_serializing_if = "is_default_timeout"
    )]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn is_default_timeout(d: &Duration) -> bool {
    *d == DEFAULT_REQUEST_TIMEOUT
}

impl ObjectStorageConfig {
    pub fn from_toml(toml: &toml_edit::Item) -> anyhow::Result<Option<ObjectStorageConfig>> {
        let document: toml_edit::DocumentMut = match toml {
            toml_edit::Item::Table(toml) => toml.clone().into(),
            toml_edit::Item::Value(toml_edit::Value::InlineTable(toml)) => {
                toml.clone().into_table().into()
            }
            _ => bail!("toml not a table or inline table"),
        };

        if document.is_empty() {
            return Ok(None);
        }

        Ok(Some(toml_edit::de::from_document(document)?))
    }
}

/// A kind of store to connect to, with its connection configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageKind {
    LocalFs(FileConfig),
    AwsS3(S3Config),
    Gcs(GcsConfig),
    AzureContainer(AzureConfig),
    Aifs(AifsConfig),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct FileConfig {
    /// Follow symlinks during listing. The shells decide; default is off.
    #[serde(default)]
    pub follow_symlinks: bool,
}

/// AWS S3 coordinates and access credentials. The uri authority picks the
/// bucket per request, so one client serves the whole account.
#[derive(Clone, PartialEq, Deserialize, Serialize)]
pub struct S3Config {
    pub region: String,
    /// A base URL to send S3 requests to. By default the endpoint is derived
    /// from the region; setting it enables other S3 flavors, e.g.
    /// `http://127.0.0.1:9000`.
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: NonZeroUsize,
    #[serde(default)]
    pub max_keys_per_list_response: Option<i32>,
}

impl Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id.as_deref().map(|_| "[redacted]"))
            .field("concurrency_limit", &self.concurrency_limit)
            .finish()
    }
}

#[derive(Clone, PartialEq, Deserialize, Serialize)]
pub struct GcsConfig {
    /// Service account key JSON; when absent, application default
    /// credentials are used.
    pub service_account_json: Option<String>,
    pub endpoint: Option<String>,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: NonZeroUsize,
}

impl Debug for GcsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsConfig")
            .field("endpoint", &self.endpoint)
            .field(
                "service_account_json",
                &self.service_account_json.as_deref().map(|_| "[redacted]"),
            )
            .field("concurrency_limit", &self.concurrency_limit)
            .finish()
    }
}

#[derive(Clone, PartialEq, Deserialize, Serialize)]
pub struct AzureConfig {
    pub account: String,
    pub access_key: Option<String>,
    pub sas_token: Option<String>,
    pub connection_string: Option<String>,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: NonZeroUsize,
    /// Overall deadline for one server-side copy, polling included.
    #[serde(with = "humantime_serde", default = "default_copy_timeout")]
    pub copy_timeout: Duration,
}

fn default_copy_timeout() -> Duration {
    Duration::from_secs(600)
}

impl Debug for AzureConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureConfig")
            .field("account", &self.account)
            .field("access_key", &self.access_key.as_deref().map(|_| "[redacted]"))
            .field("sas_token", &self.sas_token.as_deref().map(|_| "[redacted]"))
            .field("concurrency_limit", &self.concurrency_limit)
            .field("copy_timeout", &self.copy_timeout)
            .finish()
    }
}

#[derive(Clone, PartialEq, Deserialize, Serialize)]
pub struct AifsConfig {
    /// gRPC endpoint, e.g. `http://aifs.internal:50052`.
    pub endpoint: String,
    pub token: Option<String>,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: NonZeroUsize,
}

impl Debug for AifsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AifsConfig")
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_deref().map(|_| "[redacted]"))
            .field("concurrency_limit", &self.concurrency_limit)
            .finish()
    }
}

fn default_concurrency_limit() -> NonZeroUsize {
    NonZeroUsize::new(DEFAULT_CONCURRENCY_LIMIT).unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Get,
    Put,
    List,
    Delete,
    Copy,
}

/// Bounds in-flight requests per store so a burst of jobs cannot exhaust the
/// provider's rate limits or our own socket budget.
pub(crate) struct ConcurrencyLimiter {
    write: Arc<Semaphore>,
    read: Arc<Semaphore>,
}

impl ConcurrencyLimiter {
    fn for_kind(&self, kind: RequestKind) -> &Arc<Semaphore> {
        match kind {
            RequestKind::Get => &self.read,
            RequestKind::List => &self.read,
            RequestKind::Put => &self.write,
            RequestKind::Delete => &self.write,
            RequestKind::Copy => &self.write,
        }
    }

    pub(crate) async fn acquire(
        &self,
        kind: RequestKind,
    ) -> Result<tokio::sync::SemaphorePermit<'_>, tokio::sync::AcquireError> {
        self.for_kind(kind).acquire().await
    }

    pub(crate) async fn acquire_owned(
        &self,
        kind: RequestKind,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, tokio::sync::AcquireError> {
        Arc::clone(self.for_kind(kind)).acquire_owned().await
    }

    pub(crate) fn new(limit: usize) -> ConcurrencyLimiter {
        Self {
            read: Arc::new(Semaphore::new(limit)),
            write: Arc::new(Semaphore::new(limit)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> anyhow::Result<Option<ObjectStorageConfig>> {
        let toml = input.parse::<toml_edit::DocumentMut>().unwrap();
        ObjectStorageConfig::from_toml(toml.as_item())
    }

    #[test]
    fn parse_s3_config_with_timeout() {
        let toml = "\
        kind = 'aws_s3'
        region = 'eu-central-1'
        timeout = '7s'
        ";

        let config = parse(toml).unwrap().expect("it exists");

        assert_eq!(
            config,
            ObjectStorageConfig {
                storage: StorageKind::AwsS3(S3Config {
                    region: "eu-central-1".into(),
                    endpoint: None,
                    access_key_id: None,
                    secret_access_key: None,
                    session_token: None,
                    concurrency_limit: default_concurrency_limit(),
                    max_keys_per_list_response: None,
                }),
                timeout: Duration::from_secs(7),
            }
        );
    }

    #[test]
    fn parse_azure_config() {
        let toml = "\
        kind = 'azure_container'
        account = 'foo-bar'
        timeout = '7s'
        ";

        let config = parse(toml).unwrap().expect("it exists");

        assert_eq!(
            config,
            ObjectStorageConfig {
                storage: StorageKind::AzureContainer(AzureConfig {
                    account: "foo-bar".into(),
                    access_key: None,
                    sas_token: None,
                    connection_string: None,
                    concurrency_limit: default_concurrency_limit(),
                    copy_timeout: default_copy_timeout(),
                }),
                timeout: Duration::from_secs(7),
            }
        );
    }

    #[test]
    fn checksum_renders_tagged() {
        let c = Checksum::Blake3("ab12".into());
        assert_eq!(c.to_string(), "blake3:ab12");
        assert_eq!(Checksum::Crc32c("0000ffff".into()).to_string(), "crc32c:0000ffff");
    }
}
