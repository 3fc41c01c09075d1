//! AWS S3 backend.
//!
//! One client serves the whole account: the uri authority selects the
//! bucket per request. Uploads above [`crate::S3_MULTIPART_THRESHOLD`] go
//! multipart with the part size chosen to stay under the 10,000-part cap;
//! copies above [`crate::S3_MAX_SINGLE_COPY_BYTES`] go through ranged
//! `UploadPartCopy` calls. A 200 `CopyObject` response that carries no
//! `CopyObjectResult` is treated as the embedded-error case and surfaced as
//! a failure.

use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use aws_config::environment::credentials::EnvironmentVariableCredentialsProvider;
use aws_config::imds::credentials::ImdsCredentialsProvider;
use aws_config::meta::credentials::CredentialsProviderChain;
use aws_config::profile::ProfileFileCredentialsProvider;
use aws_config::provider_config::ProviderConfig;
use aws_config::retry::{RetryConfigBuilder, RetryMode};
use aws_config::web_identity_token::WebIdentityTokenCredentialsProvider;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_s3::config::{AsyncSleep, Builder, IdentityCache, Region, SharedAsyncSleep};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream as SdkByteStream;
use aws_smithy_types::byte_stream::Length;
use aws_sdk_s3::types::{
    ChecksumMode, CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier,
};
use aws_sdk_s3::Client;
use aws_smithy_async::rt::sleep::TokioSleep;
use bytes::Bytes;
use camino::Utf8Path;
use futures::stream::{FuturesUnordered, Stream};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ErrorKind, StoreError};
use crate::support::{download_stream_to_file, ThrottledProgress};
use crate::uri::{ObjectUri, Scheme};
use crate::{
    Checksum, ConcurrencyLimiter, DeleteOptions, ListOptions, ListPage, ListingMode, ObjectInfo,
    ObjectStore, ProgressSink, PutOptions, RequestKind, S3Config, MAX_KEYS_PER_DELETE,
    S3_MAX_PARTS, S3_MAX_SINGLE_COPY_BYTES, S3_MULTIPART_THRESHOLD,
};

/// Part size for ranged server-side copies. Large so that a 6 GiB copy
/// needs a handful of calls, doubled as needed to stay under the part cap.
const COPY_PART_SIZE: u64 = 1024 * 1024 * 1024;

const DEFAULT_PART_CONCURRENCY: usize = 4;

pub struct S3Bucket {
    client: Client,
    max_keys_per_list_response: Option<i32>,
    concurrency_limiter: ConcurrencyLimiter,
    // Per-request timeout. Accessible for tests.
    pub timeout: Duration,
}

impl S3Bucket {
    /// Creates the S3 client, errors if the configuration is unusable.
    pub fn new(config: &S3Config, timeout: Duration) -> anyhow::Result<Self> {
        debug!("Creating s3 client for region {}", config.region);

        let region = Some(Region::new(config.region.clone()));
        let provider_conf = ProviderConfig::without_region().with_region(region.clone());

        let credentials_provider = if let (Some(access_key), Some(secret)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            // Explicit credentials win over everything in the ambient chain.
            SharedCredentialsProvider::new(aws_credential_types::Credentials::from_keys(
                access_key.clone(),
                secret.clone(),
                config.session_token.clone(),
            ))
        } else {
            SharedCredentialsProvider::new(
                // uses "AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"
                CredentialsProviderChain::first_try(
                    "env",
                    EnvironmentVariableCredentialsProvider::new(),
                )
                // uses "AWS_PROFILE" / `aws sso login --profile <profile>`
                .or_else(
                    "profile-sso",
                    ProfileFileCredentialsProvider::builder()
                        .configure(&provider_conf)
                        .build(),
                )
                // uses "AWS_WEB_IDENTITY_TOKEN_FILE", "AWS_ROLE_ARN", "AWS_ROLE_SESSION_NAME"
                .or_else(
                    "token",
                    WebIdentityTokenCredentialsProvider::builder()
                        .configure(&provider_conf)
                        .build(),
                )
                // uses imds v2
                .or_else("imds", ImdsCredentialsProvider::builder().build()),
            )
        };

        // AWS SDK requires us to specify how the RetryConfig should sleep when it wants to back off
        let sleep_impl: Arc<dyn AsyncSleep> = Arc::new(TokioSleep::new());

        // Retries are driven by the job engine. For the SDK we set at most
        // one attempt and 'Adaptive' mode so client-side rate limiting
        // still kicks in on throttling responses.
        let mut retry_config = RetryConfigBuilder::new();
        retry_config
            .set_max_attempts(Some(1))
            .set_mode(Some(RetryMode::Adaptive));

        let mut config_builder = Builder::default()
            .behavior_version(BehaviorVersion::v2024_03_28())
            .region(region)
            .identity_cache(IdentityCache::lazy().build())
            .credentials_provider(credentials_provider)
            .retry_config(retry_config.build())
            .sleep_impl(SharedAsyncSleep::from(sleep_impl));

        if let Some(custom_endpoint) = config.endpoint.clone() {
            config_builder = config_builder
                .endpoint_url(custom_endpoint)
                .force_path_style(true);
        }

        let client = Client::from_conf(config_builder.build());

        Ok(Self {
            client,
            max_keys_per_list_response: config.max_keys_per_list_response,
            concurrency_limiter: ConcurrencyLimiter::new(config.concurrency_limit.get()),
            timeout,
        })
    }

    fn bucket_and_key(uri: &ObjectUri) -> Result<(String, String), StoreError> {
        if uri.scheme() != Scheme::S3 {
            return Err(StoreError::new(
                ErrorKind::UnsupportedScheme,
                format!("s3 backend got a {} uri", uri.scheme()),
            )
            .with_uri(uri));
        }
        Ok((uri.authority().to_string(), uri.path().to_string()))
    }

    async fn permit(
        &self,
        kind: RequestKind,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::SemaphorePermit<'_>, StoreError> {
        tokio::select! {
            permit = self.concurrency_limiter.acquire(kind) => {
                Ok(permit.expect("semaphore is never closed"))
            }
            _ = cancel.cancelled() => Err(StoreError::cancelled()),
        }
    }

    async fn head_object(
        &self,
        bucket: &str,
        key: &str,
        uri: &ObjectUri,
        cancel: &CancellationToken,
    ) -> Result<aws_sdk_s3::operation::head_object::HeadObjectOutput, StoreError> {
        let request = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .checksum_mode(ChecksumMode::Enabled)
            .send();
        let response = tokio::select! {
            res = request => res,
            _ = tokio::time::sleep(self.timeout) => return Err(StoreError::timeout().with_uri(uri)),
            _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
        };
        response.map_err(|e| match &e {
            // A HEAD 404 has no body, so there is no error code to map.
            SdkError::ServiceError(ctx) if ctx.err().is_not_found() => {
                StoreError::new(ErrorKind::NotFound, "no such object").with_uri(uri)
            }
            _ => to_store_error(e, "HeadObject", uri),
        })
    }

    fn object_info(
        &self,
        uri: &ObjectUri,
        size: u64,
        last_modified: Option<SystemTime>,
        etag: Option<String>,
        checksum: Option<Checksum>,
        metadata: Option<crate::StorageMetadata>,
    ) -> ObjectInfo {
        let uri = uri.as_object();
        ObjectInfo {
            name: uri.name().to_string(),
            size,
            last_modified,
            is_dir: false,
            etag,
            checksum,
            metadata,
            uri,
        }
    }

    async fn delete_keys(
        &self,
        bucket: &str,
        keys: Vec<String>,
        uri: &ObjectUri,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let mut object_ids = Vec::with_capacity(keys.len());
        for key in keys {
            let obj_id = ObjectIdentifier::builder()
                .set_key(Some(key))
                .build()
                .map_err(|e| {
                    StoreError::new(ErrorKind::Internal, "could not build delete entry")
                        .with_uri(uri)
                        .with_source(e)
                })?;
            object_ids.push(obj_id);
        }

        for chunk in object_ids.chunks(MAX_KEYS_PER_DELETE) {
            let request = self
                .client
                .delete_objects()
                .bucket(bucket)
                .delete(
                    Delete::builder()
                        .set_objects(Some(chunk.to_vec()))
                        .build()
                        .map_err(|e| {
                            StoreError::new(ErrorKind::Internal, "could not build delete request")
                                .with_uri(uri)
                                .with_source(e)
                        })?,
                )
                .send();

            let response = tokio::select! {
                res = request => res,
                _ = tokio::time::sleep(self.timeout) => return Err(StoreError::timeout().with_uri(uri)),
                _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
            };
            let response = response.map_err(|e| to_store_error(e, "DeleteObjects", uri))?;

            if let Some(errors) = response.errors {
                if !errors.is_empty() {
                    // These requests can carry 1000 keys; log a bounded
                    // number of the per-key errors.
                    const LOG_UP_TO_N_ERRORS: usize = 10;
                    for e in errors.iter().take(LOG_UP_TO_N_ERRORS) {
                        warn!(
                            "DeleteObjects key {} failed: {}",
                            e.key.as_deref().unwrap_or(""),
                            e.code.as_deref().unwrap_or(""),
                        );
                    }
                    return Err(StoreError::new(
                        ErrorKind::Internal,
                        format!("failed to delete {}/{} objects", errors.len(), chunk.len()),
                    )
                    .with_uri(uri));
                }
            }
        }
        Ok(())
    }

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) {
        // Best effort: an orphaned multipart upload costs storage until the
        // bucket's lifecycle rules clean it up.
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;
        if let Err(e) = result {
            warn!("failed to abort multipart upload {upload_id} for {bucket}/{key}: {e}");
        }
    }

    async fn put_multipart(
        &self,
        src_path: &Utf8Path,
        bucket: &str,
        key: &str,
        uri: &ObjectUri,
        size: u64,
        opts: &PutOptions,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let part_size = part_size_for(size, S3_MULTIPART_THRESHOLD);
        let part_concurrency = opts
            .part_concurrency
            .map(NonZeroUsize::get)
            .unwrap_or(DEFAULT_PART_CONCURRENCY);

        // Either continue the upload the resume token points at, or start a
        // fresh one and hand its id out for persistence.
        let resumable = match &opts.resume_token {
            Some(upload_id) => {
                match self
                    .list_completed_parts(bucket, key, upload_id, uri, cancel)
                    .await
                {
                    Ok(parts) => Some((upload_id.clone(), parts)),
                    // The upload id expired or was aborted; start over.
                    Err(e) if e.kind() == ErrorKind::NotFound => None,
                    Err(e) => return Err(e),
                }
            }
            None => None,
        };
        let (upload_id, completed) = match resumable {
            Some(resumed) => resumed,
            None => {
                let request = self
                    .client
                    .create_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .set_content_type(opts.content_type.clone())
                    .set_metadata(opts.metadata.clone().map(|m| m.0))
                    .send();
                let created = tokio::select! {
                    res = request => res.map_err(|e| to_store_error(e, "CreateMultipartUpload", uri))?,
                    _ = tokio::time::sleep(self.timeout) => return Err(StoreError::timeout().with_uri(uri)),
                    _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
                };
                let upload_id = created.upload_id.ok_or_else(|| {
                    StoreError::new(ErrorKind::Internal, "S3 returned no multipart upload id")
                        .with_uri(uri)
                })?;
                if let Some(sink) = &opts.resume_sink {
                    sink(&upload_id);
                }
                (upload_id, Vec::new())
            }
        };

        let part_count = size.div_ceil(part_size);
        let reporter = ThrottledProgress::new(progress);
        let done_bytes: u64 = completed.iter().map(|p| p.size).sum();
        reporter.report(done_bytes, Some(size));

        let semaphore = Arc::new(tokio::sync::Semaphore::new(part_concurrency));
        let mut tasks = FuturesUnordered::new();
        let mut parts: Vec<CompletedPart> = completed
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .set_e_tag(p.etag.clone())
                    .build()
            })
            .collect();
        let mut uploaded_bytes = done_bytes;

        for part_number in 1..=part_count {
            if completed.iter().any(|p| p.part_number == part_number as i32) {
                continue;
            }
            let offset = (part_number - 1) * part_size;
            let len = part_size.min(size - offset);
            let semaphore = Arc::clone(&semaphore);
            let client = self.client.clone();
            let src_path = src_path.to_owned();
            let bucket = bucket.to_string();
            let key = key.to_string();
            let upload_id = upload_id.clone();
            tasks.push(async move {
                let _permit = semaphore.acquire().await.expect("semaphore is never closed");
                let body = SdkByteStream::read_from()
                    .path(src_path.as_std_path())
                    .offset(offset)
                    .length(Length::Exact(len))
                    .build()
                    .await
                    .map_err(|e| {
                        StoreError::new(ErrorKind::Internal, format!("could not read part: {e}"))
                    })?;
                let output = client
                    .upload_part()
                    .bucket(&bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .part_number(part_number as i32)
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| {
                        StoreError::new(ErrorKind::Network, "UploadPart failed").with_source(e)
                    })?;
                Ok::<_, StoreError>((part_number as i32, output.e_tag, len))
            });
        }

        let result: Result<(), StoreError> = async {
            while let Some(part) = tokio::select! {
                part = tasks.next() => part,
                _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
            } {
                let (part_number, etag, len) = part?;
                parts.push(
                    CompletedPart::builder()
                        .part_number(part_number)
                        .set_e_tag(etag)
                        .build(),
                );
                uploaded_bytes += len;
                reporter.report(uploaded_bytes, Some(size));
            }
            Ok(())
        }
        .await;

        if let Err(err) = result {
            drop(tasks);
            self.abort_multipart(bucket, key, &upload_id).await;
            return Err(err);
        }

        parts.sort_by_key(|p| p.part_number());
        let complete = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await;
        if let Err(e) = complete {
            self.abort_multipart(bucket, key, &upload_id).await;
            return Err(to_store_error(e, "CompleteMultipartUpload", uri));
        }
        progress.report(size, Some(size));
        Ok(())
    }

    async fn list_completed_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        uri: &ObjectUri,
        cancel: &CancellationToken,
    ) -> Result<Vec<UploadedPart>, StoreError> {
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let request = self
                .client
                .list_parts()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .set_part_number_marker(marker.clone())
                .send();
            let response = tokio::select! {
                res = request => res.map_err(|e| to_store_error(e, "ListParts", uri))?,
                _ = tokio::time::sleep(self.timeout) => return Err(StoreError::timeout().with_uri(uri)),
                _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
            };
            for part in response.parts() {
                let (Some(part_number), Some(size)) = (part.part_number, part.size) else {
                    continue;
                };
                parts.push(UploadedPart {
                    part_number,
                    etag: part.e_tag.clone(),
                    size: size as u64,
                });
            }
            if response.is_truncated == Some(true) {
                marker = response.next_part_number_marker.clone();
            } else {
                break;
            }
        }
        Ok(parts)
    }

    async fn copy_multipart(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        dst: &ObjectUri,
        size: u64,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let part_size = part_size_for(size, COPY_PART_SIZE);
        let part_count = size.div_ceil(part_size);

        let created = self
            .client
            .create_multipart_upload()
            .bucket(dst_bucket)
            .key(dst_key)
            .send()
            .await
            .map_err(|e| to_store_error(e, "CreateMultipartUpload", dst))?;
        let upload_id = created.upload_id.ok_or_else(|| {
            StoreError::new(ErrorKind::Internal, "S3 returned no multipart upload id").with_uri(dst)
        })?;

        let copy_source = format!("{src_bucket}/{src_key}");
        let reporter = ThrottledProgress::new(progress);
        let mut parts = Vec::with_capacity(part_count as usize);

        let result: Result<(), StoreError> = async {
            for part_number in 1..=part_count {
                let start = (part_number - 1) * part_size;
                let end = (start + part_size).min(size) - 1;
                let request = self
                    .client
                    .upload_part_copy()
                    .bucket(dst_bucket)
                    .key(dst_key)
                    .upload_id(&upload_id)
                    .part_number(part_number as i32)
                    .copy_source(&copy_source)
                    .copy_source_range(format!("bytes={start}-{end}"))
                    .send();
                let response = tokio::select! {
                    res = request => res.map_err(|e| to_store_error(e, "UploadPartCopy", dst))?,
                    _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(dst)),
                };
                // Same embedded-error shape as CopyObject: a 200 with no
                // result body means the copy did not happen.
                let copy_result = response.copy_part_result.ok_or_else(|| {
                    StoreError::new(
                        ErrorKind::Internal,
                        "S3 returned 200 for UploadPartCopy with an empty result body",
                    )
                    .with_uri(dst)
                })?;
                parts.push(
                    CompletedPart::builder()
                        .part_number(part_number as i32)
                        .set_e_tag(copy_result.e_tag)
                        .build(),
                );
                reporter.report(end + 1, Some(size));
            }
            Ok(())
        }
        .await;

        if let Err(err) = result {
            self.abort_multipart(dst_bucket, dst_key, &upload_id).await;
            return Err(err);
        }

        let complete = self
            .client
            .complete_multipart_upload()
            .bucket(dst_bucket)
            .key(dst_key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await;
        if let Err(e) = complete {
            self.abort_multipart(dst_bucket, dst_key, &upload_id).await;
            return Err(to_store_error(e, "CompleteMultipartUpload", dst));
        }
        progress.report(size, Some(size));
        Ok(())
    }
}

struct UploadedPart {
    part_number: i32,
    etag: Option<String>,
    size: u64,
}

/// Smallest power-of-two multiple of `base` that keeps the part count under
/// the S3 cap.
fn part_size_for(total: u64, base: u64) -> u64 {
    let mut part_size = base;
    while total.div_ceil(part_size) > S3_MAX_PARTS {
        part_size *= 2;
    }
    part_size
}

fn checksum_from_head(
    head: &aws_sdk_s3::operation::head_object::HeadObjectOutput,
) -> Option<Checksum> {
    if let Some(crc) = &head.checksum_crc32_c {
        if let Ok(raw) = base64::decode(crc) {
            return Some(Checksum::Crc32c(hex::encode(raw)));
        }
    }
    if let Some(sha) = &head.checksum_sha256 {
        if let Ok(raw) = base64::decode(sha) {
            return Some(Checksum::Sha256(hex::encode(raw)));
        }
    }
    None
}

fn to_store_error<E, R>(err: SdkError<E, R>, op: &str, uri: &ObjectUri) -> StoreError
where
    E: aws_sdk_s3::error::ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    use aws_sdk_s3::error::ProvideErrorMetadata;

    let (kind, detail) = match &err {
        SdkError::ServiceError(_) => {
            let code = err.code().unwrap_or("");
            let kind = match code {
                "NoSuchKey" | "NoSuchBucket" | "NotFound" | "NoSuchUpload" => ErrorKind::NotFound,
                "AccessDenied" | "AccountProblem" | "AllAccessDisabled" => ErrorKind::Permission,
                "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken"
                | "TokenRefreshRequired" => ErrorKind::Authentication,
                "SlowDown" | "RequestTimeout" | "InternalError" | "ServiceUnavailable" => {
                    ErrorKind::Network
                }
                _ => ErrorKind::Internal,
            };
            (kind, format!("{op} failed ({code})"))
        }
        SdkError::TimeoutError(_) => (ErrorKind::Timeout, format!("{op} timed out")),
        SdkError::DispatchFailure(_) => (
            ErrorKind::Network,
            format!("{op} could not reach the endpoint"),
        ),
        _ => (ErrorKind::Internal, format!("{op} failed")),
    };
    let hint = match kind {
        ErrorKind::Permission => "; check the key's S3 permissions",
        ErrorKind::Authentication => "; check the configured AWS credentials",
        _ => "",
    };
    StoreError::new(kind, format!("{detail}{hint}"))
        .with_uri(uri)
        .with_source(err)
}

pin_project_lite::pin_project! {
    struct ByteStreamAsStream {
        #[pin]
        inner: SdkByteStream
    }
}

impl From<SdkByteStream> for ByteStreamAsStream {
    fn from(inner: SdkByteStream) -> Self {
        ByteStreamAsStream { inner }
    }
}

impl Stream for ByteStreamAsStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // this does the std::io::ErrorKind::Other conversion
        self.project().inner.poll_next(cx).map_err(|x| x.into())
    }

    // cannot implement size_hint because inner.size_hint is remaining size in bytes, which makes
    // sense and Stream::size_hint does not really
}

impl ObjectStore for S3Bucket {
    async fn list(
        &self,
        uri: &ObjectUri,
        opts: &ListOptions,
        cancel: &CancellationToken,
    ) -> Result<ListPage, StoreError> {
        let (bucket, mut prefix) = Self::bucket_and_key(uri)?;
        if let Some(extra) = &opts.prefix {
            prefix.push_str(extra);
        }
        let _permit = self.permit(RequestKind::List, cancel).await?;

        let request_max_keys = self
            .max_keys_per_list_response
            .into_iter()
            .chain(opts.page_size.map(|s| s.get() as i32))
            .min();
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&bucket)
            .set_prefix((!prefix.is_empty()).then(|| prefix.clone()))
            .set_continuation_token(opts.page_token.clone())
            .set_max_keys(request_max_keys);

        if let ListingMode::WithDelimiter = opts.mode {
            request = request.delimiter(crate::PREFIX_SEPARATOR.to_string());
        }

        let response = tokio::select! {
            res = request.send() => res,
            _ = tokio::time::sleep(self.timeout) => return Err(StoreError::timeout().with_uri(uri)),
            _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
        };
        let response = response.map_err(|e| to_store_error(e, "ListObjectsV2", uri))?;

        let keys = response.contents();
        let prefixes = response.common_prefixes();
        debug!("list: {} prefixes, {} keys", prefixes.len(), keys.len());

        let mut items = Vec::with_capacity(keys.len() + prefixes.len());
        for object in keys {
            let Some(key) = object.key() else { continue };
            // The marker object for the listed prefix itself is not a child.
            if key == prefix {
                continue;
            }
            let child = ObjectUri::from_parts(Scheme::S3, &bucket, key)?;
            items.push(ObjectInfo {
                name: child.name().to_string(),
                size: object.size().unwrap_or(0) as u64,
                last_modified: object.last_modified().and_then(|t| (*t).try_into().ok()),
                is_dir: false,
                etag: object.e_tag().map(str::to_string),
                checksum: None,
                metadata: None,
                uri: child,
            });
        }
        for common_prefix in prefixes {
            let Some(prefix_key) = common_prefix.prefix() else {
                continue;
            };
            let child = ObjectUri::from_parts(Scheme::S3, &bucket, prefix_key)?;
            items.push(ObjectInfo::synthetic_dir(child));
        }
        items.sort_by(|a, b| a.uri.path().as_bytes().cmp(b.uri.path().as_bytes()));

        Ok(ListPage {
            items,
            next_page_token: response
                .is_truncated
                .unwrap_or_default()
                .then(|| response.next_continuation_token.clone())
                .flatten(),
        })
    }

    async fn stat(
        &self,
        uri: &ObjectUri,
        cancel: &CancellationToken,
    ) -> Result<ObjectInfo, StoreError> {
        let (bucket, key) = Self::bucket_and_key(uri)?;
        let _permit = self.permit(RequestKind::Get, cancel).await?;

        if uri.is_dir() {
            // A prefix "exists" iff at least one object lives under it
            // (an explicit zero-byte marker included).
            let request = self
                .client
                .list_objects_v2()
                .bucket(&bucket)
                .set_prefix((!key.is_empty()).then(|| key.clone()))
                .max_keys(1)
                .send();
            let response = tokio::select! {
                res = request => res,
                _ = tokio::time::sleep(self.timeout) => return Err(StoreError::timeout().with_uri(uri)),
                _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
            };
            let response = response.map_err(|e| to_store_error(e, "ListObjectsV2", uri))?;
            // The bucket root exists whenever the listing itself succeeds.
            if !key.is_empty() && response.key_count().unwrap_or(0) == 0 {
                return Err(StoreError::new(ErrorKind::NotFound, "no such prefix").with_uri(uri));
            }
            return Ok(ObjectInfo::synthetic_dir(uri.clone()));
        }

        let head = self.head_object(&bucket, &key, uri, cancel).await?;
        Ok(self.object_info(
            uri,
            head.content_length().unwrap_or(0) as u64,
            head.last_modified().and_then(|t| (*t).try_into().ok()),
            head.e_tag().map(str::to_string),
            checksum_from_head(&head),
            head.metadata()
                .filter(|m| !m.is_empty())
                .map(|m| crate::StorageMetadata(m.clone())),
        ))
    }

    async fn get(
        &self,
        uri: &ObjectUri,
        dest_path: &Utf8Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let (bucket, key) = Self::bucket_and_key(uri)?;
        let _permit = self.permit(RequestKind::Get, cancel).await?;

        // Head first: the strong checksum, when the service has one, is
        // verified against the bytes we actually receive.
        let head = self.head_object(&bucket, &key, uri, cancel).await?;
        let expected = checksum_from_head(&head);
        let size = head.content_length().unwrap_or(0) as u64;

        let request = self.client.get_object().bucket(&bucket).key(&key).send();
        let response = tokio::select! {
            res = request => res,
            _ = tokio::time::sleep(self.timeout) => return Err(StoreError::timeout().with_uri(uri)),
            _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
        };
        let response = response.map_err(|e| to_store_error(e, "GetObject", uri))?;
        let stream = Box::pin(ByteStreamAsStream::from(response.body));

        download_stream_to_file(
            stream,
            dest_path,
            uri,
            Some(size),
            expected.as_ref(),
            progress,
            cancel,
        )
        .await?;
        Ok(())
    }

    async fn put(
        &self,
        src_path: &Utf8Path,
        uri: &ObjectUri,
        opts: &PutOptions,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ObjectInfo, StoreError> {
        let (bucket, key) = Self::bucket_and_key(uri)?;
        let _permit = self.permit(RequestKind::Put, cancel).await?;

        let size = tokio::fs::metadata(src_path)
            .await
            .map_err(|e| StoreError::from_io(e, uri))?
            .len();

        if size > S3_MULTIPART_THRESHOLD {
            self.put_multipart(src_path, &bucket, &key, uri, size, opts, progress, cancel)
                .await?;
        } else {
            let body = SdkByteStream::read_from()
                .path(src_path.as_std_path())
                .build()
                .await
                .map_err(|e| {
                    StoreError::new(ErrorKind::Internal, format!("could not open source: {e}"))
                        .with_uri(uri)
                })?;
            let request = self
                .client
                .put_object()
                .bucket(&bucket)
                .key(&key)
                .set_content_type(opts.content_type.clone())
                .set_metadata(opts.metadata.clone().map(|m| m.0))
                .content_length(size as i64)
                .body(body)
                .send();
            let response = tokio::select! {
                res = tokio::time::timeout(self.timeout, request) => match res {
                    Ok(inner) => inner,
                    Err(_elapsed) => return Err(StoreError::timeout().with_uri(uri)),
                },
                _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
            };
            response.map_err(|e| to_store_error(e, "PutObject", uri))?;
            progress.report(size, Some(size));
        }

        let head = self.head_object(&bucket, &key, uri, cancel).await?;
        Ok(self.object_info(
            uri,
            head.content_length().unwrap_or(0) as u64,
            head.last_modified().and_then(|t| (*t).try_into().ok()),
            head.e_tag().map(str::to_string),
            checksum_from_head(&head),
            None,
        ))
    }

    async fn delete(
        &self,
        uri: &ObjectUri,
        opts: &DeleteOptions,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let (bucket, key) = Self::bucket_and_key(uri)?;
        let _permit = self.permit(RequestKind::Delete, cancel).await?;

        if !uri.is_dir() {
            return self.delete_keys(&bucket, vec![key], uri, cancel).await;
        }

        // Prefix deletion: drain the listing into batched DeleteObjects.
        let mut continuation: Option<String> = None;
        loop {
            let request = self
                .client
                .list_objects_v2()
                .bucket(&bucket)
                .set_prefix((!key.is_empty()).then(|| key.clone()))
                .set_continuation_token(continuation.clone())
                .send();
            let response = tokio::select! {
                res = request => res,
                _ = tokio::time::sleep(self.timeout) => return Err(StoreError::timeout().with_uri(uri)),
                _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
            };
            let response = response.map_err(|e| to_store_error(e, "ListObjectsV2", uri))?;

            let keys: Vec<String> = response
                .contents()
                .iter()
                .filter_map(|o| o.key().map(str::to_string))
                .collect();

            if !opts.recursive {
                let has_children = keys.iter().any(|k| k != &key);
                if has_children {
                    return Err(StoreError::new(
                        ErrorKind::NotEmpty,
                        "prefix is not empty; pass recursive to remove it",
                    )
                    .with_uri(uri));
                }
            }
            if !keys.is_empty() {
                self.delete_keys(&bucket, keys, uri, cancel).await?;
            }

            match response.next_continuation_token {
                Some(token) if response.is_truncated.unwrap_or_default() => {
                    continuation = Some(token)
                }
                _ => break,
            }
        }
        Ok(())
    }

    async fn copy(
        &self,
        src: &ObjectUri,
        dst: &ObjectUri,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ObjectInfo, StoreError> {
        let (src_bucket, src_key) = Self::bucket_and_key(src)?;
        let (dst_bucket, dst_key) = Self::bucket_and_key(dst)?;
        let _permit = self.permit(RequestKind::Copy, cancel).await?;

        let head = self.head_object(&src_bucket, &src_key, src, cancel).await?;
        let size = head.content_length().unwrap_or(0) as u64;

        if size > S3_MAX_SINGLE_COPY_BYTES {
            self.copy_multipart(
                &src_bucket,
                &src_key,
                &dst_bucket,
                &dst_key,
                dst,
                size,
                progress,
                cancel,
            )
            .await?;
        } else {
            let copy_source = format!("{src_bucket}/{src_key}");
            let request = self
                .client
                .copy_object()
                .bucket(&dst_bucket)
                .key(&dst_key)
                .copy_source(copy_source)
                .send();
            let response = tokio::select! {
                res = request => res,
                _ = tokio::time::sleep(self.timeout) => return Err(StoreError::timeout().with_uri(dst)),
                _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(dst)),
            };
            let response = response.map_err(|e| to_store_error(e, "CopyObject", dst))?;

            // CopyObject can answer 200 OK and still have failed: the error
            // then rides in the body where the CopyObjectResult belongs.
            let copied = response.copy_object_result.and_then(|r| r.e_tag);
            if copied.is_none() {
                return Err(StoreError::new(
                    ErrorKind::Internal,
                    "S3 returned 200 for CopyObject with an empty result body",
                )
                .with_uri(dst));
            }
            progress.report(size, Some(size));
        }

        let head = self.head_object(&dst_bucket, &dst_key, dst, cancel).await?;
        Ok(self.object_info(
            dst,
            head.content_length().unwrap_or(0) as u64,
            head.last_modified().and_then(|t| (*t).try_into().ok()),
            head.e_tag().map(str::to_string),
            checksum_from_head(&head),
            None,
        ))
    }

    async fn mkdir(&self, uri: &ObjectUri, cancel: &CancellationToken) -> Result<(), StoreError> {
        let (bucket, key) = Self::bucket_and_key(uri)?;
        if key.is_empty() {
            // The bucket root always exists.
            return Ok(());
        }
        let _permit = self.permit(RequestKind::Put, cancel).await?;
        // Flat namespace: a directory is a zero-byte marker object.
        let request = self
            .client
            .put_object()
            .bucket(&bucket)
            .key(&key)
            .content_length(0)
            .body(SdkByteStream::from_static(b""))
            .send();
        let response = tokio::select! {
            res = request => res,
            _ = tokio::time::sleep(self.timeout) => return Err(StoreError::timeout().with_uri(uri)),
            _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
        };
        response.map_err(|e| to_store_error(e, "PutObject", uri))?;
        Ok(())
    }

    async fn exists(
        &self,
        uri: &ObjectUri,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError> {
        match self.stat(uri, cancel).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_sizes_stay_under_the_cap() {
        let gib = 1024 * 1024 * 1024;

        // Small files keep the base part size.
        assert_eq!(part_size_for(100 * 1024 * 1024, S3_MULTIPART_THRESHOLD), S3_MULTIPART_THRESHOLD);
        // An 8 MiB base only stretches to 10,000 parts at ~78 GiB.
        assert_eq!(part_size_for(80 * gib, S3_MULTIPART_THRESHOLD), 2 * S3_MULTIPART_THRESHOLD);

        for total in [1, 100 * 1024 * 1024, 6 * gib, 80 * gib, 500 * gib, 5000 * gib] {
            let part = part_size_for(total, S3_MULTIPART_THRESHOLD);
            assert!(total.div_ceil(part) <= S3_MAX_PARTS, "total {total}");
            let copy_part = part_size_for(total, COPY_PART_SIZE);
            assert!(total.div_ceil(copy_part) <= S3_MAX_PARTS, "total {total}");
        }
    }

    #[test]
    fn copy_strategy_cutover() {
        let gib: u64 = 1024 * 1024 * 1024;
        assert!(4 * gib <= S3_MAX_SINGLE_COPY_BYTES);
        assert!(8 * gib > S3_MAX_SINGLE_COPY_BYTES);
        // 6 GiB multipart copy takes six 1 GiB ranged parts.
        assert_eq!(6 * gib / part_size_for(6 * gib, COPY_PART_SIZE), 6);
    }

    #[test]
    fn checksum_decodes_from_base64() {
        let head = aws_sdk_s3::operation::head_object::HeadObjectOutput::builder()
            .checksum_crc32_c(base64::encode([0xde, 0xad, 0xbe, 0xef]))
            .build();
        assert_eq!(
            checksum_from_head(&head),
            Some(Checksum::Crc32c("deadbeef".to_string()))
        );
    }
}
