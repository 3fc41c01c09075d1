//! Google Cloud Storage backend, speaking the JSON API directly.
//!
//! Tokens come from `tame-oauth` (service-account key or application
//! default credentials); when neither is available the client runs
//! unauthenticated, which suits emulator endpoints. Uploads above
//! [`crate::GCS_RESUMABLE_THRESHOLD`] (and any upload carrying custom
//! metadata) go through a resumable session whose URL doubles as the
//! job-level resume token. Downloads restart from the last confirmed byte
//! on transient failures, and the CRC32C (or MD5) the service advertises is
//! verified against the received bytes.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use camino::Utf8Path;
use futures::StreamExt;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::StatusCode;
use serde::Deserialize;
use tame_oauth::gcp::{ServiceAccountInfo, ServiceAccountProvider, TokenOrRequest, TokenProvider, TokenProviderWrapper};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ErrorKind, StoreError};
use crate::support::{download_stream_to_file, ByteStream, ThrottledProgress};
use crate::uri::{ObjectUri, Scheme};
use crate::{
    Checksum, ConcurrencyLimiter, DeleteOptions, GcsConfig, ListOptions, ListPage, ListingMode,
    ObjectInfo, ObjectStore, ProgressSink, PutOptions, RequestKind, StorageMetadata,
    GCS_RESUMABLE_THRESHOLD,
};

const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";
const SCOPES: &[&str] = &["https://www.googleapis.com/auth/devstorage.read_write"];
/// Resumable chunks must be multiples of 256 KiB; 8 MiB is the documented
/// sweet spot.
const RESUMABLE_CHUNK: u64 = 8 * 1024 * 1024;
/// Mid-stream download failures are resumed from the confirmed offset this
/// many times before the whole operation is failed upward.
const DOWNLOAD_RESUME_ATTEMPTS: u32 = 3;

enum GcsTokenProvider {
    ServiceAccount(Box<ServiceAccountProvider>),
    Default(Box<TokenProviderWrapper>),
    /// No credentials found anywhere: talk anonymously (emulators).
    Anonymous,
}

pub struct GcsBucket {
    http: reqwest::Client,
    provider: GcsTokenProvider,
    endpoint: String,
    concurrency_limiter: ConcurrencyLimiter,
    pub timeout: Duration,
}

impl GcsBucket {
    pub fn new(config: &GcsConfig, timeout: Duration) -> anyhow::Result<Self> {
        let provider = match &config.service_account_json {
            Some(json) => {
                let info = ServiceAccountInfo::deserialize(json.as_str())?;
                GcsTokenProvider::ServiceAccount(Box::new(ServiceAccountProvider::new(info)?))
            }
            None => match TokenProviderWrapper::get_default_provider()? {
                Some(provider) => GcsTokenProvider::Default(Box::new(provider)),
                None => {
                    warn!("no GCS credentials found, requests will be unauthenticated");
                    GcsTokenProvider::Anonymous
                }
            },
        };

        // 308 "Resume Incomplete" must reach us as-is, so redirects stay off.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            http,
            provider,
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            concurrency_limiter: ConcurrencyLimiter::new(config.concurrency_limit.get()),
            timeout,
        })
    }

    fn bucket_and_object(uri: &ObjectUri) -> Result<(String, String), StoreError> {
        if uri.scheme() != Scheme::Gcs {
            return Err(StoreError::new(
                ErrorKind::UnsupportedScheme,
                format!("gcs backend got a {} uri", uri.scheme()),
            )
            .with_uri(uri));
        }
        Ok((uri.authority().to_string(), uri.path().to_string()))
    }

    fn object_url(&self, bucket: &str, object: &str) -> String {
        format!(
            "{}/storage/v1/b/{bucket}/o/{}",
            self.endpoint,
            urlencoding::encode(object)
        )
    }

    /// Produces the `Authorization` header, running the OAuth exchange when
    /// the cached token expired. `tame-oauth` keeps the token cache; we only
    /// ferry its HTTP exchange through reqwest.
    async fn bearer(&self) -> Result<Option<HeaderValue>, StoreError> {
        let token_or_request = match &self.provider {
            GcsTokenProvider::Anonymous => return Ok(None),
            GcsTokenProvider::ServiceAccount(p) => p.get_token(SCOPES),
            GcsTokenProvider::Default(p) => p.get_token(SCOPES),
        }
        .map_err(auth_error)?;

        let token = match token_or_request {
            TokenOrRequest::Token(token) => token,
            TokenOrRequest::Request {
                request,
                scope_hash,
                ..
            } => {
                let (parts, body) = request.into_parts();
                let response = self
                    .http
                    .request(parts.method, parts.uri.to_string())
                    .headers(parts.headers)
                    .body(body)
                    .timeout(self.timeout)
                    .send()
                    .await
                    .map_err(|e| transport_error(e, "token exchange"))?;

                let mut builder = http::Response::builder().status(response.status());
                if let Some(headers) = builder.headers_mut() {
                    *headers = response.headers().clone();
                }
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| transport_error(e, "token exchange"))?;
                let response = builder.body(body.to_vec()).map_err(|e| {
                    StoreError::new(ErrorKind::Internal, format!("token response: {e}"))
                })?;

                match &self.provider {
                    GcsTokenProvider::Anonymous => unreachable!(),
                    GcsTokenProvider::ServiceAccount(p) => {
                        p.parse_token_response(scope_hash, response)
                    }
                    GcsTokenProvider::Default(p) => p.parse_token_response(scope_hash, response),
                }
                .map_err(auth_error)?
            }
        };

        let value = HeaderValue::from_str(&format!("Bearer {}", token.access_token))
            .map_err(|e| StoreError::new(ErrorKind::Internal, format!("bad token: {e}")))?;
        Ok(Some(value))
    }

    fn authorize(
        &self,
        mut request: reqwest::RequestBuilder,
        bearer: &Option<HeaderValue>,
    ) -> reqwest::RequestBuilder {
        if let Some(value) = bearer {
            request = request.header(AUTHORIZATION, value.clone());
        }
        request
    }

    async fn send_checked(
        &self,
        request: reqwest::RequestBuilder,
        op: &str,
        uri: &ObjectUri,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, StoreError> {
        let response = tokio::select! {
            res = request.timeout(self.timeout).send() => {
                res.map_err(|e| transport_error(e, op).with_uri(uri))?
            }
            _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
        };
        let status = response.status();
        if status.is_success() || status.as_u16() == 308 {
            Ok(response)
        } else {
            Err(status_error(status, op).with_uri(uri))
        }
    }

    fn info_from_object(&self, bucket: &str, object: &GcsObject) -> Result<ObjectInfo, StoreError> {
        let uri = ObjectUri::from_parts(Scheme::Gcs, bucket, &object.name)?.as_object();
        Ok(ObjectInfo {
            name: uri.name().to_string(),
            size: object
                .size
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            last_modified: object.updated.map(SystemTime::from),
            is_dir: false,
            etag: object.etag.clone(),
            checksum: object.checksum(),
            metadata: object
                .metadata
                .clone()
                .filter(|m| !m.is_empty())
                .map(StorageMetadata),
            uri,
        })
    }

    async fn stat_object(
        &self,
        bucket: &str,
        object: &str,
        uri: &ObjectUri,
        cancel: &CancellationToken,
    ) -> Result<GcsObject, StoreError> {
        let bearer = self.bearer().await?;
        let request = self.authorize(self.http.get(self.object_url(bucket, object)), &bearer);
        let response = self.send_checked(request, "object metadata", uri, cancel).await?;
        response
            .json::<GcsObject>()
            .await
            .map_err(|e| transport_error(e, "object metadata").with_uri(uri))
    }

    async fn put_resumable(
        &self,
        src_path: &Utf8Path,
        bucket: &str,
        object: &str,
        uri: &ObjectUri,
        size: u64,
        opts: &PutOptions,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<GcsObject, StoreError> {
        let bearer = self.bearer().await?;

        // Reuse the session from the resume token, or initiate a fresh one
        // and immediately hand its URL out for persistence.
        let (session_url, mut offset) = match &opts.resume_token {
            Some(session_url) => {
                let offset = self
                    .probe_session(session_url, size, uri, cancel)
                    .await?;
                debug!("resuming gcs upload of {uri} from offset {offset}");
                (session_url.clone(), offset)
            }
            None => {
                let initiate_url = format!(
                    "{}/upload/storage/v1/b/{bucket}/o?uploadType=resumable&name={}",
                    self.endpoint,
                    urlencoding::encode(object)
                );
                let mut body = serde_json::Map::new();
                if let Some(content_type) = &opts.content_type {
                    body.insert("contentType".into(), content_type.clone().into());
                }
                if let Some(metadata) = &opts.metadata {
                    body.insert(
                        "metadata".into(),
                        serde_json::to_value(&metadata.0).expect("string map is valid json"),
                    );
                }
                let request = self
                    .authorize(self.http.post(&initiate_url), &bearer)
                    .json(&serde_json::Value::Object(body));
                let response = self
                    .send_checked(request, "initiate resumable upload", uri, cancel)
                    .await?;
                let session_url = response
                    .headers()
                    .get("location")
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        StoreError::new(
                            ErrorKind::Internal,
                            "resumable upload initiation returned no session URL",
                        )
                        .with_uri(uri)
                    })?
                    .to_string();
                if let Some(sink) = &opts.resume_sink {
                    sink(&session_url);
                }
                (session_url, 0)
            }
        };

        let mut file = tokio::fs::File::open(src_path)
            .await
            .map_err(|e| StoreError::from_io(e, uri))?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|e| StoreError::from_io(e, uri))?;
        }

        let reporter = ThrottledProgress::new(progress);

        if size > 0 && offset >= size {
            // The interrupted run had already pushed every byte; all that
            // is left is fetching the committed object.
            progress.report(size, Some(size));
            return self.stat_object(bucket, object, uri, cancel).await;
        }

        if size == 0 {
            // Finalize an empty object with a zero-length chunk.
            let request = self
                .authorize(self.http.put(&session_url), &bearer)
                .header(CONTENT_LENGTH, 0)
                .header(CONTENT_RANGE, "bytes */0");
            let response = self.send_checked(request, "finalize upload", uri, cancel).await?;
            return response
                .json::<GcsObject>()
                .await
                .map_err(|e| transport_error(e, "finalize upload").with_uri(uri));
        }

        loop {
            if cancel.is_cancelled() {
                return Err(StoreError::cancelled().with_uri(uri));
            }
            let len = RESUMABLE_CHUNK.min(size - offset);
            let mut buf = vec![0u8; len as usize];
            file.read_exact(&mut buf)
                .await
                .map_err(|e| StoreError::from_io(e, uri))?;
            let end = offset + len - 1;

            let request = self
                .authorize(self.http.put(&session_url), &bearer)
                .header(CONTENT_LENGTH, len)
                .header(CONTENT_RANGE, format!("bytes {offset}-{end}/{size}"))
                .body(buf);
            let response = self
                .send_checked(request, "resumable chunk upload", uri, cancel)
                .await?;

            match response.status().as_u16() {
                // 308 Resume Incomplete: the Range header confirms how far
                // the service got.
                308 => {
                    offset = confirmed_end(response.headers()).map(|e| e + 1).unwrap_or(end + 1);
                    reporter.report(offset, Some(size));
                    if offset < size {
                        file.seek(std::io::SeekFrom::Start(offset))
                            .await
                            .map_err(|e| StoreError::from_io(e, uri))?;
                    }
                }
                200 | 201 => {
                    progress.report(size, Some(size));
                    return response
                        .json::<GcsObject>()
                        .await
                        .map_err(|e| transport_error(e, "resumable chunk upload").with_uri(uri));
                }
                status => {
                    return Err(status_error(
                        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                        "resumable chunk upload",
                    )
                    .with_uri(uri));
                }
            }
        }
    }

    /// Asks a resumable session how many bytes it has already committed.
    async fn probe_session(
        &self,
        session_url: &str,
        size: u64,
        uri: &ObjectUri,
        cancel: &CancellationToken,
    ) -> Result<u64, StoreError> {
        let bearer = self.bearer().await?;
        let request = self
            .authorize(self.http.put(session_url), &bearer)
            .header(CONTENT_LENGTH, 0)
            .header(CONTENT_RANGE, format!("bytes */{size}"));
        let response = self.send_checked(request, "resumable status probe", uri, cancel).await?;
        match response.status().as_u16() {
            308 => Ok(confirmed_end(response.headers()).map(|e| e + 1).unwrap_or(0)),
            // The session already completed; nothing left to send.
            200 | 201 => Ok(size),
            status => Err(status_error(
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                "resumable status probe",
            )
            .with_uri(uri)),
        }
    }
}

/// Parses the confirmed end offset out of a 308 `Range: bytes=0-N` header.
fn confirmed_end(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(RANGE)
        .or_else(|| headers.get("range"))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit_once('-'))
        .and_then(|(_, end)| end.parse().ok())
}

fn auth_error(err: tame_oauth::Error) -> StoreError {
    StoreError::new(
        ErrorKind::Authentication,
        format!("GCS authentication failed: {err}; check the configured service account"),
    )
}

fn transport_error(err: reqwest::Error, op: &str) -> StoreError {
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else {
        ErrorKind::Network
    };
    StoreError::new(kind, format!("{op} failed")).with_source(err)
}

fn status_error(status: StatusCode, op: &str) -> StoreError {
    let (kind, hint) = match status.as_u16() {
        401 => (ErrorKind::Authentication, "; refresh the GCS credentials"),
        403 => (
            ErrorKind::Permission,
            "; grant the account access to this bucket",
        ),
        404 => (ErrorKind::NotFound, ""),
        408 | 429 => (ErrorKind::Network, ""),
        s if s >= 500 => (ErrorKind::Network, ""),
        _ => (ErrorKind::Internal, ""),
    };
    StoreError::new(kind, format!("{op} failed with status {status}{hint}"))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcsObject {
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    updated: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    etag: Option<String>,
    #[serde(default)]
    md5_hash: Option<String>,
    #[serde(default)]
    crc32c: Option<String>,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

impl GcsObject {
    /// GCS advertises both hashes base64-encoded; CRC32C covers every
    /// object (composite ones included), so it wins.
    fn checksum(&self) -> Option<Checksum> {
        if let Some(crc) = &self.crc32c {
            if let Ok(raw) = base64::decode(crc) {
                return Some(Checksum::Crc32c(hex::encode(raw)));
            }
        }
        if let Some(md5) = &self.md5_hash {
            if let Ok(raw) = base64::decode(md5) {
                return Some(Checksum::Md5(hex::encode(raw)));
            }
        }
        None
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<GcsObject>,
    #[serde(default)]
    prefixes: Vec<String>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RewriteResponse {
    done: bool,
    #[serde(default)]
    rewrite_token: Option<String>,
    #[serde(default)]
    total_bytes_rewritten: Option<String>,
    #[serde(default)]
    object_size: Option<String>,
    #[serde(default)]
    resource: Option<GcsObject>,
}

impl ObjectStore for GcsBucket {
    async fn list(
        &self,
        uri: &ObjectUri,
        opts: &ListOptions,
        cancel: &CancellationToken,
    ) -> Result<ListPage, StoreError> {
        let (bucket, mut prefix) = Self::bucket_and_object(uri)?;
        if let Some(extra) = &opts.prefix {
            prefix.push_str(extra);
        }
        let _permit = tokio::select! {
            permit = self.concurrency_limiter.acquire(RequestKind::List) => {
                permit.expect("semaphore is never closed")
            }
            _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
        };

        let bearer = self.bearer().await?;
        let mut request = self
            .http
            .get(format!("{}/storage/v1/b/{bucket}/o", self.endpoint));
        if !prefix.is_empty() {
            request = request.query(&[("prefix", prefix.as_str())]);
        }
        if let ListingMode::WithDelimiter = opts.mode {
            request = request.query(&[("delimiter", "/")]);
        }
        if let Some(token) = &opts.page_token {
            request = request.query(&[("pageToken", token.as_str())]);
        }
        if let Some(page_size) = opts.page_size {
            request = request.query(&[("maxResults", page_size.get().to_string().as_str())]);
        }
        let request = self.authorize(request, &bearer);
        let response = self.send_checked(request, "list objects", uri, cancel).await?;
        let listing: ListResponse = response
            .json()
            .await
            .map_err(|e| transport_error(e, "list objects").with_uri(uri))?;

        debug!(
            "list: {} prefixes, {} items",
            listing.prefixes.len(),
            listing.items.len()
        );

        let mut items = Vec::with_capacity(listing.items.len() + listing.prefixes.len());
        for object in &listing.items {
            if object.name == prefix {
                continue;
            }
            items.push(self.info_from_object(&bucket, object)?);
        }
        for sub_prefix in &listing.prefixes {
            let child = ObjectUri::from_parts(Scheme::Gcs, &bucket, sub_prefix)?;
            items.push(ObjectInfo::synthetic_dir(child));
        }
        items.sort_by(|a, b| a.uri.path().as_bytes().cmp(b.uri.path().as_bytes()));

        Ok(ListPage {
            items,
            next_page_token: listing.next_page_token,
        })
    }

    async fn stat(
        &self,
        uri: &ObjectUri,
        cancel: &CancellationToken,
    ) -> Result<ObjectInfo, StoreError> {
        let (bucket, object) = Self::bucket_and_object(uri)?;
        if uri.is_dir() {
            let page = self
                .list(
                    uri,
                    &ListOptions {
                        mode: ListingMode::NoDelimiter,
                        prefix: None,
                        page_token: None,
                        page_size: Some(std::num::NonZeroU32::new(1).unwrap()),
                    },
                    cancel,
                )
                .await?;
            if object.is_empty() || !page.items.is_empty() {
                return Ok(ObjectInfo::synthetic_dir(uri.clone()));
            }
            return Err(StoreError::new(ErrorKind::NotFound, "no such prefix").with_uri(uri));
        }
        let object = self.stat_object(&bucket, &object, uri, cancel).await?;
        self.info_from_object(&bucket, &object)
    }

    async fn get(
        &self,
        uri: &ObjectUri,
        dest_path: &Utf8Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let (bucket, object) = Self::bucket_and_object(uri)?;
        let _permit = tokio::select! {
            permit = self.concurrency_limiter.acquire_owned(RequestKind::Get) => {
                permit.expect("semaphore is never closed")
            }
            _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
        };

        let descriptor = self.stat_object(&bucket, &object, uri, cancel).await?;
        let expected = descriptor.checksum();
        let size = descriptor.size.as_deref().and_then(|s| s.parse().ok());

        let bearer = self.bearer().await?;
        let url = format!("{}?alt=media", self.object_url(&bucket, &object));
        let http = self.http.clone();

        // Ranged re-requests pick the download back up from the last
        // confirmed byte after a mid-stream failure.
        let stream: ByteStream = Box::pin(async_stream::try_stream! {
            let mut offset: u64 = 0;
            let mut resumes: u32 = 0;
            'request: loop {
                let mut request = http.get(&url);
                if let Some(value) = &bearer {
                    request = request.header(AUTHORIZATION, value.clone());
                }
                if offset > 0 {
                    request = request.header(RANGE, format!("bytes={offset}-"));
                }
                let response = request
                    .send()
                    .await
                    .map_err(|e| std::io::Error::other(format!("download request failed: {e}")))?;
                if !response.status().is_success() {
                    Err::<bytes::Bytes, std::io::Error>(std::io::Error::other(format!(
                        "download failed with status {}",
                        response.status()
                    )))?;
                }
                let mut body = response.bytes_stream();
                while let Some(chunk) = body.next().await {
                    match chunk {
                        Ok(chunk) => {
                            offset += chunk.len() as u64;
                            yield chunk;
                        }
                        Err(e) if resumes < DOWNLOAD_RESUME_ATTEMPTS => {
                            resumes += 1;
                            warn!("gcs download interrupted ({e}), resuming from byte {offset}");
                            continue 'request;
                        }
                        Err(e) => {
                            Err::<bytes::Bytes, std::io::Error>(std::io::Error::other(format!(
                                "download stream failed: {e}"
                            )))?;
                        }
                    }
                }
                break;
            }
        });

        download_stream_to_file(stream, dest_path, uri, size, expected.as_ref(), progress, cancel)
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
        let (bucket, object) = Self::bucket_and_object(uri)?;
        let _permit = tokio::select! {
            permit = self.concurrency_limiter.acquire(RequestKind::Put) => {
                permit.expect("semaphore is never closed")
            }
            _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
        };

        let size = tokio::fs::metadata(src_path)
            .await
            .map_err(|e| StoreError::from_io(e, uri))?
            .len();

        // The single-shot media upload cannot carry custom metadata, so
        // those go resumable regardless of size.
        let stored = if size > GCS_RESUMABLE_THRESHOLD || opts.metadata.is_some() {
            self.put_resumable(src_path, &bucket, &object, uri, size, opts, progress, cancel)
                .await?
        } else {
            let bearer = self.bearer().await?;
            let body = tokio::fs::read(src_path)
                .await
                .map_err(|e| StoreError::from_io(e, uri))?;
            let url = format!(
                "{}/upload/storage/v1/b/{bucket}/o?uploadType=media&name={}",
                self.endpoint,
                urlencoding::encode(&object)
            );
            let mut request = self.authorize(self.http.post(&url), &bearer).body(body);
            if let Some(content_type) = &opts.content_type {
                request = request.header(CONTENT_TYPE, content_type);
            }
            let response = self.send_checked(request, "media upload", uri, cancel).await?;
            progress.report(size, Some(size));
            response
                .json::<GcsObject>()
                .await
                .map_err(|e| transport_error(e, "media upload").with_uri(uri))?
        };

        self.info_from_object(&bucket, &stored)
    }

    async fn delete(
        &self,
        uri: &ObjectUri,
        opts: &DeleteOptions,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let (bucket, object) = Self::bucket_and_object(uri)?;
        let _permit = tokio::select! {
            permit = self.concurrency_limiter.acquire(RequestKind::Delete) => {
                permit.expect("semaphore is never closed")
            }
            _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
        };
        let bearer = self.bearer().await?;

        if !uri.is_dir() {
            let request = self.authorize(self.http.delete(self.object_url(&bucket, &object)), &bearer);
            return match self.send_checked(request, "delete object", uri, cancel).await {
                Ok(_) => Ok(()),
                // Deletion is idempotent.
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            };
        }

        // Prefix deletion: the JSON API has no batch call, so drain the
        // flat listing and delete object by object.
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .list(
                    uri,
                    &ListOptions {
                        mode: ListingMode::NoDelimiter,
                        prefix: None,
                        page_token: page_token.clone(),
                        page_size: None,
                    },
                    cancel,
                )
                .await?;
            if !opts.recursive {
                let has_children = page.items.iter().any(|i| i.uri.path() != object);
                if has_children {
                    return Err(StoreError::new(
                        ErrorKind::NotEmpty,
                        "prefix is not empty; pass recursive to remove it",
                    )
                    .with_uri(uri));
                }
            }
            for item in &page.items {
                if cancel.is_cancelled() {
                    return Err(StoreError::cancelled().with_uri(uri));
                }
                let request = self.authorize(
                    self.http.delete(self.object_url(&bucket, item.uri.path())),
                    &bearer,
                );
                match self.send_checked(request, "delete object", uri, cancel).await {
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
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
        let (src_bucket, src_object) = Self::bucket_and_object(src)?;
        let (dst_bucket, dst_object) = Self::bucket_and_object(dst)?;
        let _permit = tokio::select! {
            permit = self.concurrency_limiter.acquire(RequestKind::Copy) => {
                permit.expect("semaphore is never closed")
            }
            _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(dst)),
        };
        let bearer = self.bearer().await?;

        let url = format!(
            "{}/storage/v1/b/{src_bucket}/o/{}/rewriteTo/b/{dst_bucket}/o/{}",
            self.endpoint,
            urlencoding::encode(&src_object),
            urlencoding::encode(&dst_object)
        );

        // Rewrite is incremental for large or cross-region objects: loop,
        // carrying the token, until the service reports done. Metadata is
        // preserved by the operation itself.
        let reporter = ThrottledProgress::new(progress);
        let mut rewrite_token: Option<String> = None;
        let resource = loop {
            if cancel.is_cancelled() {
                return Err(StoreError::cancelled().with_uri(dst));
            }
            let mut request = self.authorize(self.http.post(&url), &bearer);
            if let Some(token) = &rewrite_token {
                request = request.query(&[("rewriteToken", token.as_str())]);
            }
            let response = self
                .send_checked(request.json(&serde_json::json!({})), "rewrite object", dst, cancel)
                .await?;
            let rewrite: RewriteResponse = response
                .json()
                .await
                .map_err(|e| transport_error(e, "rewrite object").with_uri(dst))?;

            let done_bytes = rewrite
                .total_bytes_rewritten
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let total_bytes = rewrite.object_size.as_deref().and_then(|s| s.parse().ok());
            reporter.report(done_bytes, total_bytes);

            if rewrite.done {
                break rewrite.resource;
            }
            rewrite_token = rewrite.rewrite_token;
            if rewrite_token.is_none() {
                return Err(StoreError::new(
                    ErrorKind::Internal,
                    "rewrite not done but no rewriteToken returned",
                )
                .with_uri(dst));
            }
        };

        match resource {
            Some(object) => {
                progress.report(
                    object.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0),
                    object.size.as_deref().and_then(|s| s.parse().ok()),
                );
                self.info_from_object(&dst_bucket, &object)
            }
            None => self.stat(dst, cancel).await,
        }
    }

    async fn mkdir(&self, uri: &ObjectUri, cancel: &CancellationToken) -> Result<(), StoreError> {
        let (bucket, object) = Self::bucket_and_object(uri)?;
        if object.is_empty() {
            return Ok(());
        }
        let bearer = self.bearer().await?;
        // Flat namespace: a directory is a zero-byte marker object.
        let url = format!(
            "{}/upload/storage/v1/b/{bucket}/o?uploadType=media&name={}",
            self.endpoint,
            urlencoding::encode(&object)
        );
        let request = self
            .authorize(self.http.post(&url), &bearer)
            .header(CONTENT_LENGTH, 0)
            .body(Vec::new());
        self.send_checked(request, "create directory marker", uri, cancel)
            .await?;
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
    fn confirmed_end_parses_range_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(RANGE, HeaderValue::from_static("bytes=0-2097151"));
        assert_eq!(confirmed_end(&headers), Some(2097151));

        headers.clear();
        assert_eq!(confirmed_end(&headers), None);
    }

    #[test]
    fn checksum_prefers_crc32c() {
        let object = GcsObject {
            name: "x".into(),
            size: Some("4".into()),
            updated: None,
            etag: None,
            md5_hash: Some(base64::encode([1u8; 16])),
            crc32c: Some(base64::encode([0xde, 0xad, 0xbe, 0xef])),
            metadata: None,
        };
        assert_eq!(
            object.checksum(),
            Some(Checksum::Crc32c("deadbeef".to_string()))
        );
    }

    #[test]
    fn resumable_chunk_is_256k_aligned() {
        assert_eq!(RESUMABLE_CHUNK % (256 * 1024), 0);
        assert!(RESUMABLE_CHUNK >= GCS_RESUMABLE_THRESHOLD);
    }

    #[test]
    fn upload_path_cutover() {
        let mib = 1024 * 1024;
        // 1 MiB stays on the single-shot media upload, 10 MiB must go
        // through a resumable session.
        assert!(mib <= GCS_RESUMABLE_THRESHOLD);
        assert!(10 * mib > GCS_RESUMABLE_THRESHOLD);
    }
}
