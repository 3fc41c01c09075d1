//! Azure Blob Storage backend.
//!
//! Azure's namespace is flat: directories are emulated with prefix and
//! delimiter listings plus zero-byte markers. Server-side copies may
//! complete asynchronously; those are polled with exponential backoff and
//! the source etag is re-checked on every poll, so a source mutated
//! mid-copy fails the operation instead of producing a chimera blob.

use std::time::{Duration, SystemTime};

use azure_core::request_options::{Metadata as AzureMetadata, NextMarker};
use azure_core::StatusCode;
use azure_storage::StorageCredentials;
use azure_storage_blobs::blob::{BlobBlockType, BlockId, BlockList, CopyStatus};
use azure_storage_blobs::prelude::{BlobClient, BlobServiceClient, ContainerClient};
use camino::Utf8Path;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ErrorKind, StoreError};
use crate::support::{download_stream_to_file, ByteStream, ThrottledProgress};
use crate::uri::{ObjectUri, Scheme};
use crate::{
    AzureConfig, Checksum, ConcurrencyLimiter, DeleteOptions, ListOptions, ListPage, ListingMode,
    ObjectInfo, ObjectStore, ProgressSink, PutOptions, RequestKind, StorageMetadata,
};

/// Async copy polling cadence: exponential from 250 ms, capped at 5 s.
const COPY_POLL_INITIAL: Duration = Duration::from_millis(250);
const COPY_POLL_CAP: Duration = Duration::from_secs(5);

/// Staged uploads move blocks of this size.
const BLOCK_SIZE: u64 = 8 * 1024 * 1024;

pub struct AzureBlobStorage {
    service: BlobServiceClient,
    concurrency_limiter: ConcurrencyLimiter,
    copy_timeout: Duration,
    pub timeout: Duration,
}

impl AzureBlobStorage {
    pub fn new(config: &AzureConfig, timeout: Duration) -> anyhow::Result<Self> {
        let (account, credentials) = if let Some(connection_string) = &config.connection_string {
            let parsed = azure_storage::ConnectionString::new(connection_string)?;
            let account = parsed
                .account_name
                .map(str::to_string)
                .unwrap_or_else(|| config.account.clone());
            (account, parsed.storage_credentials()?)
        } else if let Some(access_key) = &config.access_key {
            (
                config.account.clone(),
                StorageCredentials::access_key(config.account.clone(), access_key.clone()),
            )
        } else if let Some(sas_token) = &config.sas_token {
            (
                config.account.clone(),
                StorageCredentials::sas_token(sas_token.clone())?,
            )
        } else {
            // Public containers, or an Azurite endpoint.
            (config.account.clone(), StorageCredentials::anonymous())
        };
        let service = BlobServiceClient::new(account, credentials);
        Ok(Self {
            service,
            concurrency_limiter: ConcurrencyLimiter::new(config.concurrency_limit.get()),
            copy_timeout: config.copy_timeout,
            timeout,
        })
    }

    fn container_and_blob(&self, uri: &ObjectUri) -> Result<(ContainerClient, String), StoreError> {
        if uri.scheme() != Scheme::Az {
            return Err(StoreError::new(
                ErrorKind::UnsupportedScheme,
                format!("azure backend got a {} uri", uri.scheme()),
            )
            .with_uri(uri));
        }
        Ok((
            self.service.container_client(uri.authority()),
            uri.path().to_string(),
        ))
    }

    fn blob_client(&self, uri: &ObjectUri) -> Result<BlobClient, StoreError> {
        let (container, blob) = self.container_and_blob(uri)?;
        Ok(container.blob_client(blob))
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

    async fn get_blob_properties(
        &self,
        blob_client: &BlobClient,
        uri: &ObjectUri,
        cancel: &CancellationToken,
    ) -> Result<azure_storage_blobs::blob::Blob, StoreError> {
        let request = blob_client.get_properties().into_future();
        let response = tokio::select! {
            res = request => res,
            _ = tokio::time::sleep(self.timeout) => return Err(StoreError::timeout().with_uri(uri)),
            _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
        };
        response
            .map(|r| r.blob)
            .map_err(|e| to_store_error(e, "GetBlobProperties", uri))
    }

    fn info_from_blob(
        &self,
        authority: &str,
        blob: &azure_storage_blobs::blob::Blob,
    ) -> Result<ObjectInfo, StoreError> {
        let uri = ObjectUri::from_parts(Scheme::Az, authority, &blob.name)?.as_object();
        let properties = &blob.properties;
        Ok(ObjectInfo {
            name: uri.name().to_string(),
            size: properties.content_length,
            last_modified: Some(SystemTime::from(properties.last_modified)),
            is_dir: false,
            etag: Some(properties.etag.to_string()),
            checksum: properties
                .content_md5
                .as_ref()
                .map(|md5| Checksum::Md5(hex::encode(md5.as_slice()))),
            metadata: blob.metadata.as_ref().filter(|m| !m.is_empty()).map(|m| {
                StorageMetadata(m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            }),
            uri,
        })
    }
}

fn to_azure_metadata(metadata: &StorageMetadata) -> AzureMetadata {
    let mut res = AzureMetadata::new();
    for (k, v) in metadata.0.iter() {
        res.insert(k.clone(), v.clone());
    }
    res
}

fn to_store_error(err: azure_core::error::Error, op: &str, uri: &ObjectUri) -> StoreError {
    let kind = if let Some(http_err) = err.as_http_error() {
        match http_err.status() {
            StatusCode::NotFound => ErrorKind::NotFound,
            StatusCode::Unauthorized => ErrorKind::Authentication,
            StatusCode::Forbidden => ErrorKind::Permission,
            StatusCode::RequestTimeout | StatusCode::TooManyRequests => ErrorKind::Network,
            status if status.is_server_error() => ErrorKind::Network,
            _ => ErrorKind::Internal,
        }
    } else {
        ErrorKind::Network
    };
    // The azure error Display can embed the request URL; a SAS token rides
    // in the query string, so only our own wording goes into the message.
    let hint = match kind {
        ErrorKind::Permission => "; the credential or SAS token lacks a required permission",
        ErrorKind::Authentication => "; check the configured storage account credentials",
        _ => "",
    };
    StoreError::new(kind, format!("{op} failed{hint}"))
        .with_uri(uri)
        .with_source(err)
}

impl ObjectStore for AzureBlobStorage {
    async fn list(
        &self,
        uri: &ObjectUri,
        opts: &ListOptions,
        cancel: &CancellationToken,
    ) -> Result<ListPage, StoreError> {
        let (container, mut prefix) = self.container_and_blob(uri)?;
        if let Some(extra) = &opts.prefix {
            prefix.push_str(extra);
        }
        let _permit = self.permit(RequestKind::List, cancel).await?;

        let mut builder = container.list_blobs();
        if !prefix.is_empty() {
            builder = builder.prefix(prefix.clone());
        }
        if let ListingMode::WithDelimiter = opts.mode {
            builder = builder.delimiter(crate::PREFIX_SEPARATOR.to_string());
        }
        if let Some(token) = &opts.page_token {
            builder = builder.marker(NextMarker::from(token.clone()));
        }
        if let Some(page_size) = opts.page_size {
            builder = builder.max_results(page_size);
        }

        let mut pages = builder.into_stream();
        let page = tokio::select! {
            page = pages.next() => page,
            _ = tokio::time::sleep(self.timeout) => return Err(StoreError::timeout().with_uri(uri)),
            _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
        };
        let Some(page) = page else {
            return Ok(ListPage::default());
        };
        let page = page.map_err(|e| to_store_error(e, "ListBlobs", uri))?;

        let mut items = Vec::new();
        for blob in page.blobs.blobs() {
            if blob.name == prefix {
                continue;
            }
            items.push(self.info_from_blob(uri.authority(), blob)?);
        }
        for blob_prefix in page.blobs.prefixes() {
            let child = ObjectUri::from_parts(Scheme::Az, uri.authority(), &blob_prefix.name)?;
            items.push(ObjectInfo::synthetic_dir(child));
        }
        debug!("list: {} entries under {uri}", items.len());
        items.sort_by(|a, b| a.uri.path().as_bytes().cmp(b.uri.path().as_bytes()));

        Ok(ListPage {
            items,
            next_page_token: page.next_marker.map(|m| m.as_str().to_string()),
        })
    }

    async fn stat(
        &self,
        uri: &ObjectUri,
        cancel: &CancellationToken,
    ) -> Result<ObjectInfo, StoreError> {
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
            if uri.path().is_empty() || !page.items.is_empty() {
                return Ok(ObjectInfo::synthetic_dir(uri.clone()));
            }
            return Err(StoreError::new(ErrorKind::NotFound, "no such prefix").with_uri(uri));
        }
        let blob_client = self.blob_client(uri)?;
        let _permit = self.permit(RequestKind::Get, cancel).await?;
        let blob = self.get_blob_properties(&blob_client, uri, cancel).await?;
        self.info_from_blob(uri.authority(), &blob)
    }

    async fn get(
        &self,
        uri: &ObjectUri,
        dest_path: &Utf8Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let blob_client = self.blob_client(uri)?;
        let _permit = self.permit(RequestKind::Get, cancel).await?;

        let blob = self.get_blob_properties(&blob_client, uri, cancel).await?;
        let size = blob.properties.content_length;
        let expected = blob
            .properties
            .content_md5
            .as_ref()
            .map(|md5| Checksum::Md5(hex::encode(md5.as_slice())));

        let stream: ByteStream = Box::pin(async_stream::try_stream! {
            let mut chunks = blob_client.get().into_stream();
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk.map_err(std::io::Error::other)?;
                let data = chunk
                    .data
                    .collect()
                    .await
                    .map_err(std::io::Error::other)?;
                yield data;
            }
        });

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
        let blob_client = self.blob_client(uri)?;
        let _permit = self.permit(RequestKind::Put, cancel).await?;

        let size = tokio::fs::metadata(src_path)
            .await
            .map_err(|e| StoreError::from_io(e, uri))?
            .len();

        if size <= BLOCK_SIZE {
            let body = tokio::fs::read(src_path)
                .await
                .map_err(|e| StoreError::from_io(e, uri))?;
            let mut builder = blob_client.put_block_blob(body);
            if let Some(content_type) = &opts.content_type {
                builder = builder.content_type(content_type.clone());
            }
            if let Some(metadata) = &opts.metadata {
                builder = builder.metadata(to_azure_metadata(metadata));
            }
            let request = builder.into_future();
            tokio::select! {
                res = request => res.map_err(|e| to_store_error(e, "PutBlob", uri))?,
                _ = tokio::time::sleep(self.timeout) => return Err(StoreError::timeout().with_uri(uri)),
                _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
            };
            progress.report(size, Some(size));
        } else {
            // Stage blocks, then commit the list in one shot.
            use tokio::io::AsyncReadExt;
            let mut file = tokio::fs::File::open(src_path)
                .await
                .map_err(|e| StoreError::from_io(e, uri))?;
            let reporter = ThrottledProgress::new(progress);
            let mut block_ids = Vec::new();
            let mut offset: u64 = 0;
            let mut index: u64 = 0;
            while offset < size {
                if cancel.is_cancelled() {
                    return Err(StoreError::cancelled().with_uri(uri));
                }
                let len = BLOCK_SIZE.min(size - offset);
                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf)
                    .await
                    .map_err(|e| StoreError::from_io(e, uri))?;
                // Fixed-width ids: Azure requires every block id in a blob
                // to have the same encoded length.
                let block_id = BlockId::new(format!("{index:016}"));
                let request = blob_client.put_block(block_id.clone(), buf).into_future();
                tokio::select! {
                    res = request => res.map_err(|e| to_store_error(e, "PutBlock", uri))?,
                    _ = tokio::time::sleep(self.timeout) => return Err(StoreError::timeout().with_uri(uri)),
                    _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
                };
                block_ids.push(block_id);
                offset += len;
                index += 1;
                reporter.report(offset, Some(size));
            }

            let block_list = BlockList {
                blocks: block_ids
                    .into_iter()
                    .map(BlobBlockType::new_uncommitted)
                    .collect(),
            };
            let mut builder = blob_client.put_block_list(block_list);
            if let Some(content_type) = &opts.content_type {
                builder = builder.content_type(content_type.clone());
            }
            if let Some(metadata) = &opts.metadata {
                builder = builder.metadata(to_azure_metadata(metadata));
            }
            let request = builder.into_future();
            tokio::select! {
                res = request => res.map_err(|e| to_store_error(e, "PutBlockList", uri))?,
                _ = tokio::time::sleep(self.timeout) => return Err(StoreError::timeout().with_uri(uri)),
                _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
            };
            progress.report(size, Some(size));
        }

        let blob = self.get_blob_properties(&blob_client, uri, cancel).await?;
        self.info_from_blob(uri.authority(), &blob)
    }

    async fn delete(
        &self,
        uri: &ObjectUri,
        opts: &DeleteOptions,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        if !uri.is_dir() {
            let blob_client = self.blob_client(uri)?;
            let _permit = self.permit(RequestKind::Delete, cancel).await?;
            let request = blob_client.delete().into_future();
            let response = tokio::select! {
                res = request => res,
                _ = tokio::time::sleep(self.timeout) => return Err(StoreError::timeout().with_uri(uri)),
                _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
            };
            return match response {
                Ok(_) => Ok(()),
                Err(e) => {
                    let err = to_store_error(e, "DeleteBlob", uri);
                    // Deletion is idempotent.
                    if err.kind() == ErrorKind::NotFound {
                        Ok(())
                    } else {
                        Err(err)
                    }
                }
            };
        }

        // Emulated directory: delete every blob under the prefix.
        let (container, prefix) = self.container_and_blob(uri)?;
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
                let has_children = page.items.iter().any(|i| i.uri.path() != prefix);
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
                let request = container.blob_client(item.uri.path()).delete().into_future();
                match request.await {
                    Ok(_) => {}
                    Err(e) => {
                        let err = to_store_error(e, "DeleteBlob", uri);
                        if err.kind() != ErrorKind::NotFound {
                            return Err(err);
                        }
                    }
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
        let src_blob = self.blob_client(src)?;
        let dst_blob = self.blob_client(dst)?;
        let _permit = self.permit(RequestKind::Copy, cancel).await?;

        let source = self.get_blob_properties(&src_blob, src, cancel).await?;
        let source_etag = source.properties.etag.clone();
        let size = source.properties.content_length;
        let source_url = src_blob
            .url()
            .map_err(|e| to_store_error(e, "BlobUrl", src))?;

        let request = dst_blob.copy(source_url).into_future();
        let started = tokio::select! {
            res = request => res.map_err(|e| to_store_error(e, "CopyBlob", dst))?,
            _ = tokio::time::sleep(self.timeout) => return Err(StoreError::timeout().with_uri(dst)),
            _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(dst)),
        };
        let copy_id = started.copy_id.clone();

        // Same-account copies usually come back Success right away; a
        // cross-account copy answers Pending and runs server-side.
        if !matches!(started.copy_status, CopyStatus::Success) {
            let deadline = tokio::time::Instant::now() + self.copy_timeout;
            let mut poll_delay = COPY_POLL_INITIAL;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(poll_delay) => {}
                    _ = cancel.cancelled() => {
                        abort_and_cleanup(&dst_blob, &copy_id, dst).await;
                        return Err(StoreError::cancelled().with_uri(dst));
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    abort_and_cleanup(&dst_blob, &copy_id, dst).await;
                    return Err(StoreError::timeout().with_uri(dst));
                }

                // A mutated source invalidates everything copied so far.
                let current = self.get_blob_properties(&src_blob, src, cancel).await?;
                if current.properties.etag != source_etag {
                    abort_and_cleanup(&dst_blob, &copy_id, dst).await;
                    return Err(StoreError::new(
                        ErrorKind::EtagChanged,
                        "source blob changed while the copy was in flight",
                    )
                    .with_uri(src));
                }

                let destination = self.get_blob_properties(&dst_blob, dst, cancel).await?;
                match destination.properties.copy_status {
                    Some(CopyStatus::Success) => break,
                    Some(CopyStatus::Pending) | None => {}
                    Some(CopyStatus::Aborted) | Some(CopyStatus::Failed) => {
                        abort_and_cleanup(&dst_blob, &copy_id, dst).await;
                        return Err(StoreError::new(
                            ErrorKind::Internal,
                            "server-side copy reported failure",
                        )
                        .with_uri(dst));
                    }
                }
                poll_delay = (poll_delay * 2).min(COPY_POLL_CAP);
            }
        }
        progress.report(size, Some(size));

        let blob = self.get_blob_properties(&dst_blob, dst, cancel).await?;
        self.info_from_blob(dst.authority(), &blob)
    }

    async fn mkdir(&self, uri: &ObjectUri, cancel: &CancellationToken) -> Result<(), StoreError> {
        let (_, blob) = self.container_and_blob(uri)?;
        if blob.is_empty() {
            return Ok(());
        }
        let blob_client = self.blob_client(uri)?;
        let _permit = self.permit(RequestKind::Put, cancel).await?;
        // Flat namespace: a directory is a zero-byte marker blob.
        let request = blob_client.put_block_blob(Vec::new()).into_future();
        tokio::select! {
            res = request => res.map_err(|e| to_store_error(e, "PutBlob", uri))?,
            _ = tokio::time::sleep(self.timeout) => return Err(StoreError::timeout().with_uri(uri)),
            _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
        };
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

/// Stops an in-flight copy and removes the incomplete destination blob.
/// Both calls are best effort: the copy may have finished racing us.
async fn abort_and_cleanup(
    dst_blob: &BlobClient,
    copy_id: &azure_storage_blobs::prelude::CopyId,
    dst: &ObjectUri,
) {
    if let Err(e) = dst_blob.abort_copy(copy_id.clone()).into_future().await {
        warn!("failed to abort copy to {dst}: {e}");
    }
    if let Err(e) = dst_blob.delete().into_future().await {
        warn!("failed to remove incomplete copy destination {dst}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_backoff_doubles_to_cap() {
        let mut delay = COPY_POLL_INITIAL;
        let mut schedule = Vec::new();
        for _ in 0..6 {
            schedule.push(delay);
            delay = (delay * 2).min(COPY_POLL_CAP);
        }
        assert_eq!(
            schedule,
            vec![
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000),
                Duration::from_secs(5),
            ]
        );
    }

    #[test]
    fn block_ids_are_fixed_width() {
        assert_eq!(format!("{:016}", 0u64).len(), format!("{:016}", 9999u64).len());
    }
}
