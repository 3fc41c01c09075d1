//! AIFS asset store backend, speaking gRPC through [`aifs_api`].
//!
//! Uris look like `aifs://namespace/branch/asset`: the namespace rides in
//! the authority, the first path segment is the branch, the rest is the
//! asset name. The store is content addressed; every transfer is verified
//! against the BLAKE3 digest in the asset descriptor. There is no
//! server-side copy: [`ObjectStore::copy`] answers `NotImplemented` and the
//! planner streams the asset through the client instead.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aifs_api::{
    put_asset_request, AifsClient, AssetDescriptor, DeleteAssetRequest, GetAssetRequest,
    ListAssetsRequest, ListBranchesRequest, PutAssetHeader, PutAssetRequest, StatAssetRequest,
};
use camino::Utf8Path;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::Code;
use tracing::debug;

use crate::error::{ErrorKind, StoreError};
use crate::support::{self, blake3_of_file, download_stream_to_file, ByteStream};
use crate::uri::{ObjectUri, Scheme};
use crate::{
    AifsConfig, Checksum, ConcurrencyLimiter, DeleteOptions, ListOptions, ListPage, ListingMode,
    ObjectInfo, ObjectStore, ProgressSink, PutOptions, RequestKind, StorageMetadata,
};

pub struct AifsStore {
    channel: Channel,
    bearer: Option<MetadataValue<Ascii>>,
    concurrency_limiter: ConcurrencyLimiter,
    pub timeout: Duration,
}

struct AssetLocation {
    namespace: String,
    branch: String,
    name: String,
}

impl AifsStore {
    pub fn new(config: &AifsConfig, timeout: Duration) -> anyhow::Result<Self> {
        let channel = Endpoint::from_shared(config.endpoint.clone())?
            .connect_timeout(timeout)
            .connect_lazy();
        let bearer = config
            .token
            .as_ref()
            .map(|token| format!("Bearer {token}").parse())
            .transpose()?;
        Ok(Self {
            channel,
            bearer,
            concurrency_limiter: ConcurrencyLimiter::new(config.concurrency_limit.get()),
            timeout,
        })
    }

    fn client(&self) -> AifsClient<Channel> {
        AifsClient::new(self.channel.clone())
    }

    fn request<T>(&self, message: T, deadline: bool) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        if let Some(bearer) = &self.bearer {
            request.metadata_mut().insert("authorization", bearer.clone());
        }
        if deadline {
            request.set_timeout(self.timeout);
        }
        request
    }

    fn namespace_of(uri: &ObjectUri) -> Result<String, StoreError> {
        if uri.scheme() != Scheme::Aifs {
            return Err(StoreError::new(
                ErrorKind::UnsupportedScheme,
                format!("aifs backend got a {} uri", uri.scheme()),
            )
            .with_uri(uri));
        }
        Ok(uri.authority().to_string())
    }

    /// Splits `aifs://ns/branch/asset...` into its three coordinates.
    fn asset_location(uri: &ObjectUri) -> Result<AssetLocation, StoreError> {
        let namespace = Self::namespace_of(uri)?;
        let path = uri.path().trim_end_matches('/');
        let Some((branch, name)) = path.split_once('/') else {
            return Err(StoreError::new(
                ErrorKind::MalformedUri,
                "aifs asset uris take the form aifs://namespace/branch/asset",
            )
            .with_uri(uri));
        };
        if name.is_empty() {
            return Err(StoreError::new(
                ErrorKind::MalformedUri,
                "missing asset name",
            )
            .with_uri(uri));
        }
        Ok(AssetLocation {
            namespace,
            branch: branch.to_string(),
            name: name.to_string(),
        })
    }

    fn info_from_descriptor(&self, descriptor: &AssetDescriptor) -> Result<ObjectInfo, StoreError> {
        let key = format!("{}/{}", descriptor.branch, descriptor.name);
        let uri = ObjectUri::from_parts(Scheme::Aifs, &descriptor.namespace, &key)?.as_object();
        Ok(ObjectInfo {
            name: uri.name().to_string(),
            size: descriptor.size,
            last_modified: (descriptor.updated_unix_ms > 0)
                .then(|| UNIX_EPOCH + Duration::from_millis(descriptor.updated_unix_ms as u64)),
            is_dir: false,
            etag: None,
            checksum: (!descriptor.blake3.is_empty())
                .then(|| Checksum::Blake3(descriptor.blake3.clone())),
            metadata: (!descriptor.metadata.is_empty())
                .then(|| StorageMetadata(descriptor.metadata.clone().into_iter().collect())),
            uri,
        })
    }

    async fn stat_asset(
        &self,
        location: &AssetLocation,
        uri: &ObjectUri,
        cancel: &CancellationToken,
    ) -> Result<AssetDescriptor, StoreError> {
        let mut client = self.client();
        let request = self.request(
            StatAssetRequest {
                namespace: location.namespace.clone(),
                branch: location.branch.clone(),
                name: location.name.clone(),
            },
            true,
        );
        let response = tokio::select! {
            res = client.stat_asset(request) => res,
            _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
        };
        response
            .map(|r| r.into_inner())
            .map_err(|e| to_store_error(e, "StatAsset", uri))
    }
}

fn to_store_error(status: tonic::Status, op: &str, uri: &ObjectUri) -> StoreError {
    let kind = match status.code() {
        Code::NotFound => ErrorKind::NotFound,
        Code::PermissionDenied => ErrorKind::Permission,
        Code::Unauthenticated => ErrorKind::Authentication,
        // The server refuses to drop assets that snapshots still reference.
        Code::FailedPrecondition => ErrorKind::HasDependents,
        Code::DeadlineExceeded => ErrorKind::Timeout,
        Code::Unavailable | Code::Aborted | Code::ResourceExhausted => ErrorKind::Network,
        Code::Unimplemented => ErrorKind::NotImplemented,
        _ => ErrorKind::Internal,
    };
    StoreError::new(kind, format!("{op} failed: {}", status.message()))
        .with_uri(uri)
        .with_source(status)
}

impl ObjectStore for AifsStore {
    async fn list(
        &self,
        uri: &ObjectUri,
        opts: &ListOptions,
        cancel: &CancellationToken,
    ) -> Result<ListPage, StoreError> {
        let namespace = Self::namespace_of(uri)?;
        let _permit = tokio::select! {
            permit = self.concurrency_limiter.acquire(RequestKind::List) => {
                permit.expect("semaphore is never closed")
            }
            _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
        };
        let mut client = self.client();

        // The namespace root lists branches as directories.
        if uri.path().is_empty() {
            let request = self.request(
                ListBranchesRequest {
                    namespace: namespace.clone(),
                    page_token: opts.page_token.clone().unwrap_or_default(),
                    page_size: opts.page_size.map(|s| s.get()).unwrap_or(0),
                },
                true,
            );
            let response = tokio::select! {
                res = client.list_branches(request) => res,
                _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
            };
            let response = response
                .map(|r| r.into_inner())
                .map_err(|e| to_store_error(e, "ListBranches", uri))?;

            let mut items = Vec::with_capacity(response.branches.len());
            for branch in &response.branches {
                if let Some(extra) = &opts.prefix {
                    if !branch.name.starts_with(extra.as_str()) {
                        continue;
                    }
                }
                let child =
                    ObjectUri::from_parts(Scheme::Aifs, &namespace, &format!("{}/", branch.name))?;
                let mut info = ObjectInfo::synthetic_dir(child);
                info.last_modified = (branch.updated_unix_ms > 0)
                    .then(|| UNIX_EPOCH + Duration::from_millis(branch.updated_unix_ms as u64));
                items.push(info);
            }
            items.sort_by(|a, b| a.uri.path().as_bytes().cmp(b.uri.path().as_bytes()));
            return Ok(ListPage {
                items,
                next_page_token: (!response.next_page_token.is_empty())
                    .then_some(response.next_page_token),
            });
        }

        // Inside a branch: list assets, emulating directories client-side
        // since asset names are flat.
        let path = uri.path();
        let Some((branch, mut asset_prefix)) = path
            .split_once('/')
            .map(|(b, rest)| (b.to_string(), rest.to_string()))
        else {
            return Err(StoreError::new(
                ErrorKind::MalformedUri,
                "listing needs a directory uri (trailing slash)",
            )
            .with_uri(uri));
        };
        if let Some(extra) = &opts.prefix {
            asset_prefix.push_str(extra);
        }

        let request = self.request(
            ListAssetsRequest {
                namespace: namespace.clone(),
                branch: branch.clone(),
                prefix: asset_prefix.clone(),
                page_token: opts.page_token.clone().unwrap_or_default(),
                page_size: opts.page_size.map(|s| s.get()).unwrap_or(0),
            },
            true,
        );
        let response = tokio::select! {
            res = client.list_assets(request) => res,
            _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
        };
        let response = response
            .map(|r| r.into_inner())
            .map_err(|e| to_store_error(e, "ListAssets", uri))?;
        debug!("list: {} assets under {uri}", response.assets.len());

        let mut items = Vec::new();
        let mut seen_dirs = BTreeSet::new();
        for descriptor in &response.assets {
            let remainder = descriptor
                .name
                .strip_prefix(asset_prefix.as_str())
                .unwrap_or(&descriptor.name);
            match opts.mode {
                ListingMode::WithDelimiter => match remainder.split_once('/') {
                    Some((first, _)) => {
                        // A nested asset shows up as its first path segment.
                        if seen_dirs.insert(first.to_string()) {
                            let child = ObjectUri::from_parts(
                                Scheme::Aifs,
                                &namespace,
                                &format!("{branch}/{asset_prefix}{first}/"),
                            )?;
                            items.push(ObjectInfo::synthetic_dir(child));
                        }
                    }
                    None => items.push(self.info_from_descriptor(descriptor)?),
                },
                ListingMode::NoDelimiter => {
                    items.push(self.info_from_descriptor(descriptor)?)
                }
            }
        }
        items.sort_by(|a, b| a.uri.path().as_bytes().cmp(b.uri.path().as_bytes()));

        Ok(ListPage {
            items,
            next_page_token: (!response.next_page_token.is_empty())
                .then_some(response.next_page_token),
        })
    }

    async fn stat(
        &self,
        uri: &ObjectUri,
        cancel: &CancellationToken,
    ) -> Result<ObjectInfo, StoreError> {
        if uri.is_dir() {
            if uri.path().is_empty() {
                return Ok(ObjectInfo::synthetic_dir(uri.clone()));
            }
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
            if !page.items.is_empty() {
                return Ok(ObjectInfo::synthetic_dir(uri.clone()));
            }
            return Err(
                StoreError::new(ErrorKind::NotFound, "no such branch or prefix").with_uri(uri)
            );
        }
        let location = Self::asset_location(uri)?;
        let descriptor = self.stat_asset(&location, uri, cancel).await?;
        self.info_from_descriptor(&descriptor)
    }

    async fn get(
        &self,
        uri: &ObjectUri,
        dest_path: &Utf8Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let location = Self::asset_location(uri)?;
        let _permit = tokio::select! {
            permit = self.concurrency_limiter.acquire_owned(RequestKind::Get) => {
                permit.expect("semaphore is never closed")
            }
            _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
        };

        // The descriptor's digest is what the received bytes must hash to.
        let descriptor = self.stat_asset(&location, uri, cancel).await?;
        let expected = (!descriptor.blake3.is_empty())
            .then(|| Checksum::Blake3(descriptor.blake3.clone()));

        let mut client = self.client();
        let request = self.request(
            GetAssetRequest {
                namespace: location.namespace.clone(),
                branch: location.branch.clone(),
                name: location.name.clone(),
            },
            false,
        );
        let response = tokio::select! {
            res = client.get_asset(request) => res,
            _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
        };
        let mut chunks = response
            .map_err(|e| to_store_error(e, "GetAsset", uri))?
            .into_inner();

        let stream: ByteStream = Box::pin(async_stream::try_stream! {
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk.map_err(|e| {
                    std::io::Error::other(format!("asset stream failed: {}", e.message()))
                })?;
                yield bytes::Bytes::from(chunk.data);
            }
        });

        download_stream_to_file(
            stream,
            dest_path,
            uri,
            Some(descriptor.size),
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
        let location = Self::asset_location(uri)?;
        let _permit = tokio::select! {
            permit = self.concurrency_limiter.acquire_owned(RequestKind::Put) => {
                permit.expect("semaphore is never closed")
            }
            _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
        };

        let size = tokio::fs::metadata(src_path)
            .await
            .map_err(|e| StoreError::from_io(e, uri))?
            .len();
        // First pass hashes the file; the digest travels in the header so
        // the server can reject a corrupted upload outright.
        let digest = blake3_of_file(src_path, cancel).await?;

        let header = PutAssetHeader {
            namespace: location.namespace.clone(),
            branch: location.branch.clone(),
            name: location.name.clone(),
            size,
            blake3: digest,
            metadata: opts
                .metadata
                .clone()
                .map(|m| m.0.into_iter().collect())
                .unwrap_or_default(),
            content_type: opts.content_type.clone().unwrap_or_default(),
        };

        let sent = Arc::new(AtomicU64::new(0));
        let outbound = {
            let sent = Arc::clone(&sent);
            let src_path = src_path.to_owned();
            let cancel = cancel.clone();
            async_stream::stream! {
                yield PutAssetRequest {
                    msg: Some(put_asset_request::Msg::Header(header)),
                };
                let Ok(file) = tokio::fs::File::open(src_path.as_std_path()).await else {
                    return;
                };
                let mut reader =
                    tokio_util::io::ReaderStream::with_capacity(file, support::CHUNK_SIZE);
                while let Some(chunk) = reader.next().await {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let Ok(chunk) = chunk else { return };
                    sent.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    yield PutAssetRequest {
                        msg: Some(put_asset_request::Msg::Chunk(chunk.to_vec())),
                    };
                }
            }
        };

        let mut client = self.client();
        let rpc = client.put_asset(self.request(outbound, false));
        tokio::pin!(rpc);
        let descriptor = loop {
            tokio::select! {
                res = &mut rpc => {
                    break res
                        .map(|r| r.into_inner())
                        .map_err(|e| to_store_error(e, "PutAsset", uri))?;
                }
                _ = tokio::time::sleep(Duration::from_millis(200)) => {
                    progress.report(sent.load(Ordering::Relaxed), Some(size));
                }
                _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
            }
        };
        progress.report(size, Some(size));

        self.info_from_descriptor(&descriptor)
    }

    async fn delete(
        &self,
        uri: &ObjectUri,
        _opts: &DeleteOptions,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let location = Self::asset_location(uri)?;
        let _permit = tokio::select! {
            permit = self.concurrency_limiter.acquire(RequestKind::Delete) => {
                permit.expect("semaphore is never closed")
            }
            _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
        };
        let mut client = self.client();
        let request = self.request(
            DeleteAssetRequest {
                namespace: location.namespace,
                branch: location.branch,
                name: location.name,
            },
            true,
        );
        let response = tokio::select! {
            res = client.delete_asset(request) => res,
            _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
        };
        match response {
            Ok(_) => Ok(()),
            // Deletion is idempotent.
            Err(status) if status.code() == Code::NotFound => Ok(()),
            Err(status) => Err(to_store_error(status, "DeleteAsset", uri)),
        }
    }

    async fn copy(
        &self,
        src: &ObjectUri,
        dst: &ObjectUri,
        _progress: &dyn ProgressSink,
        _cancel: &CancellationToken,
    ) -> Result<ObjectInfo, StoreError> {
        let _ = Self::asset_location(src)?;
        let _ = Self::asset_location(dst)?;
        // Assets are content addressed; the transfer engine re-hashes them
        // through a local stream instead of a server-side copy.
        Err(StoreError::new(
            ErrorKind::NotImplemented,
            "the asset store has no server-side copy",
        )
        .with_uri(src))
    }

    async fn mkdir(&self, uri: &ObjectUri, _cancel: &CancellationToken) -> Result<(), StoreError> {
        Err(StoreError::new(
            ErrorKind::NotImplemented,
            "branches are created through the asset store tooling, not mkdir",
        )
        .with_uri(uri))
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
    fn asset_location_splits_branch_and_name() {
        let uri = ObjectUri::parse("aifs://ns/main/models/weights.bin").unwrap();
        let location = AifsStore::asset_location(&uri).unwrap();
        assert_eq!(location.namespace, "ns");
        assert_eq!(location.branch, "main");
        assert_eq!(location.name, "models/weights.bin");
    }

    #[test]
    fn branch_root_is_not_an_asset() {
        let uri = ObjectUri::parse("aifs://ns/main/").unwrap();
        let err = AifsStore::asset_location(&uri).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedUri);

        let uri = ObjectUri::parse("aifs://ns/main").unwrap();
        assert!(AifsStore::asset_location(&uri).is_err());
    }
}
