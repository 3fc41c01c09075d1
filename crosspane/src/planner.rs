//! Transfer strategy selection.
//!
//! Single-store operations pass straight through. Copies and moves pick
//! between the backend's server-side copy and the stream-through path
//! (download to scratch, upload, remove) depending on the endpoint
//! schemes. The S3 single-call vs multipart cutover lives inside the S3
//! backend, which consults the source size itself; a backend answering
//! `notImplemented` for copy (the asset store does) falls back to
//! stream-through at execution time.

use object_storage::{ErrorKind, GenericObjectStore, ObjectUri, Scheme, StoreError};

use crate::job::JobKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// One backend call on the source store: delete or mkdir.
    Direct,
    /// Local file into a remote store via `put`.
    Upload,
    /// Remote object onto the local filesystem via `get`.
    Download,
    /// Both endpoints on the local filesystem.
    LocalCopy,
    /// Same scheme, bridgeable authorities: ask the backend to copy
    /// server-side (stream-through remains the runtime fallback).
    ServerSide,
    /// Different schemes, or authorities the backend cannot bridge:
    /// through the scratch directory.
    StreamThrough,
}

pub fn plan(
    kind: JobKind,
    source: &ObjectUri,
    destination: Option<&ObjectUri>,
    source_store: &GenericObjectStore,
) -> Result<Strategy, StoreError> {
    match kind {
        JobKind::Delete | JobKind::Mkdir => Ok(Strategy::Direct),
        JobKind::Upload => {
            let destination = require_destination(kind, destination)?;
            if source.scheme() != Scheme::File {
                return Err(StoreError::new(
                    ErrorKind::MalformedUri,
                    "uploads read from a local file uri",
                )
                .with_uri(source));
            }
            if destination.scheme() == Scheme::File {
                return Ok(Strategy::LocalCopy);
            }
            Ok(Strategy::Upload)
        }
        JobKind::Download => {
            let destination = require_destination(kind, destination)?;
            if destination.scheme() != Scheme::File {
                return Err(StoreError::new(
                    ErrorKind::MalformedUri,
                    "downloads write to a local file uri",
                )
                .with_uri(destination));
            }
            if source.scheme() == Scheme::File {
                return Ok(Strategy::LocalCopy);
            }
            Ok(Strategy::Download)
        }
        JobKind::Copy | JobKind::Move => {
            let destination = require_destination(kind, destination)?;
            match (source.scheme(), destination.scheme()) {
                (Scheme::File, Scheme::File) => Ok(Strategy::LocalCopy),
                (Scheme::File, _) => Ok(Strategy::Upload),
                (_, Scheme::File) => Ok(Strategy::Download),
                (src_scheme, dst_scheme) if src_scheme == dst_scheme => {
                    // Same scheme, but the backend may still be unable to
                    // bridge the two authorities server-side.
                    if source_store.can_bridge(source, destination) {
                        Ok(Strategy::ServerSide)
                    } else {
                        Ok(Strategy::StreamThrough)
                    }
                }
                _ => Ok(Strategy::StreamThrough),
            }
        }
    }
}

fn require_destination<'a>(
    kind: JobKind,
    destination: Option<&'a ObjectUri>,
) -> Result<&'a ObjectUri, StoreError> {
    destination.ok_or_else(|| {
        StoreError::new(
            ErrorKind::MalformedUri,
            format!("{kind:?} jobs need a destination uri"),
        )
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use object_storage::{AifsConfig, FileConfig, LocalFs};

    use super::*;

    fn local() -> GenericObjectStore {
        GenericObjectStore::LocalFs(LocalFs::new(FileConfig::default(), Duration::from_secs(30)))
    }

    fn aifs() -> GenericObjectStore {
        let config = AifsConfig {
            endpoint: "http://localhost:50052".to_string(),
            token: None,
            concurrency_limit: std::num::NonZeroUsize::new(16).unwrap(),
        };
        GenericObjectStore::Aifs(std::sync::Arc::new(
            object_storage::AifsStore::new(&config, Duration::from_secs(30)).unwrap(),
        ))
    }

    fn uri(s: &str) -> ObjectUri {
        ObjectUri::parse(s).unwrap()
    }

    #[test]
    fn single_store_ops_are_direct() {
        let src = uri("s3://b/x/");
        assert_eq!(
            plan(JobKind::Delete, &src, None, &local()).unwrap(),
            Strategy::Direct
        );
        assert_eq!(
            plan(JobKind::Mkdir, &src, None, &local()).unwrap(),
            Strategy::Direct
        );
    }

    #[test]
    fn copy_strategy_by_scheme_pair() {
        let store = local();
        let cases = [
            ("file:///a", "file:///b", Strategy::LocalCopy),
            ("file:///a", "s3://b/x", Strategy::Upload),
            ("s3://b/x", "file:///a", Strategy::Download),
            ("s3://b/x", "s3://b/y", Strategy::ServerSide),
            ("s3://b/x", "s3://other/y", Strategy::ServerSide),
            ("s3://b/x", "gcs://b/y", Strategy::StreamThrough),
            ("gcs://b/x", "az://c/y", Strategy::StreamThrough),
        ];
        for (src, dst, expected) in cases {
            let got = plan(JobKind::Copy, &uri(src), Some(&uri(dst)), &store).unwrap();
            assert_eq!(got, expected, "{src} -> {dst}");
        }
    }

    #[test]
    fn aifs_cross_namespace_streams_through() {
        let store = aifs();
        // Same namespace: the planner still proposes server-side; the
        // backend's notImplemented answer triggers the runtime fallback.
        assert_eq!(
            plan(
                JobKind::Copy,
                &uri("aifs://ns/main/a"),
                Some(&uri("aifs://ns/main/b")),
                &store
            )
            .unwrap(),
            Strategy::ServerSide
        );
        // Different namespaces are not bridgeable at all.
        assert_eq!(
            plan(
                JobKind::Copy,
                &uri("aifs://ns/main/a"),
                Some(&uri("aifs://other/main/a")),
                &store
            )
            .unwrap(),
            Strategy::StreamThrough
        );
    }

    #[test]
    fn move_plans_like_copy() {
        let store = local();
        assert_eq!(
            plan(
                JobKind::Move,
                &uri("file:///tmp/in.txt"),
                Some(&uri("s3://b/out.txt")),
                &store
            )
            .unwrap(),
            Strategy::Upload
        );
    }

    #[test]
    fn missing_destination_is_rejected() {
        let err = plan(JobKind::Copy, &uri("s3://b/x"), None, &local()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedUri);
    }
}
