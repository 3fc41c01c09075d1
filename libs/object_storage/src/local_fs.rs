//! Local file system backend.
//!
//! Uris map 1:1 onto absolute paths (`file:///a/b` is `/a/b`). Listing
//! returns the on-disk case; on case-insensitive filesystems the tree is
//! treated as case-preserving, with comparisons handled by
//! [`ObjectUri::same_location`].

use std::os::unix::fs::MetadataExt;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, StoreError};
use crate::support::{download_stream_to_file, file_byte_stream};
use crate::uri::{ObjectUri, Scheme};
use crate::{
    DeleteOptions, FileConfig, ListOptions, ListPage, ListingMode, ObjectInfo, ObjectStore,
    ProgressSink, PutOptions,
};

#[derive(Clone)]
pub struct LocalFs {
    #[allow(unused)]
    config: FileConfig,
    /// Applied to metadata operations only; data streaming is bounded by
    /// cancellation, not by wall clock, since file sizes are unbounded.
    timeout: Duration,
}

impl LocalFs {
    pub fn new(config: FileConfig, timeout: Duration) -> Self {
        LocalFs { config, timeout }
    }

    fn check_scheme(uri: &ObjectUri) -> Result<Utf8PathBuf, StoreError> {
        if uri.scheme() != Scheme::File {
            return Err(StoreError::new(
                ErrorKind::UnsupportedScheme,
                format!("file backend got a {} uri", uri.scheme()),
            )
            .with_uri(uri));
        }
        Ok(uri.local_path())
    }

    async fn info_for(&self, uri: &ObjectUri, path: &Utf8Path) -> Result<ObjectInfo, StoreError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| StoreError::from_io(e, uri))?;
        Ok(info_from_metadata(uri, &metadata))
    }
}

fn info_from_metadata(uri: &ObjectUri, metadata: &std::fs::Metadata) -> ObjectInfo {
    let uri = if metadata.is_dir() {
        uri.as_dir()
    } else {
        uri.as_object()
    };
    let name = uri.name().to_string();
    ObjectInfo {
        name,
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        last_modified: metadata.modified().ok(),
        is_dir: metadata.is_dir(),
        etag: None,
        checksum: None,
        metadata: None,
        uri,
    }
}

impl ObjectStore for LocalFs {
    async fn list(
        &self,
        uri: &ObjectUri,
        opts: &ListOptions,
        cancel: &CancellationToken,
    ) -> Result<ListPage, StoreError> {
        let dir_path = Self::check_scheme(uri)?;

        // Collect (name, metadata) pairs, relative to the listed dir.
        let mut entries: Vec<(String, std::fs::Metadata)> = match opts.mode {
            ListingMode::WithDelimiter => {
                let mut out = Vec::new();
                let mut read_dir = tokio::time::timeout(self.timeout, tokio::fs::read_dir(&dir_path))
                    .await
                    .map_err(|_| StoreError::timeout().with_uri(uri))?
                    .map_err(|e| StoreError::from_io(e, uri))?;
                loop {
                    if cancel.is_cancelled() {
                        return Err(StoreError::cancelled().with_uri(uri));
                    }
                    let Some(entry) = read_dir
                        .next_entry()
                        .await
                        .map_err(|e| StoreError::from_io(e, uri))?
                    else {
                        break;
                    };
                    let Ok(name) = entry.file_name().into_string() else {
                        // Skip non-UTF-8 names; the uri model cannot carry them.
                        continue;
                    };
                    let metadata = entry
                        .metadata()
                        .await
                        .map_err(|e| StoreError::from_io(e, uri))?;
                    out.push((name, metadata));
                }
                out
            }
            ListingMode::NoDelimiter => {
                let root = dir_path.clone();
                tokio::task::spawn_blocking(move || {
                    let mut out = Vec::new();
                    for entry in walkdir::WalkDir::new(root.as_std_path()).min_depth(1) {
                        let entry = entry.map_err(std::io::Error::other)?;
                        if entry.file_type().is_dir() {
                            continue;
                        }
                        let Ok(rel) = entry.path().strip_prefix(root.as_std_path()) else {
                            continue;
                        };
                        let Some(rel) = rel.to_str() else { continue };
                        out.push((rel.to_string(), entry.metadata().map_err(std::io::Error::other)?));
                    }
                    Ok::<_, std::io::Error>(out)
                })
                .await
                .map_err(|e| StoreError::new(ErrorKind::Internal, format!("list task failed: {e}")))?
                .map_err(|e| StoreError::from_io(e, uri))?
            }
        };

        if let Some(extra) = &opts.prefix {
            entries.retain(|(name, _)| name.starts_with(extra.as_str()));
        }
        entries.sort_by(|(a, _), (b, _)| a.as_bytes().cmp(b.as_bytes()));

        // page_token is the last name of the previous page.
        if let Some(token) = &opts.page_token {
            entries.retain(|(name, _)| name.as_str() > token.as_str());
        }
        let limit = opts.page_size.map(|s| s.get() as usize).unwrap_or(usize::MAX);
        let truncated = entries.len() > limit;
        entries.truncate(limit);

        let next_page_token = if truncated {
            entries.last().map(|(name, _)| name.clone())
        } else {
            None
        };

        let items = entries
            .into_iter()
            .map(|(name, metadata)| {
                let child = if metadata.is_dir() {
                    uri.join(&format!("{name}/"))
                } else {
                    uri.join(&name)
                };
                info_from_metadata(&child, &metadata)
            })
            .collect();

        Ok(ListPage {
            items,
            next_page_token,
        })
    }

    async fn stat(
        &self,
        uri: &ObjectUri,
        _cancel: &CancellationToken,
    ) -> Result<ObjectInfo, StoreError> {
        let path = Self::check_scheme(uri)?;
        self.info_for(uri, &path).await
    }

    async fn get(
        &self,
        uri: &ObjectUri,
        dest_path: &Utf8Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let src_path = Self::check_scheme(uri)?;
        let (stream, size) = file_byte_stream(&src_path, uri, cancel).await?;
        download_stream_to_file(stream, dest_path, uri, Some(size), None, progress, cancel).await?;
        Ok(())
    }

    async fn put(
        &self,
        src_path: &Utf8Path,
        uri: &ObjectUri,
        _opts: &PutOptions,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ObjectInfo, StoreError> {
        let dest_path = Self::check_scheme(uri)?;
        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::from_io(e, uri))?;
        }
        let (stream, size) = file_byte_stream(src_path, uri, cancel).await?;
        download_stream_to_file(stream, &dest_path, uri, Some(size), None, progress, cancel)
            .await?;
        self.info_for(uri, &dest_path).await
    }

    async fn delete(
        &self,
        uri: &ObjectUri,
        opts: &DeleteOptions,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let path = Self::check_scheme(uri)?;
        let metadata = match tokio::fs::symlink_metadata(&path).await {
            Ok(m) => m,
            // Deletion is idempotent.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::from_io(e, uri)),
        };

        if !metadata.is_dir() {
            return tokio::fs::remove_file(&path)
                .await
                .map_err(|e| StoreError::from_io(e, uri));
        }

        if !opts.recursive {
            let mut read_dir = tokio::fs::read_dir(&path)
                .await
                .map_err(|e| StoreError::from_io(e, uri))?;
            if read_dir
                .next_entry()
                .await
                .map_err(|e| StoreError::from_io(e, uri))?
                .is_some()
            {
                return Err(StoreError::new(
                    ErrorKind::NotEmpty,
                    "directory is not empty; pass recursive to remove it",
                )
                .with_uri(uri));
            }
            return tokio::fs::remove_dir(&path)
                .await
                .map_err(|e| StoreError::from_io(e, uri));
        }

        remove_tree_guarded(path, uri.clone(), opts.allow_foreign_mounts, cancel.clone()).await
    }

    async fn copy(
        &self,
        src: &ObjectUri,
        dst: &ObjectUri,
        progress: &dyn ProgressSink,
        _cancel: &CancellationToken,
    ) -> Result<ObjectInfo, StoreError> {
        let src_path = Self::check_scheme(src)?;
        let dst_path = Self::check_scheme(dst)?;
        if let Some(parent) = dst_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::from_io(e, dst))?;
        }
        // tokio::fs::copy bottoms out in copy_file_range on Linux, which
        // gets reflink speed on filesystems that support it.
        let copied = tokio::fs::copy(&src_path, &dst_path)
            .await
            .map_err(|e| StoreError::from_io(e, src))?;
        progress.report(copied, Some(copied));
        self.info_for(dst, &dst_path).await
    }

    async fn move_object(
        &self,
        src: &ObjectUri,
        dst: &ObjectUri,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ObjectInfo, StoreError> {
        let src_path = Self::check_scheme(src)?;
        let dst_path = Self::check_scheme(dst)?;
        // Same-filesystem rename is free; fall back to copy+delete across
        // device boundaries (EXDEV).
        match tokio::fs::rename(&src_path, &dst_path).await {
            Ok(()) => {
                let info = self.info_for(dst, &dst_path).await?;
                progress.report(info.size, Some(info.size));
                Ok(info)
            }
            Err(e) if e.raw_os_error() == Some(nix::libc::EXDEV) => {
                let info = self.copy(src, dst, progress, cancel).await?;
                self.delete(src, &DeleteOptions::default(), cancel).await?;
                Ok(info)
            }
            Err(e) => Err(StoreError::from_io(e, src)),
        }
    }

    async fn mkdir(&self, uri: &ObjectUri, _cancel: &CancellationToken) -> Result<(), StoreError> {
        let path = Self::check_scheme(uri)?;
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| StoreError::from_io(e, uri))
    }

    async fn exists(
        &self,
        uri: &ObjectUri,
        _cancel: &CancellationToken,
    ) -> Result<bool, StoreError> {
        let path = Self::check_scheme(uri)?;
        match tokio::fs::metadata(&path).await {
            Ok(metadata) => Ok(!uri.is_dir() || metadata.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::from_io(e, uri)),
        }
    }
}

/// Depth-first removal that refuses to descend into mount points owned by a
/// different uid unless the caller opted in.
async fn remove_tree_guarded(
    root: Utf8PathBuf,
    uri: ObjectUri,
    allow_foreign_mounts: bool,
    cancel: CancellationToken,
) -> Result<(), StoreError> {
    let root_dev = tokio::fs::metadata(&root)
        .await
        .map_err(|e| StoreError::from_io(e, &uri))?
        .dev();
    let own_uid = nix::unistd::geteuid().as_raw();

    let uri_for_task = uri.clone();
    tokio::task::spawn_blocking(move || {
        for entry in walkdir::WalkDir::new(root.as_std_path()).contents_first(true) {
            if cancel.is_cancelled() {
                return Err(StoreError::cancelled().with_uri(&uri_for_task));
            }
            let entry = entry.map_err(|e| {
                StoreError::new(ErrorKind::Internal, format!("walk failed: {e}"))
                    .with_uri(&uri_for_task)
            })?;
            let metadata = entry.metadata().map_err(|e| {
                StoreError::new(ErrorKind::Internal, format!("stat failed: {e}"))
                    .with_uri(&uri_for_task)
            })?;
            if metadata.dev() != root_dev
                && metadata.uid() != own_uid
                && !allow_foreign_mounts
            {
                return Err(StoreError::new(
                    ErrorKind::Permission,
                    format!(
                        "refusing to delete through a mount point owned by uid {} at {}; \
                         re-run with foreign mounts allowed to override",
                        metadata.uid(),
                        entry.path().display()
                    ),
                )
                .with_uri(&uri_for_task));
            }
            let result = if entry.file_type().is_dir() {
                std::fs::remove_dir(entry.path())
            } else {
                std::fs::remove_file(entry.path())
            };
            match result {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::from_io(e, &uri_for_task)),
            }
        }
        Ok(())
    })
    .await
    .map_err(|e| StoreError::new(ErrorKind::Internal, format!("delete task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use super::*;
    use crate::NullProgress;

    fn store() -> LocalFs {
        LocalFs::new(FileConfig::default(), Duration::from_secs(30))
    }

    fn uri_for(path: &Utf8Path) -> ObjectUri {
        ObjectUri::parse(&format!("file://{path}")).unwrap()
    }

    fn dir_uri_for(path: &Utf8Path) -> ObjectUri {
        ObjectUri::parse(&format!("file://{path}/")).unwrap()
    }

    #[tokio::test]
    async fn list_sorts_and_paginates() {
        let dir = camino_tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        for name in ["b.txt", "a.txt", "c.txt"] {
            tokio::fs::write(dir.path().join(name), b"x").await.unwrap();
        }
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();

        let uri = dir_uri_for(dir.path());
        let page = store()
            .list(
                &uri,
                &ListOptions {
                    page_size: Some(NonZeroU32::new(2).unwrap()),
                    ..Default::default()
                },
                &cancel,
            )
            .await
            .unwrap();
        let names: Vec<_> = page.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        let token = page.next_page_token.expect("more pages");

        let page2 = store()
            .list(
                &uri,
                &ListOptions {
                    page_token: Some(token),
                    ..Default::default()
                },
                &cancel,
            )
            .await
            .unwrap();
        let names2: Vec<_> = page2.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names2, vec!["c.txt", "sub"]);
        assert!(page2.next_page_token.is_none());

        let sub = &page2.items[1];
        assert!(sub.is_dir);
        assert!(sub.uri.to_string().ends_with("/sub/"));
        assert_eq!(sub.size, 0);
    }

    #[tokio::test]
    async fn list_prefix_filters_names() {
        let dir = camino_tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        for name in ["alpha.txt", "alps.txt", "beta.txt"] {
            tokio::fs::write(dir.path().join(name), b"x").await.unwrap();
        }

        let uri = dir_uri_for(dir.path());
        let page = store()
            .list(
                &uri,
                &ListOptions {
                    prefix: Some("alp".to_string()),
                    ..Default::default()
                },
                &cancel,
            )
            .await
            .unwrap();
        let names: Vec<_> = page.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["alpha.txt", "alps.txt"]);
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let dir = camino_tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let src = dir.path().join("src.bin");
        let payload: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
        tokio::fs::write(&src, &payload).await.unwrap();

        let stored_uri = uri_for(&dir.path().join("stored/obj.bin"));
        let info = store()
            .put(&src, &stored_uri, &PutOptions::default(), &NullProgress, &cancel)
            .await
            .unwrap();
        assert_eq!(info.size, payload.len() as u64);
        assert!(!info.is_dir);

        let out = dir.path().join("out.bin");
        store()
            .get(&stored_uri, &out, &NullProgress, &cancel)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&out).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn delete_refuses_non_empty_dir_without_recursive() {
        let dir = camino_tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let sub = dir.path().join("sub");
        tokio::fs::create_dir(&sub).await.unwrap();
        tokio::fs::write(sub.join("f"), b"x").await.unwrap();

        let uri = dir_uri_for(&sub);
        let err = store()
            .delete(&uri, &DeleteOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotEmpty);

        store()
            .delete(
                &uri,
                &DeleteOptions {
                    recursive: true,
                    ..Default::default()
                },
                &cancel,
            )
            .await
            .unwrap();
        assert!(!sub.exists());

        // Idempotent on absence.
        store()
            .delete(&uri, &DeleteOptions::default(), &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn move_renames_within_filesystem() {
        let dir = camino_tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let src = dir.path().join("a.bin");
        tokio::fs::write(&src, b"payload").await.unwrap();

        let moved = store()
            .move_object(
                &uri_for(&src),
                &uri_for(&dir.path().join("b.bin")),
                &NullProgress,
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(moved.size, 7);
        assert!(!src.exists());
        assert!(dir.path().join("b.bin").exists());
    }

    #[tokio::test]
    async fn mkdir_then_listed_in_parent() {
        let dir = camino_tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let child = dir_uri_for(&dir.path().join("newdir"));
        store().mkdir(&child, &cancel).await.unwrap();

        let parent = child.parent();
        let page = store()
            .list(&parent, &ListOptions::default(), &cancel)
            .await
            .unwrap();
        assert!(page.items.iter().any(|i| i.name == "newdir" && i.is_dir));
    }

    #[tokio::test]
    async fn exists_never_errors_on_absence() {
        let dir = camino_tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let missing = uri_for(&dir.path().join("nope"));
        assert!(!store().exists(&missing, &cancel).await.unwrap());
    }
}
