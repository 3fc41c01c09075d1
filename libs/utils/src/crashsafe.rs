//! Atomic file replacement: write to a sibling temp file, fsync, rename.
//!
//! A reader either sees the previous complete contents or the new complete
//! contents, never a torn write. The temp file lives next to the target so
//! the rename stays within one filesystem.

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;

pub const TEMP_FILE_SUFFIX: &str = "___temp";

pub fn path_with_suffix_extension(path: &Utf8Path, suffix: &str) -> Utf8PathBuf {
    let extension = match path.extension() {
        Some(ext) => format!("{ext}.{suffix}"),
        None => suffix.to_string(),
    };
    path.with_extension(extension)
}

/// Atomically replaces the contents of `path` with `content`.
pub async fn overwrite(path: &Utf8Path, content: &[u8]) -> anyhow::Result<()> {
    let temp_path = path_with_suffix_extension(path, TEMP_FILE_SUFFIX);
    let result = write_and_rename(path, &temp_path, content).await;
    if result.is_err() {
        // Leave no temp droppings behind on failure.
        let _ = tokio::fs::remove_file(&temp_path).await;
    }
    result
}

async fn write_and_rename(
    path: &Utf8Path,
    temp_path: &Utf8Path,
    content: &[u8],
) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::create(temp_path).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(temp_path, path).await?;
    // Persist the rename itself.
    if let Some(parent) = path.parent() {
        fsync_dir(parent).await?;
    }
    Ok(())
}

async fn fsync_dir(dir: &Utf8Path) -> std::io::Result<()> {
    let dir = dir.to_owned();
    tokio::task::spawn_blocking(move || std::fs::File::open(dir.as_std_path())?.sync_all())
        .await
        .expect("fsync_dir task panicked")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overwrite_is_complete_or_absent() {
        let dir = camino_tempfile::tempdir().unwrap();
        let target = dir.path().join("state.json");

        overwrite(&target, b"first").await.unwrap();
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"first");

        overwrite(&target, b"second, longer contents").await.unwrap();
        assert_eq!(
            tokio::fs::read(&target).await.unwrap(),
            b"second, longer contents"
        );

        // No temp file left behind.
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(e) = entries.next_entry().await.unwrap() {
            names.push(e.file_name());
        }
        assert_eq!(names, vec!["state.json"]);
    }

    #[test]
    fn temp_path_next_to_target() {
        assert_eq!(
            path_with_suffix_extension(Utf8Path::new("/a/b/state.json"), TEMP_FILE_SUFFIX),
            Utf8PathBuf::from("/a/b/state.json.___temp")
        );
        assert_eq!(
            path_with_suffix_extension(Utf8Path::new("/a/b/state"), TEMP_FILE_SUFFIX),
            Utf8PathBuf::from("/a/b/state.___temp")
        );
    }
}
