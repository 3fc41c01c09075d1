//! Helpers shared by the backends: cancellable timeouts, atomic streamed
//! downloads with checksum verification, and progress accounting.

use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use futures::Stream;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, StoreError};
use crate::uri::ObjectUri;
use crate::{Checksum, ProgressSink};

/// Streaming loops hand data around in chunks of this size.
pub const CHUNK_SIZE: usize = 64 * 1024;

const PARTIAL_SUFFIX: &str = "partial";

/// Wire chunk streams all look like this.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + 'static>>;

/// Incremental digest matching whichever checksum the backend advertised.
enum Hasher {
    Blake3(Box<blake3::Hasher>),
    Md5(md5::Context),
    Crc32c(u32),
    Sha256(sha2::Sha256),
}

impl Hasher {
    fn for_checksum(expected: &Checksum) -> Self {
        match expected {
            Checksum::Blake3(_) => Hasher::Blake3(Box::new(blake3::Hasher::new())),
            Checksum::Md5(_) => Hasher::Md5(md5::Context::new()),
            Checksum::Crc32c(_) => Hasher::Crc32c(0),
            Checksum::Sha256(_) => {
                use sha2::Digest;
                Hasher::Sha256(sha2::Sha256::new())
            }
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Blake3(h) => {
                h.update(data);
            }
            Hasher::Md5(h) => h.consume(data),
            Hasher::Crc32c(state) => *state = crc32c::crc32c_append(*state, data),
            Hasher::Sha256(h) => {
                use sha2::Digest;
                h.update(data);
            }
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Blake3(h) => h.finalize().to_hex().to_string(),
            Hasher::Md5(h) => hex::encode(h.compute().0),
            Hasher::Crc32c(state) => hex::encode(state.to_be_bytes()),
            Hasher::Sha256(h) => {
                use sha2::Digest;
                hex::encode(h.finalize())
            }
        }
    }
}

/// Computes the BLAKE3 digest of a local file, streaming in [`CHUNK_SIZE`]
/// pieces and observing cancellation between reads.
pub async fn blake3_of_file(
    path: &Utf8Path,
    cancel: &CancellationToken,
) -> Result<String, StoreError> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| StoreError::new(ErrorKind::Internal, format!("open {path}: {e}")))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        if cancel.is_cancelled() {
            return Err(StoreError::cancelled());
        }
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| StoreError::new(ErrorKind::Internal, format!("read {path}: {e}")))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Drains `stream` into `dest_path` atomically.
///
/// Data lands in a sibling temp file first; the rename happens only after
/// the stream finished and, when `expected` is given, the recomputed digest
/// matched. Any failure or cancellation removes the temp file, so a partial
/// download is never visible at `dest_path`.
pub async fn download_stream_to_file(
    mut stream: ByteStream,
    dest_path: &Utf8Path,
    uri: &ObjectUri,
    bytes_total: Option<u64>,
    expected: Option<&Checksum>,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<u64, StoreError> {
    let temp_path = utils::crashsafe::path_with_suffix_extension(dest_path, PARTIAL_SUFFIX);
    let result = write_stream(
        &mut stream,
        &temp_path,
        uri,
        bytes_total,
        expected,
        progress,
        cancel,
    )
    .await;

    match result {
        Ok(bytes_done) => {
            tokio::fs::rename(&temp_path, dest_path)
                .await
                .map_err(|e| StoreError::from_io(e, uri))?;
            progress.report(bytes_done, bytes_total.or(Some(bytes_done)));
            Ok(bytes_done)
        }
        Err(err) => {
            if let Err(cleanup) = tokio::fs::remove_file(&temp_path).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("failed to remove partial download {temp_path}: {cleanup}");
                }
            }
            Err(err)
        }
    }
}

async fn write_stream(
    stream: &mut ByteStream,
    temp_path: &Utf8PathBuf,
    uri: &ObjectUri,
    bytes_total: Option<u64>,
    expected: Option<&Checksum>,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<u64, StoreError> {
    let mut file = tokio::fs::File::create(temp_path)
        .await
        .map_err(|e| StoreError::from_io(e, uri))?;
    let mut hasher = expected.map(Hasher::for_checksum);
    let mut bytes_done: u64 = 0;
    let reporter = ThrottledProgress::new(progress);

    loop {
        let chunk = tokio::select! {
            chunk = stream.next() => chunk,
            _ = cancel.cancelled() => return Err(StoreError::cancelled().with_uri(uri)),
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk.map_err(|e| {
            StoreError::new(ErrorKind::Network, format!("download stream failed: {e}"))
                .with_uri(uri)
                .with_source(e)
        })?;
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&chunk);
        }
        file.write_all(&chunk)
            .await
            .map_err(|e| StoreError::from_io(e, uri))?;
        bytes_done += chunk.len() as u64;
        reporter.report(bytes_done, bytes_total);
    }

    file.sync_all()
        .await
        .map_err(|e| StoreError::from_io(e, uri))?;
    drop(file);

    if let (Some(hasher), Some(expected)) = (hasher, expected) {
        let actual = hasher.finalize_hex();
        if !expected.hex_digest().eq_ignore_ascii_case(&actual) {
            return Err(StoreError::new(
                ErrorKind::ChecksumMismatch,
                format!(
                    "{} checksum mismatch: stored {}, received {}",
                    expected.algorithm(),
                    expected.hex_digest(),
                    actual
                ),
            )
            .with_uri(uri));
        }
    }

    Ok(bytes_done)
}

/// Caps how often a sink hears from a hot streaming loop. The final report
/// is always delivered by the caller on completion.
pub struct ThrottledProgress<'a> {
    sink: &'a dyn ProgressSink,
    last: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl<'a> ThrottledProgress<'a> {
    pub fn new(sink: &'a dyn ProgressSink) -> Self {
        ThrottledProgress {
            sink,
            last: Mutex::new(None),
            min_interval: Duration::from_millis(100),
        }
    }

    pub fn report(&self, bytes_done: u64, bytes_total: Option<u64>) {
        let mut last = self.last.lock().unwrap();
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < self.min_interval => {}
            _ => {
                *last = Some(now);
                self.sink.report(bytes_done, bytes_total);
            }
        }
    }
}

/// Opens a local file as a chunked byte stream, reporting read progress.
/// Returns the stream and the file size.
pub async fn file_byte_stream(
    path: &Utf8Path,
    uri: &ObjectUri,
    cancel: &CancellationToken,
) -> Result<(ByteStream, u64), StoreError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| StoreError::from_io(e, uri))?;
    if !metadata.is_file() {
        return Err(
            StoreError::new(ErrorKind::Internal, format!("{path} is not a regular file"))
                .with_uri(uri),
        );
    }
    let size = metadata.len();
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| StoreError::from_io(e, uri))?;
    let cancel = cancel.clone();
    let stream = async_stream::try_stream! {
        let mut reader = tokio_util::io::ReaderStream::with_capacity(file, CHUNK_SIZE);
        while let Some(chunk) = tokio::select! {
            chunk = reader.next() => chunk,
            _ = cancel.cancelled() => Some(Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "upload cancelled",
            ))),
        } {
            yield chunk?;
        }
    };
    Ok((Box::pin(stream), size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NullProgress;

    fn chunks(data: &'static [u8]) -> ByteStream {
        let iter = data
            .chunks(3)
            .map(|c| Ok(Bytes::from_static(c)))
            .collect::<Vec<_>>();
        Box::pin(futures::stream::iter(iter))
    }

    #[tokio::test]
    async fn download_lands_atomically() {
        let dir = camino_tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let uri = ObjectUri::parse("s3://b/out.bin").unwrap();
        let cancel = CancellationToken::new();

        let n = download_stream_to_file(
            chunks(b"hello world"),
            &dest,
            &uri,
            Some(11),
            None,
            &NullProgress,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(n, 11);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn checksum_mismatch_removes_partial() {
        let dir = camino_tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let uri = ObjectUri::parse("s3://b/out.bin").unwrap();
        let cancel = CancellationToken::new();

        let expected = Checksum::Crc32c("deadbeef".to_string());
        let err = download_stream_to_file(
            chunks(b"hello world"),
            &dest,
            &uri,
            Some(11),
            Some(&expected),
            &NullProgress,
            &cancel,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
        assert!(!dest.exists());
        // No partial file either.
        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn matching_checksum_passes() {
        let dir = camino_tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let uri = ObjectUri::parse("s3://b/out.bin").unwrap();
        let cancel = CancellationToken::new();

        let crc = crc32c::crc32c(b"hello world");
        let expected = Checksum::Crc32c(hex::encode(crc.to_be_bytes()));
        download_stream_to_file(
            chunks(b"hello world"),
            &dest,
            &uri,
            Some(11),
            Some(&expected),
            &NullProgress,
            &cancel,
        )
        .await
        .unwrap();
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn cancellation_leaves_no_file() {
        let dir = camino_tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let uri = ObjectUri::parse("s3://b/out.bin").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        // A stream that never yields; cancellation must win.
        let stream: ByteStream = Box::pin(futures::stream::pending());
        let err = download_stream_to_file(
            stream,
            &dest,
            &uri,
            None,
            None,
            &NullProgress,
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(err.is_cancel());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn file_stream_yields_whole_file() {
        let dir = camino_tempfile::tempdir().unwrap();
        let src = dir.path().join("in.bin");
        let payload = vec![7u8; 200_000];
        tokio::fs::write(&src, &payload).await.unwrap();
        let uri = ObjectUri::parse("s3://b/in.bin").unwrap();
        let cancel = CancellationToken::new();

        let (mut stream, size) = file_byte_stream(&src, &uri, &cancel).await.unwrap();
        assert_eq!(size, 200_000);
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, payload);
    }
}
