//! Chunk-level storage I/O.
//!
//! [`StorageBackend`] is the only I/O boundary of the queue. Backends move
//! raw bytes and classify their failures; retry policy lives in the queue.

use std::future::Future;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

/// Suffix of the staging file that receives chunks until the transfer is
/// finalized.
const STAGING_SUFFIX: &str = ".part";

/// Backend failure, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Likely to succeed on retry (network blip, interrupted syscall).
    #[error("transient storage error: {0}")]
    Transient(String),

    /// Retrying cannot help (missing file, permission denied, bad range).
    #[error("storage error: {0}")]
    Permanent(String),

    /// The chunk did not finish within its time limit.
    #[error("chunk timed out")]
    TimedOut,
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::TimedOut)
    }
}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::Transient(e.to_string()),
            _ => Self::Permanent(e.to_string()),
        }
    }
}

/// Boxed future returned by [`StorageBackend`] methods.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// Raw chunk I/O against one storage location.
///
/// Writes are positional and land in a staging area; nothing written is
/// visible under the final name until [`finalize`](Self::finalize).
pub trait StorageBackend: Send + Sync {
    /// Reads exactly `length` bytes at `offset` from a finalized file.
    fn read_chunk<'a>(
        &'a self,
        path: &'a Path,
        offset: u64,
        length: u64,
    ) -> StorageFuture<'a, Vec<u8>>;

    /// Writes `data` at `offset` into the staging area for `path`.
    fn write_chunk<'a>(
        &'a self,
        path: &'a Path,
        offset: u64,
        data: &'a [u8],
    ) -> StorageFuture<'a, ()>;

    /// Size of a finalized file.
    fn size<'a>(&'a self, path: &'a Path) -> StorageFuture<'a, u64>;

    /// Promotes staged bytes to `path` and returns the final size.
    fn finalize<'a>(&'a self, path: &'a Path) -> StorageFuture<'a, u64>;

    /// Drops staged bytes for `path`. Missing staging data is not an error.
    fn discard<'a>(&'a self, path: &'a Path) -> StorageFuture<'a, ()>;

    /// Deletes a finalized file.
    fn remove<'a>(&'a self, path: &'a Path) -> StorageFuture<'a, ()>;
}

/// Path of the staging file for `path` (`<name>.part`).
pub fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}

/// Backend over the local filesystem.
///
/// Chunks are written at their absolute offset into `<name>.part`, so they
/// may arrive in any order; finalizing renames the staging file into place.
#[derive(Debug, Default, Clone)]
pub struct LocalFsBackend;

impl LocalFsBackend {
    pub fn new() -> Self {
        Self
    }
}

impl StorageBackend for LocalFsBackend {
    fn read_chunk<'a>(
        &'a self,
        path: &'a Path,
        offset: u64,
        length: u64,
    ) -> StorageFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let mut file = tokio::fs::File::open(path).await?;
            let size = file.metadata().await?.len();
            if offset.saturating_add(length) > size {
                return Err(StorageError::Permanent(format!(
                    "range {offset}+{length} beyond end of file ({size} bytes)"
                )));
            }
            file.seek(SeekFrom::Start(offset)).await?;
            let mut buf = vec![0u8; length as usize];
            file.read_exact(&mut buf).await?;
            Ok(buf)
        })
    }

    fn write_chunk<'a>(
        &'a self,
        path: &'a Path,
        offset: u64,
        data: &'a [u8],
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let staging = staging_path(path);
            if let Some(parent) = staging.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&staging)
                .await?;
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(data).await?;
            file.flush().await?;
            Ok(())
        })
    }

    fn size<'a>(&'a self, path: &'a Path) -> StorageFuture<'a, u64> {
        Box::pin(async move {
            let metadata = tokio::fs::metadata(path).await?;
            if !metadata.is_file() {
                return Err(StorageError::Permanent(format!(
                    "not a regular file: {}",
                    path.display()
                )));
            }
            Ok(metadata.len())
        })
    }

    fn finalize<'a>(&'a self, path: &'a Path) -> StorageFuture<'a, u64> {
        Box::pin(async move {
            let staging = staging_path(path);
            let file = tokio::fs::OpenOptions::new().write(true).open(&staging).await?;
            file.sync_all().await?;
            let size = file.metadata().await?.len();
            drop(file);

            tokio::fs::rename(&staging, path).await?;
            debug!(path = %path.display(), bytes = size, "staged file promoted");
            Ok(size)
        })
    }

    fn discard<'a>(&'a self, path: &'a Path) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            match tokio::fs::remove_file(staging_path(path)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn remove<'a>(&'a self, path: &'a Path) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            match tokio::fs::remove_file(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}
