//! Object store: durable blob storage on local disk.
//!
//! Blobs live beneath `base_path/{shard}/{shard}/{location}`, where the
//! location is a freshly generated UUID rather than the content digest.
//! Incoming bytes are first written to `base_path/.staging/` while being
//! hashed, then renamed into place once the catalog decides they are new.

use crate::services::{
    error::{StoreError, StoreResult},
    hasher::{ContentHasher, DIGEST_SIZE, Digest},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncWriteExt},
};
use tracing::{debug, warn};
use uuid::Uuid;

const STAGING_DIR: &str = ".staging";

/// Upload body as handed over by the transport.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Readable blob content.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Bytes that have been fully received and hashed but not yet committed.
///
/// Dropping a staged blob removes its temp file, so an abandoned upload
/// leaves nothing behind.
#[derive(Debug)]
pub struct StagedBlob {
    path: PathBuf,
    digest: Digest,
    size: u64,
    armed: bool,
}

impl StagedBlob {
    pub fn new(path: PathBuf, digest: Digest, size: u64) -> Self {
        Self {
            path,
            digest,
            size,
            armed: true,
        }
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mark the temp file as consumed so drop leaves it alone.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StagedBlob {
    fn drop(&mut self) {
        if self.armed {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!("removed staged blob {}", self.path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!("failed to remove staged blob {}: {}", self.path.display(), err),
            }
        }
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Receive the whole stream into a staging area, hashing it on the way.
    ///
    /// Fails with `Validation` if more than `limit` bytes arrive and with `Io`
    /// if the stream breaks. No staged bytes survive a failure.
    async fn stage(&self, stream: ByteStream, limit: Option<u64>) -> StoreResult<StagedBlob>;

    /// Fresh, never-before-used location for a new blob.
    fn allocate_location(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Commit staged bytes under `location`. On success the staged blob is
    /// consumed and dropping it is a no-op.
    async fn put(&self, staged: &mut StagedBlob, location: &str) -> StoreResult<()>;

    async fn get(&self, location: &str) -> StoreResult<BlobReader>;

    /// Remove a blob. An already-missing blob is logged, not reported.
    async fn delete(&self, location: &str) -> StoreResult<()>;

    /// Readiness probe: a write/read/delete round trip.
    async fn check(&self) -> StoreResult<()>;

    /// Throw away staged bytes that turned out to be a duplicate.
    async fn discard(&self, mut staged: StagedBlob) {
        if let Err(err) = fs::remove_file(staged.path()).await {
            if err.kind() != ErrorKind::NotFound {
                warn!("failed to discard staged blob {}: {}", staged.path().display(), err);
            }
        }
        staged.disarm();
    }
}

/// Blob store rooted at a local directory.
#[derive(Clone, Debug)]
pub struct LocalBlobStore {
    base_path: PathBuf,
}

impl LocalBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn staging_dir(&self) -> PathBuf {
        self.base_path.join(STAGING_DIR)
    }

    /// Generate two-level shard identifiers for a location.
    ///
    /// Uses MD5(location) and returns the first two bytes as lowercase
    /// hexadecimal strings (00–ff). Reduces file count per directory.
    fn shards(location: &str) -> (String, String) {
        let digest = md5::compute(location.as_bytes());
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Resolve a location to its on-disk path.
    ///
    /// Only UUID-shaped locations are accepted, which rules out traversal.
    fn blob_path(&self, location: &str) -> StoreResult<PathBuf> {
        if Uuid::parse_str(location).is_err() {
            return Err(StoreError::storage(format!("invalid blob location `{location}`")));
        }
        let (shard_a, shard_b) = Self::shards(location);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(location);
        Ok(path)
    }

    /// Recursively remove empty shard directories up to the base path.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn stage(&self, mut stream: ByteStream, limit: Option<u64>) -> StoreResult<StagedBlob> {
        let staging = self.staging_dir();
        fs::create_dir_all(&staging).await?;
        let tmp_path = staging.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        // From here on the guard owns the temp file; every early return cleans it up.
        let mut guard = StagedBlob::new(tmp_path, Digest::from_bytes([0; DIGEST_SIZE]), 0);
        let mut hasher = ContentHasher::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            if let Some(limit) = limit {
                if hasher.consumed() > limit {
                    return Err(StoreError::validation(format!(
                        "upload exceeds the {limit} byte limit"
                    )));
                }
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        guard.size = hasher.consumed();
        guard.digest = hasher.finalize();
        debug!(
            "staged {} bytes with digest {} at {}",
            guard.size,
            guard.digest,
            guard.path.display()
        );
        Ok(guard)
    }

    async fn put(&self, staged: &mut StagedBlob, location: &str) -> StoreResult<()> {
        let file_path = self.blob_path(location)?;
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::storage("blob path missing parent directory")
        })?;
        if fs::try_exists(&file_path).await.unwrap_or(false) {
            return Err(StoreError::storage(format!(
                "blob location `{location}` is already occupied"
            )));
        }

        // A concurrent delete may prune the shard directory between creating
        // it and renaming into it, so recreate it once on NotFound.
        let mut attempts = 0;
        loop {
            attempts += 1;
            fs::create_dir_all(&parent).await.map_err(|err| {
                StoreError::storage(format!("creating {}: {err}", parent.display()))
            })?;
            match fs::rename(staged.path(), &file_path).await {
                Ok(()) => break,
                Err(err) if err.kind() == ErrorKind::NotFound && attempts < 2 => {
                    debug!("shard directory {} vanished, retrying", parent.display());
                }
                Err(err) => {
                    return Err(StoreError::storage(format!("committing blob {location}: {err}")));
                }
            }
        }
        staged.disarm();
        debug!("committed blob {} to {}", location, file_path.display());
        Ok(())
    }

    async fn get(&self, location: &str) -> StoreResult<BlobReader> {
        let file_path = self.blob_path(location)?;
        let file = File::open(&file_path).await.map_err(|err| {
            StoreError::storage(format!("opening blob {location}: {err}"))
        })?;
        Ok(Box::new(file))
    }

    async fn delete(&self, location: &str) -> StoreResult<()> {
        let file_path = self.blob_path(location)?;
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed blob {}", file_path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!("blob {} already missing", file_path.display());
                return Ok(());
            }
            Err(err) => return Err(StoreError::storage(format!("removing blob {location}: {err}"))),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn check(&self) -> StoreResult<()> {
        let staging = self.staging_dir();
        fs::create_dir_all(&staging).await?;
        let probe = staging.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&probe, b"readyz").await?;
        let read_back = fs::read(&probe).await;
        // best-effort cleanup before judging the read
        let _ = fs::remove_file(&probe).await;
        if read_back? != b"readyz" {
            return Err(StoreError::storage("readiness probe content mismatch"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::hasher::digest_bytes;
    use futures::stream;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn body(chunks: &[&'static [u8]]) -> ByteStream {
        let items: Vec<io::Result<Bytes>> = chunks.iter().map(|c| Ok(Bytes::from_static(*c))).collect();
        stream::iter(items).boxed()
    }

    fn staged_files(store: &LocalBlobStore) -> usize {
        std::fs::read_dir(store.staging_dir())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn stage_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());

        let mut staged = store.stage(body(&[b"hel", b"lo"]), None).await.unwrap();
        assert_eq!(staged.size(), 5);
        assert_eq!(staged.digest(), digest_bytes(b"hello"));

        let location = store.allocate_location();
        store.put(&mut staged, &location).await.unwrap();
        drop(staged);
        assert_eq!(staged_files(&store), 0);

        let mut reader = store.get(&location).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");

        store.delete(&location).await.unwrap();
        assert!(store.get(&location).await.is_err());
        // Deleting twice is tolerated.
        store.delete(&location).await.unwrap();
    }

    #[tokio::test]
    async fn broken_stream_leaves_no_staged_file() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());
        let items = vec![
            Ok(Bytes::from_static(b"abc")),
            Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated")),
        ];

        let err = store.stage(stream::iter(items).boxed(), None).await.unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert_eq!(staged_files(&store), 0);
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());

        let err = store.stage(body(&[b"0123", b"4567"]), Some(6)).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(staged_files(&store), 0);
    }

    #[tokio::test]
    async fn dropped_and_discarded_stages_are_cleaned_up() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());

        let staged = store.stage(body(&[b"one"]), None).await.unwrap();
        drop(staged);
        assert_eq!(staged_files(&store), 0);

        let staged = store.stage(body(&[b"two"]), None).await.unwrap();
        store.discard(staged).await;
        assert_eq!(staged_files(&store), 0);
    }

    #[tokio::test]
    async fn non_uuid_locations_are_refused() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());
        assert!(store.get("../../etc/passwd").await.is_err());
        assert!(store.delete("not-a-location").await.is_err());
    }
}
