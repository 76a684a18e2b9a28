#![allow(dead_code)]

use bytes::Bytes;
use dedup_store::services::{
    blob_store::{BlobStore, ByteStream, LocalBlobStore},
    catalog::Catalog,
    dedup_service::UploadRequest,
    file_service::FileService,
};
use futures::{StreamExt, stream};
use std::{io, path::Path, sync::Arc, time::Duration};
use tempfile::TempDir;

pub struct Harness {
    pub dir: TempDir,
    pub service: FileService,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let blobs = Arc::new(LocalBlobStore::new(dir.path().join("blobs")));
        Self::with_blobs(dir, blobs).await
    }

    pub async fn with_blobs(dir: TempDir, blobs: Arc<dyn BlobStore>) -> Self {
        let url = format!("sqlite://{}", dir.path().join("catalog.db").display());
        let catalog = Catalog::connect(&url, 5, Duration::from_secs(10)).await.unwrap();
        catalog.migrate().await.unwrap();
        let service = FileService::new(catalog, blobs, None);
        Self { dir, service }
    }

    pub fn blob_root(&self) -> std::path::PathBuf {
        self.dir.path().join("blobs")
    }

    /// Committed blobs on disk, staging excluded.
    pub fn blob_count(&self) -> usize {
        count_files(&self.blob_root())
    }

    pub fn staged_count(&self) -> usize {
        count_files(&self.blob_root().join(".staging"))
    }

    pub async fn record_count(&self) -> i64 {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM stored_objects")
            .fetch_one(self.service.catalog().pool())
            .await
            .unwrap()
    }
}

fn count_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.file_name().is_some_and(|n| n == ".staging") {
                0
            } else if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}

pub fn body(content: &'static [u8]) -> ByteStream {
    let chunks: Vec<io::Result<Bytes>> = content
        .chunks(3)
        .map(|c| Ok(Bytes::from_static(c)))
        .collect();
    stream::iter(chunks).boxed()
}

pub fn request(name: &str, content: &[u8]) -> UploadRequest {
    UploadRequest {
        name: name.to_string(),
        media_type: "text/plain".to_string(),
        declared_size: content.len() as u64,
    }
}
