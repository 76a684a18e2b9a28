//! FileService — the four public operations plus downloads, bundled behind
//! one cloneable handle that request handlers share.

use crate::{
    models::stored_object::{NewReference, StoredObject},
    services::{
        blob_store::{BlobReader, BlobStore, ByteStream},
        catalog::{Catalog, ObjectFilter, Page, PageRequest, Sort},
        dedup_service::{DedupEngine, UploadRequest, UploadResult},
        error::{StoreError, StoreResult},
        hasher::Digest,
        lifecycle_service::{DeleteOutcome, LifecycleEngine},
    },
};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct FileService {
    catalog: Catalog,
    blobs: Arc<dyn BlobStore>,
    dedup: DedupEngine,
    lifecycle: LifecycleEngine,
}

impl FileService {
    pub fn new(catalog: Catalog, blobs: Arc<dyn BlobStore>, max_upload_bytes: Option<u64>) -> Self {
        Self {
            dedup: DedupEngine::new(catalog.clone(), blobs.clone(), max_upload_bytes),
            lifecycle: LifecycleEngine::new(catalog.clone(), blobs.clone()),
            catalog,
            blobs,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub async fn upload(&self, stream: ByteStream, req: UploadRequest) -> StoreResult<UploadResult> {
        self.dedup.upload(stream, req).await
    }

    pub async fn delete(&self, id: Uuid) -> StoreResult<DeleteOutcome> {
        self.lifecycle.delete(id).await
    }

    pub async fn add_reference(&self, target_id: Uuid, meta: NewReference) -> StoreResult<StoredObject> {
        self.lifecycle.add_reference(target_id, meta).await
    }

    pub async fn get(&self, id: Uuid) -> StoreResult<StoredObject> {
        self.catalog.get(id).await
    }

    pub async fn list(
        &self,
        filter: &ObjectFilter,
        sort: Sort,
        page: PageRequest,
    ) -> StoreResult<Page<StoredObject>> {
        self.catalog.list(filter, sort, page).await
    }

    /// The owning record for a hex digest.
    pub async fn find_by_digest(&self, digest_hex: &str) -> StoreResult<Option<StoredObject>> {
        let digest = Digest::from_hex(digest_hex)
            .ok_or_else(|| StoreError::validation(format!("`{digest_hex}` is not a SHA-256 hex digest")))?;
        let mut conn = self.catalog.pool().acquire().await?;
        self.catalog.find_active_by_digest(&mut conn, &digest).await
    }

    /// Catalog connectivity probe.
    pub async fn check_catalog(&self) -> StoreResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(self.catalog.pool())
            .await?;
        Ok(())
    }

    pub async fn check_blobs(&self) -> StoreResult<()> {
        self.blobs.check().await
    }

    /// Metadata plus readable bytes. References resolve to their target's blob.
    pub async fn open(&self, id: Uuid) -> StoreResult<(StoredObject, BlobReader)> {
        let record = self.catalog.get(id).await?;
        let owner = match record.points_to {
            Some(target_id) if record.is_reference => self.catalog.get(target_id).await?,
            _ => record.clone(),
        };
        let location = owner
            .location
            .as_deref()
            .ok_or_else(|| StoreError::storage(format!("stored object {} has no blob", owner.id)))?;
        let reader = self.blobs.get(location).await?;
        Ok((record, reader))
    }
}
