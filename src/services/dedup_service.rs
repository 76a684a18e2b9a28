//! Upload orchestration: hash, then either attach to existing content or
//! create a new owning record.

use crate::{
    models::stored_object::{NewObject, StoredObject},
    services::{
        MAX_CONFLICT_ATTEMPTS,
        blob_store::{BlobStore, ByteStream, StagedBlob},
        catalog::{Catalog, CopyTarget},
        error::{StoreError, StoreResult},
    },
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

/// Caller-supplied description of an upload.
#[derive(Clone, Debug)]
pub struct UploadRequest {
    pub name: String,
    pub media_type: String,
    /// Size the caller claims to send. Must match what actually arrives.
    pub declared_size: u64,
}

#[derive(Debug, Serialize)]
pub struct UploadResult {
    pub record: StoredObject,
    pub was_duplicate: bool,
}

#[derive(Clone)]
pub struct DedupEngine {
    catalog: Catalog,
    blobs: Arc<dyn BlobStore>,
    max_upload_bytes: Option<u64>,
}

impl DedupEngine {
    pub fn new(catalog: Catalog, blobs: Arc<dyn BlobStore>, max_upload_bytes: Option<u64>) -> Self {
        Self {
            catalog,
            blobs,
            max_upload_bytes,
        }
    }

    /// Store an upload, or count it against identical content already stored.
    ///
    /// On any error no record is created and no blob is left behind.
    pub async fn upload(&self, stream: ByteStream, req: UploadRequest) -> StoreResult<UploadResult> {
        let meta = validate(req.clone())?;

        let mut staged = self.blobs.stage(stream, self.max_upload_bytes).await?;
        if staged.size() != req.declared_size {
            let actual = staged.size();
            self.blobs.discard(staged).await;
            return Err(StoreError::validation(format!(
                "declared size {} does not match received size {actual}",
                req.declared_size
            )));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.commit_staged(&mut staged, &meta).await {
                Ok(result) => {
                    if result.was_duplicate {
                        self.blobs.discard(staged).await;
                    }
                    return Ok(result);
                }
                Err(err) if err.is_conflict() && attempt < MAX_CONFLICT_ATTEMPTS => {
                    debug!("upload of {} hit a conflict (attempt {attempt}): {err}", meta.original_name);
                }
                Err(err) => return Err(err.settle_conflict()),
            }
        }
    }

    /// One attempt at the lookup-then-create-or-increment decision.
    ///
    /// The increment is a conditional UPDATE on the active row, so a duplicate
    /// can only ever attach to a record that still exists. If a concurrent
    /// upload claims the digest first, the unique index rejects our insert and
    /// the attempt reports a conflict so the next one increments instead.
    async fn commit_staged(&self, staged: &mut StagedBlob, meta: &NewObject) -> StoreResult<UploadResult> {
        let digest = staged.digest();
        let mut tx = self.catalog.begin().await?;

        if let Some(attached) = self
            .catalog
            .attach_copy(&mut *tx, CopyTarget::Digest(&digest), None)
            .await?
        {
            tx.commit().await?;
            info!(
                "duplicate upload of {} ({}): reference count of {} now {}",
                meta.original_name, digest, attached.target.id, attached.target.reference_count
            );
            return Ok(UploadResult {
                record: attached.target,
                was_duplicate: true,
            });
        }

        let location = self.blobs.allocate_location();
        let Some(record) = self
            .catalog
            .insert_original(&mut *tx, meta, &digest, &location)
            .await?
        else {
            return Err(StoreError::Conflict(format!("digest {digest} was claimed concurrently")));
        };

        // Bytes land before the row becomes visible; a failed put rolls the row back.
        self.blobs.put(staged, &location).await?;

        if let Err(err) = tx.commit().await {
            if let Err(cleanup) = self.blobs.delete(&location).await {
                warn!("orphaned blob {location} after failed commit: {cleanup}");
            }
            return Err(StoreError::from(err).settle_conflict());
        }

        info!(
            "stored {} ({} bytes, digest {}) as {}",
            record.original_name, record.byte_size, digest, record.id
        );
        Ok(UploadResult {
            record,
            was_duplicate: false,
        })
    }
}

fn validate(req: UploadRequest) -> StoreResult<NewObject> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(StoreError::validation("file name is required"));
    }
    let byte_size = i64::try_from(req.declared_size)
        .map_err(|_| StoreError::validation("declared size is out of range"))?;
    let media_type = match req.media_type.trim() {
        "" => DEFAULT_MEDIA_TYPE.to_string(),
        other => other.to_string(),
    };
    Ok(NewObject {
        original_name: name.to_string(),
        media_type,
        byte_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_media_type_falls_back_to_octet_stream() {
        let meta = validate(UploadRequest {
            name: " report.bin ".into(),
            media_type: "  ".into(),
            declared_size: 3,
        })
        .unwrap();
        assert_eq!(meta.original_name, "report.bin");
        assert_eq!(meta.media_type, DEFAULT_MEDIA_TYPE);
        assert_eq!(meta.byte_size, 3);
    }

    #[test]
    fn blank_name_is_rejected() {
        let err = validate(UploadRequest {
            name: "   ".into(),
            media_type: "text/plain".into(),
            declared_size: 0,
        })
        .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }
}
