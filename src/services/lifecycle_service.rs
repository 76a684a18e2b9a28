//! Delete and explicit-reference orchestration.

use crate::{
    models::stored_object::{NewReference, StoredObject},
    services::{
        MAX_CONFLICT_ATTEMPTS,
        blob_store::BlobStore,
        catalog::{Catalog, CopyTarget, Release},
        dedup_service::DEFAULT_MEDIA_TYPE,
        error::{StoreError, StoreResult},
    },
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a delete request did. Both variants are successes.
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeleteOutcome {
    /// Other copies remain; only the count changed.
    Decremented { record: StoredObject },
    /// The last copy is gone along with the record.
    Deleted { id: Uuid },
}

#[derive(Clone)]
pub struct LifecycleEngine {
    catalog: Catalog,
    blobs: Arc<dyn BlobStore>,
}

impl LifecycleEngine {
    pub fn new(catalog: Catalog, blobs: Arc<dyn BlobStore>) -> Self {
        Self { catalog, blobs }
    }

    /// Release one logical copy of `id`.
    ///
    /// A failed delete leaves every count unchanged.
    pub async fn delete(&self, id: Uuid) -> StoreResult<DeleteOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_delete(id).await {
                Err(err) if err.is_conflict() && attempt < MAX_CONFLICT_ATTEMPTS => {
                    debug!("delete of {id} hit a conflict (attempt {attempt}): {err}");
                }
                other => return other.map_err(StoreError::settle_conflict),
            }
        }
    }

    async fn try_delete(&self, id: Uuid) -> StoreResult<DeleteOutcome> {
        let mut tx = self.catalog.begin().await?;
        let mut freed_location = None;

        let outcome = match self.catalog.decrement_or_delete(&mut *tx, id).await? {
            Release::Decremented(record) => {
                info!("reference count of {id} decremented to {}", record.reference_count);
                DeleteOutcome::Decremented { record }
            }
            Release::Deleted(record) => {
                match record.points_to {
                    // A reference counted once against its target; give that back too.
                    Some(target_id) if record.is_reference => {
                        if let Release::Deleted(target) =
                            self.catalog.decrement_or_delete(&mut *tx, target_id).await?
                        {
                            info!("last copy of {target_id} released through reference {id}");
                            freed_location = target.location;
                        }
                    }
                    _ => freed_location = record.location.clone(),
                }
                info!("deleted stored object {id}");
                DeleteOutcome::Deleted { id }
            }
        };

        tx.commit().await?;

        // The row is gone for good, so a blob that won't delete is only a leak.
        if let Some(location) = freed_location {
            if let Err(err) = self.blobs.delete(&location).await {
                warn!("orphaned blob {location} after deleting {id}: {err}");
            }
        }
        Ok(outcome)
    }

    /// Create a reference record sharing `target_id`'s bytes.
    ///
    /// The reference row and the target's increment commit together.
    pub async fn add_reference(&self, target_id: Uuid, meta: NewReference) -> StoreResult<StoredObject> {
        let meta = validate(meta)?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_add_reference(target_id, &meta).await {
                Err(err) if err.is_conflict() && attempt < MAX_CONFLICT_ATTEMPTS => {
                    debug!("reference to {target_id} hit a conflict (attempt {attempt}): {err}");
                }
                other => return other.map_err(StoreError::settle_conflict),
            }
        }
    }

    async fn try_add_reference(&self, target_id: Uuid, meta: &NewReference) -> StoreResult<StoredObject> {
        let mut tx = self.catalog.begin().await?;

        let attached = self
            .catalog
            .attach_copy(&mut *tx, CopyTarget::Id(target_id), Some(meta))
            .await?;

        let Some(attached) = attached else {
            return match self.catalog.fetch(&mut *tx, target_id).await? {
                Some(_) => Err(StoreError::validation(format!(
                    "`{target_id}` is itself a reference and cannot be referenced"
                ))),
                None => Err(StoreError::validation(format!(
                    "reference target `{target_id}` does not exist"
                ))),
            };
        };

        tx.commit().await?;

        let reference = attached
            .reference
            .ok_or_else(|| StoreError::storage("reference row was not created"))?;
        info!(
            "created reference {} to {} (count now {})",
            reference.id, target_id, attached.target.reference_count
        );
        Ok(reference)
    }
}

fn validate(meta: NewReference) -> StoreResult<NewReference> {
    let name = meta.original_name.trim();
    if name.is_empty() {
        return Err(StoreError::validation("file name is required"));
    }
    let media_type = match meta.media_type.trim() {
        "" => DEFAULT_MEDIA_TYPE,
        other => other,
    };
    Ok(NewReference {
        original_name: name.to_string(),
        media_type: media_type.to_string(),
    })
}
