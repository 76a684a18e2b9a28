//! Represents one logical upload tracked by the catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A catalog record for a stored file.
///
/// Non-reference records own exactly one blob in the object store and carry
/// the content digest. Reference records point at a non-reference record and
/// own no bytes of their own.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct StoredObject {
    /// Identifier assigned at creation.
    pub id: Uuid,

    /// Lowercase hex SHA-256 of the content. `None` on reference records.
    pub digest: Option<String>,

    /// Filename supplied by the uploader.
    pub original_name: String,

    /// Declared content type (MIME type).
    pub media_type: String,

    /// Size in bytes.
    pub byte_size: i64,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// Number of logical copies sharing this content. Always >= 1.
    pub reference_count: i64,

    /// Whether this record borrows another record's bytes.
    pub is_reference: bool,

    /// The non-reference record whose bytes this record shares.
    pub points_to: Option<Uuid>,

    /// Blob location in the object store, owned by non-reference records only.
    #[serde(skip_serializing)]
    pub location: Option<String>,
}

/// Descriptive metadata for a freshly uploaded, non-reference record.
#[derive(Clone, Debug)]
pub struct NewObject {
    pub original_name: String,
    pub media_type: String,
    pub byte_size: i64,
}

/// Descriptive metadata for an explicit reference record.
#[derive(Clone, Debug, Deserialize)]
pub struct NewReference {
    #[serde(alias = "name")]
    pub original_name: String,
    #[serde(default)]
    pub media_type: String,
}
