//! Catalog: durable `stored_objects` records in SQLite. Every mutation is a
//! single atomic statement run on a caller-supplied connection, so the engines
//! can compose several of them inside one transaction.

use crate::{
    models::stored_object::{NewObject, NewReference, StoredObject},
    services::{
        error::{StoreError, StoreResult, is_unique_violation},
        hasher::Digest,
    },
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{
    QueryBuilder, SqliteConnection, SqlitePool, Transaction,
    sqlite::{Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{str::FromStr, sync::Arc, time::Duration};
use tracing::debug;
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

macro_rules! object_columns {
    () => {
        "id, digest, original_name, media_type, byte_size, created_at, \
         reference_count, is_reference, points_to, location"
    };
}

/// What a copy is attached to: the active record for a digest, or a record id.
#[derive(Clone, Copy, Debug)]
pub enum CopyTarget<'a> {
    Digest(&'a Digest),
    Id(Uuid),
}

/// Result of attaching one more logical copy to existing content.
#[derive(Debug)]
pub struct AttachedCopy {
    /// The owning record, with its count already incremented.
    pub target: StoredObject,
    /// The reference row, when one was requested.
    pub reference: Option<StoredObject>,
}

/// Outcome of releasing one logical copy.
#[derive(Debug)]
pub enum Release {
    /// Count went down; the record (and its blob) remain.
    Decremented(StoredObject),
    /// Count was 1; the record is gone. Its blob, if any, must be freed.
    Deleted(StoredObject),
}

/// Filters accepted by [`Catalog::list`]. `None` means "don't filter".
#[derive(Clone, Debug, Default)]
pub struct ObjectFilter {
    pub name: Option<String>,
    pub name_contains: Option<String>,
    pub media_type: Option<String>,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
    pub uploaded_after: Option<DateTime<Utc>>,
    pub uploaded_before: Option<DateTime<Utc>>,
    pub is_reference: Option<bool>,
    pub min_reference_count: Option<i64>,
    pub max_reference_count: Option<i64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortField {
    #[default]
    CreatedAt,
    OriginalName,
    ByteSize,
    ReferenceCount,
}

impl SortField {
    fn column(self) -> &'static str {
        match self {
            SortField::CreatedAt => "created_at",
            SortField::OriginalName => "original_name",
            SortField::ByteSize => "byte_size",
            SortField::ReferenceCount => "reference_count",
        }
    }
}

impl FromStr for SortField {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created_at" | "uploaded_at" => Ok(SortField::CreatedAt),
            "original_name" | "name" => Ok(SortField::OriginalName),
            "byte_size" | "size" => Ok(SortField::ByteSize),
            "reference_count" => Ok(SortField::ReferenceCount),
            other => Err(StoreError::validation(format!("unknown sort field `{other}`"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sort {
    pub field: SortField,
    pub descending: bool,
}

impl Default for Sort {
    /// Newest first.
    fn default() -> Self {
        Self {
            field: SortField::CreatedAt,
            descending: true,
        }
    }
}

/// 1-based page request.
#[derive(Clone, Copy, Debug)]
pub struct PageRequest {
    pub number: u32,
    pub size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            number: 1,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    fn normalized(self) -> Self {
        Self {
            number: self.number.max(1),
            size: self.size.clamp(1, MAX_PAGE_SIZE),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

/// Catalog handle. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct Catalog {
    db: Arc<SqlitePool>,
}

impl Catalog {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Open (creating if needed) the SQLite database behind `database_url`.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        busy_timeout: Duration,
    ) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        Ok(Self::new(Arc::new(pool)))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn migrate(&self) -> StoreResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("running {} schema statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    pub async fn begin(&self) -> StoreResult<Transaction<'static, Sqlite>> {
        Ok(self.db.begin().await?)
    }

    /// Fetch a record by id, failing with `NotFound`.
    pub async fn get(&self, id: Uuid) -> StoreResult<StoredObject> {
        let mut conn = self.db.acquire().await?;
        self.fetch(&mut conn, id).await?.ok_or(StoreError::NotFound(id))
    }

    pub async fn fetch(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> StoreResult<Option<StoredObject>> {
        Ok(sqlx::query_as::<_, StoredObject>(concat!(
            "SELECT ",
            object_columns!(),
            " FROM stored_objects WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(conn)
        .await?)
    }

    /// The unique non-reference record holding `digest`, if any.
    pub async fn find_active_by_digest(
        &self,
        conn: &mut SqliteConnection,
        digest: &Digest,
    ) -> StoreResult<Option<StoredObject>> {
        Ok(sqlx::query_as::<_, StoredObject>(concat!(
            "SELECT ",
            object_columns!(),
            " FROM stored_objects WHERE digest = ? AND is_reference = 0"
        ))
        .bind(digest.to_hex())
        .fetch_optional(conn)
        .await?)
    }

    /// Insert a new owning record with `reference_count = 1`.
    ///
    /// Returns `None` when another owning record already holds `digest`; the
    /// caller should then retry as an increment.
    pub async fn insert_original(
        &self,
        conn: &mut SqliteConnection,
        meta: &NewObject,
        digest: &Digest,
        location: &str,
    ) -> StoreResult<Option<StoredObject>> {
        let result = sqlx::query_as::<_, StoredObject>(concat!(
            "INSERT INTO stored_objects (
                id, digest, original_name, media_type, byte_size, created_at,
                reference_count, is_reference, points_to, location
            ) VALUES (?, ?, ?, ?, ?, ?, 1, 0, NULL, ?)
            RETURNING ",
            object_columns!()
        ))
        .bind(Uuid::new_v4())
        .bind(digest.to_hex())
        .bind(&meta.original_name)
        .bind(&meta.media_type)
        .bind(meta.byte_size)
        .bind(Utc::now())
        .bind(location)
        .fetch_one(conn)
        .await;

        match result {
            Ok(obj) => Ok(Some(obj)),
            Err(err) if is_unique_violation(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Atomically bump the count of an owning record.
    pub async fn increment(&self, conn: &mut SqliteConnection, id: Uuid) -> StoreResult<StoredObject> {
        self.attach_copy(conn, CopyTarget::Id(id), None)
            .await?
            .map(|attached| attached.target)
            .ok_or(StoreError::NotFound(id))
    }

    /// Attach one more logical copy to existing content.
    ///
    /// Increments the owning record's count and, when `reference` is given,
    /// inserts a reference row pointing at it. Both happen on `conn`, so inside
    /// a transaction they commit or roll back together. Returns `None` if no
    /// owning record matches `target`.
    pub async fn attach_copy(
        &self,
        conn: &mut SqliteConnection,
        target: CopyTarget<'_>,
        reference: Option<&NewReference>,
    ) -> StoreResult<Option<AttachedCopy>> {
        let target = match target {
            CopyTarget::Digest(digest) => {
                sqlx::query_as::<_, StoredObject>(concat!(
                    "UPDATE stored_objects SET reference_count = reference_count + 1
                     WHERE digest = ? AND is_reference = 0
                     RETURNING ",
                    object_columns!()
                ))
                .bind(digest.to_hex())
                .fetch_optional(&mut *conn)
                .await?
            }
            CopyTarget::Id(id) => {
                sqlx::query_as::<_, StoredObject>(concat!(
                    "UPDATE stored_objects SET reference_count = reference_count + 1
                     WHERE id = ? AND is_reference = 0
                     RETURNING ",
                    object_columns!()
                ))
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?
            }
        };

        let Some(target) = target else {
            return Ok(None);
        };

        let reference = match reference {
            Some(meta) => Some(
                sqlx::query_as::<_, StoredObject>(concat!(
                    "INSERT INTO stored_objects (
                        id, digest, original_name, media_type, byte_size, created_at,
                        reference_count, is_reference, points_to, location
                    ) VALUES (?, NULL, ?, ?, ?, ?, 1, 1, ?, NULL)
                    RETURNING ",
                    object_columns!()
                ))
                .bind(Uuid::new_v4())
                .bind(&meta.original_name)
                .bind(&meta.media_type)
                .bind(target.byte_size)
                .bind(Utc::now())
                .bind(target.id)
                .fetch_one(&mut *conn)
                .await?,
            ),
            None => None,
        };

        Ok(Some(AttachedCopy { target, reference }))
    }

    /// Release one logical copy of record `id`.
    ///
    /// A count above 1 is decremented; a count of exactly 1 deletes the row.
    /// Each branch is a single conditional statement, so two concurrent
    /// releases can never both observe the same count.
    ///
    /// Copies held by reference rows are not the owner's to give back: once
    /// the count is down to `1 + references`, releasing the owner fails with
    /// `Validation` until those references are deleted.
    pub async fn decrement_or_delete(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> StoreResult<Release> {
        let decremented = sqlx::query_as::<_, StoredObject>(concat!(
            "UPDATE stored_objects SET reference_count = reference_count - 1
             WHERE id = ?
               AND reference_count > 1 + (SELECT COUNT(*) FROM stored_objects WHERE points_to = ?)
             RETURNING ",
            object_columns!()
        ))
        .bind(id)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(obj) = decremented {
            return Ok(Release::Decremented(obj));
        }

        let deleted = sqlx::query_as::<_, StoredObject>(concat!(
            "DELETE FROM stored_objects
             WHERE id = ? AND reference_count = 1
               AND NOT EXISTS (SELECT 1 FROM stored_objects WHERE points_to = ?)
             RETURNING ",
            object_columns!()
        ))
        .bind(id)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(obj) = deleted {
            return Ok(Release::Deleted(obj));
        }

        let pinned_by = sqlx::query_scalar::<_, i64>(
            "SELECT (SELECT COUNT(*) FROM stored_objects WHERE points_to = ?)
             FROM stored_objects WHERE id = ?",
        )
        .bind(id)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        match pinned_by {
            Some(references) => Err(StoreError::validation(format!(
                "`{id}` is still referenced by {references} reference record(s); delete those first"
            ))),
            None => Err(StoreError::NotFound(id)),
        }
    }

    /// Filtered, sorted, paginated listing.
    ///
    /// The count and the page are read from one snapshot, so `total` always
    /// agrees with `items`.
    pub async fn list(
        &self,
        filter: &ObjectFilter,
        sort: Sort,
        page: PageRequest,
    ) -> StoreResult<Page<StoredObject>> {
        let page = page.normalized();
        let mut tx = self.db.begin().await?;

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM stored_objects WHERE 1 = 1");
        push_filters(&mut count, filter);
        let total = count.build_query_scalar::<i64>().fetch_one(&mut *tx).await?;

        let mut builder = QueryBuilder::<Sqlite>::new(concat!(
            "SELECT ",
            object_columns!(),
            " FROM stored_objects WHERE 1 = 1"
        ));
        push_filters(&mut builder, filter);
        builder.push(" ORDER BY ");
        builder.push(sort.field.column());
        builder.push(if sort.descending { " DESC" } else { " ASC" });
        builder.push(", id ASC LIMIT ");
        builder.push_bind(i64::from(page.size));
        builder.push(" OFFSET ");
        builder.push_bind(i64::from(page.number - 1) * i64::from(page.size));

        let items: Vec<StoredObject> = builder.build_query_as().fetch_all(&mut *tx).await?;
        tx.commit().await?;

        Ok(Page {
            items,
            total,
            page: page.number,
            page_size: page.size,
        })
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, filter: &ObjectFilter) {
    if let Some(name) = &filter.name {
        builder.push(" AND original_name = ");
        builder.push_bind(name.clone());
    }
    if let Some(fragment) = &filter.name_contains {
        builder.push(" AND LOWER(original_name) LIKE ");
        builder.push_bind(format!("%{}%", escape_like(&fragment.to_lowercase())));
        builder.push(" ESCAPE '\\'");
    }
    if let Some(media_type) = &filter.media_type {
        let normalized = media_type.trim().trim_start_matches('.').to_lowercase();
        if !normalized.is_empty() {
            builder.push(" AND LOWER(media_type) = ");
            builder.push_bind(normalized);
        }
    }
    if let Some(min) = filter.min_size {
        builder.push(" AND byte_size >= ");
        builder.push_bind(min);
    }
    if let Some(max) = filter.max_size {
        builder.push(" AND byte_size <= ");
        builder.push_bind(max);
    }
    if let Some(after) = filter.uploaded_after {
        builder.push(" AND created_at >= ");
        builder.push_bind(after);
    }
    if let Some(before) = filter.uploaded_before {
        builder.push(" AND created_at <= ");
        builder.push_bind(before);
    }
    if let Some(is_reference) = filter.is_reference {
        builder.push(" AND is_reference = ");
        builder.push_bind(is_reference);
    }
    if let Some(min) = filter.min_reference_count {
        builder.push(" AND reference_count >= ");
        builder.push_bind(min);
    }
    if let Some(max) = filter.max_reference_count {
        builder.push(" AND reference_count <= ");
        builder.push_bind(max);
    }
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
