//! HTTP handlers for file operations.
//! Streams upload and download bodies without buffering them in memory and
//! delegates every decision to `FileService`.

use crate::{
    errors::AppError,
    models::stored_object::{NewReference, StoredObject},
    services::{
        catalog::{ObjectFilter, PageRequest, Sort, SortField},
        dedup_service::{DEFAULT_MEDIA_TYPE, UploadRequest},
        file_service::FileService,
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use std::io;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

const FILE_NAME_HEADER: HeaderName = HeaderName::from_static("x-file-name");

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub name: Option<String>,
}

/// Query params accepted by `GET /files`.
#[derive(Debug, Default, Deserialize)]
pub struct ListFilesQuery {
    pub name: Option<String>,
    pub name_contains: Option<String>,
    #[serde(alias = "file_type")]
    pub media_type: Option<String>,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
    pub uploaded_after: Option<DateTime<Utc>>,
    pub uploaded_before: Option<DateTime<Utc>>,
    pub is_reference: Option<bool>,
    pub min_reference_count: Option<i64>,
    pub max_reference_count: Option<i64>,
    pub sort: Option<String>,
    pub order: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl ListFilesQuery {
    fn into_parts(self) -> Result<(ObjectFilter, Sort, PageRequest), AppError> {
        let field = match self.sort.as_deref() {
            Some(raw) => raw.parse::<SortField>()?,
            None => SortField::default(),
        };
        let descending = match self.order.as_deref() {
            None => field == SortField::CreatedAt,
            Some(o) if o.eq_ignore_ascii_case("desc") => true,
            Some(o) if o.eq_ignore_ascii_case("asc") => false,
            Some(other) => {
                return Err(AppError::bad_request(format!(
                    "order must be `asc` or `desc`, got `{other}`"
                )));
            }
        };
        let defaults = PageRequest::default();
        let page = PageRequest {
            number: self.page.unwrap_or(defaults.number),
            size: self.page_size.unwrap_or(defaults.size),
        };
        let filter = ObjectFilter {
            name: self.name,
            name_contains: self.name_contains,
            media_type: self.media_type,
            min_size: self.min_size,
            max_size: self.max_size,
            uploaded_after: self.uploaded_after,
            uploaded_before: self.uploaded_before,
            is_reference: self.is_reference,
            min_reference_count: self.min_reference_count,
            max_reference_count: self.max_reference_count,
        };
        Ok((filter, Sort { field, descending }, page))
    }
}

/// `POST /files?name=...` — upload a file from the raw request body.
///
/// `Content-Length` is the declared size and is required. `Content-Type` is
/// recorded as the media type.
pub async fn upload_file(
    State(service): State<FileService>,
    Query(q): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let name = q
        .name
        .or_else(|| header_str(&headers, &FILE_NAME_HEADER).map(str::to_string))
        .ok_or_else(|| AppError::bad_request("a file name is required (`name` query or x-file-name header)"))?;

    let declared_size = header_str(&headers, &header::CONTENT_LENGTH)
        .ok_or_else(|| AppError::bad_request("Content-Length is required"))?
        .parse::<u64>()
        .map_err(|_| AppError::bad_request("Content-Length is not a valid size"))?;

    let media_type = header_str(&headers, &header::CONTENT_TYPE)
        .unwrap_or(DEFAULT_MEDIA_TYPE)
        .to_string();

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
        .boxed();

    let result = service
        .upload(
            stream,
            UploadRequest {
                name,
                media_type,
                declared_size,
            },
        )
        .await?;

    let status = if result.was_duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(result)).into_response())
}

/// `GET /files` — filtered, sorted, paginated listing.
pub async fn list_files(
    State(service): State<FileService>,
    Query(q): Query<ListFilesQuery>,
) -> Result<Response, AppError> {
    let (filter, sort, page) = q.into_parts()?;
    let page = service.list(&filter, sort, page).await?;
    Ok(Json(page).into_response())
}

/// `GET /files/{id}` — metadata only.
pub async fn get_file(
    State(service): State<FileService>,
    Path(id): Path<Uuid>,
) -> Result<Json<StoredObject>, AppError> {
    Ok(Json(service.get(id).await?))
}

/// `GET /files/{id}/content` — stream the bytes back.
pub async fn download_file(
    State(service): State<FileService>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let (meta, reader) = service.open(id).await?;
    let body = Body::from_stream(ReaderStream::new(reader));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_file_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// `DELETE /files/{id}` — release one copy.
pub async fn delete_file(
    State(service): State<FileService>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let outcome = service.delete(id).await?;
    Ok(Json(outcome).into_response())
}

/// `POST /files/{id}/references` — explicit reference to existing content.
pub async fn add_reference(
    State(service): State<FileService>,
    Path(id): Path<Uuid>,
    Json(payload): Json<NewReference>,
) -> Result<Response, AppError> {
    let reference = service.add_reference(id, payload).await?;
    Ok((StatusCode::CREATED, Json(reference)).into_response())
}

/// `GET /files/by-digest/{digest}` — the record owning a content digest.
pub async fn find_by_digest(
    State(service): State<FileService>,
    Path(digest): Path<String>,
) -> Result<Json<StoredObject>, AppError> {
    service
        .find_by_digest(&digest)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("no stored object with digest `{digest}`")))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn set_file_headers(headers: &mut HeaderMap, meta: &StoredObject) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.media_type)
            .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_MEDIA_TYPE)),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&meta.byte_size.max(0).to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );

    if let Some(digest) = meta.digest.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", digest)) {
            headers.insert(header::ETAG, value);
        }
    }

    let disposition = format!(
        "attachment; filename=\"{}\"",
        meta.original_name.replace(['"', '\\'], "_")
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    headers.insert(
        header::LAST_MODIFIED,
        HeaderValue::from_str(&meta.created_at.to_rfc2822())
            .unwrap_or_else(|_| HeaderValue::from_static("")),
    );
}
