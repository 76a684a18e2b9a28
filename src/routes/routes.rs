//! Defines routes for all file operations.
//!
//! ## Structure
//! - **Collection endpoints**
//!   - `POST   /files` — upload (deduplicated by content digest)
//!   - `GET    /files` — list with filters, sort and pagination
//!   - `GET    /files/by-digest/{digest}` — owning record for a digest
//!
//! - **Record endpoints**
//!   - `GET    /files/{id}` — metadata
//!   - `GET    /files/{id}/content` — bytes
//!   - `DELETE /files/{id}` — release one copy
//!   - `POST   /files/{id}/references` — create an explicit reference

use crate::{
    handlers::{
        file_handlers::{
            add_reference, delete_file, download_file, find_by_digest, get_file, list_files,
            upload_file,
        },
        health_handlers::{healthz, readyz},
    },
    services::file_service::FileService,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router. Shared state (`FileService`) reaches every handler.
pub fn routes() -> Router<FileService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/files", post(upload_file).get(list_files))
        .route("/files/by-digest/{digest}", get(find_by_digest))
        .route("/files/{id}", get(get_file).delete(delete_file))
        .route("/files/{id}/content", get(download_file))
        .route("/files/{id}/references", post(add_reference))
}
