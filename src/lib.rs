//! Content-addressed file store with reference counting.
//!
//! Uploads are deduplicated by SHA-256 digest: identical content is stored
//! once and every further upload only bumps a reference count. Deletes give a
//! count back and free the bytes when the last copy goes.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
