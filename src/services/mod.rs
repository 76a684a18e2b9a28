//! The deduplicating store's core: hashing, blob storage, the catalog and the
//! two engines that keep reference counts honest.

pub mod blob_store;
pub mod catalog;
pub mod dedup_service;
pub mod error;
pub mod file_service;
pub mod hasher;
pub mod lifecycle_service;

/// Attempts an engine makes before a lock conflict becomes a storage failure.
pub const MAX_CONFLICT_ATTEMPTS: u32 = 3;
