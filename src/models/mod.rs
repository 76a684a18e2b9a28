//! Core data models for the deduplicating file store.
//!
//! A single catalog entity describes every logical upload. It maps to the
//! `stored_objects` table via `sqlx::FromRow` and serializes as JSON via `serde`.

pub mod stored_object;
