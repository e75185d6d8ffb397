//! Core data models for the resumable upload service.
//!
//! Rows map to the `uploads` table via `sqlx::FromRow` and serialize as
//! JSON via `serde` for diagnostics.

pub mod upload;
