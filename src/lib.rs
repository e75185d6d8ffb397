//! Server side of the IETF resumable uploads draft (interop version 4).
//!
//! A `POST` to the upload collection creates an upload and announces its
//! URL in an interim `104` response while the body is still streaming;
//! `HEAD` reports the durable offset and `PATCH` resumes from it.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod protocol;
pub mod routes;
pub mod services;
pub mod state;
pub mod transport;

use services::{offset_store::OffsetStore, registry::SessionRegistry};
use sqlx::SqlitePool;
use state::AppState;
use std::{path::PathBuf, sync::Arc};

/// Wire the storage, registry and routes into a ready-to-serve router.
pub fn build_app(
    db: Arc<SqlitePool>,
    storage_dir: impl Into<PathBuf>,
    upload_path: &str,
    public_base_url: Option<String>,
) -> axum::Router {
    let store = OffsetStore::new(db, storage_dir);
    let state = AppState::new(SessionRegistry::new(store), upload_path, public_base_url);
    routes::routes::routes(state)
}
