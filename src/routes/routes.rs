//! Routes of the resumable upload service.
//!
//! ## Structure
//! - **Upload collection** (default `/uploads`)
//!   - `POST  {collection}`        -> create upload (interim `104` + `Location`)
//! - **Upload resource**
//!   - `HEAD  {collection}/{id}`   -> offset and completion state
//!   - `PATCH {collection}/{id}`   -> append at the stated offset
//!   - `GET   {collection}/{id}`   -> download a completed upload
//! - **Probes**
//!   - `GET /healthz`, `GET /readyz`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{create_upload, download_upload, resume_upload, upload_status},
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, head, post},
};
use tower_http::trace::TraceLayer;

/// Build the router for the collection and resource paths carried by `state`.
pub fn routes(state: AppState) -> Router {
    let collection = if state.upload_path.is_empty() {
        "/".to_string()
    } else {
        state.upload_path.clone()
    };
    let resource = state.upload_resource("{id}");

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(&collection, post(create_upload))
        .route(
            &resource,
            head(upload_status)
                .patch(resume_upload)
                .get(download_upload),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
