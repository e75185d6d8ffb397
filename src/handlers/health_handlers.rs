//! Health & readiness handlers.
//!
//! - GET /healthz  -> liveness, no I/O
//! - GET /readyz   -> metadata database and payload directory are usable

use crate::{services::offset_store::OffsetStore, state::AppState};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::fs;
use uuid::Uuid;

const PROBE_BYTES: &[u8] = b"readyz";

/// `GET /healthz`
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(ProbeResponse::new(BTreeMap::new())))
}

/// `GET /readyz`
///
/// Runs `SELECT 1` against SQLite and a write/read/delete round trip in the
/// payload directory. 200 when both pass, 503 otherwise; the body lists
/// each check.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.registry.store();
    let mut checks = BTreeMap::new();
    checks.insert("sqlite", CheckStatus::from(check_sqlite(store).await));
    checks.insert("disk", CheckStatus::from(check_disk(store).await));

    let body = ProbeResponse::new(checks);
    let status = if body.status == "ok" {
        StatusCode::OK
    } else {
        tracing::warn!("readiness check failed: {:?}", body.checks);
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn check_sqlite(store: &OffsetStore) -> Result<(), String> {
    match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*store.db)
        .await
    {
        Ok(1) => Ok(()),
        Ok(v) => Err(format!("unexpected result: {}", v)),
        Err(e) => Err(format!("error: {}", e)),
    }
}

async fn check_disk(store: &OffsetStore) -> Result<(), String> {
    fs::create_dir_all(&store.base_path)
        .await
        .map_err(|e| format!("could not create payload dir: {}", e))?;
    let probe = store.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
    fs::write(&probe, PROBE_BYTES)
        .await
        .map_err(|e| format!("could not write probe file: {}", e))?;

    let read = fs::read(&probe).await;
    let _ = fs::remove_file(&probe).await;
    match read {
        Ok(bytes) if bytes == PROBE_BYTES => Ok(()),
        Ok(_) => Err("probe file content mismatch".to_string()),
        Err(e) => Err(format!("could not read probe file: {}", e)),
    }
}

#[derive(Serialize)]
struct ProbeResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    checks: BTreeMap<&'static str, CheckStatus>,
}

impl ProbeResponse {
    fn new(checks: BTreeMap<&'static str, CheckStatus>) -> Self {
        let status = if checks.values().all(|c| c.ok) {
            "ok"
        } else {
            "error"
        };
        Self { status, checks }
    }
}

#[derive(Serialize, Debug)]
struct CheckStatus {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<Result<(), String>> for CheckStatus {
    fn from(result: Result<(), String>) -> Self {
        Self {
            ok: result.is_ok(),
            error: result.err(),
        }
    }
}
