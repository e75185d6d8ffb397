//! Shared state handed to every handler.

use crate::services::registry::SessionRegistry;
use axum::http::{HeaderMap, header};

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,

    /// Path of the upload collection, e.g. `/uploads`.
    pub upload_path: String,

    /// Externally visible origin used to build `Location`, e.g.
    /// `https://uploads.example.com`. Falls back to the request's `Host`.
    pub public_base_url: Option<String>,
}

impl AppState {
    pub fn new(
        registry: SessionRegistry,
        upload_path: impl Into<String>,
        public_base_url: Option<String>,
    ) -> Self {
        Self {
            registry,
            upload_path: normalize_path(&upload_path.into()),
            public_base_url: public_base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    /// Path of one upload resource.
    pub fn upload_resource(&self, id: &str) -> String {
        format!("{}/{}", self.upload_path, id)
    }

    /// URL a client dereferences to reach upload `id`.
    ///
    /// Absolute whenever an origin is known, so clients that only accept
    /// absolute URLs can follow it directly.
    pub fn location(&self, request_headers: &HeaderMap, id: &str) -> String {
        let path = self.upload_resource(id);
        if let Some(base) = &self.public_base_url {
            return format!("{}{}", base, path);
        }
        let host = request_headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .filter(|h| is_plausible_host(h));
        match host {
            Some(host) => format!("http://{}{}", host, path),
            None => path,
        }
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

fn is_plausible_host(host: &str) -> bool {
    !host.is_empty()
        && host
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b':' | b'[' | b']'))
}
