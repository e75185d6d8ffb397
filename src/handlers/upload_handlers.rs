//! HTTP handlers for resumable uploads.
//!
//! - `POST {collection}`        create an upload, announce it with `104`, stream the body
//! - `HEAD {collection}/{id}`   report the durable offset and completion state
//! - `PATCH {collection}/{id}`  append to an incomplete upload at the stated offset
//! - `GET {collection}/{id}`    download a completed upload
//!
//! Every precondition is checked before shared state is touched, so a
//! rejected request never moves an offset.

use crate::{
    errors::AppError,
    models::upload::UploadSession,
    protocol::{
        self, ProtocolError, UPLOAD_COMPLETE, UPLOAD_OFFSET, UPLOAD_RESUMPTION_SUPPORTED,
    },
    services::{offset_store::UploadError, registry::SessionGuard},
    state::AppState,
    transport::InterimResponder,
};
use axum::{
    Extension,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::io;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

/// `POST {collection}`: create an upload.
pub async fn create_upload(
    State(state): State<AppState>,
    interim: Option<Extension<InterimResponder>>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    protocol::interop_version(&headers)?;
    let complete = protocol::upload_complete(&headers)?.unwrap_or(false);
    let declared_len = protocol::content_length(&headers)?;
    // The total is stored as a signed SQLite integer.
    let total_size = match declared_len {
        Some(len) if complete => Some(
            i64::try_from(len)
                .map_err(|_| ProtocolError::InvalidHeader(header::CONTENT_LENGTH))?,
        ),
        _ => None,
    };

    let session = state.registry.create(total_size).await?;
    let guard = state.registry.lock(&session.id).await?;

    let location = HeaderValue::from_str(&state.location(&headers, &session.id))
        .map_err(|_| AppError::internal("upload location is not a valid header value"))?;

    match interim {
        Some(Extension(responder)) => {
            let status = StatusCode::from_u16(UPLOAD_RESUMPTION_SUPPORTED)
                .map_err(|_| AppError::internal("invalid interim status"))?;
            let mut interim_headers = HeaderMap::new();
            interim_headers.insert(header::LOCATION, location.clone());
            if let Err(err) = responder.send(status, interim_headers).await {
                warn!(upload_id = %session.id, "could not send interim response: {}", err);
            }
        }
        None => debug!(upload_id = %session.id, "transport cannot send interim responses"),
    }

    let session = apply_body(&guard, 0, complete, body).await?;
    info!(
        upload_id = %session.id,
        offset = session.offset,
        complete = session.complete,
        "Upload created"
    );

    let mut response = upload_state_response(StatusCode::CREATED, &session);
    response.headers_mut().insert(header::LOCATION, location);
    Ok(response)
}

/// `HEAD {collection}/{id}`: report progress of an upload.
pub async fn upload_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    // Must run before the lookup: a bad request is 400 even for unknown ids.
    protocol::reject_forbidden(&headers, &[UPLOAD_OFFSET, UPLOAD_COMPLETE])?;
    protocol::interop_version(&headers)?;

    let session = state.registry.get(&id).await?;
    Ok(upload_state_response(StatusCode::NO_CONTENT, &session))
}

/// `PATCH {collection}/{id}`: resume an upload.
pub async fn resume_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    protocol::interop_version(&headers)?;
    let offset =
        protocol::upload_offset(&headers)?.ok_or(ProtocolError::MissingHeader(UPLOAD_OFFSET))?;
    let complete = protocol::upload_complete(&headers)?.unwrap_or(false);
    let declared_len = protocol::content_length(&headers)?;

    let guard = state.registry.lock(&id).await?;
    let current = guard.session().await?;
    if current.complete {
        return Err(UploadError::AlreadyComplete(id).into());
    }
    if current.offset as u64 != offset {
        return Err(UploadError::OffsetMismatch {
            current: current.offset as u64,
            requested: offset,
        }
        .into());
    }
    if let (Some(total), Some(remaining), Some(len)) =
        (current.total_size, current.remaining(), declared_len)
    {
        if len > remaining as u64 {
            return Err(UploadError::SizeExceeded {
                limit: total as u64,
            }
            .into());
        }
    }

    let session = apply_body(&guard, offset, complete, body).await?;
    info!(
        upload_id = %session.id,
        from = offset,
        offset = session.offset,
        complete = session.complete,
        "Upload resumed"
    );
    Ok(upload_state_response(StatusCode::NO_CONTENT, &session))
}

/// `GET {collection}/{id}`: stream the bytes of a completed upload.
pub async fn download_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let (session, file) = state.registry.open_payload(&id).await?;
    if !session.complete {
        return Err(AppError::conflict("upload is not complete yet")
            .with_upload_state(session.offset as u64, false));
    }

    let length = session.offset as u64;
    let mut response = Response::new(Body::from_stream(ReaderStream::new(file.take(length))));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    set_upload_headers(headers, &session);
    Ok(response)
}

/// Stream `body` into the locked upload and complete it when asked to.
async fn apply_body(
    guard: &SessionGuard,
    start: u64,
    complete: bool,
    body: Body,
) -> Result<UploadSession, AppError> {
    let appended = guard.append_and_advance(start, data_stream(body)).await?;
    if appended.interrupted {
        info!(
            upload_id = %guard.id(),
            offset = appended.offset,
            "Upload body interrupted, keeping durable prefix"
        );
        return Err(
            AppError::bad_request("request body ended before it was complete")
                .with_upload_state(appended.offset, false),
        );
    }
    if complete {
        return Ok(guard.mark_complete().await?);
    }
    Ok(guard.session().await?)
}

fn data_stream(body: Body) -> impl Stream<Item = io::Result<Bytes>> {
    body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other))
}

fn upload_state_response(status: StatusCode, session: &UploadSession) -> Response {
    let mut response = status.into_response();
    set_upload_headers(response.headers_mut(), session);
    response
}

fn set_upload_headers(headers: &mut HeaderMap, session: &UploadSession) {
    headers.insert(UPLOAD_OFFSET, protocol::sf_integer(session.offset as u64));
    headers.insert(UPLOAD_COMPLETE, protocol::sf_boolean(session.complete));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
}
