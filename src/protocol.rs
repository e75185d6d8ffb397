//! Header vocabulary of the resumable upload draft (interop version 4).
//!
//! Booleans are structured-field booleans (`?0` / `?1`), offsets are
//! structured-field integers. Parsing is strict: a malformed value is a
//! client error, never a silently ignored header.

use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use thiserror::Error;

pub const UPLOAD_DRAFT_INTEROP_VERSION: HeaderName =
    HeaderName::from_static("upload-draft-interop-version");
pub const UPLOAD_OFFSET: HeaderName = HeaderName::from_static("upload-offset");
pub const UPLOAD_COMPLETE: HeaderName = HeaderName::from_static("upload-complete");

/// Interop versions this server speaks.
pub const SUPPORTED_INTEROP_VERSIONS: [&str; 1] = ["4"];

/// Informational status announcing a resumable upload resource.
pub const UPLOAD_RESUMPTION_SUPPORTED: u16 = 104;

/// Largest integer a structured field may carry (15 digits).
const MAX_SF_INTEGER_DIGITS: usize = 15;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("missing Upload-Draft-Interop-Version header")]
    MissingVersion,
    #[error("unsupported interop version `{0}`")]
    UnsupportedVersion(String),
    #[error("header `{0}` is not allowed on this request")]
    ForbiddenHeader(HeaderName),
    #[error("missing required header `{0}`")]
    MissingHeader(HeaderName),
    #[error("invalid value for header `{0}`")]
    InvalidHeader(HeaderName),
}

/// Check that the client speaks a supported interop version.
pub fn interop_version(headers: &HeaderMap) -> Result<&'static str, ProtocolError> {
    let raw = headers
        .get(&UPLOAD_DRAFT_INTEROP_VERSION)
        .ok_or(ProtocolError::MissingVersion)?;
    let value = raw
        .to_str()
        .map_err(|_| ProtocolError::InvalidHeader(UPLOAD_DRAFT_INTEROP_VERSION))?
        .trim();
    SUPPORTED_INTEROP_VERSIONS
        .iter()
        .find(|v| **v == value)
        .copied()
        .ok_or_else(|| ProtocolError::UnsupportedVersion(value.to_string()))
}

/// Fail on the first of `names` present in `headers`.
pub fn reject_forbidden(headers: &HeaderMap, names: &[HeaderName]) -> Result<(), ProtocolError> {
    match names.iter().find(|name| headers.contains_key(*name)) {
        Some(name) => Err(ProtocolError::ForbiddenHeader(name.clone())),
        None => Ok(()),
    }
}

/// `Upload-Complete`, if present.
pub fn upload_complete(headers: &HeaderMap) -> Result<Option<bool>, ProtocolError> {
    single(headers, &UPLOAD_COMPLETE)?
        .map(|value| parse_sf_boolean(value).ok_or(ProtocolError::InvalidHeader(UPLOAD_COMPLETE)))
        .transpose()
}

/// `Upload-Offset`, if present.
pub fn upload_offset(headers: &HeaderMap) -> Result<Option<u64>, ProtocolError> {
    single(headers, &UPLOAD_OFFSET)?
        .map(|value| parse_sf_integer(value).ok_or(ProtocolError::InvalidHeader(UPLOAD_OFFSET)))
        .transpose()
}

/// `Content-Length`, if present and well formed.
pub fn content_length(headers: &HeaderMap) -> Result<Option<u64>, ProtocolError> {
    single(headers, &header::CONTENT_LENGTH)?
        .map(|value| {
            value
                .parse::<u64>()
                .map_err(|_| ProtocolError::InvalidHeader(header::CONTENT_LENGTH))
        })
        .transpose()
}

pub fn sf_boolean(value: bool) -> HeaderValue {
    HeaderValue::from_static(if value { "?1" } else { "?0" })
}

pub fn sf_integer(value: u64) -> HeaderValue {
    HeaderValue::from(value)
}

/// The trimmed value of a header that may appear at most once.
fn single<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Result<Option<&'a str>, ProtocolError> {
    let mut values = headers.get_all(name).iter();
    let Some(first) = values.next() else {
        return Ok(None);
    };
    if values.next().is_some() {
        return Err(ProtocolError::InvalidHeader(name.clone()));
    }
    first
        .to_str()
        .map(|v| Some(v.trim()))
        .map_err(|_| ProtocolError::InvalidHeader(name.clone()))
}

fn parse_sf_boolean(value: &str) -> Option<bool> {
    match value {
        "?1" => Some(true),
        "?0" => Some(false),
        _ => None,
    }
}

fn parse_sf_integer(value: &str) -> Option<u64> {
    if value.is_empty()
        || value.len() > MAX_SF_INTEGER_DIGITS
        || !value.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    value.parse().ok()
}
