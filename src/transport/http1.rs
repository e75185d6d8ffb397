//! HTTP/1.1 connection handling around an `axum::Router`.
//!
//! Every request gets a two-phase response path: any number of interim
//! (1xx) responses written through `InterimResponder` while the body is
//! still streaming into the handler, then exactly one final response.

use crate::transport::{
    body::{BodyDecoder, Framing, Input},
    interim::{Interim, InterimResponder},
};
use axum::{
    Router,
    body::{Body, HttpBody},
    http::{
        HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri, Version,
        header,
    },
};
use bytes::Bytes;
use futures::{StreamExt, stream};
use std::{
    future::Future,
    io::{self, Write as _},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    sync::mpsc,
};
use tower::ServiceExt;
use tracing::{debug, warn};

const MAX_HEADERS: usize = 64;
const MAX_HEAD_BYTES: usize = 16 * 1024;
/// Body chunks buffered between the socket reader and the handler.
const BODY_CHANNEL_DEPTH: usize = 8;
/// Unconsumed request body drained to keep a connection reusable.
const MAX_DRAIN_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Error)]
enum HeadError {
    #[error("malformed request head: {0}")]
    Parse(#[from] httparse::Error),
    #[error("request head exceeds {MAX_HEAD_BYTES} bytes")]
    TooLarge,
    #[error("invalid request: {0}")]
    Invalid(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl HeadError {
    fn status(&self) -> StatusCode {
        match self {
            HeadError::TooLarge => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

struct RequestHead {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
}

/// Accept connections until `shutdown` resolves, one task per connection.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send,
{
    tokio::pin!(shutdown);
    loop {
        let (stream, peer) = tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received, no longer accepting connections");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };

        if let Err(err) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", peer, err);
        }
        let app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_connection(stream, app).await {
                debug!("connection from {} ended with error: {}", peer, err);
            }
        });
    }
}

/// Serve HTTP/1.1 requests on one connection until either side closes it.
pub async fn serve_connection<IO>(io: IO, app: Router) -> io::Result<()>
where
    IO: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (reader, mut writer) = tokio::io::split(io);
    let mut input = Input::new(reader);

    loop {
        let head = match read_head(&mut input).await {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(()),
            Err(HeadError::Io(err)) => return Err(err),
            Err(err) => {
                debug!("rejecting request: {}", err);
                write_error(&mut writer, err.status()).await?;
                return Ok(());
            }
        };
        let framing = match body_framing(&head.headers) {
            Ok(framing) => framing,
            Err(err) => {
                debug!("rejecting request: {}", err);
                write_error(&mut writer, err.status()).await?;
                return Ok(());
            }
        };

        let keep_alive = wants_keep_alive(&head);
        let is_head = head.method == Method::HEAD;
        if framing != Framing::Empty && expects_continue(&head.headers) {
            writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
            writer.flush().await?;
        }

        let (body_tx, body_rx) = mpsc::channel::<io::Result<Bytes>>(BODY_CHANNEL_DEPTH);
        let body = if framing == Framing::Empty {
            Body::empty()
        } else {
            Body::from_stream(stream::unfold(body_rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            }))
        };

        let (responder, mut interim_rx) = InterimResponder::channel();
        let mut request = Request::new(body);
        *request.method_mut() = head.method;
        *request.uri_mut() = head.uri;
        *request.version_mut() = head.version;
        *request.headers_mut() = head.headers;
        request.extensions_mut().insert(responder);

        let pump = pump_body(&mut input, framing, body_tx);
        let exchange = async {
            let response = call(app.clone(), request, &mut interim_rx, &mut writer).await;
            interim_rx.close();
            write_response(&mut writer, response, is_head, keep_alive).await
        };
        let (pumped, written) = tokio::join!(pump, exchange);

        written?;
        if let Err(err) = pumped {
            debug!("closing connection after body error: {}", err);
            let _ = writer.shutdown().await;
            return Ok(());
        }
        if !keep_alive {
            let _ = writer.shutdown().await;
            return Ok(());
        }
    }
}

/// Drive the router, writing interim responses as the handler emits them.
async fn call<W>(
    app: Router,
    request: Request<Body>,
    interim_rx: &mut mpsc::Receiver<Interim>,
    writer: &mut W,
) -> Response<Body>
where
    W: AsyncWrite + Unpin,
{
    let response = app.oneshot(request);
    tokio::pin!(response);
    let mut interims_open = true;
    loop {
        tokio::select! {
            result = &mut response => {
                return match result {
                    Ok(response) => response,
                    Err(never) => match never {},
                };
            }
            interim = interim_rx.recv(), if interims_open => match interim {
                Some(interim) => {
                    let written = write_interim(writer, interim.status, &interim.headers).await;
                    if let Err(err) = &written {
                        debug!("interim response write failed: {}", err);
                    }
                    let _ = interim.written.send(written.is_ok());
                }
                None => interims_open = false,
            },
        }
    }
}

/// Forward body bytes to the handler; drain what it leaves unread.
async fn pump_body<R>(
    input: &mut Input<R>,
    framing: Framing,
    tx: mpsc::Sender<io::Result<Bytes>>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = BodyDecoder::new(framing);
    let mut forwarding = true;
    let mut drained = 0u64;
    loop {
        match decoder.next_chunk(input).await {
            Ok(Some(chunk)) => {
                if forwarding {
                    let len = chunk.len() as u64;
                    if tx.send(Ok(chunk)).await.is_err() {
                        forwarding = false;
                        drained += len;
                    }
                } else {
                    drained += chunk.len() as u64;
                }
                if drained > MAX_DRAIN_BYTES {
                    return Err(io::Error::other("unread request body too large to drain"));
                }
            }
            Ok(None) => {
                debug_assert!(decoder.is_done());
                return Ok(());
            }
            Err(err) => {
                if forwarding {
                    let _ = tx.send(Err(io::Error::new(err.kind(), err.to_string()))).await;
                }
                return Err(err);
            }
        }
    }
}

async fn read_head<R>(input: &mut Input<R>) -> Result<Option<RequestHead>, HeadError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if !input.buf.is_empty() {
            let parsed = {
                let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let mut req = httparse::Request::new(&mut headers);
                match req.parse(&input.buf)? {
                    httparse::Status::Complete(len) => Some((len, owned_head(&req)?)),
                    httparse::Status::Partial => None,
                }
            };
            if let Some((len, head)) = parsed {
                let _ = input.buf.split_to(len);
                return Ok(Some(head));
            }
            if input.buf.len() >= MAX_HEAD_BYTES {
                return Err(HeadError::TooLarge);
            }
        }

        if input.fill().await? == 0 {
            if input.buf.is_empty() {
                return Ok(None);
            }
            return Err(HeadError::Invalid("connection closed mid request head"));
        }
    }
}

fn owned_head(req: &httparse::Request<'_, '_>) -> Result<RequestHead, HeadError> {
    let method = req
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or(HeadError::Invalid("bad method"))?;
    let uri = req
        .path
        .and_then(|p| p.parse::<Uri>().ok())
        .ok_or(HeadError::Invalid("bad request target"))?;
    let version = match req.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(HeadError::Invalid("unsupported HTTP version")),
    };

    let mut headers = HeaderMap::with_capacity(req.headers.len());
    for h in req.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| HeadError::Invalid("bad header name"))?;
        let value =
            HeaderValue::from_bytes(h.value).map_err(|_| HeadError::Invalid("bad header value"))?;
        headers.append(name, value);
    }

    Ok(RequestHead {
        method,
        uri,
        version,
        headers,
    })
}

fn body_framing(headers: &HeaderMap) -> Result<Framing, HeadError> {
    let mut codings = headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .peekable();
    if codings.peek().is_some() {
        if headers.contains_key(header::CONTENT_LENGTH) {
            return Err(HeadError::Invalid(
                "both Content-Length and Transfer-Encoding present",
            ));
        }
        let last = codings
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .last();
        return match last {
            Some(coding) if coding.eq_ignore_ascii_case("chunked") => Ok(Framing::Chunked),
            _ => Err(HeadError::Invalid("unsupported transfer coding")),
        };
    }

    let mut length = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or(HeadError::Invalid("bad Content-Length"))?;
        if length.is_some_and(|seen| seen != parsed) {
            return Err(HeadError::Invalid("conflicting Content-Length values"));
        }
        length = Some(parsed);
    }
    Ok(match length {
        None | Some(0) => Framing::Empty,
        Some(n) => Framing::Length(n),
    })
}

fn connection_has(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn wants_keep_alive(head: &RequestHead) -> bool {
    if head.version == Version::HTTP_10 {
        connection_has(&head.headers, "keep-alive")
    } else {
        !connection_has(&head.headers, "close")
    }
}

fn expects_continue(headers: &HeaderMap) -> bool {
    headers
        .get(header::EXPECT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
}

fn reason(status: StatusCode) -> &'static str {
    match status.as_u16() {
        104 => "Upload Resumption Supported",
        _ => status.canonical_reason().unwrap_or("Unknown"),
    }
}

fn encode_head(status: StatusCode, headers: &HeaderMap, extra: &[(&str, &str)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    // Writing into a Vec cannot fail.
    let _ = write!(out, "HTTP/1.1 {} {}\r\n", status.as_u16(), reason(status));
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    for (name, value) in extra {
        let _ = write!(out, "{}: {}\r\n", name, value);
    }
    out.extend_from_slice(b"\r\n");
    out
}

async fn write_interim<W>(writer: &mut W, status: StatusCode, headers: &HeaderMap) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_head(status, headers, &[])).await?;
    writer.flush().await
}

async fn write_error<W>(writer: &mut W, status: StatusCode) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let head = encode_head(
        status,
        &HeaderMap::new(),
        &[("content-length", "0"), ("connection", "close")],
    );
    writer.write_all(&head).await?;
    writer.flush().await?;
    writer.shutdown().await
}

async fn write_response<W>(
    writer: &mut W,
    response: Response<Body>,
    is_head: bool,
    keep_alive: bool,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (parts, body) = response.into_parts();
    let mut headers = parts.headers;
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::CONNECTION);

    let status = parts.status;
    let bodyless = is_head
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;

    let mut chunked = false;
    if status == StatusCode::NO_CONTENT || status.is_informational() {
        headers.remove(header::CONTENT_LENGTH);
    } else if !headers.contains_key(header::CONTENT_LENGTH) {
        match body.size_hint().exact() {
            Some(len) if !is_head => {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            }
            Some(_) => {}
            None => chunked = !bodyless,
        }
    }

    let mut extra: Vec<(&str, &str)> = Vec::new();
    if chunked {
        extra.push(("transfer-encoding", "chunked"));
    }
    if !keep_alive {
        extra.push(("connection", "close"));
    }
    writer.write_all(&encode_head(status, &headers, &extra)).await?;

    if !bodyless {
        let mut data = body.into_data_stream();
        while let Some(frame) = data.next().await {
            let frame = frame.map_err(io::Error::other)?;
            if frame.is_empty() {
                continue;
            }
            if chunked {
                writer
                    .write_all(format!("{:x}\r\n", frame.len()).as_bytes())
                    .await?;
                writer.write_all(&frame).await?;
                writer.write_all(b"\r\n").await?;
            } else {
                writer.write_all(&frame).await?;
            }
        }
        if chunked {
            writer.write_all(b"0\r\n\r\n").await?;
        }
    }
    writer.flush().await
}
