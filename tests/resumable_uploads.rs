//! End-to-end tests over real TCP connections.
//!
//! A raw client is used on purpose: common HTTP clients swallow 1xx
//! responses, and the interim `104` carrying `Location` is part of what is
//! under test.

use std::net::SocketAddr;
use std::sync::Arc;

use rufh_server::{build_app, db, transport};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const VERSION: (&str, &str) = ("Upload-Draft-Interop-Version", "4");

/// A test server instance.
struct TestServer {
    addr: SocketAddr,
    _handle: JoinHandle<()>,
    _shutdown_tx: oneshot::Sender<()>,
    _temp_dir: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let url = format!("sqlite://{}", temp_dir.path().join("meta.db").display());
        let pool = db::connect(&url, 4).await.expect("Failed to open database");
        db::migrate(&pool).await.expect("Failed to migrate");
        let app = build_app(
            Arc::new(pool),
            temp_dir.path().join("payloads"),
            "/uploads",
            None,
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get local addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            transport::serve(listener, app, async {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("Server error");
        });

        Self { addr, _handle: handle, _shutdown_tx: shutdown_tx, _temp_dir: temp_dir }
    }

    fn request(&self, method: &str, path: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
        let mut raw = format!("{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n", method, path, self.addr);
        for (name, value) in headers {
            raw.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !body.is_empty() || method == "POST" || method == "PATCH" {
            raw.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        raw.push_str("\r\n");
        let mut raw = raw.into_bytes();
        raw.extend_from_slice(body);
        raw
    }

    /// Send one request and collect every response (interim and final).
    async fn send(&self, method: &str, path: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<Reply> {
        let raw = self.request(method, path, headers, body);
        let mut stream = TcpStream::connect(self.addr).await.expect("Failed to connect");
        stream.write_all(&raw).await.expect("Failed to write request");
        read_replies(stream, method == "HEAD").await
    }

    async fn post(&self, complete: &str, body: &[u8]) -> Vec<Reply> {
        self.send("POST", "/uploads", &[VERSION, ("Upload-Complete", complete)], body).await
    }

    async fn head(&self, path: &str, extra: &[(&str, &str)]) -> Reply {
        let mut headers = vec![VERSION];
        headers.extend_from_slice(extra);
        let mut replies = self.send("HEAD", path, &headers, b"").await;
        assert_eq!(replies.len(), 1, "HEAD yields a single response");
        replies.remove(0)
    }

    async fn patch(&self, path: &str, offset: &str, complete: &str, body: &[u8]) -> Reply {
        let headers = [VERSION, ("Upload-Offset", offset), ("Upload-Complete", complete)];
        let mut replies = self.send("PATCH", path, &headers, body).await;
        replies.pop().expect("PATCH yields a final response")
    }

    /// Write a hand-made request, then half-close so the body ends where `raw` does.
    async fn send_truncated(&self, raw: &[u8]) -> Vec<Reply> {
        let mut stream = TcpStream::connect(self.addr).await.expect("Failed to connect");
        stream.write_all(raw).await.expect("Failed to write request");
        stream.shutdown().await.expect("Failed to half-close");
        read_replies(stream, false).await
    }

    /// Create an upload and return the path of its resource.
    async fn create(&self, complete: &str, body: &[u8]) -> String {
        let replies = self.post(complete, body).await;
        assert_eq!(replies.last().unwrap().status, 201);
        path_of(replies[0].header("location").expect("Location header was expected"))
    }
}

#[derive(Debug)]
struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

async fn read_replies(mut stream: TcpStream, is_head: bool) -> Vec<Reply> {
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.expect("Failed to read response");

    let mut replies = Vec::new();
    let mut rest = &raw[..];
    while !rest.is_empty() {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut headers);
        let used = match response.parse(rest).expect("Malformed response") {
            httparse::Status::Complete(used) => used,
            httparse::Status::Partial => panic!("Truncated response: {:?}", String::from_utf8_lossy(rest)),
        };
        let status = response.code.expect("status code");
        let headers: Vec<(String, String)> = response
            .headers
            .iter()
            .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
            .collect();
        rest = &rest[used..];

        let has_body = !(is_head || (100..200).contains(&status) || status == 204 || status == 304);
        let length = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
            .map(|(_, v)| v.parse::<usize>().expect("numeric content-length"))
            .unwrap_or(0);
        let body = if has_body { rest[..length].to_vec() } else { Vec::new() };
        if has_body {
            rest = &rest[length..];
        }
        replies.push(Reply { status, headers, body });
    }
    replies
}

fn path_of(location: &str) -> String {
    let after_scheme = location.split_once("://").map(|(_, rest)| rest).unwrap_or(location);
    let start = after_scheme.find('/').expect("Location has a path");
    after_scheme[start..].to_string()
}

// =============================================================================
// Creation
// =============================================================================

#[tokio::test]
async fn test_known_size_upload_announces_location() {
    let server = TestServer::start().await;
    let replies = server.post("?1", b"hello").await;

    assert_eq!(replies.len(), 2, "interim and final response expected");
    assert_eq!(replies[0].status, 104, "104 status code was expected");
    let location = replies[0].header("location").expect("Location header was expected");
    assert!(!location.is_empty(), "Non-empty Location header value was expected");
    assert!(location.starts_with(&format!("http://{}/uploads/", server.addr)));

    let last = &replies[1];
    assert_eq!(last.status, 201);
    assert_eq!(last.header("location"), Some(location));
    assert_eq!(last.header("upload-offset"), Some("5"));
    assert_eq!(last.header("upload-complete"), Some("?1"));
}

#[tokio::test]
async fn test_post_without_interop_version_creates_nothing() {
    let server = TestServer::start().await;
    let replies = server.send("POST", "/uploads", &[("Upload-Complete", "?1")], b"hello").await;

    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].status, 400);
    assert!(replies[0].header("location").is_none());

    let replies = server
        .send("POST", "/uploads", &[("Upload-Draft-Interop-Version", "1")], b"hello")
        .await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].status, 400);
}

#[tokio::test]
async fn test_every_upload_gets_its_own_location() {
    let server = TestServer::start().await;
    let a = server.create("?1", b"one").await;
    let b = server.create("?1", b"two").await;
    assert_ne!(a, b);
}

// =============================================================================
// Offset retrieval
// =============================================================================

#[tokio::test]
async fn test_offset_retrieval() {
    let server = TestServer::start().await;
    let path = server.create("?1", b"hello").await;

    let reply = server.head(&path, &[]).await;
    assert_eq!(reply.status, 204, "204 status code was expected");
    assert_eq!(reply.header("upload-offset"), Some("5"));
    assert_eq!(reply.header("upload-complete"), Some("?1"));
    assert_eq!(reply.header("cache-control"), Some("no-store"));
}

#[tokio::test]
async fn test_offset_retrieval_bad_head_with_offset() {
    let server = TestServer::start().await;
    let path = server.create("?1", b"hello").await;

    let reply = server.head(&path, &[("Upload-Offset", "10")]).await;
    assert_eq!(reply.status, 400, "400 status code was expected");
}

#[tokio::test]
async fn test_offset_retrieval_bad_head_with_complete() {
    let server = TestServer::start().await;
    let path = server.create("?1", b"hello").await;

    let reply = server.head(&path, &[("Upload-Complete", "?0")]).await;
    assert_eq!(reply.status, 400, "400 status code was expected");
}

#[tokio::test]
async fn test_bad_head_is_rejected_before_lookup() {
    let server = TestServer::start().await;

    let reply = server.head("/uploads/doesnotexist", &[("Upload-Offset", "10")]).await;
    assert_eq!(reply.status, 400);

    let reply = server.head("/uploads/doesnotexist", &[]).await;
    assert_eq!(reply.status, 404);
}

#[tokio::test]
async fn test_head_requires_interop_version() {
    let server = TestServer::start().await;
    let path = server.create("?1", b"hello").await;

    let mut replies = server.send("HEAD", &path, &[], b"").await;
    assert_eq!(replies.remove(0).status, 400);
}

// =============================================================================
// Resumption
// =============================================================================

#[tokio::test]
async fn test_patch_resumes_and_completes() {
    let server = TestServer::start().await;
    let path = server.create("?0", b"hel").await;

    let reply = server.head(&path, &[]).await;
    assert_eq!(reply.header("upload-offset"), Some("3"));
    assert_eq!(reply.header("upload-complete"), Some("?0"));

    let reply = server.patch(&path, "3", "?1", b"lo").await;
    assert_eq!(reply.status, 204);
    assert_eq!(reply.header("upload-offset"), Some("5"));
    assert_eq!(reply.header("upload-complete"), Some("?1"));

    let replies = server.send("GET", &path, &[], b"").await;
    assert_eq!(replies[0].status, 200);
    assert_eq!(replies[0].body, b"hello");
}

#[tokio::test]
async fn test_patch_offset_mismatch_is_a_conflict() {
    let server = TestServer::start().await;
    let path = server.create("?0", b"hel").await;

    let reply = server.patch(&path, "1", "?1", b"xx").await;
    assert_eq!(reply.status, 409);
    assert_eq!(reply.header("upload-offset"), Some("3"));

    let reply = server.head(&path, &[]).await;
    assert_eq!(reply.header("upload-offset"), Some("3"));
    assert_eq!(reply.header("upload-complete"), Some("?0"));
}

#[tokio::test]
async fn test_patch_on_complete_upload_is_rejected() {
    let server = TestServer::start().await;
    let path = server.create("?1", b"hello").await;

    let reply = server.patch(&path, "5", "?1", b"more").await;
    assert_eq!(reply.status, 400);

    let reply = server.head(&path, &[]).await;
    assert_eq!(reply.header("upload-offset"), Some("5"));
    assert_eq!(reply.header("upload-complete"), Some("?1"));
}

#[tokio::test]
async fn test_patch_requires_upload_offset() {
    let server = TestServer::start().await;
    let path = server.create("?0", b"hel").await;

    let mut replies = server
        .send("PATCH", &path, &[VERSION, ("Upload-Complete", "?1")], b"lo")
        .await;
    assert_eq!(replies.pop().unwrap().status, 400);
}

#[tokio::test]
async fn test_patch_unknown_upload_is_not_found() {
    let server = TestServer::start().await;
    let reply = server.patch("/uploads/doesnotexist", "0", "?1", b"x").await;
    assert_eq!(reply.status, 404);
}

#[tokio::test]
async fn test_concurrent_patches_at_same_offset() {
    let server = Arc::new(TestServer::start().await);
    let path = server.create("?0", b"").await;

    let mut handles = Vec::new();
    for _ in 0..2 {
        let server = server.clone();
        let path = path.clone();
        handles.push(tokio::spawn(async move { server.patch(&path, "0", "?0", b"abc").await.status }));
    }
    let mut statuses = Vec::new();
    for handle in handles {
        statuses.push(handle.await.unwrap());
    }
    statuses.sort();
    assert_eq!(statuses, vec![204, 409]);

    let reply = server.head(&path, &[]).await;
    assert_eq!(reply.header("upload-offset"), Some("3"));
}

#[tokio::test]
async fn test_incomplete_upload_cannot_be_downloaded() {
    let server = TestServer::start().await;
    let path = server.create("?0", b"hel").await;

    let replies = server.send("GET", &path, &[], b"").await;
    assert_eq!(replies[0].status, 409);
}

// =============================================================================
// Interrupted bodies
// =============================================================================

#[tokio::test]
async fn test_disconnect_keeps_durable_prefix() {
    let server = TestServer::start().await;

    let mut raw = format!(
        "POST /uploads HTTP/1.1\r\nHost: {}\r\nUpload-Draft-Interop-Version: 4\r\n\
         Upload-Complete: ?1\r\nContent-Length: 10\r\n\r\n",
        server.addr
    )
    .into_bytes();
    raw.extend_from_slice(b"1234");

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(&raw).await.unwrap();
    stream.shutdown().await.unwrap();
    let replies = read_replies(stream, false).await;

    assert_eq!(replies[0].status, 104);
    let path = path_of(replies[0].header("location").unwrap());
    let last = replies.last().unwrap();
    assert_eq!(last.status, 400);
    assert_eq!(last.header("upload-offset"), Some("4"));

    let reply = server.head(&path, &[]).await;
    assert_eq!(reply.header("upload-offset"), Some("4"));
    assert_eq!(reply.header("upload-complete"), Some("?0"));

    let reply = server.patch(&path, "4", "?1", b"567890").await;
    assert_eq!(reply.status, 204);
    assert_eq!(reply.header("upload-offset"), Some("10"));
    assert_eq!(reply.header("upload-complete"), Some("?1"));

    let replies = server.send("GET", &path, &[], b"").await;
    assert_eq!(replies[0].body, b"1234567890");
}

#[tokio::test]
async fn test_patch_beyond_declared_size_is_rejected() {
    let server = TestServer::start().await;

    let raw = format!(
        "POST /uploads HTTP/1.1\r\nHost: {}\r\nUpload-Draft-Interop-Version: 4\r\n\
         Upload-Complete: ?1\r\nContent-Length: 4\r\n\r\n12",
        server.addr
    )
    .into_bytes();
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(&raw).await.unwrap();
    stream.shutdown().await.unwrap();
    let replies = read_replies(stream, false).await;
    let path = path_of(replies[0].header("location").unwrap());

    let reply = server.patch(&path, "2", "?1", b"345").await;
    assert_eq!(reply.status, 400);

    let reply = server.head(&path, &[]).await;
    assert_eq!(reply.header("upload-offset"), Some("2"));
}

#[tokio::test]
async fn test_patch_with_huge_content_length_is_rejected() {
    let server = TestServer::start().await;
    let raw = format!(
        "POST /uploads HTTP/1.1\r\nHost: {}\r\nUpload-Draft-Interop-Version: 4\r\n\
         Upload-Complete: ?1\r\nContent-Length: 10\r\n\r\n1234",
        server.addr
    );
    let replies = server.send_truncated(raw.as_bytes()).await;
    let path = path_of(replies[0].header("location").unwrap());

    let raw = format!(
        "PATCH {} HTTP/1.1\r\nHost: {}\r\nUpload-Draft-Interop-Version: 4\r\n\
         Upload-Offset: 4\r\nUpload-Complete: ?1\r\nContent-Length: {}\r\n\r\n",
        path,
        server.addr,
        u64::MAX
    );
    let replies = server.send_truncated(raw.as_bytes()).await;
    assert_eq!(replies.last().expect("a final response").status, 400);

    let reply = server.head(&path, &[]).await;
    assert_eq!(reply.header("upload-offset"), Some("4"));
    assert_eq!(reply.header("upload-complete"), Some("?0"));
}

#[tokio::test]
async fn test_post_with_unrepresentable_size_is_rejected() {
    let server = TestServer::start().await;
    let raw = format!(
        "POST /uploads HTTP/1.1\r\nHost: {}\r\nUpload-Draft-Interop-Version: 4\r\n\
         Upload-Complete: ?1\r\nContent-Length: {}\r\n\r\n",
        server.addr,
        u64::MAX
    );
    let replies = server.send_truncated(raw.as_bytes()).await;

    assert_eq!(replies.len(), 1, "no upload should be announced");
    assert_eq!(replies[0].status, 400);
    assert!(replies[0].header("location").is_none());
}

// =============================================================================
// Health checks
// =============================================================================

#[tokio::test]
async fn test_health_probes() {
    let server = TestServer::start().await;

    let replies = server.send("GET", "/healthz", &[], b"").await;
    assert_eq!(replies[0].status, 200);

    let replies = server.send("GET", "/readyz", &[], b"").await;
    assert_eq!(replies[0].status, 200);
    let body: serde_json::Value = serde_json::from_slice(&replies[0].body).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["checks"]["sqlite"]["ok"], true);
    assert_eq!(body["checks"]["disk"]["ok"], true);
}
