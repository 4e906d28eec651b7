use tollgate_core::route::Protocol;
use tollgate_core::upstream::{Endpoint, Upstream};
use tollgate_transform::{RequestParts, ResponseParts};

/// Hop-by-hop headers stripped on both legs of the proxy.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// True when the inbound request asks for a WebSocket upgrade.
pub fn is_websocket_upgrade(req: &RequestParts) -> bool {
    req.header("upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Build the upstream HTTP/1.1 request into a reused buffer.
///
/// Hop-by-hop headers are dropped, upstream auth and the forwarding trio
/// (X-Forwarded-For/Proto/Host) are injected, and the request id is
/// propagated. For WebSocket upgrades the Connection/Upgrade pair is
/// re-added after filtering so the handshake survives.
pub fn build_upstream_request(
    buf: &mut Vec<u8>,
    req: &RequestParts,
    endpoint: &Endpoint,
    upstream: &Upstream,
    client_ip: &str,
    request_id: &str,
) {
    buf.clear();
    let websocket = is_websocket_upgrade(req);
    let inbound_host = req.header("host").unwrap_or("").to_string();

    buf.extend_from_slice(req.method.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(endpoint.join_path(&req.uri()).as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");

    buf.extend_from_slice(b"host: ");
    buf.extend_from_slice(endpoint.host.as_bytes());
    buf.extend_from_slice(b"\r\n");

    for (name, value) in &req.headers {
        if is_hop_by_hop(name)
            || name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("x-request-id")
        {
            continue;
        }
        // The caller's credential is not forwarded when the upstream has
        // its own auth configured.
        if name.eq_ignore_ascii_case("authorization")
            && upstream.auth.header().is_some_and(|(n, _)| n == "authorization")
        {
            continue;
        }
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    if let Some((name, value)) = upstream.auth.header() {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    buf.extend_from_slice(b"x-forwarded-for: ");
    buf.extend_from_slice(client_ip.as_bytes());
    buf.extend_from_slice(b"\r\nx-forwarded-proto: http\r\n");
    if !inbound_host.is_empty() {
        buf.extend_from_slice(b"x-forwarded-host: ");
        buf.extend_from_slice(inbound_host.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"x-request-id: ");
    buf.extend_from_slice(request_id.as_bytes());
    buf.extend_from_slice(b"\r\n");

    if websocket {
        buf.extend_from_slice(b"connection: Upgrade\r\nupgrade: websocket\r\n");
    } else {
        buf.extend_from_slice(b"connection: keep-alive\r\n");
    }

    if !req.body.is_empty() {
        let mut itoa_buf = itoa::Buffer::new();
        buf.extend_from_slice(b"content-length: ");
        buf.extend_from_slice(itoa_buf.format(req.body.len()).as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    if !req.body.is_empty() {
        buf.extend_from_slice(&req.body);
    }
}

/// Parsed status line + headers of an upstream response.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// Byte length of the head (through the final CRLF CRLF).
    pub head_len: usize,
    pub content_length: Option<usize>,
    pub chunked: bool,
    pub keep_alive: bool,
    pub content_type: Option<String>,
}

/// Try to parse a response head out of `data`. Returns `Ok(None)` when
/// more bytes are needed.
pub fn parse_response_head(data: &[u8]) -> Result<Option<ResponseHead>, httparse::Error> {
    let mut header_buf = [httparse::EMPTY_HEADER; 64];
    let mut resp = httparse::Response::new(&mut header_buf);
    let head_len = match resp.parse(data)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };

    let status = resp.code.unwrap_or(502);
    let mut headers = Vec::with_capacity(resp.headers.len());
    let mut content_length = None;
    let mut chunked = false;
    let mut keep_alive = true;
    let mut content_type = None;

    for h in resp.headers.iter() {
        if h.name.is_empty() {
            break;
        }
        let value = std::str::from_utf8(h.value).unwrap_or("").to_string();
        if h.name.eq_ignore_ascii_case("content-length") {
            content_length = value.trim().parse().ok();
        } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = value.to_ascii_lowercase().contains("chunked");
        } else if h.name.eq_ignore_ascii_case("connection") {
            keep_alive = !value.eq_ignore_ascii_case("close");
        } else if h.name.eq_ignore_ascii_case("content-type") {
            content_type = Some(value.clone());
        }
        headers.push((h.name.to_string(), value));
    }

    Ok(Some(ResponseHead {
        status,
        headers,
        head_len,
        content_length,
        chunked,
        keep_alive,
        content_type,
    }))
}

/// Decide whether the response body is copied through (streaming) or
/// buffered for the response transform:
///   - ws/sse/grpc routes always stream;
///   - `text/event-stream` and `application/grpc*` bodies always stream;
///   - chunked with no Content-Length on an http route streams;
///   - everything else buffers.
pub fn wants_streaming(protocol: Protocol, head: &ResponseHead) -> bool {
    if protocol.always_streams() {
        return true;
    }
    if let Some(ct) = &head.content_type {
        let ct = ct.to_ascii_lowercase();
        if ct.starts_with("text/event-stream") || ct.starts_with("application/grpc") {
            return true;
        }
    }
    head.chunked && head.content_length.is_none()
}

/// Serialize a buffered response (status line, filtered headers, fresh
/// content-length) into a reused buffer.
pub fn build_response(buf: &mut Vec<u8>, resp: &ResponseParts, keep_alive: bool) {
    buf.clear();
    let mut itoa_buf = itoa::Buffer::new();
    buf.extend_from_slice(b"HTTP/1.1 ");
    buf.extend_from_slice(itoa_buf.format(resp.status).as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(status_text(resp.status).as_bytes());
    buf.extend_from_slice(b"\r\n");
    for (name, value) in &resp.headers {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"content-length: ");
    buf.extend_from_slice(itoa_buf.format(resp.body.len()).as_bytes());
    buf.extend_from_slice(if keep_alive {
        b"\r\nconnection: keep-alive\r\n\r\n" as &[u8]
    } else {
        b"\r\nconnection: close\r\n\r\n" as &[u8]
    });
    buf.extend_from_slice(&resp.body);
}

/// Serialize the head of a streamed response: upstream headers pass
/// through (framing intact), gateway headers are appended.
pub fn build_streaming_head(
    buf: &mut Vec<u8>,
    head: &ResponseHead,
    extra_headers: &[(String, String)],
) {
    buf.clear();
    let mut itoa_buf = itoa::Buffer::new();
    buf.extend_from_slice(b"HTTP/1.1 ");
    buf.extend_from_slice(itoa_buf.format(head.status).as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(status_text(head.status).as_bytes());
    buf.extend_from_slice(b"\r\n");
    for (name, value) in &head.headers {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    for (name, value) in extra_headers {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
}

/// Detects the end of a chunked body across arbitrary chunk boundaries by
/// tracking the trailing bytes of the stream. Seeded with CRLF so an
/// immediately-empty chunked body (`0\r\n\r\n`) is recognized.
pub struct ChunkedEndDetector {
    tail: Vec<u8>,
}

const CHUNKED_TERMINATOR: &[u8] = b"\r\n0\r\n\r\n";

impl ChunkedEndDetector {
    pub fn new() -> Self {
        Self {
            tail: b"\r\n".to_vec(),
        }
    }

    /// Feed the next body chunk; returns true once the terminating
    /// zero-chunk has been seen.
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        self.tail.extend_from_slice(chunk);
        let keep = CHUNKED_TERMINATOR.len();
        if self.tail.len() > keep {
            self.tail.drain(..self.tail.len() - keep);
        }
        self.tail.ends_with(CHUNKED_TERMINATOR)
    }
}

impl Default for ChunkedEndDetector {
    fn default() -> Self {
        Self::new()
    }
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}
