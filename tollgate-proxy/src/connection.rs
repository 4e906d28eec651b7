use crate::dispatch::{
    ChunkedEndDetector, build_response, build_streaming_head, build_upstream_request,
    is_websocket_upgrade, parse_response_head,
};
use crate::pipeline::{
    ForwardPlan, Pipeline, PipelineOutcome, RequestMeta, bare_meta, decorate_response,
    error_response,
};
use monoio::io::{AsyncReadRent, AsyncWriteRentExt, Splitable};
use monoio::net::TcpStream;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tollgate_core::GatewayError;
use tollgate_core::route::Protocol;
use tollgate_transform::{RequestParts, ResponseParts};
use tracing::{debug, warn};

const MAX_HEAD_BYTES: usize = 64 * 1024;

// ── Upstream connection pool ──────────────────────────────────

/// Thread-local upstream connection pool, shared by every connection task
/// on one worker via Rc<RefCell>. Pooled streams older than the upstream's
/// idle timeout are discarded on take.
pub struct ConnPool {
    pools: HashMap<String, VecDeque<(TcpStream, Instant)>>,
    max_idle: usize,
}

impl ConnPool {
    pub fn new(max_idle_per_host: usize) -> Self {
        Self {
            pools: HashMap::with_capacity(16),
            max_idle: max_idle_per_host,
        }
    }

    pub fn take(&mut self, addr: &str, max_age: Duration) -> Option<TcpStream> {
        let queue = self.pools.get_mut(addr)?;
        while let Some((stream, stored_at)) = queue.pop_front() {
            if stored_at.elapsed() <= max_age {
                return Some(stream);
            }
            // Stale; dropping closes the fd.
        }
        None
    }

    pub fn put(&mut self, addr: String, stream: TcpStream) {
        let queue = self
            .pools
            .entry(addr)
            .or_insert_with(|| VecDeque::with_capacity(self.max_idle));
        if queue.len() < self.max_idle {
            queue.push_back((stream, Instant::now()));
        }
    }

    /// Pre-warm: open `count` connections to each addr before traffic.
    pub async fn warm(&mut self, addrs: &[String], count: usize) {
        for addr in addrs {
            let target = count.min(self.max_idle);
            for _ in 0..target {
                match TcpStream::connect(addr.as_str()).await {
                    Ok(stream) => {
                        let _ = stream.set_nodelay(true);
                        self.put(addr.clone(), stream);
                    }
                    Err(e) => {
                        debug!(addr = %addr, error = %e, "Pool pre-warm connect failed");
                        break;
                    }
                }
            }
        }
    }
}

// ── In-flight accounting ──────────────────────────────────────

pub struct InflightGuard {
    counter: Arc<AtomicI64>,
}

impl InflightGuard {
    /// Reserve an in-flight slot; `None` means the gateway is saturated.
    pub fn try_acquire(counter: &Arc<AtomicI64>, max: i64) -> Option<Self> {
        let previous = counter.fetch_add(1, Ordering::AcqRel);
        if previous >= max {
            counter.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(Self {
            counter: Arc::clone(counter),
        })
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

// ── Connection handling ───────────────────────────────────────

struct ParsedRequest {
    parts: RequestParts,
    keep_alive: bool,
}

enum ForwardResult {
    /// Response fully written; connection may continue.
    Buffered {
        status: u16,
        response_bytes: u64,
        reuse_upstream: Option<(String, TcpStream)>,
    },
    /// Body was streamed; upstream framing governs, so the client
    /// connection closes afterwards.
    Streamed { status: u16, response_bytes: u64 },
    /// 101 upgrade written; the caller owns the tunnel from here.
    Upgrade { upstream: TcpStream, status: u16 },
}

/// Handle one client connection (HTTP/1.1 with keepalive).
///
/// Buffers are allocated once and reused across keepalive requests.
/// Exactly one usage event is recorded per request the gateway answers,
/// cancellations included.
pub async fn handle_connection(
    mut client: TcpStream,
    peer_addr: SocketAddr,
    pipeline: Arc<Pipeline>,
    pool: Rc<RefCell<ConnPool>>,
    inflight: Arc<AtomicI64>,
) -> anyhow::Result<()> {
    let client_ip = peer_addr.ip().to_string();
    let max_body = pipeline.config().proxy.max_body_bytes;
    let max_inflight = pipeline.config().proxy.max_inflight;
    let request_timeout = pipeline.config().request_timeout();

    let mut scratch = vec![0u8; 16 * 1024];
    let mut acc: Vec<u8> = Vec::with_capacity(8 * 1024);
    let mut wire_buf: Vec<u8> = Vec::with_capacity(4 * 1024);

    loop {
        acc.clear();

        // ── Read + parse request head ──
        // The first read is the idle keepalive wait and is unbounded; the
        // per-request deadline starts with the first bytes of a request
        // and covers head, body, and the buffered upstream exchange.
        let mut request_started: Option<Instant> = None;
        let (head_len, mut parsed) = loop {
            let (res, returned) = match request_started {
                None => client.read(scratch).await,
                Some(at) => {
                    let remaining = request_timeout.saturating_sub(at.elapsed());
                    if remaining.is_zero() {
                        debug!("Client stalled sending the request head");
                        return Ok(());
                    }
                    match monoio::time::timeout(remaining, client.read(scratch)).await {
                        Ok(out) => out,
                        Err(_) => {
                            debug!("Client stalled sending the request head");
                            return Ok(());
                        }
                    }
                }
            };
            scratch = returned;
            let n = match res {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) => return Err(e.into()),
            };
            acc.extend_from_slice(&scratch[..n]);
            request_started.get_or_insert_with(Instant::now);

            match parse_request_head(&acc) {
                Ok(Some(parsed)) => break parsed,
                Ok(None) => {
                    if acc.len() > MAX_HEAD_BYTES {
                        write_simple_error(&mut client, 400, "request head too large").await?;
                        return Ok(());
                    }
                }
                Err(_) => {
                    write_simple_error(&mut client, 400, "malformed request").await?;
                    return Ok(());
                }
            }
        };

        let started = request_started.unwrap_or_else(Instant::now);
        let deadline = started + request_timeout;
        let keep_alive = parsed.keep_alive;

        // ── Read body (content-length delimited) ──
        let content_length = parsed
            .parts
            .header("content-length")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);

        if content_length > max_body {
            let meta = bare_meta(&parsed.parts.method, &parsed.parts.path, &client_ip);
            let response = error_response(&GatewayError::BodyTooLarge, &meta);
            let _ = write_response(&mut client, &mut wire_buf, &response, false).await;
            record(&pipeline, &meta, 413, &started, response.body.len() as u64);
            return Ok(());
        }

        while acc.len() - head_len < content_length {
            let remaining = request_timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                let meta = bare_meta(&parsed.parts.method, &parsed.parts.path, &client_ip);
                record(&pipeline, &meta, 499, &started, 0);
                return Ok(());
            }
            let (res, returned) = match monoio::time::timeout(remaining, client.read(scratch)).await
            {
                Ok(out) => out,
                Err(_) => {
                    // Stalled mid-body: the client is treated as cancelled
                    // (logged and recorded, no response emitted).
                    let meta = bare_meta(&parsed.parts.method, &parsed.parts.path, &client_ip);
                    record(&pipeline, &meta, 499, &started, 0);
                    return Ok(());
                }
            };
            scratch = returned;
            let n = match res {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) => return Err(e.into()),
            };
            acc.extend_from_slice(&scratch[..n]);
        }
        parsed.parts.body = acc[head_len..head_len + content_length].to_vec();

        // ── Overload shedding ──
        let Some(_guard) = InflightGuard::try_acquire(&inflight, max_inflight) else {
            let meta = bare_meta(&parsed.parts.method, &parsed.parts.path, &client_ip);
            let response = error_response(&GatewayError::Overloaded, &meta);
            record(&pipeline, &meta, 503, &started, response.body.len() as u64);
            write_response(&mut client, &mut wire_buf, &response, keep_alive).await?;
            if keep_alive {
                continue;
            }
            return Ok(());
        };

        // ── Pipeline ──
        match pipeline.handle(parsed.parts, &client_ip) {
            PipelineOutcome::Reply { response, meta } => {
                record(
                    &pipeline,
                    &meta,
                    response.status,
                    &started,
                    response.body.len() as u64,
                );
                if write_response(&mut client, &mut wire_buf, &response, keep_alive)
                    .await
                    .is_err()
                {
                    return Ok(());
                }
            }
            PipelineOutcome::Forward(plan) => {
                let meta = plan.meta.clone();
                match forward(
                    &mut client,
                    *plan,
                    &pipeline,
                    &pool,
                    &client_ip,
                    max_body,
                    keep_alive,
                    deadline,
                )
                .await
                {
                    Ok(ForwardResult::Buffered {
                        status,
                        response_bytes,
                        reuse_upstream,
                    }) => {
                        record(&pipeline, &meta, status, &started, response_bytes);
                        if let Some((addr, stream)) = reuse_upstream {
                            pool.borrow_mut().put(addr, stream);
                        }
                    }
                    Ok(ForwardResult::Streamed {
                        status,
                        response_bytes,
                    }) => {
                        record(&pipeline, &meta, status, &started, response_bytes);
                        // Streamed bodies are framing-owned by the upstream;
                        // close rather than resynchronize keepalive.
                        return Ok(());
                    }
                    Ok(ForwardResult::Upgrade { upstream, status }) => {
                        let copied = tunnel(client, upstream).await;
                        record(&pipeline, &meta, status, &started, copied);
                        return Ok(());
                    }
                    Err(GatewayError::ClientCancelled) => {
                        record(&pipeline, &meta, 499, &started, 0);
                        return Ok(());
                    }
                    Err(err) => {
                        let response = error_response(&err, &meta);
                        record(
                            &pipeline,
                            &meta,
                            response.status,
                            &started,
                            response.body.len() as u64,
                        );
                        if write_response(&mut client, &mut wire_buf, &response, keep_alive)
                            .await
                            .is_err()
                        {
                            return Ok(());
                        }
                    }
                }
            }
        }

        if !keep_alive {
            return Ok(());
        }
    }
}

fn record(pipeline: &Pipeline, meta: &RequestMeta, status: u16, started: &Instant, bytes: u64) {
    let latency_ms = started.elapsed().as_millis() as u64;
    tracing::info!(
        request_id = %meta.request_id,
        method = %meta.method,
        path = %meta.path,
        status,
        latency_ms,
        route_id = %meta.route_id,
        key_id = %meta.key_id,
        "request"
    );
    let event = pipeline.build_event(meta, status, latency_ms, bytes);
    pipeline.record(event);
}

fn parse_request_head(data: &[u8]) -> Result<Option<(usize, ParsedRequest)>, httparse::Error> {
    let mut headers_raw = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers_raw);
    let head_len = match req.parse(data)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };

    let method = req.method.unwrap_or("GET").to_string();
    let uri = req.path.unwrap_or("/").to_string();

    let mut headers = Vec::with_capacity(req.headers.len());
    let mut keep_alive = true;
    for h in req.headers.iter() {
        if h.name.is_empty() {
            break;
        }
        let value = std::str::from_utf8(h.value).unwrap_or("").to_string();
        if h.name.eq_ignore_ascii_case("connection") {
            keep_alive = !value.eq_ignore_ascii_case("close");
        }
        headers.push((h.name.to_string(), value));
    }

    let (path, query) = split_uri(&uri);
    Ok(Some((
        head_len,
        ParsedRequest {
            parts: RequestParts {
                method,
                path,
                query,
                headers,
                body: Vec::new(),
            },
            keep_alive,
        },
    )))
}

/// Split a request target into path and parsed query pairs.
fn split_uri(uri: &str) -> (String, Vec<(String, String)>) {
    match uri.split_once('?') {
        None => (uri.to_string(), Vec::new()),
        Some((path, qs)) => {
            let query = qs
                .split('&')
                .filter(|part| !part.is_empty())
                .map(|part| match part.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (part.to_string(), String::new()),
                })
                .collect();
            (path.to_string(), query)
        }
    }
}

async fn write_response(
    client: &mut TcpStream,
    wire_buf: &mut Vec<u8>,
    response: &ResponseParts,
    keep_alive: bool,
) -> std::io::Result<()> {
    build_response(wire_buf, response, keep_alive);
    let (res, _) = client.write_all(wire_buf.clone()).await;
    res.map(|_| ())
}

async fn write_simple_error(
    client: &mut TcpStream,
    status: u16,
    message: &str,
) -> std::io::Result<()> {
    let body = format!(r#"{{"error":{{"code":"malformed_request","message":"{}"}}}}"#, message);
    let head = format!(
        "HTTP/1.1 {} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        status,
        crate::dispatch::status_text(status),
        body.len(),
        body
    );
    let (res, _) = client.write_all(head.into_bytes()).await;
    res.map(|_| ())
}

async fn connect_upstream(addr: &str, timeout: Duration) -> Result<TcpStream, GatewayError> {
    match monoio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(GatewayError::UpstreamUnreachable(format!("{}: {}", addr, e))),
        Err(_) => Err(GatewayError::UpstreamTimeout),
    }
}

/// The gateway-added headers for a streamed response head.
fn gateway_headers(meta: &RequestMeta) -> Vec<(String, String)> {
    let mut probe = ResponseParts {
        status: 200,
        headers: Vec::new(),
        body: Vec::new(),
    };
    decorate_response(&mut probe, meta);
    probe.headers
}

/// Remaining per-attempt budget under the overall request deadline.
/// An exhausted deadline surfaces as an upstream timeout (504).
fn attempt_budget(attempt: Duration, deadline: Instant) -> Result<Duration, GatewayError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(GatewayError::UpstreamTimeout);
    }
    Ok(attempt.min(left))
}

/// Dispatch a planned request to its upstream and relay the response.
///
/// The buffered path runs under `deadline` (the overall request deadline);
/// streaming bodies are exempt once the head is written, since SSE/ws
/// streams legitimately outlive any per-request bound.
#[allow(clippy::too_many_arguments)]
async fn forward(
    client: &mut TcpStream,
    plan: ForwardPlan,
    pipeline: &Pipeline,
    pool: &Rc<RefCell<ConnPool>>,
    client_ip: &str,
    max_body: usize,
    client_keep_alive: bool,
    deadline: Instant,
) -> Result<ForwardResult, GatewayError> {
    let ForwardPlan {
        snapshot,
        route_index,
        request,
        upstream: upstream_cfg,
        protocol,
        mut scope,
        meta,
    } = plan;
    let route = &snapshot.routes()[route_index];

    let endpoint = upstream_cfg.endpoint()?;
    if endpoint.tls {
        return Err(GatewayError::UpstreamUnreachable(format!(
            "upstream {} requires TLS, which terminates ahead of the gateway",
            upstream_cfg.id
        )));
    }

    let mut req_buf = Vec::with_capacity(2048);
    build_upstream_request(
        &mut req_buf,
        &request,
        &endpoint,
        &upstream_cfg,
        client_ip,
        &meta.request_id,
    );

    let attempt_timeout = upstream_cfg.timeout();
    let idle_timeout = upstream_cfg.idle_conn_timeout();

    let pooled = pool.borrow_mut().take(&endpoint.addr, idle_timeout);
    let mut upstream = match pooled {
        Some(stream) => stream,
        None => connect_upstream(&endpoint.addr, attempt_budget(attempt_timeout, deadline)?).await?,
    };

    // Send; a stale pooled connection gets one fresh retry.
    let (res, _) = upstream.write_all(req_buf.clone()).await;
    if res.is_err() {
        upstream = connect_upstream(&endpoint.addr, attempt_budget(attempt_timeout, deadline)?).await?;
        let (res, _) = upstream.write_all(req_buf.clone()).await;
        res.map_err(|e| GatewayError::UpstreamUnreachable(e.to_string()))?;
    }

    // ── Read the response head ──
    let mut acc: Vec<u8> = Vec::with_capacity(8 * 1024);
    let mut buf = vec![0u8; 16 * 1024];
    let head = loop {
        let budget = attempt_budget(attempt_timeout, deadline)?;
        let (res, returned) = match monoio::time::timeout(budget, upstream.read(buf)).await {
            Ok(out) => out,
            Err(_) => return Err(GatewayError::UpstreamTimeout),
        };
        buf = returned;
        let n = res.map_err(|e| GatewayError::UpstreamUnreachable(e.to_string()))?;
        if n == 0 {
            return Err(GatewayError::UpstreamProtocolError(
                "upstream closed before sending a response".into(),
            ));
        }
        acc.extend_from_slice(&buf[..n]);
        match parse_response_head(&acc)
            .map_err(|e| GatewayError::UpstreamProtocolError(e.to_string()))?
        {
            Some(head) => break head,
            None if acc.len() > MAX_HEAD_BYTES => {
                return Err(GatewayError::UpstreamProtocolError(
                    "upstream response head too large".into(),
                ));
            }
            None => {}
        }
    };

    // ── WebSocket upgrade: forward the raw head and tunnel ──
    if head.status == 101 && (protocol == Protocol::Ws || is_websocket_upgrade(&request)) {
        let raw = acc.clone();
        let (res, _) = client.write_all(raw).await;
        if res.is_err() {
            return Err(GatewayError::ClientCancelled);
        }
        return Ok(ForwardResult::Upgrade {
            upstream,
            status: 101,
        });
    }

    // ── Streaming: copy through with no end-to-end buffering ──
    if crate::dispatch::wants_streaming(protocol, &head) {
        let mut head_buf = Vec::with_capacity(1024);
        build_streaming_head(&mut head_buf, &head, &gateway_headers(&meta));
        let (res, _) = client.write_all(head_buf).await;
        if res.is_err() {
            return Err(GatewayError::ClientCancelled);
        }

        let mut written: u64 = 0;
        let mut detector = ChunkedEndDetector::new();
        let mut remaining = head.content_length;

        let initial = acc[head.head_len..].to_vec();
        let mut done = initial.is_empty() && head.content_length == Some(0);
        if !initial.is_empty() {
            written += initial.len() as u64;
            if head.chunked && detector.push(&initial) {
                done = true;
            }
            if let Some(cl) = remaining.as_mut() {
                *cl = cl.saturating_sub(initial.len());
                if *cl == 0 {
                    done = true;
                }
            }
            let (res, _) = client.write_all(initial).await;
            if res.is_err() {
                return Err(GatewayError::ClientCancelled);
            }
        }

        while !done {
            let (res, returned) = upstream.read(buf).await;
            buf = returned;
            let n = match res {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "Upstream read failed mid-stream");
                    break;
                }
            };
            let chunk = buf[..n].to_vec();
            written += n as u64;
            if head.chunked && detector.push(&chunk) {
                done = true;
            }
            if let Some(cl) = remaining.as_mut() {
                *cl = cl.saturating_sub(n);
                if *cl == 0 {
                    done = true;
                }
            }
            // Write-through per chunk; TCP_NODELAY keeps per-event latency low.
            let (res, _) = client.write_all(chunk).await;
            if res.is_err() {
                return Err(GatewayError::ClientCancelled);
            }
        }

        return Ok(ForwardResult::Streamed {
            status: head.status,
            response_bytes: written,
        });
    }

    // ── Buffered: read fully, transform, re-frame ──
    let mut body = acc[head.head_len..].to_vec();
    match head.content_length {
        Some(cl) => {
            if cl > max_body {
                return Err(GatewayError::BodyTooLarge);
            }
            while body.len() < cl {
                let budget = attempt_budget(attempt_timeout, deadline)?;
                let (res, returned) = match monoio::time::timeout(budget, upstream.read(buf)).await
                {
                    Ok(out) => out,
                    Err(_) => return Err(GatewayError::UpstreamTimeout),
                };
                buf = returned;
                let n = res.map_err(|e| GatewayError::UpstreamUnreachable(e.to_string()))?;
                if n == 0 {
                    return Err(GatewayError::UpstreamProtocolError(
                        "upstream body truncated".into(),
                    ));
                }
                body.extend_from_slice(&buf[..n]);
            }
            body.truncate(cl);
        }
        None => {
            // Connection-close delimited.
            loop {
                let budget = attempt_budget(attempt_timeout, deadline)?;
                let (res, returned) = match monoio::time::timeout(budget, upstream.read(buf)).await
                {
                    Ok(out) => out,
                    Err(_) => return Err(GatewayError::UpstreamTimeout),
                };
                buf = returned;
                let n = res.map_err(|e| GatewayError::UpstreamUnreachable(e.to_string()))?;
                if n == 0 {
                    break;
                }
                body.extend_from_slice(&buf[..n]);
                if body.len() > max_body {
                    return Err(GatewayError::BodyTooLarge);
                }
            }
        }
    }
    if body.len() > max_body {
        return Err(GatewayError::BodyTooLarge);
    }

    let reusable = head.keep_alive && head.content_length.is_some();
    let mut response = ResponseParts {
        status: head.status,
        headers: head
            .headers
            .iter()
            .filter(|(name, _)| !crate::dispatch::is_hop_by_hop(name))
            .cloned()
            .collect(),
        body,
    };

    // ── [7] Response transform (buffered only) ──
    pipeline.transform_response(route, &mut response, &mut scope)?;
    decorate_response(&mut response, &meta);

    let mut wire = Vec::with_capacity(response.body.len() + 512);
    build_response(&mut wire, &response, client_keep_alive);
    let response_bytes = response.body.len() as u64;
    let (res, _) = client.write_all(wire).await;
    if res.is_err() {
        return Err(GatewayError::ClientCancelled);
    }

    Ok(ForwardResult::Buffered {
        status: response.status,
        response_bytes,
        reuse_upstream: reusable.then(|| (endpoint.addr.clone(), upstream)),
    })
}

/// Bidirectional byte tunnel for upgraded (WebSocket) connections.
/// Returns bytes copied upstream→client for usage accounting.
async fn tunnel(client: TcpStream, upstream: TcpStream) -> u64 {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let downstream = monoio::spawn(async move {
        let mut copied: u64 = 0;
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let (res, returned) = upstream_read.read(buf).await;
            buf = returned;
            let n = match res {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            copied += n as u64;
            let (res, _) = client_write.write_all(buf[..n].to_vec()).await;
            if res.is_err() {
                break;
            }
        }
        copied
    });

    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let (res, returned) = client_read.read(buf).await;
        buf = returned;
        let n = match res {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let (res, _) = upstream_write.write_all(buf[..n].to_vec()).await;
        if res.is_err() {
            break;
        }
    }

    downstream.await
}
