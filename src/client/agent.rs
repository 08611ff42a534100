use super::{ClientResponse, Fetching, ProxyClient};
use crate::base::neterror::NetError;
use crate::socket::client::SocketType;
use crate::socket::pool::{ClientSocketPool, PoolConfig};
use crate::socket::proxy::ProxySettings;
use crate::socket::tls::TlsOptions;
use bytes::{Buf, Bytes, BytesMut};
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode, Version};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

/// Largest response head we will buffer.
const MAX_HEAD: usize = 16 * 1024;
/// Largest chunk-size line we will buffer.
const MAX_CHUNK_LINE: usize = 1024;

/// Tuning for [`KeepAliveAgent`].
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub proxy: ProxySettings,
    /// Socket cap for the agent's pool.
    pub max_sockets: usize,
    /// How long a parked socket stays eligible for reuse.
    pub idle_timeout: Duration,
    /// TLS profile for the proxy leg.
    pub proxy_tls: TlsOptions,
    /// TLS profile for tunneled request legs.
    pub request_tls: TlsOptions,
}

impl AgentConfig {
    /// Benchmark profile: 100 sockets, 30 second reuse window, certificate
    /// verification off, 5 second TLS session cache on both legs.
    pub fn new(proxy: ProxySettings) -> Self {
        Self {
            proxy,
            max_sockets: 100,
            idle_timeout: Duration::from_secs(30),
            proxy_tls: TlsOptions::insecure(Duration::from_secs(5)),
            request_tls: TlsOptions::insecure(Duration::from_secs(5)),
        }
    }
}

/// Client B: a hand-rolled HTTP/1.1 exchange over pooled sockets.
///
/// The agent owns raw sockets rather than protocol state machines. Each
/// request checks the warmest socket out of the pool, writes the request
/// by hand, parses the response head, and reads exactly one framed body
/// before deciding whether the socket survives for the next caller.
pub struct KeepAliveAgent {
    proxy: ProxySettings,
    pool: ClientSocketPool,
}

impl KeepAliveAgent {
    pub fn new(config: AgentConfig) -> Self {
        let pool = ClientSocketPool::new(PoolConfig {
            max_sockets_per_group: config.max_sockets,
            idle_timeout: config.idle_timeout,
            proxy_tls: config.proxy_tls,
            request_tls: config.request_tls,
        });
        Self {
            proxy: config.proxy,
            pool,
        }
    }

    /// Sockets currently parked for reuse.
    pub fn idle_sockets(&self) -> usize {
        self.pool.idle_socket_count()
    }

    /// Sockets currently checked out.
    pub fn active_sockets(&self) -> usize {
        self.pool.active_socket_count()
    }
}

impl ProxyClient for KeepAliveAgent {
    fn get(&self, target: &Url) -> Fetching {
        let pool = self.pool.clone();
        let proxy = self.proxy.clone();
        let target = target.clone();
        Box::pin(async move { fetch(pool, proxy, target).await })
    }

    fn label(&self) -> &'static str {
        "agent"
    }
}

async fn fetch(
    pool: ClientSocketPool,
    proxy: ProxySettings,
    target: Url,
) -> Result<ClientResponse, NetError> {
    let mut attempt = 0;
    loop {
        let (mut socket, reused) = pool.request_socket(&target, &proxy).await?;

        match exchange(&mut socket, &proxy, &target).await {
            Ok(ex) => {
                if ex.head.status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
                    drop(socket);
                    pool.discard_socket(&target);
                    return Err(NetError::ProxyAuthRequested);
                }
                if ex.reusable {
                    pool.release_socket(&target, socket);
                } else {
                    drop(socket);
                    pool.discard_socket(&target);
                }
                return Ok(ClientResponse::buffered(
                    ex.head.status,
                    ex.head.version,
                    ex.head.headers,
                    ex.body,
                ));
            }
            Err(e) => {
                drop(socket);
                pool.discard_socket(&target);
                // A parked socket can die between the liveness probe and
                // our write; retry once on a fresh connection.
                if reused && attempt == 0 && is_stale(&e) {
                    attempt += 1;
                    continue;
                }
                return Err(e);
            }
        }
    }
}

fn is_stale(e: &NetError) -> bool {
    matches!(
        e,
        NetError::ConnectionClosed
            | NetError::ConnectionReset
            | NetError::ConnectionAborted
            | NetError::EmptyResponse
    )
}

/// Everything learned from one request/response exchange.
struct Exchange {
    head: ParsedHead,
    body: Bytes,
    reusable: bool,
}

async fn exchange(
    socket: &mut SocketType,
    proxy: &ProxySettings,
    target: &Url,
) -> Result<Exchange, NetError> {
    let host = target.host_str().ok_or(NetError::InvalidUrl)?;
    let port = target.port_or_known_default().ok_or(NetError::InvalidUrl)?;
    let tunneled = target.scheme() == "https";

    // Requests riding the proxy connection use the absolute form and
    // re-present credentials; inside a CONNECT tunnel the request line
    // reverts to origin-form and the tunnel is already authorized.
    let request_target = if tunneled {
        match target.query() {
            Some(q) => format!("{}?{}", target.path(), q),
            None => target.path().to_string(),
        }
    } else {
        target.as_str().to_string()
    };

    let mut head = format!(
        "GET {} HTTP/1.1\r\nHost: {}:{}\r\nConnection: keep-alive\r\n",
        request_target, host, port
    );
    if !tunneled {
        if let Some(auth) = proxy.get_auth_header() {
            head.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
        }
    }
    head.push_str("\r\n");

    socket.write_all(head.as_bytes()).await?;
    socket.flush().await?;

    // Read up to and including the blank line; whatever follows belongs
    // to the body.
    let mut buf = BytesMut::with_capacity(1024);
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD {
            return Err(NetError::ResponseHeadersTooBig);
        }
        let n = socket.read_buf(&mut buf).await?;
        if n == 0 {
            return if buf.is_empty() {
                Err(NetError::EmptyResponse)
            } else {
                Err(NetError::ConnectionClosed)
            };
        }
    };

    let raw_head = buf.split_to(head_end);
    let parsed = parse_head(&raw_head)?;

    let (body, framed) = match response_framing(&parsed.headers)? {
        Framing::ContentLength(len) => (read_content_length(socket, &mut buf, len).await?, true),
        Framing::Chunked => (read_chunked(socket, &mut buf).await?, true),
        Framing::Eof => (read_to_eof(socket, &mut buf).await?, false),
    };

    // Leftover bytes past the framed body poison the connection.
    let reusable = framed
        && buf.is_empty()
        && match parsed.version {
            Version::HTTP_11 => !connection_has_token(&parsed.headers, "close"),
            // HTTP/1.0 peers must opt in explicitly
            _ => connection_has_token(&parsed.headers, "keep-alive"),
        };

    Ok(Exchange {
        head: parsed,
        body,
        reusable,
    })
}

struct ParsedHead {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

fn parse_head(raw: &[u8]) -> Result<ParsedHead, NetError> {
    let text = std::str::from_utf8(raw).map_err(|_| NetError::InvalidResponse)?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next().ok_or(NetError::InvalidResponse)?;
    let mut parts = status_line.splitn(3, ' ');
    let version = match parts.next() {
        Some("HTTP/1.1") => Version::HTTP_11,
        Some("HTTP/1.0") => Version::HTTP_10,
        _ => return Err(NetError::InvalidResponse),
    };
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or(NetError::InvalidResponse)?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').ok_or(NetError::InvalidResponse)?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| NetError::InvalidResponse)?;
        let value =
            HeaderValue::from_str(value.trim()).map_err(|_| NetError::InvalidResponse)?;
        headers.append(name, value);
    }

    Ok(ParsedHead {
        status,
        version,
        headers,
    })
}

enum Framing {
    ContentLength(usize),
    Chunked,
    Eof,
}

fn response_framing(headers: &HeaderMap) -> Result<Framing, NetError> {
    // Transfer-Encoding wins over Content-Length
    let chunked = headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        return Ok(Framing::Chunked);
    }

    let mut lengths = headers.get_all(header::CONTENT_LENGTH).iter();
    let Some(first) = lengths.next() else {
        return Ok(Framing::Eof);
    };
    // Identical duplicates are tolerated, conflicting ones are not
    if lengths.any(|v| v != first) {
        return Err(NetError::ResponseHeadersMultipleContentLength);
    }
    let len = first
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .ok_or(NetError::InvalidResponse)?;
    Ok(Framing::ContentLength(len))
}

fn connection_has_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

async fn read_content_length(
    socket: &mut SocketType,
    buf: &mut BytesMut,
    len: usize,
) -> Result<Bytes, NetError> {
    while buf.len() < len {
        let n = socket.read_buf(buf).await?;
        if n == 0 {
            return Err(NetError::ContentLengthMismatch);
        }
    }
    Ok(buf.split_to(len).freeze())
}

async fn read_chunked(socket: &mut SocketType, buf: &mut BytesMut) -> Result<Bytes, NetError> {
    let mut body = BytesMut::new();
    loop {
        let line = read_line(socket, buf).await?;
        // Chunk extensions after ';' are ignored
        let size_str = line.split(';').next().unwrap_or("").trim();
        let size =
            usize::from_str_radix(size_str, 16).map_err(|_| NetError::InvalidChunkedEncoding)?;
        if size == 0 {
            break;
        }
        // Chunk data plus its trailing CRLF; a size this close to
        // usize::MAX is hostile framing, not a real chunk
        let needed = size.checked_add(2).ok_or(NetError::InvalidChunkedEncoding)?;
        while buf.len() < needed {
            let n = socket.read_buf(buf).await?;
            if n == 0 {
                return Err(NetError::IncompleteChunkedEncoding);
            }
        }
        body.extend_from_slice(&buf.split_to(size));
        let crlf = buf.split_to(2);
        if &crlf[..] != b"\r\n" {
            return Err(NetError::InvalidChunkedEncoding);
        }
    }

    // Trailer section: lines until the terminating blank one
    loop {
        let line = read_line(socket, buf).await?;
        if line.is_empty() {
            break;
        }
    }

    Ok(body.freeze())
}

async fn read_line(socket: &mut SocketType, buf: &mut BytesMut) -> Result<String, NetError> {
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = buf.split_to(pos);
            buf.advance(2);
            return String::from_utf8(line.to_vec())
                .map_err(|_| NetError::InvalidChunkedEncoding);
        }
        if buf.len() > MAX_CHUNK_LINE {
            return Err(NetError::InvalidChunkedEncoding);
        }
        let n = socket.read_buf(buf).await?;
        if n == 0 {
            return Err(NetError::IncompleteChunkedEncoding);
        }
    }
}

async fn read_to_eof(socket: &mut SocketType, buf: &mut BytesMut) -> Result<Bytes, NetError> {
    loop {
        let n = socket.read_buf(buf).await?;
        if n == 0 {
            return Ok(buf.split().freeze());
        }
    }
}
