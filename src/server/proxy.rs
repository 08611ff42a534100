use crate::base::neterror::NetError;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1 as client_http1;
use hyper::header::{self, HeaderName, HeaderValue};
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use url::Url;

type ProxyBody = BoxBody<Bytes, hyper::Error>;

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full_body(chunk: &'static str) -> ProxyBody {
    Full::new(Bytes::from_static(chunk.as_bytes()))
        .map_err(|never| match never {})
        .boxed()
}

fn status_response(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    let mut resp = Response::new(full_body(message));
    *resp.status_mut() = status;
    resp
}

#[derive(Debug, Default)]
struct ProxyStats {
    forwarded: AtomicUsize,
    rejected: AtomicUsize,
    connections: AtomicUsize,
}

/// Authenticating HTTP/1.1 forward proxy.
///
/// Accepts absolute-form requests for `http` targets and CONNECT for
/// tunnels. Every request must carry the exact `Proxy-Authorization`
/// credentials the proxy was started with; anything else gets a 407 with
/// a `Proxy-Authenticate` challenge. Relayed bodies pass through
/// untouched, only connection-scoped headers are stripped.
pub struct ForwardProxy {
    addr: SocketAddr,
    url: Url,
    stats: Arc<ProxyStats>,
    accept_task: JoinHandle<()>,
}

impl ForwardProxy {
    /// Bind to an ephemeral localhost port and start proxying.
    pub async fn bind(username: &str, password: &str) -> Result<Self, NetError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        // Clients dial this URL; the userinfo section carries the
        // credentials the proxy expects back.
        let mut url = Url::parse(&format!("http://{}", addr))?;
        let _ = url.set_username(username);
        let _ = url.set_password(Some(password));

        let expected_auth: Arc<str> = {
            use base64::{engine::general_purpose, Engine as _};
            let creds = general_purpose::STANDARD.encode(format!("{}:{}", username, password));
            format!("Basic {}", creds).into()
        };

        let stats = Arc::new(ProxyStats::default());
        let accept_stats = Arc::clone(&stats);
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::debug!(error = %e, "proxy accept failed");
                        continue;
                    }
                };
                accept_stats.connections.fetch_add(1, Ordering::Relaxed);

                let io = TokioIo::new(stream);
                let conn_stats = Arc::clone(&accept_stats);
                let conn_auth = Arc::clone(&expected_auth);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        handle(req, Arc::clone(&conn_stats), Arc::clone(&conn_auth))
                    });
                    // with_upgrades keeps the connection alive for CONNECT
                    let conn = server_http1::Builder::new()
                        .serve_connection(io, service)
                        .with_upgrades();
                    if let Err(e) = conn.await {
                        tracing::debug!(error = %e, "proxy connection error");
                    }
                });
            }
        });

        Ok(Self {
            addr,
            url,
            stats,
            accept_task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Proxy URL with the expected credentials embedded in the userinfo.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Requests relayed upstream (CONNECT tunnels count once).
    pub fn forwarded(&self) -> usize {
        self.stats.forwarded.load(Ordering::Relaxed)
    }

    /// Requests bounced with a 407.
    pub fn rejected(&self) -> usize {
        self.stats.rejected.load(Ordering::Relaxed)
    }

    /// TCP connections accepted from clients.
    pub fn connections(&self) -> usize {
        self.stats.connections.load(Ordering::Relaxed)
    }

    /// Stop accepting new connections.
    pub fn close(&self) {
        self.accept_task.abort();
    }
}

impl Drop for ForwardProxy {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn handle(
    req: Request<Incoming>,
    stats: Arc<ProxyStats>,
    expected_auth: Arc<str>,
) -> Result<Response<ProxyBody>, Infallible> {
    let presented = req
        .headers()
        .get(header::PROXY_AUTHORIZATION)
        .map(HeaderValue::as_bytes);
    if presented != Some(expected_auth.as_bytes()) {
        stats.rejected.fetch_add(1, Ordering::Relaxed);
        let mut resp = Response::new(empty_body());
        *resp.status_mut() = StatusCode::PROXY_AUTHENTICATION_REQUIRED;
        resp.headers_mut().insert(
            header::PROXY_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"proxy\""),
        );
        return Ok(resp);
    }

    if req.method() == Method::CONNECT {
        return Ok(handle_connect(req, &stats).await);
    }

    // Absolute-form requests carry the full target in the request line.
    if req.uri().scheme_str() != Some("http") || req.uri().authority().is_none() {
        return Ok(status_response(
            StatusCode::BAD_REQUEST,
            "absolute-form http URI required",
        ));
    }

    match forward(req, &stats).await {
        Ok(resp) => Ok(resp),
        Err(e) => {
            tracing::debug!(error = %e, "upstream request failed");
            Ok(status_response(StatusCode::BAD_GATEWAY, "bad gateway"))
        }
    }
}

/// Dial the tunnel target, then splice bytes both ways once the client
/// connection upgrades.
async fn handle_connect(req: Request<Incoming>, stats: &ProxyStats) -> Response<ProxyBody> {
    let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
        return status_response(StatusCode::BAD_REQUEST, "CONNECT requires authority form");
    };

    let mut upstream = match TcpStream::connect(authority.as_str()).await {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!(%authority, error = %e, "tunnel dial failed");
            return status_response(StatusCode::BAD_GATEWAY, "tunnel dial failed");
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                    tracing::debug!(error = %e, "tunnel closed with error");
                }
            }
            Err(e) => tracing::debug!(error = %e, "tunnel upgrade failed"),
        }
    });

    stats.forwarded.fetch_add(1, Ordering::Relaxed);
    Response::new(empty_body())
}

/// Relay one absolute-form request upstream and stream the reply back.
async fn forward(
    mut req: Request<Incoming>,
    stats: &ProxyStats,
) -> Result<Response<ProxyBody>, NetError> {
    let authority = req.uri().authority().ok_or(NetError::InvalidUrl)?.clone();
    let dial = format!(
        "{}:{}",
        authority.host(),
        authority.port_u16().unwrap_or(80)
    );

    // Rewrite to origin-form for the upstream leg
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    *req.uri_mut() = path.parse().map_err(|_| NetError::InvalidUrl)?;

    strip_hop_by_hop(req.headers_mut());
    req.headers_mut().insert(
        header::HOST,
        HeaderValue::from_str(authority.as_str()).map_err(|_| NetError::InvalidUrl)?,
    );

    let upstream = TcpStream::connect(dial.as_str()).await?;
    let io = TokioIo::new(upstream);
    let (mut sender, conn) = client_http1::handshake(io)
        .await
        .map_err(|_| NetError::ConnectionFailed)?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "upstream connection error");
        }
    });

    let resp = sender
        .send_request(req)
        .await
        .map_err(|_| NetError::ConnectionFailed)?;
    stats.forwarded.fetch_add(1, Ordering::Relaxed);

    let (mut parts, body) = resp.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Ok(Response::from_parts(parts, body.boxed()))
}

/// Remove connection-scoped headers before relaying. The fixed RFC 9112
/// set plus anything the Connection header names.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }

    for name in [
        header::CONNECTION,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ] {
        headers.remove(name);
    }
    headers.remove("proxy-connection");
    headers.remove("keep-alive");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close, x-custom"));
        headers.insert("x-custom", HeaderValue::from_static("1"));
        headers.insert(header::PROXY_AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        strip_hop_by_hop(&mut headers);

        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("x-custom").is_none());
        assert!(headers.get(header::PROXY_AUTHORIZATION).is_none());
        assert!(headers.get("keep-alive").is_none());
        assert_eq!(
            headers.get(header::CONTENT_TYPE),
            Some(&HeaderValue::from_static("application/json"))
        );
    }
}
