use crate::base::neterror::NetError;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use url::Url;

#[derive(Debug, Default)]
struct OriginStats {
    hits: AtomicUsize,
    connections: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Minimal HTTP/1.1 origin: every request gets the same JSON greeting.
///
/// Binds an ephemeral localhost port so parallel runs never collide, and
/// counts hits, accepted connections, and the high-water mark of
/// concurrently served requests so callers can assert on traffic shape.
pub struct OriginServer {
    addr: SocketAddr,
    url: Url,
    payload: Bytes,
    stats: Arc<OriginStats>,
    accept_task: JoinHandle<()>,
}

impl OriginServer {
    /// Bind to an ephemeral localhost port and start serving.
    pub async fn bind() -> Result<Self, NetError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let url = Url::parse(&format!("http://{}", addr))?;
        let payload = Bytes::from(serde_json::json!({"hello": "world"}).to_string());
        let stats = Arc::new(OriginStats::default());

        let accept_stats = Arc::clone(&stats);
        let accept_payload = payload.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::debug!(error = %e, "origin accept failed");
                        continue;
                    }
                };
                accept_stats.connections.fetch_add(1, Ordering::Relaxed);

                let io = TokioIo::new(stream);
                let conn_stats = Arc::clone(&accept_stats);
                let conn_payload = accept_payload.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let stats = Arc::clone(&conn_stats);
                        let payload = conn_payload.clone();
                        async move {
                            let current = stats.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
                            stats.max_in_flight.fetch_max(current, Ordering::Relaxed);
                            stats.hits.fetch_add(1, Ordering::Relaxed);
                            // Drain the request body so keep-alive survives
                            // non-empty requests.
                            let _ = req.into_body().collect().await;
                            let resp = greeting(payload);
                            stats.in_flight.fetch_sub(1, Ordering::Relaxed);
                            Ok::<_, Infallible>(resp)
                        }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        tracing::debug!(error = %e, "origin connection error");
                    }
                });
            }
        });

        Ok(Self {
            addr,
            url,
            payload,
            stats,
            accept_task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The exact body bytes every response carries.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Requests served so far.
    pub fn hits(&self) -> usize {
        self.stats.hits.load(Ordering::Relaxed)
    }

    /// TCP connections accepted so far.
    pub fn connections(&self) -> usize {
        self.stats.connections.load(Ordering::Relaxed)
    }

    /// Highest number of requests observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.stats.max_in_flight.load(Ordering::Relaxed)
    }

    /// Stop accepting new connections. Established connections die when
    /// their peers hang up.
    pub fn close(&self) {
        self.accept_task.abort();
    }
}

impl Drop for OriginServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

fn greeting(payload: Bytes) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(payload));
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    resp
}
