use super::{ClientResponse, Fetching, ProxyClient};
use crate::base::neterror::NetError;
use crate::socket::client::SocketType;
use crate::socket::connectjob::ConnectJob;
use crate::socket::pool::GroupId;
use crate::socket::proxy::ProxySettings;
use crate::socket::tls::TlsOptions;
use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::Empty;
use hyper::client::conn::http1;
use hyper::header::{self, HeaderValue};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;

/// Tuning for [`PooledDispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub proxy: ProxySettings,
    /// Cap on pooled connections per (scheme, host, port) group.
    pub max_connections: usize,
    /// How long an idle pooled connection stays eligible for reuse.
    pub keep_alive: Duration,
    /// Deadline for response headers after the request is written.
    pub headers_timeout: Duration,
    /// Deadline for draining a response body.
    pub body_timeout: Duration,
    /// TLS profile for the proxy leg.
    pub proxy_tls: TlsOptions,
    /// TLS profile for tunneled request legs.
    pub request_tls: TlsOptions,
}

impl DispatcherConfig {
    /// Benchmark profile: 50 connections, 30 second timeouts, certificate
    /// verification off, 5 second TLS session cache on both legs.
    pub fn new(proxy: ProxySettings) -> Self {
        Self {
            proxy,
            max_connections: 50,
            keep_alive: Duration::from_secs(30),
            headers_timeout: Duration::from_secs(30),
            body_timeout: Duration::from_secs(30),
            proxy_tls: TlsOptions::insecure(Duration::from_secs(5)),
            request_tls: TlsOptions::insecure(Duration::from_secs(5)),
        }
    }
}

/// One established hyper connection plus its driver task.
struct PooledConn {
    sender: http1::SendRequest<Empty<Bytes>>,
    driver: JoinHandle<()>,
    parked_at: Instant,
    is_tls: bool,
}

impl PooledConn {
    fn shutdown(self) {
        // Dropping the sender closes the connection; aborting the driver
        // reaps the task without waiting for the peer.
        drop(self.sender);
        self.driver.abort();
    }
}

struct ConnGroup {
    idle: VecDeque<PooledConn>,
    active_count: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl ConnGroup {
    fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            active_count: 0,
            waiters: VecDeque::new(),
        }
    }

    fn total_slots(&self) -> usize {
        self.active_count + self.idle.len()
    }
}

struct DispatcherInner {
    config: DispatcherConfig,
    groups: DashMap<GroupId, ConnGroup>,
    closed: AtomicBool,
}

/// Client A: hyper connections checked out of a capped shared pool.
///
/// Connections park at the cold end and check out oldest-first. Callers
/// over the cap queue until a connection is released. [`close`] tears the
/// pool down; afterwards every call fails with
/// [`NetError::ClientClosed`].
///
/// [`close`]: PooledDispatcher::close
pub struct PooledDispatcher {
    inner: Arc<DispatcherInner>,
}

impl PooledDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                groups: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Tear down the pool.
    ///
    /// Idle connections shut down immediately, leases in flight discard
    /// when they resolve, queued callers wake up and fail. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for mut entry in self.inner.groups.iter_mut() {
            let group = entry.value_mut();
            for conn in group.idle.drain(..) {
                conn.shutdown();
            }
            // Dropping the senders resolves the waiters' receivers with an
            // error; their retry loop then observes the closed flag.
            group.waiters.clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Connections currently parked for reuse.
    pub fn idle_connections(&self) -> usize {
        self.inner.groups.iter().map(|g| g.idle.len()).sum()
    }

    /// Connections currently leased out.
    pub fn active_connections(&self) -> usize {
        self.inner.groups.iter().map(|g| g.active_count).sum()
    }
}

impl ProxyClient for PooledDispatcher {
    fn get(&self, target: &Url) -> Fetching {
        let inner = Arc::clone(&self.inner);
        let target = target.clone();
        Box::pin(async move { fetch(inner, target).await })
    }

    fn label(&self) -> &'static str {
        "dispatcher"
    }
}

async fn fetch(inner: Arc<DispatcherInner>, target: Url) -> Result<ClientResponse, NetError> {
    if inner.closed.load(Ordering::SeqCst) {
        return Err(NetError::ClientClosed);
    }
    let group_id = GroupId::from_url(&target).ok_or(NetError::InvalidUrl)?;
    let mut lease = checkout(&inner, &group_id, &target).await?;

    let host = target.host_str().ok_or(NetError::InvalidUrl)?;
    let port = target.port_or_known_default().ok_or(NetError::InvalidUrl)?;
    let tunneled = target.scheme() == "https";

    // Requests riding the proxy connection directly use the absolute form
    // and re-present credentials; inside a CONNECT tunnel the request line
    // reverts to origin-form and the tunnel itself is already authorized.
    let uri: hyper::Uri = if tunneled {
        origin_form(&target).parse().map_err(|_| NetError::InvalidUrl)?
    } else {
        target.as_str().parse().map_err(|_| NetError::InvalidUrl)?
    };

    let mut builder = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(header::HOST, format!("{}:{}", host, port));
    if !tunneled {
        if let Some(auth) = inner.config.proxy.get_auth_header() {
            let value =
                HeaderValue::from_str(&auth).map_err(|_| NetError::ProxyConnectionFailed)?;
            builder = builder.header(header::PROXY_AUTHORIZATION, value);
        }
    }
    let req = builder
        .body(Empty::<Bytes>::new())
        .map_err(|_| NetError::InvalidUrl)?;

    let send = lease.sender_mut()?.send_request(req);
    let resp = match tokio::time::timeout(inner.config.headers_timeout, send).await {
        // Dropping the lease here discards the half-used connection.
        Err(_) => return Err(NetError::HeadersTimedOut),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "dispatcher request failed");
            return Err(NetError::ConnectionFailed);
        }
        Ok(Ok(resp)) => resp,
    };

    if resp.status() == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        return Err(NetError::ProxyAuthRequested);
    }

    let (parts, body) = resp.into_parts();
    Ok(ClientResponse::streamed(
        parts.status,
        parts.version,
        parts.headers,
        body,
        lease,
        inner.config.body_timeout,
    ))
}

fn origin_form(target: &Url) -> String {
    match target.query() {
        Some(q) => format!("{}?{}", target.path(), q),
        None => target.path().to_string(),
    }
}

fn idle_bound(config: &DispatcherConfig, is_tls: bool) -> Duration {
    // TLS-backed connections are additionally capped by the session cache
    // lifetime.
    if is_tls {
        config.keep_alive.min(config.request_tls.session_timeout)
    } else {
        config.keep_alive
    }
}

enum Plan {
    Reuse(PooledConn),
    Dial,
    Wait(oneshot::Receiver<()>),
}

async fn checkout(
    inner: &Arc<DispatcherInner>,
    group_id: &GroupId,
    target: &Url,
) -> Result<ConnLease, NetError> {
    loop {
        if inner.closed.load(Ordering::SeqCst) {
            return Err(NetError::ClientClosed);
        }

        // Decide under the group lock, act after it drops.
        let plan = {
            let mut group = inner
                .groups
                .entry(group_id.clone())
                .or_insert_with(ConnGroup::new);

            let mut reusable = None;
            while let Some(conn) = group.idle.pop_front() {
                if conn.parked_at.elapsed() >= idle_bound(&inner.config, conn.is_tls)
                    || conn.sender.is_closed()
                {
                    conn.shutdown();
                    continue;
                }
                reusable = Some(conn);
                break;
            }

            match reusable {
                Some(conn) => {
                    group.active_count += 1;
                    Plan::Reuse(conn)
                }
                None if group.total_slots() < inner.config.max_connections => {
                    group.active_count += 1;
                    Plan::Dial
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    group.waiters.push_back(tx);
                    Plan::Wait(rx)
                }
            }
        };

        match plan {
            Plan::Reuse(conn) => {
                return Ok(ConnLease::new(Arc::clone(inner), group_id.clone(), conn))
            }
            Plan::Dial => match dial(inner, target).await {
                Ok(conn) => return Ok(ConnLease::new(Arc::clone(inner), group_id.clone(), conn)),
                Err(e) => {
                    release_slot(inner, group_id);
                    return Err(e);
                }
            },
            Plan::Wait(rx) => {
                // Woken when a connection parks or a slot frees; loop and
                // compete again. A dropped sender also wakes us, and the
                // closed check at the top handles teardown.
                let _ = rx.await;
            }
        }
    }
}

async fn dial(inner: &Arc<DispatcherInner>, target: &Url) -> Result<PooledConn, NetError> {
    let socket = ConnectJob::connect(
        target,
        &inner.config.proxy,
        &inner.config.proxy_tls,
        &inner.config.request_tls,
    )
    .await?;
    let is_tls = matches!(socket, SocketType::Ssl(_));

    let io = TokioIo::new(socket);
    let (sender, conn) = http1::handshake(io)
        .await
        .map_err(|_| NetError::ConnectionFailed)?;
    let driver = tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "pooled connection error");
        }
    });

    Ok(PooledConn {
        sender,
        driver,
        parked_at: Instant::now(),
        is_tls,
    })
}

/// Give back a slot without giving back a connection, waking one waiter.
fn release_slot(inner: &DispatcherInner, group_id: &GroupId) {
    let waiter = {
        let Some(mut group) = inner.groups.get_mut(group_id) else {
            return;
        };
        group.active_count = group.active_count.saturating_sub(1);
        group.waiters.pop_front()
    };
    if let Some(w) = waiter {
        let _ = w.send(());
    }
}

/// Exclusive lease on one pooled connection.
///
/// [`release`](Self::release) parks the connection for reuse. Dropping
/// the lease instead tears the connection down, which is what a caller
/// abandoning a response mid-body wants.
pub(crate) struct ConnLease {
    inner: Arc<DispatcherInner>,
    group_id: GroupId,
    conn: Option<PooledConn>,
}

impl ConnLease {
    fn new(inner: Arc<DispatcherInner>, group_id: GroupId, conn: PooledConn) -> Self {
        Self {
            inner,
            group_id,
            conn: Some(conn),
        }
    }

    fn sender_mut(&mut self) -> Result<&mut http1::SendRequest<Empty<Bytes>>, NetError> {
        self.conn
            .as_mut()
            .map(|c| &mut c.sender)
            .ok_or(NetError::SocketNotConnected)
    }

    /// Park the connection for the next caller.
    pub(crate) fn release(mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };

        if self.inner.closed.load(Ordering::SeqCst) || conn.sender.is_closed() {
            conn.shutdown();
            release_slot(&self.inner, &self.group_id);
            return;
        }

        conn.parked_at = Instant::now();
        let waiter = {
            let mut group = self
                .inner
                .groups
                .entry(self.group_id.clone())
                .or_insert_with(ConnGroup::new);
            group.active_count = group.active_count.saturating_sub(1);
            group.idle.push_back(conn);
            group.waiters.pop_front()
        };
        if let Some(w) = waiter {
            let _ = w.send(());
        }
    }
}

impl Drop for ConnLease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.shutdown();
            release_slot(&self.inner, &self.group_id);
        }
    }
}
