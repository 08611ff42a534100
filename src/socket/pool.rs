use crate::base::neterror::NetError;
use crate::socket::client::{SocketType, StreamSocket};
use crate::socket::connectjob::ConnectJob;
use crate::socket::proxy::ProxySettings;
use crate::socket::tls::TlsOptions;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use url::Url;

/// Limits and TLS profiles for a socket pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Socket cap per (scheme, host, port) group.
    pub max_sockets_per_group: usize,
    /// How long a parked socket may wait before it is considered stale.
    pub idle_timeout: Duration,
    /// TLS profile for the proxy leg.
    pub proxy_tls: TlsOptions,
    /// TLS profile for tunneled request legs.
    pub request_tls: TlsOptions,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sockets_per_group: 6,
            idle_timeout: Duration::from_secs(300),
            proxy_tls: TlsOptions::default(),
            request_tls: TlsOptions::default(),
        }
    }
}

impl PoolConfig {
    /// Reuse bound for a parked socket. TLS-backed sockets are additionally
    /// capped by the session cache lifetime.
    fn idle_limit(&self, socket: &SocketType) -> Duration {
        match socket {
            SocketType::Ssl(_) => self.idle_timeout.min(self.request_tls.session_timeout),
            SocketType::Tcp(_) => self.idle_timeout,
        }
    }
}

/// Identifies a connection group (scheme, host, port).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct GroupId {
    scheme: String,
    host: String,
    port: u16,
}

impl GroupId {
    pub(crate) fn from_url(url: &Url) -> Option<Self> {
        Some(GroupId {
            scheme: url.scheme().to_string(),
            host: url.host_str()?.to_string(),
            port: url.port_or_known_default()?,
        })
    }
}

/// A socket request waiting for a slot, served in arrival order.
struct PendingRequest {
    sender: oneshot::Sender<Result<(SocketType, bool), NetError>>,
    url: Url,
    proxy: ProxySettings,
}

/// Per-group state tracking.
struct Group {
    idle_sockets: VecDeque<IdleSocket>,
    active_count: usize,
    pending_requests: VecDeque<PendingRequest>,
}

/// Idle socket with metadata for timeout tracking.
struct IdleSocket {
    socket: SocketType,
    /// When this socket was returned to the pool
    parked_at: Instant,
}

impl Group {
    fn new() -> Self {
        Self {
            idle_sockets: VecDeque::new(),
            active_count: 0,
            pending_requests: VecDeque::new(),
        }
    }

    fn total_slots(&self) -> usize {
        self.active_count + self.idle_sockets.len()
    }

    fn has_available_slot(&self, max_per_group: usize) -> bool {
        self.total_slots() < max_per_group
    }
}

enum Acquire {
    Reuse(SocketType),
    Dial,
    Wait(oneshot::Receiver<Result<(SocketType, bool), NetError>>),
}

/// Manages a pool of proxied sockets with per-group limits.
///
/// Checkout prefers the most recently parked socket, so under a steady
/// sequential load the same warm connection is handed back every time.
/// Expired or dead entries are evicted lazily when checkout walks past
/// them; there is no background sweeper.
#[derive(Clone)]
pub struct ClientSocketPool {
    config: PoolConfig,
    groups: Arc<DashMap<GroupId, Group>>,
    total_active: Arc<AtomicUsize>,
}

impl std::fmt::Debug for ClientSocketPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSocketPool")
            .field("max_sockets_per_group", &self.config.max_sockets_per_group)
            .field("idle_timeout", &self.config.idle_timeout)
            .field("total_active", &self.total_active.load(Ordering::Relaxed))
            .finish()
    }
}

impl ClientSocketPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            groups: Arc::new(DashMap::new()),
            total_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Request a socket to `url` through `proxy`.
    ///
    /// Returns the socket and whether it was reused from the pool. If the
    /// group is at its cap the request queues and is fulfilled when a
    /// socket is released.
    pub async fn request_socket(
        &self,
        url: &Url,
        proxy: &ProxySettings,
    ) -> Result<(SocketType, bool), NetError> {
        let group_id = GroupId::from_url(url).ok_or(NetError::InvalidUrl)?;

        match self.acquire(&group_id, url, proxy) {
            Acquire::Reuse(socket) => Ok((socket, true)),
            Acquire::Dial => self.dial(&group_id, url, proxy).await.map(|s| (s, false)),
            Acquire::Wait(rx) => rx.await.map_err(|_| NetError::ConnectionAborted)?,
        }
    }

    /// Decide under the group lock, act after it drops. Reused sockets and
    /// claimed dial slots are accounted active before the lock releases.
    fn acquire(&self, group_id: &GroupId, url: &Url, proxy: &ProxySettings) -> Acquire {
        let mut group = self.groups.entry(group_id.clone()).or_insert_with(Group::new);

        // 1. Check for a parked socket, newest first
        while let Some(idle) = group.idle_sockets.pop_back() {
            if idle.parked_at.elapsed() >= self.config.idle_limit(&idle.socket) {
                continue; // Expired, drop it
            }
            if !idle.socket.is_connected_and_idle() {
                continue; // Dead or poisoned, drop it
            }
            group.active_count += 1;
            self.total_active.fetch_add(1, Ordering::Relaxed);
            return Acquire::Reuse(idle.socket);
        }

        // 2. Claim a fresh slot if the cap allows
        if group.has_available_slot(self.config.max_sockets_per_group) {
            group.active_count += 1;
            self.total_active.fetch_add(1, Ordering::Relaxed);
            return Acquire::Dial;
        }

        // 3. Queue behind the cap
        let (tx, rx) = oneshot::channel();
        group.pending_requests.push_back(PendingRequest {
            sender: tx,
            url: url.clone(),
            proxy: proxy.clone(),
        });
        Acquire::Wait(rx)
    }

    /// Dial a new connection for a slot already claimed by `acquire`.
    async fn dial(
        &self,
        group_id: &GroupId,
        url: &Url,
        proxy: &ProxySettings,
    ) -> Result<SocketType, NetError> {
        match ConnectJob::connect(url, proxy, &self.config.proxy_tls, &self.config.request_tls)
            .await
        {
            Ok(socket) => Ok(socket),
            Err(e) => {
                // The claimed slot goes back, possibly to a waiter
                self.release_claim(group_id);
                Err(e)
            }
        }
    }

    /// Release a socket back to the pool.
    ///
    /// A waiting request gets the socket directly, keeping the slot
    /// claimed; otherwise the socket parks at the warm end of the idle
    /// list.
    pub fn release_socket(&self, url: &Url, socket: SocketType) {
        // A peer that hung up, or left unread bytes behind, poisons reuse.
        if !socket.is_connected_and_idle() {
            self.discard_socket(url);
            return;
        }

        let Some(group_id) = GroupId::from_url(url) else {
            return;
        };

        let mut group = self.groups.entry(group_id).or_insert_with(Group::new);
        let mut socket = socket;
        while let Some(request) = group.pending_requests.pop_front() {
            match request.sender.send(Ok((socket, true))) {
                Ok(()) => return,
                Err(payload) => {
                    // Waiter gave up; reclaim the socket for the next one
                    let Ok((returned, _)) = payload else { return };
                    socket = returned;
                }
            }
        }

        group.active_count = group.active_count.saturating_sub(1);
        self.total_active.fetch_sub(1, Ordering::Relaxed);
        group.idle_sockets.push_back(IdleSocket {
            socket,
            parked_at: Instant::now(),
        });
    }

    /// Drop an active socket without returning it to the pool.
    pub fn discard_socket(&self, url: &Url) {
        let Some(group_id) = GroupId::from_url(url) else {
            return;
        };
        self.release_claim(&group_id);
    }

    /// Give a claimed slot back. The oldest waiter, if any, takes it over
    /// on a fresh dial.
    fn release_claim(&self, group_id: &GroupId) {
        let pending = {
            let mut group = self.groups.entry(group_id.clone()).or_insert_with(Group::new);
            group.active_count = group.active_count.saturating_sub(1);
            self.total_active.fetch_sub(1, Ordering::Relaxed);
            group.pending_requests.pop_front()
        };

        if let Some(request) = pending {
            let pool = self.clone();
            tokio::spawn(async move {
                let result = pool.request_socket(&request.url, &request.proxy).await;
                if let Err(payload) = request.sender.send(result) {
                    // Waiter gave up; the dialed socket goes back to the
                    // pool so its slot is not lost
                    if let Ok((socket, _)) = payload {
                        pool.release_socket(&request.url, socket);
                    }
                }
            });
        }
    }

    /// Get total active socket count.
    pub fn active_socket_count(&self) -> usize {
        self.total_active.load(Ordering::Relaxed)
    }

    /// Get total idle socket count across all groups.
    pub fn idle_socket_count(&self) -> usize {
        self.groups.iter().map(|g| g.idle_sockets.len()).sum()
    }

    /// Get number of queued requests for a group.
    pub fn pending_request_count(&self, url: &Url) -> usize {
        GroupId::from_url(url)
            .and_then(|gid| self.groups.get(&gid).map(|g| g.pending_requests.len()))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_id_uses_known_default_ports() {
        let http = Url::parse("http://example.com/hello").unwrap();
        let https = Url::parse("https://example.com/hello").unwrap();
        let explicit = Url::parse("http://example.com:8080/hello").unwrap();

        assert_eq!(GroupId::from_url(&http).unwrap().port, 80);
        assert_eq!(GroupId::from_url(&https).unwrap().port, 443);
        assert_eq!(GroupId::from_url(&explicit).unwrap().port, 8080);
        assert_ne!(
            GroupId::from_url(&http).unwrap(),
            GroupId::from_url(&https).unwrap()
        );
    }

    #[test]
    fn group_slot_accounting() {
        let mut group = Group::new();
        assert!(group.has_available_slot(1));
        group.active_count = 1;
        assert!(!group.has_available_slot(1));
        assert_eq!(group.total_slots(), 1);
    }
}
