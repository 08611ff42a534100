//! Client Pooling Tests
//!
//! Covers:
//! - `ClientSocketPool` reuse order, passive expiry, and accounting
//! - `PooledDispatcher` connection reuse, caps, and close semantics
//! - `KeepAliveAgent` socket reuse and response framing

use http::StatusCode;
use proxybench::base::neterror::NetError;
use proxybench::client::agent::{AgentConfig, KeepAliveAgent};
use proxybench::client::dispatcher::{DispatcherConfig, PooledDispatcher};
use proxybench::client::ProxyClient;
use proxybench::server::origin::OriginServer;
use proxybench::server::proxy::ForwardProxy;
use proxybench::socket::pool::{ClientSocketPool, PoolConfig};
use proxybench::socket::proxy::ProxySettings;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;

/// Listener that accepts and parks connections without answering them.
async fn parking_listener() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

#[tokio::test]
async fn test_socket_pool_prefers_most_recent_socket() {
    let addr = parking_listener().await;
    let proxy = ProxySettings::new(&format!("http://{}", addr)).unwrap();
    let target = Url::parse("http://origin.example/hello").unwrap();

    let pool = ClientSocketPool::new(PoolConfig {
        max_sockets_per_group: 4,
        idle_timeout: Duration::from_secs(30),
        ..PoolConfig::default()
    });

    // 1. Dial two sockets
    let (s1, reused1) = pool.request_socket(&target, &proxy).await.unwrap();
    let (s2, reused2) = pool.request_socket(&target, &proxy).await.unwrap();
    assert!(!reused1);
    assert!(!reused2);
    let first = s1.local_addr().unwrap();
    let second = s2.local_addr().unwrap();
    assert_ne!(first, second);

    // 2. Park them in order
    pool.release_socket(&target, s1);
    pool.release_socket(&target, s2);
    assert_eq!(pool.idle_socket_count(), 2);
    assert_eq!(pool.active_socket_count(), 0);

    // 3. The most recently parked socket comes back first
    let (s3, reused3) = pool.request_socket(&target, &proxy).await.unwrap();
    assert!(reused3);
    assert_eq!(s3.local_addr().unwrap(), second);
    assert_eq!(pool.idle_socket_count(), 1);
}

#[tokio::test]
async fn test_socket_pool_expires_stale_sockets() {
    let addr = parking_listener().await;
    let proxy = ProxySettings::new(&format!("http://{}", addr)).unwrap();
    let target = Url::parse("http://origin.example/hello").unwrap();

    let pool = ClientSocketPool::new(PoolConfig {
        max_sockets_per_group: 4,
        idle_timeout: Duration::from_millis(50),
        ..PoolConfig::default()
    });

    let (s1, _) = pool.request_socket(&target, &proxy).await.unwrap();
    pool.release_socket(&target, s1);
    assert_eq!(pool.idle_socket_count(), 1);

    tokio::time::sleep(Duration::from_millis(120)).await;

    // Past the reuse window the parked socket is evicted, not handed out
    let (_s2, reused) = pool.request_socket(&target, &proxy).await.unwrap();
    assert!(!reused);
    assert_eq!(pool.idle_socket_count(), 0);
}

#[tokio::test]
async fn test_socket_pool_reclaims_socket_from_vanished_waiter() {
    let addr = parking_listener().await;
    let proxy = ProxySettings::new(&format!("http://{}", addr)).unwrap();
    let target = Url::parse("http://origin.example/hello").unwrap();

    let pool = ClientSocketPool::new(PoolConfig {
        max_sockets_per_group: 1,
        idle_timeout: Duration::from_secs(30),
        ..PoolConfig::default()
    });

    // 1. The only slot is taken, so a second request queues
    let (s1, _) = pool.request_socket(&target, &proxy).await.unwrap();
    let waiter = {
        let pool = pool.clone();
        let target = target.clone();
        let proxy = proxy.clone();
        tokio::spawn(async move { pool.request_socket(&target, &proxy).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.pending_request_count(&target), 1);

    // 2. The waiter gives up before the slot frees
    waiter.abort();
    let _ = waiter.await;

    // 3. Discarding the active socket dials a replacement for the queued
    //    waiter; with the waiter gone the fresh socket parks in the pool
    pool.discard_socket(&target);
    drop(s1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.pending_request_count(&target), 0);
    assert_eq!(pool.idle_socket_count(), 1);
    assert_eq!(pool.active_socket_count(), 0);

    // 4. The parked socket is live and handed out on the next request
    let (s2, reused) = pool.request_socket(&target, &proxy).await.unwrap();
    assert!(reused);
    assert_eq!(s2.peer_addr(), Some(addr));
}

#[tokio::test]
async fn test_dispatcher_reuses_one_connection() {
    let origin = OriginServer::bind().await.unwrap();
    let proxy = ForwardProxy::bind("username", "password").await.unwrap();
    let settings = ProxySettings::new(proxy.url().as_str()).unwrap();

    let dispatcher = PooledDispatcher::new(DispatcherConfig::new(settings));
    let target = origin.url().join("/hello?foo=bar").unwrap();

    for _ in 0..3 {
        let resp = dispatcher.get(&target).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.bytes().await.unwrap();
        assert_eq!(&body[..], br#"{"hello":"world"}"#);
    }

    assert_eq!(proxy.connections(), 1); // all three rode one pooled conn
    assert_eq!(proxy.forwarded(), 3);
    assert_eq!(dispatcher.idle_connections(), 1);
    assert_eq!(dispatcher.active_connections(), 0);
}

#[tokio::test]
async fn test_dispatcher_queues_when_capped() {
    let origin = OriginServer::bind().await.unwrap();
    let proxy = ForwardProxy::bind("username", "password").await.unwrap();
    let settings = ProxySettings::new(proxy.url().as_str()).unwrap();

    let mut config = DispatcherConfig::new(settings);
    config.max_connections = 1;
    let dispatcher = PooledDispatcher::new(config);
    let target = origin.url().join("/hello").unwrap();

    let (a, b) = tokio::join!(
        async {
            let resp = dispatcher.get(&target).await.unwrap();
            resp.bytes().await.unwrap()
        },
        async {
            let resp = dispatcher.get(&target).await.unwrap();
            resp.bytes().await.unwrap()
        },
    );

    assert_eq!(a, b);
    assert_eq!(proxy.connections(), 1); // second caller waited for the slot
    assert_eq!(proxy.forwarded(), 2);
}

#[tokio::test]
async fn test_dispatcher_discards_abandoned_responses() {
    let origin = OriginServer::bind().await.unwrap();
    let proxy = ForwardProxy::bind("username", "password").await.unwrap();
    let settings = ProxySettings::new(proxy.url().as_str()).unwrap();

    let dispatcher = PooledDispatcher::new(DispatcherConfig::new(settings));
    let target = origin.url().join("/hello").unwrap();

    // 1. Drop the response without draining the body
    let resp = dispatcher.get(&target).await.unwrap();
    drop(resp);
    assert_eq!(dispatcher.idle_connections(), 0);
    assert_eq!(dispatcher.active_connections(), 0);

    // 2. The next request has to dial fresh
    let resp = dispatcher.get(&target).await.unwrap();
    resp.bytes().await.unwrap();
    assert_eq!(proxy.connections(), 2);
}

#[tokio::test]
async fn test_dispatcher_close_fails_new_requests() {
    let origin = OriginServer::bind().await.unwrap();
    let proxy = ForwardProxy::bind("username", "password").await.unwrap();
    let settings = ProxySettings::new(proxy.url().as_str()).unwrap();

    let dispatcher = PooledDispatcher::new(DispatcherConfig::new(settings));
    let target = origin.url().join("/hello").unwrap();

    let resp = dispatcher.get(&target).await.unwrap();
    resp.bytes().await.unwrap();
    assert_eq!(dispatcher.idle_connections(), 1);

    dispatcher.close();
    assert!(dispatcher.is_closed());
    assert_eq!(dispatcher.idle_connections(), 0);

    let err = dispatcher.get(&target).await.unwrap_err();
    assert_eq!(err, NetError::ClientClosed);

    // Closing twice is a no-op
    dispatcher.close();
    assert!(dispatcher.is_closed());
}

#[tokio::test]
async fn test_agent_reuses_sockets_across_requests() {
    let origin = OriginServer::bind().await.unwrap();
    let proxy = ForwardProxy::bind("username", "password").await.unwrap();
    let settings = ProxySettings::new(proxy.url().as_str()).unwrap();

    let agent = KeepAliveAgent::new(AgentConfig::new(settings));
    let target = origin.url().join("/hello?foo=bar").unwrap();

    for _ in 0..3 {
        let resp = agent.get(&target).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.bytes().await.unwrap();
        assert_eq!(&body[..], br#"{"hello":"world"}"#);
    }

    assert_eq!(proxy.connections(), 1);
    assert_eq!(agent.idle_sockets(), 1);
    assert_eq!(agent.active_sockets(), 0);
}

#[tokio::test]
async fn test_agent_reads_chunked_bodies() {
    // 1. Raw stand-in for the proxy answering with a chunked body
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 2048];
        let _ = socket.read(&mut buf).await.unwrap();
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n7\r\n{\"hello\r\nA\r\n\":\"world\"}\r\n0\r\n\r\n")
            .await
            .unwrap();
        // Stay open: framing must terminate without an EOF
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(socket);
    });

    let settings = ProxySettings::new(&format!("http://{}", addr)).unwrap();
    let agent = KeepAliveAgent::new(AgentConfig::new(settings));
    let target = Url::parse("http://origin.example/hello").unwrap();

    // 2. Body reassembles across chunk boundaries
    let resp = agent.get(&target).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..], br#"{"hello":"world"}"#);
    assert_eq!(agent.idle_sockets(), 1); // chunked 1.1 reply stays reusable
}

#[tokio::test]
async fn test_agent_rejects_oversized_chunk_sizes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 2048];
        let _ = socket.read(&mut buf).await.unwrap();
        // Size line parses to usize::MAX
        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nhello",
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(socket);
    });

    let settings = ProxySettings::new(&format!("http://{}", addr)).unwrap();
    let agent = KeepAliveAgent::new(AgentConfig::new(settings));
    let target = Url::parse("http://origin.example/hello").unwrap();

    // The decoder must refuse the frame, not overflow its accounting
    let err = agent.get(&target).await.unwrap_err();
    assert_eq!(err, NetError::InvalidChunkedEncoding);
    assert_eq!(agent.idle_sockets(), 0);
}

#[tokio::test]
async fn test_agent_honors_connection_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 2048];
        let _ = socket.read(&mut buf).await.unwrap();
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nhi")
            .await
            .unwrap();
    });

    let settings = ProxySettings::new(&format!("http://{}", addr)).unwrap();
    let agent = KeepAliveAgent::new(AgentConfig::new(settings));
    let target = Url::parse("http://origin.example/hello").unwrap();

    let resp = agent.get(&target).await.unwrap();
    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..], b"hi");
    assert_eq!(agent.idle_sockets(), 0); // close means no reuse
}

#[tokio::test]
async fn test_agent_rejects_conflicting_content_lengths() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 2048];
        let _ = socket.read(&mut buf).await.unwrap();
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nContent-Length: 3\r\n\r\nhi!")
            .await
            .unwrap();
    });

    let settings = ProxySettings::new(&format!("http://{}", addr)).unwrap();
    let agent = KeepAliveAgent::new(AgentConfig::new(settings));
    let target = Url::parse("http://origin.example/hello").unwrap();

    let err = agent.get(&target).await.unwrap_err();
    assert_eq!(err, NetError::ResponseHeadersMultipleContentLength);
}
