//! End-to-end Benchmark Harness Tests
//!
//! Covers:
//! - `BenchContext` wiring both client stacks through the proxy
//! - Report formatting and request accounting after a run
//! - Credential failures surfacing through both stacks
//! - Strictly sequential request scheduling per client

use proxybench::base::context::BenchContext;
use proxybench::base::neterror::NetError;
use proxybench::client::agent::{AgentConfig, KeepAliveAgent};
use proxybench::client::dispatcher::{DispatcherConfig, PooledDispatcher};
use proxybench::client::ProxyClient;
use proxybench::driver::timed_run;
use proxybench::server::origin::OriginServer;
use proxybench::server::proxy::ForwardProxy;
use proxybench::socket::proxy::ProxySettings;
use std::time::Duration;

#[tokio::test]
async fn test_context_runs_both_clients() {
    let ctx = BenchContext::start("username", "password").await.unwrap();

    let report = ctx.run(3).await.unwrap();

    // Every request from both clients crossed the proxy and hit the origin
    assert_eq!(ctx.proxy().forwarded(), 6);
    assert_eq!(ctx.proxy().rejected(), 0);
    assert_eq!(ctx.origin().hits(), 6);

    // One header line, one line per client, fixed format
    let lines = report.lines();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "Results for 3 requests");
    assert!(lines[1].starts_with("agent "));
    assert!(lines[1].ends_with(" ms"));
    assert!(lines[2].starts_with("dispatcher "));
    assert!(lines[2].ends_with(" ms"));

    for timing in report.results() {
        assert!(timing.elapsed > Duration::ZERO);
    }

    ctx.shutdown();
}

#[tokio::test]
async fn test_wrong_credentials_fail_both_clients() {
    let origin = OriginServer::bind().await.unwrap();
    let proxy = ForwardProxy::bind("username", "password").await.unwrap();

    let bad = ProxySettings::new(proxy.url().as_str())
        .unwrap()
        .with_auth("username", "hunter2");
    let dispatcher = PooledDispatcher::new(DispatcherConfig::new(bad.clone()));
    let agent = KeepAliveAgent::new(AgentConfig::new(bad));
    let target = origin.url().join("/hello").unwrap();

    let err = dispatcher.get(&target).await.unwrap_err();
    assert_eq!(err, NetError::ProxyAuthRequested);
    let err = agent.get(&target).await.unwrap_err();
    assert_eq!(err, NetError::ProxyAuthRequested);

    assert_eq!(proxy.rejected(), 2);
    assert_eq!(proxy.forwarded(), 0);
    assert_eq!(origin.hits(), 0);
}

#[tokio::test]
async fn test_sequential_clients_never_overlap() {
    let ctx = BenchContext::start("username", "password").await.unwrap();

    // Each loop drains the body before sending the next request, so the
    // origin never sees more than one request in flight.
    let elapsed = timed_run(ctx.agent(), ctx.target(), 5).await.unwrap();
    assert!(elapsed > Duration::ZERO);
    assert_eq!(ctx.origin().hits(), 5);
    assert_eq!(ctx.origin().max_in_flight(), 1);

    let elapsed = timed_run(ctx.dispatcher(), ctx.target(), 5).await.unwrap();
    assert!(elapsed > Duration::ZERO);
    assert_eq!(ctx.origin().hits(), 10);
    assert_eq!(ctx.origin().max_in_flight(), 1);

    ctx.shutdown();
}

#[tokio::test]
async fn test_greeting_decodes_as_json() {
    #[derive(serde::Deserialize)]
    struct Greeting {
        hello: String,
    }

    let ctx = BenchContext::start("username", "password").await.unwrap();

    let resp = ctx.dispatcher().get(ctx.target()).await.unwrap();
    let content_type = resp.headers().get("content-type").cloned();
    assert_eq!(
        content_type.as_ref().and_then(|v| v.to_str().ok()),
        Some("application/json")
    );

    let greeting: Greeting = resp.json().await.unwrap();
    assert_eq!(greeting.hello, "world");

    ctx.shutdown();
}
