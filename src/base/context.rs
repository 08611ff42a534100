use crate::base::neterror::NetError;
use crate::client::agent::{AgentConfig, KeepAliveAgent};
use crate::client::dispatcher::{DispatcherConfig, PooledDispatcher};
use crate::client::ProxyClient;
use crate::driver::report::RunReport;
use crate::driver::timed_run;
use crate::server::origin::OriginServer;
use crate::server::proxy::ForwardProxy;
use crate::socket::proxy::ProxySettings;
use std::sync::Arc;
use url::Url;

/// Path the benchmark requests. The query string rides along to exercise
/// absolute-form forwarding end to end.
pub const TARGET_PATH: &str = "/hello?foo=bar";

/// Owns every moving part of one benchmark run.
///
/// Both servers, both client stacks, and the target URL live in one value
/// so a single owner can stand up the world, drive it, and tear it down.
/// [`shutdown`](Self::shutdown) releases everything explicitly; dropping
/// the context runs the same teardown, so early returns and panics cannot
/// leak the servers or the dispatcher pool.
pub struct BenchContext {
    origin: OriginServer,
    proxy: ForwardProxy,
    dispatcher: Arc<PooledDispatcher>,
    agent: Arc<KeepAliveAgent>,
    target: Url,
}

impl BenchContext {
    /// Stand up the origin and proxy on ephemeral ports and point both
    /// client stacks at them.
    pub async fn start(username: &str, password: &str) -> Result<Self, NetError> {
        let origin = OriginServer::bind().await?;
        let proxy = ForwardProxy::bind(username, password).await?;

        let settings = ProxySettings::new(proxy.url().as_str())?;
        let dispatcher = Arc::new(PooledDispatcher::new(DispatcherConfig::new(
            settings.clone(),
        )));
        let agent = Arc::new(KeepAliveAgent::new(AgentConfig::new(settings)));

        let target = origin.url().join(TARGET_PATH)?;

        Ok(Self {
            origin,
            proxy,
            dispatcher,
            agent,
            target,
        })
    }

    /// Race both clients: one task per stack, `total` strictly sequential
    /// requests each, launched together and joined at the end.
    pub async fn run(&self, total: usize) -> Result<RunReport, NetError> {
        let agent = Arc::clone(&self.agent);
        let agent_target = self.target.clone();
        let agent_task =
            tokio::spawn(async move { timed_run(agent.as_ref(), &agent_target, total).await });

        let dispatcher = Arc::clone(&self.dispatcher);
        let dispatcher_target = self.target.clone();
        let dispatcher_task = tokio::spawn(async move {
            timed_run(dispatcher.as_ref(), &dispatcher_target, total).await
        });

        let (agent_elapsed, dispatcher_elapsed) = tokio::join!(agent_task, dispatcher_task);
        let agent_elapsed = agent_elapsed.map_err(|_| NetError::ConnectionAborted)??;
        let dispatcher_elapsed = dispatcher_elapsed.map_err(|_| NetError::ConnectionAborted)??;

        let mut report = RunReport::new(total);
        report.record(self.agent.label(), agent_elapsed);
        report.record(self.dispatcher.label(), dispatcher_elapsed);
        Ok(report)
    }

    pub fn origin(&self) -> &OriginServer {
        &self.origin
    }

    pub fn proxy(&self) -> &ForwardProxy {
        &self.proxy
    }

    pub fn dispatcher(&self) -> &PooledDispatcher {
        &self.dispatcher
    }

    pub fn agent(&self) -> &KeepAliveAgent {
        &self.agent
    }

    /// Full URL the clients request.
    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Close the dispatcher pool and stop both servers.
    pub fn shutdown(self) {
        self.dispatcher.close();
        self.proxy.close();
        self.origin.close();
        // Drop re-runs the same teardown; every part is idempotent
    }
}

impl Drop for BenchContext {
    fn drop(&mut self) {
        self.dispatcher.close();
        self.proxy.close();
        self.origin.close();
    }
}
