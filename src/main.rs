use proxybench::base::context::BenchContext;
use proxybench::base::neterror::NetError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Requests each client runs.
const TOTAL_REQUESTS: usize = 10_000;
/// Credentials the proxy demands on every request.
const PROXY_USERNAME: &str = "username";
const PROXY_PASSWORD: &str = "password";

#[tokio::main]
async fn main() -> Result<(), NetError> {
    // Diagnostics go to stderr; stdout carries only the report lines.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "proxybench=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let ctx = BenchContext::start(PROXY_USERNAME, PROXY_PASSWORD).await?;
    tracing::info!(url = %ctx.target(), proxy = %ctx.proxy().addr(), "benchmark starting");

    let report = ctx.run(TOTAL_REQUESTS).await?;
    print!("{report}");

    ctx.shutdown();
    Ok(())
}
