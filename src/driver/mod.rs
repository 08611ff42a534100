//! Sequential request loops and the timing report they produce.

pub mod report;

use crate::base::neterror::NetError;
use crate::client::ProxyClient;
use std::time::{Duration, Instant};
use url::Url;

/// Run `total` GETs back to back through `client` and return how long the
/// whole loop took.
///
/// Requests are strictly sequential: the next one starts only after the
/// previous body has been drained to the end. The first error aborts the
/// loop.
pub async fn timed_run<C>(client: &C, target: &Url, total: usize) -> Result<Duration, NetError>
where
    C: ProxyClient + ?Sized,
{
    let started = Instant::now();
    for _ in 0..total {
        let response = client.get(target).await?;
        response.bytes().await?;
    }
    Ok(started.elapsed())
}
