//! The two proxied HTTP/1.1 client stacks under measurement.
//!
//! - [`dispatcher`]: hyper connections pooled behind a shared dispatcher
//! - [`agent`]: a hand-rolled exchange over per-agent pooled sockets
//!
//! Both stacks speak to the same forward proxy and expose the same
//! [`ProxyClient`] face, so the driver can race them without caring
//! which is which.

pub mod agent;
pub mod dispatcher;

use crate::base::neterror::NetError;
use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use url::Url;

/// Boxed future returned by [`ProxyClient::get`].
pub type Fetching = Pin<Box<dyn Future<Output = Result<ClientResponse, NetError>> + Send>>;

/// Object-safe face shared by both client stacks.
pub trait ProxyClient: Send + Sync {
    /// Issue a GET for `target` through the configured proxy.
    fn get(&self, target: &Url) -> Fetching;

    /// Short name used in the benchmark report.
    fn label(&self) -> &'static str;
}

/// A response from either client stack.
///
/// The body may still be streaming on a pooled connection; draining it
/// with [`bytes`](Self::bytes) hands the connection back to its pool.
/// Dropping the response without draining discards the connection, since
/// it may carry unread bytes.
pub struct ClientResponse {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: ResponseBody,
}

impl ClientResponse {
    pub(crate) fn streamed(
        status: StatusCode,
        version: Version,
        headers: HeaderMap,
        body: Incoming,
        lease: dispatcher::ConnLease,
        body_timeout: Duration,
    ) -> Self {
        Self {
            status,
            version,
            headers,
            body: ResponseBody {
                kind: BodyKind::Streamed {
                    body,
                    lease,
                    timeout: body_timeout,
                },
            },
        }
    }

    pub(crate) fn buffered(
        status: StatusCode,
        version: Version,
        headers: HeaderMap,
        body: Bytes,
    ) -> Self {
        Self {
            status,
            version,
            headers,
            body: ResponseBody {
                kind: BodyKind::Buffered(body),
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Drain the body to completion.
    pub async fn bytes(self) -> Result<Bytes, NetError> {
        self.body.drain().await
    }

    /// Drain the body and decode it as UTF-8.
    pub async fn text(self) -> Result<String, NetError> {
        let raw = self.bytes().await?;
        String::from_utf8(raw.to_vec()).map_err(|_| NetError::InvalidUtf8)
    }

    /// Drain the body and deserialize it as JSON.
    #[cfg(feature = "json")]
    pub async fn json<T: serde::de::DeserializeOwned>(self) -> Result<T, NetError> {
        let raw = self.bytes().await?;
        serde_json::from_slice(&raw).map_err(|_| NetError::JsonParseError)
    }
}

enum BodyKind {
    /// Still streaming on a leased pooled connection.
    Streamed {
        body: Incoming,
        lease: dispatcher::ConnLease,
        timeout: Duration,
    },
    /// Already read off the socket in full.
    Buffered(Bytes),
}

/// Response body plus the pooled connection it rides on, if any.
pub struct ResponseBody {
    kind: BodyKind,
}

impl ResponseBody {
    async fn drain(self) -> Result<Bytes, NetError> {
        match self.kind {
            BodyKind::Streamed {
                body,
                lease,
                timeout,
            } => {
                // An error or timeout drops the lease, which discards the
                // connection rather than re-pooling it.
                let collected = tokio::time::timeout(timeout, body.collect())
                    .await
                    .map_err(|_| NetError::BodyTimedOut)?
                    .map_err(|_| NetError::HttpBodyError)?;
                lease.release();
                Ok(collected.to_bytes())
            }
            BodyKind::Buffered(bytes) => Ok(bytes),
        }
    }
}
