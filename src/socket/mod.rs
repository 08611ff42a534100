//! Socket and connection management.
//!
//! Everything below the HTTP layer lives here:
//! - [`client`]: socket types and liveness probes
//! - [`pool`]: keep-alive socket pooling with per-group caps
//! - [`connectjob`]: DNS -> TCP -> CONNECT tunnel -> TLS connection flow
//! - [`proxy`]: HTTP/HTTPS forward proxy settings and credentials
//! - [`tls`]: TLS profiles backed by BoringSSL

pub mod client;
pub mod connectjob;
pub mod pool;
pub mod proxy;
pub mod tls;
