//! TLS leg configuration.
//!
//! Each hop of a proxied connection (client to proxy, tunnel to origin) gets
//! its own [`TlsOptions`], applied to a BoringSSL connector builder.

use crate::base::neterror::NetError;
use boring::ssl::{SslConnectorBuilder, SslVerifyMode, SslVersion};
use std::time::Duration;

/// TLS connection configuration for one leg.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// ALPN protocols, in preference order.
    pub alpn_protocols: Vec<String>,

    /// Minimum TLS version.
    pub min_version: Option<SslVersion>,

    /// Maximum TLS version.
    pub max_version: Option<SslVersion>,

    /// Verify the peer certificate chain.
    pub verify_certificates: bool,

    /// Session cache lifetime. Pooled TLS-backed connections are not reused
    /// after sitting idle longer than this.
    pub session_timeout: Duration,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            alpn_protocols: vec!["http/1.1".to_string()],
            min_version: Some(SslVersion::TLS1_2),
            max_version: Some(SslVersion::TLS1_3),
            verify_certificates: true,
            session_timeout: Duration::from_secs(300),
        }
    }
}

impl TlsOptions {
    /// Benchmark profile: certificate verification off, short session cache.
    pub fn insecure(session_timeout: Duration) -> Self {
        Self {
            verify_certificates: false,
            session_timeout,
            ..Self::default()
        }
    }

    /// Apply this configuration to an SSL connector builder.
    pub fn apply_to_builder(&self, builder: &mut SslConnectorBuilder) -> Result<(), NetError> {
        if let Some(min) = self.min_version {
            builder.set_min_proto_version(Some(min)).map_err(|_| NetError::SslProtocolError)?;
        }
        if let Some(max) = self.max_version {
            builder.set_max_proto_version(Some(max)).map_err(|_| NetError::SslProtocolError)?;
        }

        // ALPN wire format: length-prefixed protocol names
        if !self.alpn_protocols.is_empty() {
            let mut alpn_wire = Vec::new();
            for proto in &self.alpn_protocols {
                if proto.len() > 255 {
                    return Err(NetError::SslProtocolError);
                }
                alpn_wire.push(proto.len() as u8);
                alpn_wire.extend_from_slice(proto.as_bytes());
            }
            builder.set_alpn_protos(&alpn_wire).map_err(|_| NetError::SslProtocolError)?;
        }

        if self.verify_certificates {
            builder.set_verify(SslVerifyMode::PEER);
        } else {
            builder.set_verify(SslVerifyMode::NONE);
        }

        Ok(())
    }
}
