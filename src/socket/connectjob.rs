use crate::base::neterror::NetError;
use crate::socket::client::SocketType;
use crate::socket::proxy::{ProxySettings, ProxyType};
use crate::socket::tls::TlsOptions;
use boring::ssl::{SslConnector, SslMethod};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

/// Largest CONNECT reply we will buffer before giving up.
const MAX_TUNNEL_REPLY: usize = 8 * 1024;

/// Manages the connection process: DNS -> TCP -> tunnel -> TLS.
///
/// Every socket in this crate goes through a proxy, so the TCP leg always
/// lands on the proxy endpoint. What happens next depends on the schemes:
/// `http` targets ride the proxy connection directly (callers send
/// absolute-form requests), while `https` targets get a CONNECT tunnel and
/// a TLS handshake inside it.
pub struct ConnectJob;

impl ConnectJob {
    pub async fn connect(
        target: &Url,
        proxy: &ProxySettings,
        proxy_tls: &TlsOptions,
        request_tls: &TlsOptions,
    ) -> Result<SocketType, NetError> {
        let (proxy_host, proxy_port) = proxy.host_port().ok_or(NetError::InvalidUrl)?;

        // 1. DNS resolution of the proxy endpoint
        let addrs = tokio::net::lookup_host((proxy_host, proxy_port))
            .await
            .map_err(|_| NetError::NameNotResolved)?;

        // 2. TCP connect: first address that answers wins
        let mut stream = None;
        for addr in addrs {
            if let Ok(s) = TcpStream::connect(addr).await {
                stream = Some(s);
                break;
            }
        }
        let mut stream = stream.ok_or(NetError::ProxyConnectionFailed)?;

        let target_host = target.host_str().ok_or(NetError::InvalidUrl)?;
        let target_port = target.port_or_known_default().ok_or(NetError::InvalidUrl)?;
        let target_is_tls = target.scheme() == "https";

        match proxy.proxy_type() {
            ProxyType::Http => {
                if target_is_tls {
                    // 3. CONNECT handshake, then TLS inside the tunnel
                    establish_tunnel(&mut stream, target_host, target_port, proxy).await?;
                    let tls = tls_handshake(stream, target_host, request_tls).await?;
                    Ok(SocketType::Ssl(tls))
                } else {
                    Ok(SocketType::Tcp(stream))
                }
            }
            ProxyType::Https => {
                if target_is_tls {
                    // TLS-in-TLS (a tunnel inside the proxy session) is not
                    // supported.
                    Err(NetError::TunnelConnectionFailed)
                } else {
                    let tls = tls_handshake(stream, proxy_host, proxy_tls).await?;
                    Ok(SocketType::Ssl(tls))
                }
            }
        }
    }
}

/// Send `CONNECT host:port` and wait for a 2xx reply.
async fn establish_tunnel(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
    proxy: &ProxySettings,
) -> Result<(), NetError> {
    let authority = format!("{}:{}", host, port);
    let mut connect_req = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);
    if let Some(auth) = proxy.get_auth_header() {
        connect_req.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    connect_req.push_str("\r\n");

    stream.write_all(connect_req.as_bytes()).await?;

    // The tunnel peer only speaks after we do, so everything read here
    // belongs to the proxy's reply.
    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(NetError::ConnectionClosed);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > MAX_TUNNEL_REPLY {
            return Err(NetError::ResponseHeadersTooBig);
        }
    }

    let head = String::from_utf8_lossy(&buf);
    let code: u16 = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or(NetError::InvalidResponse)?;

    match code {
        200..=299 => Ok(()),
        407 => Err(NetError::ProxyAuthRequested),
        _ => {
            tracing::debug!(code, "CONNECT refused by proxy");
            Err(NetError::TunnelConnectionFailed)
        }
    }
}

async fn tls_handshake(
    stream: TcpStream,
    host: &str,
    opts: &TlsOptions,
) -> Result<tokio_boring::SslStream<TcpStream>, NetError> {
    let mut builder =
        SslConnector::builder(SslMethod::tls()).map_err(|_| NetError::SslProtocolError)?;
    opts.apply_to_builder(&mut builder)?;

    let connector = builder.build();
    let mut config = connector.configure().map_err(|_| NetError::SslProtocolError)?;
    if !opts.verify_certificates {
        config.set_verify_hostname(false);
    }

    tokio_boring::connect(config, host, stream).await.map_err(|e| {
        tracing::debug!(host, error = ?e, "TLS handshake failed");
        NetError::SslProtocolError
    })
}
