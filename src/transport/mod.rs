//! Upstream transports: how requests and CONNECT tunnels leave the proxy.
//!
//! Every transport answers two questions: "fetch this request for me"
//! ([`UpstreamTransport::round_trip`]) and "give me a byte stream to
//! `host:port`" ([`UpstreamTransport::dial`]). The server picks one
//! transport for upstream traffic at startup and always keeps a direct one
//! for unblocked hosts.

mod client;
mod direct;
mod reconnect;
mod relay;
mod socks;
mod ssh;

pub use client::HttpClient;
pub use direct::TcpDialer;
pub use reconnect::{Connector, ReconnectCoordinator, SharedConnection};
pub use relay::RelayTransport;
pub use socks::SocksDialer;
pub use ssh::{SshConnection, SshConnector, SshCredentials};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::{Request, Response};
use percent_encoding::percent_decode_str;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;

use crate::error::{Error, Result};

/// Body type flowing through the proxy in both directions.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Any bidirectional byte stream an upstream can hand back.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// A way of reaching origin servers.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Forward one request with an absolute-form URI and return the origin's response.
    async fn round_trip(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>>;

    /// Open a raw byte stream to `host:port`.
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream>;

    /// Short name used in logs and the audit trail.
    fn name(&self) -> &'static str;

    /// CONNECT through this transport must be decrypted locally and each
    /// request relayed individually, since it cannot carry raw streams.
    fn intercepts_connect(&self) -> bool {
        false
    }
}

/// Opens byte streams to `host:port`.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream>;
}

/// A transport built from a stream dialer: raw tunnels use the dialer
/// directly and requests go through the one-shot HTTP client over it.
pub struct DialerTransport<D> {
    dialer: D,
    client: HttpClient,
    name: &'static str,
}

impl<D: Dialer> DialerTransport<D> {
    pub fn new(name: &'static str, dialer: D, client: HttpClient) -> Self {
        Self {
            dialer,
            client,
            name,
        }
    }
}

#[async_trait]
impl<D: Dialer> UpstreamTransport for DialerTransport<D> {
    async fn round_trip(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        self.client.send(&self.dialer, req).await
    }

    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
        self.dialer.dial(host, port).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Everything needed to build the upstream transport from a `remote` URL.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    /// SSH private key; tried before a password from the URL
    pub private_key: Option<PathBuf>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            private_key: None,
        }
    }
}

/// Plain TCP transport for hosts that need no upstream.
pub fn direct(options: &TransportOptions, client: HttpClient) -> Arc<dyn UpstreamTransport> {
    Arc::new(DialerTransport::new(
        "direct",
        TcpDialer::new(options.connect_timeout),
        client,
    ))
}

/// Build the upstream transport for `remote`.
///
/// SSH connects eagerly so that bad credentials fail at startup.
pub async fn from_remote(
    remote: &str,
    options: &TransportOptions,
    client: HttpClient,
) -> Result<Arc<dyn UpstreamTransport>> {
    let url = Url::parse(remote)
        .map_err(|e| Error::invalid_url(format!("Invalid remote '{}': {}", remote, e)))?;

    match url.scheme() {
        "socks5" | "socks5h" => {
            let dialer = SocksDialer::from_url(&url, options.connect_timeout)?;
            Ok(Arc::new(DialerTransport::new("socks", dialer, client)))
        }
        "ssh" => {
            let connector = SshConnector::from_url(&url, options)?;
            let coordinator = ReconnectCoordinator::connect(connector).await?;
            Ok(Arc::new(DialerTransport::new("ssh", coordinator, client)))
        }
        "http" | "https" => Ok(Arc::new(RelayTransport::new(
            url,
            client,
            options.connect_timeout,
        ))),
        other => Err(Error::config(format!(
            "Unsupported remote scheme '{}'",
            other
        ))),
    }
}

/// `host` and `port` of a URL, with the scheme's default port filled in.
pub(crate) fn host_port(url: &Url) -> Result<(String, u16)> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::invalid_url(format!("URL has no host: {}", url)))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::invalid_url(format!("URL has no port: {}", url)))?;
    Ok((host, port))
}

/// Percent-decoded userinfo of a URL.
pub(crate) fn credentials(url: &Url) -> (Option<String>, Option<String>) {
    let decode = |s: &str| {
        percent_decode_str(s)
            .decode_utf8()
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| s.to_string())
    };
    let user = Some(url.username())
        .filter(|u| !u.is_empty())
        .map(decode);
    let password = url.password().map(decode);
    (user, password)
}
