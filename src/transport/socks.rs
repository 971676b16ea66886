//! SOCKS5 upstream

use async_trait::async_trait;
use std::time::Duration;
use tokio_socks::tcp::Socks5Stream;
use url::Url;

use super::{credentials, host_port, BoxedStream, Dialer, TcpDialer};
use crate::error::{Error, Result};

/// Opens streams through a SOCKS5 proxy, `socks5://[user:pass@]host:port`.
/// Target names are resolved by the proxy.
#[derive(Debug, Clone)]
pub struct SocksDialer {
    proxy_host: String,
    proxy_port: u16,
    auth: Option<(String, String)>,
    tcp: TcpDialer,
}

impl SocksDialer {
    pub fn from_url(url: &Url, timeout: Duration) -> Result<Self> {
        let (proxy_host, _) = host_port(url)?;
        let proxy_port = url.port().unwrap_or(1080);
        let auth = match credentials(url) {
            (Some(user), password) => Some((user, password.unwrap_or_default())),
            (None, _) => None,
        };
        Ok(Self {
            proxy_host,
            proxy_port,
            auth,
            tcp: TcpDialer::new(timeout),
        })
    }
}

#[async_trait]
impl Dialer for SocksDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let socket = self.tcp.connect(&self.proxy_host, self.proxy_port).await?;
        let target = (host, port);

        let stream = match &self.auth {
            Some((user, pass)) => {
                Socks5Stream::connect_with_password_and_socket(socket, target, user, pass).await
            }
            None => Socks5Stream::connect_with_socket(socket, target).await,
        }
        .map_err(|e| {
            Error::upstream(format!(
                "SOCKS5 connect to {}:{} via {}:{} failed: {}",
                host, port, self.proxy_host, self.proxy_port, e
            ))
        })?;

        tracing::debug!(host = %host, port, proxy = %self.proxy_host, "SOCKS5 tunnel established");
        Ok(Box::new(stream))
    }
}
