//! One-shot HTTP/1.1 client that runs over any [`Dialer`]

use http_body_util::BodyExt;
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsConnector;

use super::{BoxedStream, Dialer, ProxyBody};
use crate::error::{Error, Result};

/// Sends each request on a fresh connection opened through a dialer.
/// `https` targets get a client TLS session on top of the dialed stream.
#[derive(Clone)]
pub struct HttpClient {
    tls: Arc<ClientConfig>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient").finish_non_exhaustive()
    }
}

impl HttpClient {
    /// Trust the bundled webpki roots
    pub fn with_webpki_roots() -> Self {
        Self::with_tls_config(Arc::new(client_config(root_store())))
    }

    /// Inject a custom TLS config for upstream connections (for testing with self-signed certs).
    pub fn with_tls_config(config: Arc<ClientConfig>) -> Self {
        Self { tls: config }
    }

    /// Trust the webpki roots plus every certificate in a PEM file
    pub fn with_extra_roots(pem_path: impl AsRef<Path>) -> Result<Self> {
        let pem = std::fs::read(pem_path.as_ref()).map_err(|e| {
            Error::config(format!(
                "Failed to read upstream CA '{}': {}",
                pem_path.as_ref().display(),
                e
            ))
        })?;
        let mut roots = root_store();
        for cert in rustls_pemfile::certs(&mut BufReader::new(pem.as_slice())) {
            let cert = cert.map_err(|e| Error::tls(format!("Invalid upstream CA PEM: {}", e)))?;
            roots
                .add(cert)
                .map_err(|e| Error::tls(format!("Invalid upstream CA: {}", e)))?;
        }
        Ok(Self::with_tls_config(Arc::new(client_config(roots))))
    }

    pub fn tls_config(&self) -> Arc<ClientConfig> {
        self.tls.clone()
    }

    /// Send `req` (absolute-form URI) to its origin through `dialer`.
    pub async fn send<D: Dialer + ?Sized>(
        &self,
        dialer: &D,
        req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>> {
        let target = Target::from_uri(req.uri())?;
        let stream = dialer.dial(&target.host, target.port).await?;
        let stream = if target.tls {
            self.wrap_tls(&target.host, stream).await?
        } else {
            stream
        };

        let req = into_origin_form(req, &target)?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| Error::upstream(format!("HTTP handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "Upstream connection error");
            }
        });

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| Error::upstream(format!("Request failed: {}", e)))?;

        let (parts, body) = resp.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    async fn wrap_tls(&self, host: &str, stream: BoxedStream) -> Result<BoxedStream> {
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| Error::tls(format!("Invalid server name '{}': {}", host, e)))?;
        let tls = TlsConnector::from(self.tls.clone())
            .connect(server_name, stream)
            .await
            .map_err(|e| Error::tls(format!("TLS connection to {} failed: {}", host, e)))?;
        Ok(Box::new(tls))
    }
}

fn root_store() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

fn client_config(roots: rustls::RootCertStore) -> ClientConfig {
    crate::tls::ensure_crypto_provider();
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

/// Where an absolute-form request is headed.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Target {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Target {
    pub(crate) fn from_uri(uri: &Uri) -> Result<Self> {
        let tls = match uri.scheme_str() {
            Some("http") => false,
            Some("https") => true,
            _ => {
                return Err(Error::invalid_url(format!(
                    "Expected an absolute http(s) URI, got '{}'",
                    uri
                )))
            }
        };
        let host = uri
            .host()
            .ok_or_else(|| Error::invalid_url(format!("URI has no host: {}", uri)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
        Ok(Self { host, port, tls })
    }

    /// Value for the Host header: the port is omitted when it is the default.
    pub(crate) fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let default = if self.tls { 443 } else { 80 };
        if self.port == default {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

/// Rewrite to origin-form and make sure a Host header is present.
fn into_origin_form(req: Request<ProxyBody>, target: &Target) -> Result<Request<ProxyBody>> {
    let (mut parts, body) = req.into_parts();

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = path
        .parse()
        .map_err(|e| Error::invalid_url(format!("Invalid request path '{}': {}", path, e)))?;

    if !parts.headers.contains_key(HOST) {
        let value = HeaderValue::from_str(&target.authority())
            .map_err(|e| Error::invalid_url(format!("Invalid host: {}", e)))?;
        parts.headers.insert(HOST, value);
    }

    Ok(Request::from_parts(parts, body))
}
