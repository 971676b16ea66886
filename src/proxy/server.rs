//! Main proxy server

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use super::handler::ProxyHandler;
use super::services::{FaviconService, PacService, ServiceRegistry};
use super::session::SessionRegistry;
use super::tunnel::TunnelEngine;
use crate::audit::AuditLogger;
use crate::blocklist::{BlockedHostCache, BlockedHostOracle, BlockedList};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::tls::{CertificateAuthority, CertificatePool, CertificateStore};
use crate::transport::{self, HttpClient, TransportOptions, UpstreamTransport};

/// The main proxy server
pub struct ProxyServer {
    config: Config,
    sessions: Arc<SessionRegistry>,
    services: ServiceRegistry,
    pool: Option<Arc<CertificatePool>>,
    audit_logger: Option<Arc<AuditLogger>>,
    oracle: Arc<dyn BlockedHostOracle>,
    upstream_tls_config: Option<Arc<ClientConfig>>,
    upstream_override: Option<Arc<dyn UpstreamTransport>>,
    listener: Option<TcpListener>,
    handler: Option<Arc<ProxyHandler>>,
}

impl ProxyServer {
    /// Create a new proxy server from configuration.
    ///
    /// Loads the CA, opens the audit log and reads the PAC file; the
    /// upstream transport is only built by [`ProxyServer::bind`].
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let pool = match (&config.tls.ca_cert, &config.tls.ca_key) {
            (Some(cert), Some(key)) => {
                let ca = CertificateAuthority::from_files(Config::path(cert)?, Config::path(key)?)?;
                let store = match config.tls.certs_dir {
                    Some(ref dir) => CertificateStore::new(Config::path(dir)?),
                    None => CertificateStore::memory_only(),
                };
                tracing::info!(
                    certs_dir = ?store.dir(),
                    key_policy = ?config.tls.key_policy,
                    "TLS interception enabled"
                );
                Some(Arc::new(CertificatePool::new(ca, store, config.tls.key_policy)))
            }
            _ => None,
        };

        let audit_logger = match config.logging.audit_log {
            Some(ref path) => {
                let path = Config::path(path)?;
                let logger = AuditLogger::open(&path).map_err(|e| {
                    Error::config(format!(
                        "Failed to open audit log '{}': {}",
                        path.display(),
                        e
                    ))
                })?;
                tracing::info!(path = %path.display(), "Audit log enabled");
                Some(Arc::new(logger))
            }
            None => None,
        };

        let mut services = ServiceRegistry::new();
        services.register(Arc::new(FaviconService));
        if let Some(ref pac) = config.proxy.pac_file {
            services.register(Arc::new(PacService::from_file(Config::path(pac)?)?));
        }

        let oracle: Arc<dyn BlockedHostOracle> = Arc::new(BlockedList::new(&config.blocked));
        tracing::info!(
            blocked = config.blocked.len(),
            mode = ?config.proxy.mode,
            remote = config.proxy.remote.as_deref().unwrap_or("(none)"),
            "Routing configured"
        );

        Ok(Self {
            config,
            sessions: SessionRegistry::new(),
            services,
            pool,
            audit_logger,
            oracle,
            upstream_tls_config: None,
            upstream_override: None,
            listener: None,
            handler: None,
        })
    }

    /// Inject a custom TLS config for upstream connections (for testing with self-signed certs).
    pub fn with_upstream_tls(mut self, config: Arc<ClientConfig>) -> Self {
        self.upstream_tls_config = Some(config);
        self
    }

    /// Replace the configured blocklist.
    pub fn with_oracle(mut self, oracle: Arc<dyn BlockedHostOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    /// Use `transport` instead of building one from `proxy.remote`.
    pub fn with_transport(mut self, transport: Arc<dyn UpstreamTransport>) -> Self {
        self.upstream_override = Some(transport);
        self
    }

    /// Run the proxy server with graceful shutdown
    pub async fn run_until_shutdown(
        mut self,
        shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        let local_addr = self.bind().await?;
        tracing::info!(address = %local_addr, "Proxy server listening");
        self.serve(shutdown).await
    }

    /// Build the transports and bind to the configured address.
    ///
    /// Returns the local address, which is useful when binding to port 0.
    /// Call `serve()` afterwards to start accepting connections.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let handler = self.build_handler().await?;
        self.handler = Some(Arc::new(handler));

        let bind_address = &self.config.proxy.bind_address;
        let addr: SocketAddr = bind_address.parse().map_err(|e| {
            Error::config(format!("Invalid bind address '{}': {}", bind_address, e))
        })?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::proxy(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::proxy(format!("Failed to get local address: {}", e)))?;

        self.listener = Some(listener);
        Ok(local_addr)
    }

    async fn build_handler(&self) -> Result<ProxyHandler> {
        let client = match (&self.upstream_tls_config, &self.config.proxy.upstream_tls_ca) {
            (Some(tls), _) => HttpClient::with_tls_config(tls.clone()),
            (None, Some(ca)) => HttpClient::with_extra_roots(Config::path(ca)?)?,
            (None, None) => HttpClient::with_webpki_roots(),
        };

        let options = TransportOptions {
            connect_timeout: self.config.proxy.connect_timeout(),
            private_key: self
                .config
                .proxy
                .private_key
                .as_deref()
                .map(Config::path)
                .transpose()?,
        };

        let direct = transport::direct(&options, client.clone());
        let upstream = match (&self.upstream_override, &self.config.proxy.remote) {
            (Some(transport), _) => Some(transport.clone()),
            (None, Some(remote)) => {
                let transport = transport::from_remote(remote, &options, client).await?;
                tracing::info!(transport = transport.name(), "Upstream ready");
                Some(transport)
            }
            (None, None) => None,
        };

        let mut engine =
            TunnelEngine::new(self.sessions.clone()).with_audit_logger(self.audit_logger.clone());
        if let Some(ref pool) = self.pool {
            engine = engine.with_certificate_pool(pool.clone());
        }

        let blocked = Arc::new(BlockedHostCache::new(self.oracle.clone()));
        Ok(
            ProxyHandler::new(self.sessions.clone(), blocked, direct, engine)
                .with_services(self.services.clone())
                .with_upstream(upstream, self.config.proxy.mode),
        )
    }

    /// Serve connections using a previously bound listener, with graceful shutdown.
    pub async fn serve(mut self, mut shutdown: tokio::sync::oneshot::Receiver<()>) -> Result<()> {
        let (Some(listener), Some(handler)) = (self.listener.take(), self.handler.take()) else {
            return Err(Error::proxy("serve() called before bind()"));
        };

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(alive = self.sessions.alive(), "Shutdown signal received");
                    return Ok(());
                }
                result = listener.accept() => {
                    let (stream, client_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(client = %client_addr, error = %e, "Failed to set TCP_NODELAY");
                    }
                    tracing::debug!(client = %client_addr, "New connection");
                    spawn_connection(stream, client_addr, handler.clone());
                }
            }
        }
    }

    /// Get the bind address
    pub fn bind_address(&self) -> &str {
        &self.config.proxy.bind_address
    }

    /// Certificate pool used for interception, if a CA is configured
    pub fn certificate_pool(&self) -> Option<&Arc<CertificatePool>> {
        self.pool.as_ref()
    }
}

/// Spawn a task to handle a single connection.
fn spawn_connection<S>(stream: S, client_addr: SocketAddr, handler: Arc<ProxyHandler>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            async move { handler.handle(req.map(|body| body.boxed())).await }
        });

        if let Err(e) = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            if !e.to_string().contains("connection closed") {
                tracing::debug!(client = %client_addr, error = %e, "Connection error");
            }
        }
    });
}
