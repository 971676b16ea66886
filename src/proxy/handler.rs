//! HTTP request handler for the proxy

use hyper::{Method, Request, Response};
use std::sync::Arc;

use super::headers::sanitize_request_headers;
use super::response::bad_request;
use super::services::ServiceRegistry;
use super::session::SessionRegistry;
use super::tunnel::TunnelEngine;
use crate::blocklist::BlockedHostCache;
use crate::config::Mode;
use crate::transport::{ProxyBody, UpstreamTransport};

/// Main proxy request handler: one per server, shared by every connection.
pub struct ProxyHandler {
    sessions: Arc<SessionRegistry>,
    services: ServiceRegistry,
    blocked: Arc<BlockedHostCache>,
    mode: Mode,
    direct: Arc<dyn UpstreamTransport>,
    upstream: Option<Arc<dyn UpstreamTransport>>,
    engine: TunnelEngine,
}

impl ProxyHandler {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        blocked: Arc<BlockedHostCache>,
        direct: Arc<dyn UpstreamTransport>,
        engine: TunnelEngine,
    ) -> Self {
        Self {
            sessions,
            services: ServiceRegistry::new(),
            blocked,
            mode: Mode::default(),
            direct,
            upstream: None,
            engine,
        }
    }

    pub fn with_services(mut self, services: ServiceRegistry) -> Self {
        self.services = services;
        self
    }

    /// Transport for blocked hosts, or for everything with [`Mode::Always`].
    pub fn with_upstream(mut self, upstream: Option<Arc<dyn UpstreamTransport>>, mode: Mode) -> Self {
        self.upstream = upstream;
        self.mode = mode;
        self
    }

    /// Pick the transport for `host`. Without an upstream everything goes direct.
    pub fn transport_for(&self, host: &str) -> Arc<dyn UpstreamTransport> {
        let Some(ref upstream) = self.upstream else {
            return self.direct.clone();
        };
        match self.mode {
            Mode::Always => upstream.clone(),
            Mode::BlockedOnly if self.blocked.is_blocked(host) => upstream.clone(),
            Mode::BlockedOnly => self.direct.clone(),
        }
    }

    /// Handle an incoming proxy request
    pub async fn handle(
        &self,
        mut req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, hyper::Error> {
        let session = self
            .sessions
            .start(req.method().to_string(), req.uri().to_string());
        tracing::info!(
            session = session.id,
            alive = session.alive(),
            "{} {}",
            session.method,
            session.target
        );

        // Origin-form: addressed to the proxy itself
        if req.uri().authority().is_none() {
            let path = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            if let Some(service) = self.services.lookup(path) {
                tracing::debug!(session = session.id, path, "Serving local service");
                return Ok(service.serve(&session));
            }
            tracing::warn!(session = session.id, path, "Not a proxy request");
            return Ok(bad_request(&format!("Not a proxy request: {}", path)));
        }

        sanitize_request_headers(req.headers_mut());

        let Some(host) = req.uri().host().map(str::to_string) else {
            return Ok(bad_request("Request target has no host"));
        };
        let transport = self.transport_for(&host);
        tracing::debug!(session = session.id, host = %host, transport = transport.name(), "Routing");

        if req.method() == Method::CONNECT {
            return Ok(self.engine.tunnel(session, req, transport).await);
        }

        if req.uri().scheme().is_none() {
            return Ok(bad_request(&format!(
                "Unsupported request target: {}",
                req.uri()
            )));
        }

        Ok(self.engine.relay(session, req, transport).await)
    }
}
