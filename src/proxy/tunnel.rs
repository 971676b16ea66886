//! Request relaying and CONNECT tunnels, raw or with TLS interception

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;

use super::headers::sanitize_request_headers;
use super::response::{bad_request, empty_response, method_not_allowed, upstream_failure};
use super::session::{Session, SessionRegistry};
use crate::audit::{format_duration, format_size, AuditEntry, AuditEvent, AuditLogger};
use crate::error::{Error, Result};
use crate::tls::CertificatePool;
use crate::transport::{ProxyBody, UpstreamTransport};

/// Only HTTPS can be decrypted and relayed request by request.
const INTERCEPT_PORT: u16 = 443;

/// Relays plain requests and runs CONNECT tunnels for one proxy instance.
#[derive(Clone)]
pub struct TunnelEngine {
    pool: Option<Arc<CertificatePool>>,
    audit: Option<Arc<AuditLogger>>,
    sessions: Arc<SessionRegistry>,
}

impl TunnelEngine {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self {
            pool: None,
            audit: None,
            sessions,
        }
    }

    /// Certificates for intercepted CONNECT targets.
    pub fn with_certificate_pool(mut self, pool: Arc<CertificatePool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_audit_logger(mut self, logger: Option<Arc<AuditLogger>>) -> Self {
        self.audit = logger;
        self
    }

    fn emit_audit(&self, entry: AuditEntry) {
        if let Some(ref logger) = self.audit {
            logger.log(&entry);
        }
    }

    /// Forward one request through `transport` and stream the answer back.
    pub async fn relay(
        &self,
        session: Session,
        req: Request<ProxyBody>,
        transport: Arc<dyn UpstreamTransport>,
    ) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            return method_not_allowed(req.method());
        }

        match transport.round_trip(req).await {
            Ok(resp) => {
                let (parts, body) = resp.into_parts();
                let status = parts.status;
                let body = CountingBody::new(body, session, status, transport.name(), self.audit.clone());

                let mut out = Response::new(BodyExt::boxed(body));
                *out.status_mut() = status;
                *out.headers_mut() = parts.headers;
                out
            }
            Err(e) => {
                tracing::warn!(
                    session = session.id,
                    target = %session.target,
                    transport = transport.name(),
                    error = %e,
                    "Upstream request failed"
                );
                self.emit_audit(
                    AuditEntry::new(
                        session.id,
                        AuditEvent::RelayFailed,
                        &session.method,
                        &session.target,
                        transport.name(),
                    )
                    .with_status(StatusCode::INTERNAL_SERVER_ERROR.as_u16())
                    .with_duration(session.elapsed())
                    .with_error(&e),
                );
                upstream_failure(&e.to_string())
            }
        }
    }

    /// Answer a CONNECT. Raw tunnels dial first and only report `200` once
    /// the upstream stream exists; intercepting transports decrypt locally.
    pub async fn tunnel(
        &self,
        session: Session,
        req: Request<ProxyBody>,
        transport: Arc<dyn UpstreamTransport>,
    ) -> Response<ProxyBody> {
        if req.method() != Method::CONNECT {
            return method_not_allowed(req.method());
        }

        let Some(host) = req.uri().host().map(|h| h.to_string()) else {
            return bad_request("CONNECT target must be host:port");
        };
        let port = req.uri().port_u16().unwrap_or(INTERCEPT_PORT);

        if transport.intercepts_connect() {
            return self.start_interception(session, req, host, port, transport);
        }

        let upstream = match transport.dial(&host, port).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(session = session.id, host = %host, port, error = %e, "Tunnel dial failed");
                self.emit_audit(
                    AuditEntry::new(
                        session.id,
                        AuditEvent::TunnelFailed,
                        "CONNECT",
                        &session.target,
                        transport.name(),
                    )
                    .with_status(StatusCode::INTERNAL_SERVER_ERROR.as_u16())
                    .with_duration(session.elapsed())
                    .with_error(&e),
                );
                return upstream_failure(&e.to_string());
            }
        };

        let upgrade = hyper::upgrade::on(req);
        let engine = self.clone();
        let transport_name = transport.name();

        tokio::spawn(async move {
            let upgraded = match upgrade.await {
                Ok(u) => u,
                Err(e) => {
                    tracing::error!(session = session.id, host = %host, error = %e, "Failed to upgrade connection");
                    return;
                }
            };

            let stats = splice(TokioIo::new(upgraded), upstream).await;
            engine.finish_tunnel(&session, transport_name, &stats);
        });

        empty_response(StatusCode::OK)
    }

    fn start_interception(
        &self,
        session: Session,
        req: Request<ProxyBody>,
        host: String,
        port: u16,
        transport: Arc<dyn UpstreamTransport>,
    ) -> Response<ProxyBody> {
        if port != INTERCEPT_PORT {
            tracing::warn!(session = session.id, host = %host, port, "Refusing to intercept non-HTTPS CONNECT");
            return bad_request(&format!(
                "Unsupported CONNECT port {}: only {} can be relayed",
                port, INTERCEPT_PORT
            ));
        }
        let Some(pool) = self.pool.clone() else {
            return upstream_failure("TLS interception is not configured");
        };

        let upgrade = hyper::upgrade::on(req);
        let engine = self.clone();

        tokio::spawn(async move {
            let upgraded = match upgrade.await {
                Ok(u) => u,
                Err(e) => {
                    tracing::error!(session = session.id, host = %host, error = %e, "Failed to upgrade connection");
                    return;
                }
            };

            let result = engine
                .serve_intercepted(upgraded, &pool, &host, &session, transport.clone())
                .await;
            let stats = TunnelStats {
                bytes_up: 0,
                bytes_down: 0,
                error: result.err().map(|e| e.to_string()),
            };
            engine.finish_tunnel(&session, transport.name(), &stats);
        });

        empty_response(StatusCode::OK)
    }

    /// Terminate TLS with a certificate for `host` and relay every decrypted
    /// request on its own.
    async fn serve_intercepted(
        &self,
        upgraded: hyper::upgrade::Upgraded,
        pool: &CertificatePool,
        host: &str,
        parent: &Session,
        transport: Arc<dyn UpstreamTransport>,
    ) -> Result<()> {
        let server_config = pool.server_config_for_host(host)?;
        let client_tls = TlsAcceptor::from(server_config)
            .accept(TokioIo::new(upgraded))
            .await
            .map_err(|e| Error::tls(format!("Failed to accept TLS from client: {}", e)))?;

        tracing::debug!(session = parent.id, host = %host, "TLS handshake with client complete");

        let engine = self.clone();
        let host = host.to_string();
        let parent_id = parent.id;
        let service = service_fn(move |req: Request<Incoming>| {
            let engine = engine.clone();
            let host = host.clone();
            let transport = transport.clone();
            async move {
                Ok::<_, hyper::Error>(
                    engine
                        .relay_intercepted(req, &host, parent_id, transport)
                        .await,
                )
            }
        });

        if let Err(e) = http1::Builder::new()
            .preserve_header_case(true)
            .serve_connection(TokioIo::new(client_tls), service)
            .await
        {
            // Connection closed errors are normal
            if !is_disconnect(&e.to_string()) {
                tracing::debug!(host = %parent.target, error = %e, "Intercepted connection error");
            }
        }

        Ok(())
    }

    async fn relay_intercepted(
        &self,
        req: Request<Incoming>,
        host: &str,
        parent: u64,
        transport: Arc<dyn UpstreamTransport>,
    ) -> Response<ProxyBody> {
        let (mut parts, body) = req.into_parts();

        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = match format!("https://{}{}", host, path).parse::<Uri>() {
            Ok(uri) => uri,
            Err(e) => return bad_request(&format!("Invalid request path: {}", e)),
        };
        sanitize_request_headers(&mut parts.headers);

        let session = self
            .sessions
            .start(parts.method.to_string(), parts.uri.to_string());
        tracing::info!(
            session = session.id,
            parent,
            alive = session.alive(),
            "{} {}",
            session.method,
            session.target
        );

        self.relay(session, Request::from_parts(parts, body.boxed()), transport)
            .await
    }

    fn finish_tunnel(&self, session: &Session, transport: &str, stats: &TunnelStats) {
        let elapsed = session.elapsed();
        match &stats.error {
            None => tracing::info!(
                session = session.id,
                up = %format_size(stats.bytes_up),
                down = %format_size(stats.bytes_down),
                elapsed = %format_duration(elapsed),
                "CLOSE {}",
                session.target
            ),
            Some(e) => tracing::warn!(
                session = session.id,
                up = %format_size(stats.bytes_up),
                down = %format_size(stats.bytes_down),
                elapsed = %format_duration(elapsed),
                error = %e,
                "CLOSE {}",
                session.target
            ),
        }

        let event = if stats.error.is_some() {
            AuditEvent::TunnelFailed
        } else {
            AuditEvent::TunnelClosed
        };
        let mut entry = AuditEntry::new(session.id, event, "CONNECT", &session.target, transport)
            .with_bytes(stats.bytes_up, stats.bytes_down)
            .with_duration(elapsed);
        if let Some(e) = &stats.error {
            entry = entry.with_error(e);
        }
        self.emit_audit(entry);
    }
}

fn is_disconnect(message: &str) -> bool {
    message.contains("connection closed")
        || message.contains("early eof")
        || message.contains("connection reset")
}

/// Bytes moved by a finished tunnel.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TunnelStats {
    /// Client to upstream
    pub bytes_up: u64,
    /// Upstream to client
    pub bytes_down: u64,
    pub error: Option<String>,
}

/// Copy bytes both ways until each side has reached EOF.
///
/// When one direction ends, only the write half of its destination is shut
/// down, so the other direction keeps flowing until it ends too.
pub async fn splice<A, B>(client: A, upstream: B) -> TunnelStats
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_r, client_w) = tokio::io::split(client);
    let (upstream_r, upstream_w) = tokio::io::split(upstream);

    let upload = tokio::spawn(pipe(client_r, upstream_w));
    let download = tokio::spawn(pipe(upstream_r, client_w));
    let (upload, download) = tokio::join!(upload, download);

    let (bytes_up, up_err) = upload.unwrap_or_else(|e| (0, Some(std::io::Error::other(e))));
    let (bytes_down, down_err) =
        download.unwrap_or_else(|e| (0, Some(std::io::Error::other(e))));

    let error = up_err
        .or(down_err)
        .map(|e| e.to_string())
        .filter(|e| !is_disconnect(e));

    TunnelStats {
        bytes_up,
        bytes_down,
        error,
    }
}

/// One direction of a tunnel: copy until EOF or error, then half-close.
async fn pipe<R, W>(mut reader: R, mut writer: W) -> (u64, Option<std::io::Error>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0u64;

    let err = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    break Some(e);
                }
                total += n as u64;
            }
            Err(e) => break Some(e),
        }
    };

    let _ = writer.shutdown().await;
    (total, err)
}

/// Response body that counts bytes sent to the client and reports the
/// session once the body is finished or dropped.
struct CountingBody {
    inner: ProxyBody,
    bytes: u64,
    session: Session,
    status: StatusCode,
    transport: &'static str,
    audit: Option<Arc<AuditLogger>>,
    error: Option<String>,
    finished: bool,
}

impl CountingBody {
    fn new(
        inner: ProxyBody,
        session: Session,
        status: StatusCode,
        transport: &'static str,
        audit: Option<Arc<AuditLogger>>,
    ) -> Self {
        Self {
            inner,
            bytes: 0,
            session,
            status,
            transport,
            audit,
            error: None,
            finished: false,
        }
    }
}

impl Body for CountingBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, hyper::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes += data.len() as u64;
                }
            }
            Poll::Ready(Some(Err(e))) => this.error = Some(e.to_string()),
            Poll::Ready(None) => this.finished = true,
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CountingBody {
    fn drop(&mut self) {
        let elapsed = self.session.elapsed();
        // Chunked and close-delimited bodies only report their end by yielding None
        let complete = self.error.is_none() && (self.finished || self.inner.is_end_stream());
        let error = match (&self.error, complete) {
            (Some(e), _) => Some(e.clone()),
            (None, false) => Some("response body not fully delivered".to_string()),
            (None, true) => None,
        };

        tracing::info!(
            session = self.session.id,
            status = self.status.as_u16(),
            size = %format_size(self.bytes),
            elapsed = %format_duration(elapsed),
            "RESPONSE {}",
            self.session.target
        );

        if let Some(logger) = &self.audit {
            let event = if error.is_some() {
                AuditEvent::RelayFailed
            } else {
                AuditEvent::RelayCompleted
            };
            let mut entry = AuditEntry::new(
                self.session.id,
                event,
                &self.session.method,
                &self.session.target,
                self.transport,
            )
            .with_status(self.status.as_u16())
            .with_bytes(0, self.bytes)
            .with_duration(elapsed);
            if let Some(e) = error {
                entry = entry.with_error(e);
            }
            logger.log(&entry);
        }
    }
}
