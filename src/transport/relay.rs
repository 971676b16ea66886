//! Remote fetch relay: each request is shipped to an HTTP endpoint that
//! performs it and sends back the origin's raw response.
//!
//! The relay receives the client request in proxy form (absolute URI,
//! `Content-Length` framed body) as the body of a `POST`, and answers with
//! the origin's HTTP/1.1 response as its own body. A `500` from the relay
//! means the relay itself failed.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use http_body_util::{BodyExt, Empty, Full};
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use url::Url;

use super::client::Target;
use super::{BoxedStream, HttpClient, ProxyBody, TcpDialer, UpstreamTransport};
use crate::error::{Error, Result};

pub const RELAY_CONTENT_TYPE: &str = "application/data";

pub struct RelayTransport {
    endpoint: Url,
    client: HttpClient,
    dialer: TcpDialer,
}

impl RelayTransport {
    pub fn new(endpoint: Url, client: HttpClient, timeout: Duration) -> Self {
        Self {
            endpoint,
            client,
            dialer: TcpDialer::new(timeout),
        }
    }
}

#[async_trait]
impl UpstreamTransport for RelayTransport {
    async fn round_trip(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        let method = req.method().clone();
        let target = Target::from_uri(req.uri())?;
        let payload = encode_proxy_request(req).await?;

        let post = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.as_str())
            .header(CONTENT_TYPE, RELAY_CONTENT_TYPE)
            .header(CONTENT_LENGTH, payload.len())
            .body(Full::new(payload).map_err(|e| match e {}).boxed())
            .map_err(|e| Error::proxy(format!("Failed to build relay request: {}", e)))?;

        let resp = self.client.send(&self.dialer, post).await?;
        let status = resp.status();
        let body = resp.into_body().collect().await?.to_bytes();

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            return Err(Error::upstream(format!(
                "Relay failed: {} {}",
                status,
                String::from_utf8_lossy(&body).trim()
            )));
        }

        decode_origin_response(&method, &target, body).await
    }

    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
        Err(Error::upstream(format!(
            "Relay transport cannot open raw streams ({}:{})",
            host, port
        )))
    }

    fn name(&self) -> &'static str {
        "relay"
    }

    fn intercepts_connect(&self) -> bool {
        true
    }
}

/// Serialize a request in proxy form with a `Content-Length` framed body.
pub(crate) async fn encode_proxy_request(req: Request<ProxyBody>) -> Result<Bytes> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();

    let mut out = BytesMut::with_capacity(256 + body.len());
    out.put_slice(format!("{} {} HTTP/1.1\r\n", parts.method, parts.uri).as_bytes());

    if !parts.headers.contains_key(HOST) {
        let target = Target::from_uri(&parts.uri)?;
        out.put_slice(format!("Host: {}\r\n", target.authority()).as_bytes());
    }
    for (name, value) in parts.headers.iter() {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        out.put_slice(name.as_str().as_bytes());
        out.put_slice(b": ");
        out.put_slice(value.as_bytes());
        out.put_slice(b"\r\n");
    }
    if !body.is_empty() || parts.headers.contains_key(CONTENT_LENGTH) {
        out.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    out.put_slice(b"\r\n");
    out.put_slice(&body);

    Ok(out.freeze())
}

/// Parse a raw HTTP/1.1 response. The original method matters for framing
/// (a `HEAD` response has no body whatever its headers say).
pub(crate) async fn decode_origin_response(
    method: &Method,
    target: &Target,
    raw: Bytes,
) -> Result<Response<ProxyBody>> {
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(Replay::new(raw)))
        .await
        .map_err(|e| Error::upstream(format!("Relay response handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "Relay response stream error");
        }
    });

    let host = HeaderValue::from_str(&target.authority())
        .map_err(|e| Error::invalid_url(format!("Invalid host: {}", e)))?;
    let framing = Request::builder()
        .method(method.clone())
        .uri("/")
        .header(HOST, host)
        .body(Empty::<Bytes>::new())
        .map_err(|e| Error::proxy(format!("Failed to build request: {}", e)))?;

    let resp = sender
        .send_request(framing)
        .await
        .map_err(|e| Error::upstream(format!("Malformed relay response: {}", e)))?;

    let (parts, body) = resp.into_parts();
    Ok(Response::from_parts(parts, body.boxed()))
}

/// Reads back a fixed buffer and discards everything written to it.
struct Replay {
    data: Bytes,
}

impl Replay {
    fn new(data: Bytes) -> Self {
        Self { data }
    }
}

impl AsyncRead for Replay {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let n = self.data.len().min(buf.remaining());
        let chunk = self.data.split_to(n);
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Replay {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
