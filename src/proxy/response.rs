//! Shared HTTP response helpers for local and error responses

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::{Response, StatusCode};

use crate::transport::ProxyBody;

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|e| match e {}).boxed()
}

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|e| match e {}).boxed()
}

/// Plain-text error response with the given status
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = format!("{}\n", message);

    let mut resp = Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// Bodyless response, e.g. `200 OK` for an established tunnel
pub fn empty_response(status: StatusCode) -> Response<ProxyBody> {
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = status;
    resp
}

pub fn method_not_allowed(method: &hyper::Method) -> Response<ProxyBody> {
    error_response(
        StatusCode::METHOD_NOT_ALLOWED,
        &format!("Method not allowed: {}", method),
    )
}

pub fn bad_request(message: &str) -> Response<ProxyBody> {
    error_response(StatusCode::BAD_REQUEST, message)
}

pub fn upstream_failure(message: &str) -> Response<ProxyBody> {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        &format!("Proxy error: {}", message),
    )
}
