//! Small local services answered by the proxy itself for origin-form requests

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::response::{empty_response, full_body};
use super::session::Session;
use crate::error::{Error, Result};
use crate::transport::ProxyBody;

/// A handler bound to one exact request path.
pub trait LocalService: Send + Sync {
    fn path(&self) -> &str;
    fn serve(&self, session: &Session) -> Response<ProxyBody>;
}

/// Serves a proxy auto-config file read once at startup.
pub struct PacService {
    contents: bytes::Bytes,
}

impl PacService {
    pub fn new(contents: impl Into<bytes::Bytes>) -> Self {
        Self {
            contents: contents.into(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "Failed to read PAC file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Ok(Self::new(contents))
    }
}

impl LocalService for PacService {
    fn path(&self) -> &str {
        "/pac"
    }

    fn serve(&self, _session: &Session) -> Response<ProxyBody> {
        let mut resp = Response::new(full_body(self.contents.clone()));
        resp.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-ns-proxy-autoconfig"),
        );
        resp
    }
}

/// Empty `200` for browsers asking the proxy for its icon.
pub struct FaviconService;

impl LocalService for FaviconService {
    fn path(&self) -> &str {
        "/favicon.ico"
    }

    fn serve(&self, _session: &Session) -> Response<ProxyBody> {
        empty_response(StatusCode::OK)
    }
}

/// Path to service map; a later registration replaces an earlier one.
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<dyn LocalService>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: Arc<dyn LocalService>) {
        self.services.insert(service.path().to_string(), service);
    }

    pub fn lookup(&self, path: &str) -> Option<&Arc<dyn LocalService>> {
        self.services.get(path)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
