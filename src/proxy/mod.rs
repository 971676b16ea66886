//! HTTP proxy server implementation

mod handler;
mod headers;
mod response;
mod server;
mod services;
mod session;
mod tunnel;

pub use handler::ProxyHandler;
pub use headers::sanitize_request_headers;
pub use server::ProxyServer;
pub use services::{FaviconService, LocalService, PacService, ServiceRegistry};
pub use session::{Session, SessionRegistry};
pub use tunnel::{splice, TunnelEngine, TunnelStats};
