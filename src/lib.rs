//! Tunnelgate - a forward HTTP/HTTPS proxy that routes blocked hosts through an upstream
//!
//! Clients point `HTTP_PROXY`/`HTTPS_PROXY` at the proxy. Each request is
//! relayed either directly or through the configured upstream, depending on
//! the routing mode and a blocklist.
//!
//! # Features
//!
//! - **Upstreams**: SSH (`direct-tcpip` channels over one shared session),
//!   SOCKS5, and an HTTP relay endpoint that fetches on the proxy's behalf
//! - **CONNECT tunnels**: raw byte splicing with half-close, or TLS
//!   interception when the upstream can only carry single requests
//! - **Certificate pool**: per-host leaf certificates minted from a local CA,
//!   optionally persisted to disk
//! - **Reconnect**: a dropped SSH session is redialed once, shared by all waiters
//!
//! # Example
//!
//! ```no_run
//! use tunnelgate::{Config, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("tunnelgate.toml")?;
//!     let server = ProxyServer::new(config)?;
//!     let (_tx, rx) = tokio::sync::oneshot::channel();
//!     server.run_until_shutdown(rx).await?;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod blocklist;
pub mod config;
pub mod error;
pub mod proxy;
pub mod single_flight;
pub mod tls;
pub mod transport;

#[cfg(test)]
#[allow(dead_code)]
mod test_support;

pub use audit::{AuditEntry, AuditEvent, AuditLogger};
pub use blocklist::{BlockedHostCache, BlockedHostOracle, BlockedList};
pub use config::{Config, Mode};
pub use error::{Error, Result};
pub use proxy::{ProxyHandler, ProxyServer};
pub use single_flight::SingleFlight;
pub use tls::{CertificateAuthority, CertificatePool, CertificateStore, GeneratedCa, KeyPolicy};
pub use transport::{HttpClient, UpstreamTransport};
