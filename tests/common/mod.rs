//! Test infrastructure for end-to-end proxy tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tunnelgate::tls::{CertificateAuthority, GeneratedCa};
use tunnelgate::{Config, ProxyServer};

// ---------------------------------------------------------------------------
// TestCa
// ---------------------------------------------------------------------------

/// A test CA saved to a tempdir.
pub struct TestCa {
    pub ca: CertificateAuthority,
    pub cert_pem: String,
    pub dir: TempDir,
    pub cert_path: String,
    pub key_path: String,
}

impl TestCa {
    pub fn generate() -> Self {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let generated = GeneratedCa::generate().unwrap();
        let ca = CertificateAuthority::from_pem(&generated.cert_pem, &generated.key_pem).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ca.crt");
        let key_path = dir.path().join("ca.key");
        generated.save(&cert_path, &key_path).unwrap();

        Self {
            ca,
            cert_pem: generated.cert_pem,
            cert_path: cert_path.to_str().unwrap().to_string(),
            key_path: key_path.to_str().unwrap().to_string(),
            dir,
        }
    }

    /// Point a config's `[tls]` section at this CA.
    pub fn apply(&self, config: &mut Config) {
        config.tls.ca_cert = Some(self.cert_path.clone());
        config.tls.ca_key = Some(self.key_path.clone());
    }
}

// ---------------------------------------------------------------------------
// TestProxy: wraps ProxyServer with bind + spawn
// ---------------------------------------------------------------------------

pub struct TestProxy {
    pub addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestProxy {
    /// Start a proxy on an ephemeral port.
    pub async fn start(config: Config) -> Self {
        Self::start_server(ProxyServer::new(config).unwrap()).await
    }

    pub async fn start_server(mut server: ProxyServer) -> Self {
        let addr = server.bind().await.unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let _ = server.serve(shutdown_rx).await;
        });

        Self { addr, shutdown_tx }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Config bound to an ephemeral port.
pub fn test_config() -> Config {
    Config::minimal("127.0.0.1:0".to_string())
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

/// reqwest client that routes everything through the proxy.
pub fn proxy_client(proxy_addr: SocketAddr) -> reqwest::Client {
    let proxy = reqwest::Proxy::all(format!("http://{}", proxy_addr)).unwrap();
    reqwest::Client::builder().proxy(proxy).build().unwrap()
}

/// reqwest client that routes through the proxy and trusts the test CA.
pub fn intercepting_client(proxy_addr: SocketAddr, ca: &TestCa) -> reqwest::Client {
    let proxy = reqwest::Proxy::all(format!("http://{}", proxy_addr)).unwrap();
    let ca_cert = reqwest::tls::Certificate::from_pem(ca.cert_pem.as_bytes()).unwrap();

    reqwest::Client::builder()
        .proxy(proxy)
        .add_root_certificate(ca_cert)
        .build()
        .unwrap()
}

/// Send a CONNECT by hand and return the status line plus the open stream.
pub async fn connect(proxy_addr: SocketAddr, target: &str) -> (String, TcpStream) {
    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    stream
        .write_all(format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", target).as_bytes())
        .await
        .unwrap();

    let mut reader = BufReader::new(stream);
    let mut status = String::new();
    reader.read_line(&mut status).await.unwrap();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        if line == "\r\n" || line.is_empty() {
            break;
        }
    }
    (status.trim_end().to_string(), reader.into_inner())
}

// ---------------------------------------------------------------------------
// Upstreams
// ---------------------------------------------------------------------------

/// TCP server that echoes everything back and closes after the client's EOF.
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                let _ = stream.shutdown().await;
            });
        }
    });

    addr
}

/// A local port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Raw origin response the fake relay hands back.
pub fn raw_response(status: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
        status,
        body.len(),
        body
    )
    .into_bytes()
}

/// Poll `path` until it contains `needle`; audit entries are written when
/// the response body is dropped, which can trail the client by a moment.
pub async fn wait_for_file_contains(path: &std::path::Path, needle: &str) -> String {
    for _ in 0..50 {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if contents.contains(needle) {
                return contents;
            }
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
    }
    std::fs::read_to_string(path).unwrap_or_default()
}
