//! CONNECT handling: raw tunnels with half-close, and TLS interception for relays.

#[macro_use]
#[allow(dead_code)]
#[path = "../src/test_support.rs"]
mod test_support;

mod common;

use common::{
    closed_port, connect, intercepting_client, raw_response, start_echo_server, test_config,
    wait_for_file_contains, TestCa, TestProxy,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tunnelgate::config::Mode;
use tunnelgate::KeyPolicy;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Bytes flow both ways and a client half-close still lets the reply through.
#[tokio::test]
async fn test_raw_tunnel_half_close() {
    let t = test_report!("Raw CONNECT tunnel relays both directions with half-close");

    let echo = start_echo_server().await;
    let proxy = TestProxy::start(test_config()).await;

    t.action(format!("CONNECT {}", echo));
    let (status, mut stream) = connect(proxy.addr(), &echo.to_string()).await;
    t.assert_eq("Status line", &status.as_str(), &"HTTP/1.1 200 OK");

    let payload = vec![b'x'; 64 * 1024];
    stream.write_all(&payload).await.unwrap();
    stream.shutdown().await.unwrap();
    t.action("Sent 64 KB and closed the write half");

    let mut echoed = Vec::new();
    stream.read_to_end(&mut echoed).await.unwrap();
    t.assert_eq("Echoed length", &echoed.len(), &payload.len());
    t.assert_true("Echoed content", echoed == payload);

    proxy.shutdown();
}

/// Tunnel close is audited with the byte counts of both directions.
#[tokio::test]
async fn test_raw_tunnel_audited() {
    let t = test_report!("Closed tunnel is audited with byte counts");

    let echo = start_echo_server().await;
    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("audit.jsonl");
    let mut config = test_config();
    config.logging.audit_log = Some(audit_path.to_str().unwrap().to_string());
    let proxy = TestProxy::start(config).await;

    let (_, mut stream) = connect(proxy.addr(), &echo.to_string()).await;
    stream.write_all(b"ping").await.unwrap();
    stream.shutdown().await.unwrap();
    let mut echoed = Vec::new();
    stream.read_to_end(&mut echoed).await.unwrap();
    drop(stream);

    let contents = wait_for_file_contains(&audit_path, "tunnel_closed").await;
    t.output("audit log", &contents);
    let entry: serde_json::Value =
        serde_json::from_str(contents.lines().next().unwrap()).unwrap();
    t.assert_eq("event", &entry["event"].as_str(), &Some("tunnel_closed"));
    t.assert_eq("method", &entry["method"].as_str(), &Some("CONNECT"));
    t.assert_eq("bytes_up", &entry["bytes_up"].as_u64(), &Some(4));
    t.assert_eq("bytes_down", &entry["bytes_down"].as_u64(), &Some(4));

    proxy.shutdown();
}

/// The proxy only answers 200 once the upstream stream exists.
#[tokio::test]
async fn test_tunnel_dial_failure() {
    let t = test_report!("CONNECT to a closed port returns 500");

    let port = closed_port().await;
    let proxy = TestProxy::start(test_config()).await;

    let (status, _) = connect(proxy.addr(), &format!("127.0.0.1:{}", port)).await;
    t.assert_starts_with("Status line", &status, "HTTP/1.1 500");

    proxy.shutdown();
}

async fn start_relay(body: Vec<u8>) -> MockServer {
    let relay = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/data"))
        .mount(&relay)
        .await;
    relay
}

/// HTTPS through a relay: the proxy terminates TLS with a minted certificate
/// and relays each decrypted request.
#[tokio::test]
async fn test_intercepted_https() {
    let t = test_report!("HTTPS via relay is intercepted and relayed");

    let ca = TestCa::generate();
    let relay = start_relay(raw_response("200 OK", "secret page")).await;

    let mut config = test_config();
    config.proxy.mode = Mode::Always;
    config.proxy.remote = Some(format!("{}/fetch", relay.uri()));
    ca.apply(&mut config);
    let proxy = TestProxy::start(config).await;

    let client = intercepting_client(proxy.addr(), &ca);
    t.action("GET https://secure.test/account?tab=1 through the proxy");
    let resp = client
        .get("https://secure.test/account?tab=1")
        .send()
        .await
        .unwrap();

    t.assert_eq("Response status", &resp.status().as_u16(), &200u16);
    t.assert_eq(
        "Response body",
        &resp.text().await.unwrap().as_str(),
        &"secret page",
    );

    let received = relay.received_requests().await.unwrap();
    let payload = String::from_utf8_lossy(&received[0].body).to_string();
    t.assert_starts_with(
        "Relay sees the decrypted request",
        &payload,
        "GET https://secure.test/account?tab=1 HTTP/1.1\r\n",
    );

    proxy.shutdown();
}

/// Several requests share one intercepted connection.
#[tokio::test]
async fn test_intercepted_keepalive() {
    let t = test_report!("Multiple requests over one intercepted tunnel");

    let ca = TestCa::generate();
    let relay = start_relay(raw_response("200 OK", "ok")).await;

    let mut config = test_config();
    config.proxy.mode = Mode::Always;
    config.proxy.remote = Some(format!("{}/fetch", relay.uri()));
    ca.apply(&mut config);
    let proxy = TestProxy::start(config).await;

    let client = intercepting_client(proxy.addr(), &ca);
    for i in 0..3 {
        let resp = client
            .get(format!("https://secure.test/{}", i))
            .send()
            .await
            .unwrap();
        t.assert_eq("Response body", &resp.text().await.unwrap().as_str(), &"ok");
    }

    t.assert_eq(
        "Relay requests",
        &relay.received_requests().await.unwrap().len(),
        &3usize,
    );
    proxy.shutdown();
}

/// Only port 443 can be intercepted; anything else is refused up front.
#[tokio::test]
async fn test_intercept_non_https_port() {
    let t = test_report!("CONNECT to a non-443 port through a relay returns 400");

    let ca = TestCa::generate();
    let relay = start_relay(raw_response("200 OK", "unused")).await;

    let mut config = test_config();
    config.proxy.mode = Mode::Always;
    config.proxy.remote = Some(format!("{}/fetch", relay.uri()));
    ca.apply(&mut config);
    let proxy = TestProxy::start(config).await;

    let (status, _) = connect(proxy.addr(), "secure.test:22").await;
    t.assert_starts_with("Status line", &status, "HTTP/1.1 400");

    proxy.shutdown();
}

/// Minted certificates are written to `certs_dir` and reused after a restart.
#[tokio::test]
async fn test_certificates_persisted() {
    let t = test_report!("Minted certificates are stored on disk");

    let ca = TestCa::generate();
    let relay = start_relay(raw_response("200 OK", "ok")).await;
    let certs = tempfile::tempdir().unwrap();

    let mut config = test_config();
    config.proxy.mode = Mode::Always;
    config.proxy.remote = Some(format!("{}/fetch", relay.uri()));
    config.tls.certs_dir = Some(certs.path().to_str().unwrap().to_string());
    config.tls.key_policy = KeyPolicy::PerHost;
    ca.apply(&mut config);

    let proxy = TestProxy::start(config.clone()).await;
    intercepting_client(proxy.addr(), &ca)
        .get("https://stored.test/")
        .send()
        .await
        .unwrap();
    proxy.shutdown();

    let crt = certs.path().join("stored.test.crt");
    t.assert_true("certificate written", crt.exists());
    t.assert_true("key written", certs.path().join("stored.test.key").exists());
    let first = std::fs::read(&crt).unwrap();

    let proxy = TestProxy::start(config).await;
    let resp = intercepting_client(proxy.addr(), &ca)
        .get("https://stored.test/")
        .send()
        .await
        .unwrap();
    t.assert_eq("second run works", &resp.status().as_u16(), &200u16);
    t.assert_true("certificate reused", std::fs::read(&crt).unwrap() == first);

    proxy.shutdown();
}
