//! Removal of hop-by-hop and proxy-only request headers

use hyper::header::{HeaderMap, HeaderName, CONNECTION};

/// Headers that never travel past the proxy. `Transfer-Encoding` is absent:
/// hyper owns body framing on both sides.
const STRIPPED_HEADERS: &[&str] = &[
    "accept-encoding",
    "connection",
    "keep-alive",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

/// Strip hop-by-hop and proxy-only headers in place, including every
/// header named by a `Connection` token.
///
/// `Accept-Encoding` is dropped so origins answer uncompressed and byte
/// counts reflect what the client sees.
pub fn sanitize_request_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }

    for name in STRIPPED_HEADERS {
        headers.remove(*name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_report;
    use hyper::header::{HeaderValue, HOST, USER_AGENT};

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn test_strips_fixed_set() {
        let t = test_report!("Hop-by-hop and proxy headers are removed");
        let mut map = headers(&[
            ("host", "example.com"),
            ("accept-encoding", "gzip"),
            ("proxy-connection", "keep-alive"),
            ("proxy-authorization", "Basic Zm9vOmJhcg=="),
            ("keep-alive", "timeout=5"),
            ("te", "trailers"),
            ("trailer", "Expires"),
            ("upgrade", "websocket"),
            ("user-agent", "curl/8"),
        ]);
        sanitize_request_headers(&mut map);

        t.assert_eq("remaining", &map.len(), &2usize);
        t.assert_true("host kept", map.contains_key(HOST));
        t.assert_true("user-agent kept", map.contains_key(USER_AGENT));
    }

    #[test]
    fn test_strips_connection_tokens() {
        let t = test_report!("Headers named by Connection tokens are removed");
        let mut map = headers(&[
            ("connection", "close, X-Secret , x-other"),
            ("connection", "X-Third"),
            ("x-secret", "1"),
            ("x-other", "2"),
            ("x-third", "3"),
            ("x-kept", "4"),
        ]);
        sanitize_request_headers(&mut map);

        t.assert_true("connection gone", !map.contains_key(CONNECTION));
        t.assert_true("x-secret gone", !map.contains_key("x-secret"));
        t.assert_true("x-other gone", !map.contains_key("x-other"));
        t.assert_true("x-third gone", !map.contains_key("x-third"));
        t.assert_true("x-kept kept", map.contains_key("x-kept"));
    }

    #[test]
    fn test_transfer_encoding_untouched() {
        let t = test_report!("Transfer-Encoding is left for hyper's framing");
        let mut map = headers(&[("transfer-encoding", "chunked")]);
        sanitize_request_headers(&mut map);
        t.assert_true("kept", map.contains_key("transfer-encoding"));
    }

    #[test]
    fn test_clean_map_unchanged() {
        let t = test_report!("A map without hop-by-hop headers is unchanged");
        let mut map = headers(&[("host", "a.com"), ("accept", "*/*")]);
        sanitize_request_headers(&mut map);
        t.assert_eq("len", &map.len(), &2usize);
    }
}
