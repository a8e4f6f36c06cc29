//! Header manipulation for forwarded traffic.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers in both directions
//! - Add X-Forwarded-For, X-Forwarded-Proto, X-Forwarded-Host
//! - Select the headers carried into an upstream WebSocket handshake
//!
//! # Design Decisions
//! - Never trust existing X-Forwarded-* from clients; they are replaced
//! - End-to-end headers (including `authorization`) pass untouched

use std::net::SocketAddr;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};

/// Headers meaningful only for a single transport hop (RFC 9110 §7.6.1).
pub const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(&name);
    }
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Replace the X-Forwarded-* headers with what this hop observed.
pub fn set_forwarded_headers(headers: &mut HeaderMap, client: Option<SocketAddr>, proto: &'static str) {
    let host = headers.get(header::HOST).cloned();

    headers.remove(&X_FORWARDED_FOR);
    if let Some(addr) = client {
        if let Ok(value) = HeaderValue::from_str(&addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    headers.remove(&X_FORWARDED_HOST);
    if let Some(host) = host {
        headers.insert(X_FORWARDED_HOST, host);
    }
}

/// Headers copied from a client upgrade into the upstream handshake.
///
/// The handshake itself (key, version, upgrade) is generated by the client
/// library; subprotocols are carried separately.
pub fn websocket_passthrough(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    strip_hop_by_hop(&mut out);
    out.remove(header::HOST);
    out.remove(header::CONTENT_LENGTH);
    out.remove(header::SEC_WEBSOCKET_KEY);
    out.remove(header::SEC_WEBSOCKET_VERSION);
    out.remove(header::SEC_WEBSOCKET_EXTENSIONS);
    out.remove(header::SEC_WEBSOCKET_PROTOCOL);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fixed_and_connection_listed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-session-hint"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session-hint", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::PROXY_AUTHORIZATION, HeaderValue::from_static("Basic x"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer k"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 3);
        assert!(headers.contains_key(header::AUTHORIZATION));
        assert!(headers.contains_key(header::CONTENT_TYPE));
        assert!(headers.contains_key(header::ACCEPT));
    }

    #[test]
    fn forwarded_headers_replace_client_supplied_values() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("chat.example.com"));
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("6.6.6.6"));

        let client: SocketAddr = "10.0.0.7:5555".parse().unwrap();
        set_forwarded_headers(&mut headers, Some(client), "http");

        assert_eq!(headers[&X_FORWARDED_FOR], "10.0.0.7");
        assert_eq!(headers[&X_FORWARDED_PROTO], "http");
        assert_eq!(headers[&X_FORWARDED_HOST], "chat.example.com");
    }

    #[test]
    fn websocket_passthrough_drops_handshake_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::SEC_WEBSOCKET_KEY, HeaderValue::from_static("abc"));
        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("chat"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::HOST, HeaderValue::from_static("proxy"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer k"));

        let out = websocket_passthrough(&headers);
        assert_eq!(out.len(), 1);
        assert!(out.contains_key(header::AUTHORIZATION));
    }
}
