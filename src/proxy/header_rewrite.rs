//! Hop-by-hop stripping and `X-Forwarded-*` / `X-Real-IP` injection, shared by
//! the HTTP, fan-out, and WebSocket proxy paths.

use http::header::{CONNECTION, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue};
use std::net::IpAddr;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Strip the RFC 7230 §6.1 hop-by-hop set plus any header named in the
/// incoming `Connection` header (e.g. `Connection: X-Custom` strips `X-Custom`
/// too).
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let mut extra: Vec<String> = Vec::new();
    if let Some(conn) = headers.get(CONNECTION).and_then(|v| v.to_str().ok()) {
        extra.extend(conn.split(',').map(|s| s.trim().to_lowercase()));
    }

    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    for name in &extra {
        if let Ok(hn) = HeaderName::try_from(name.as_str()) {
            headers.remove(hn);
        }
    }
    headers.remove(TRANSFER_ENCODING);
}

/// Proto string for `X-Forwarded-Proto`: websocket variants use `ws`/`wss`.
pub enum ForwardedProto {
    Http,
    Https,
    Ws,
    Wss,
}

impl ForwardedProto {
    fn as_str(&self) -> &'static str {
        match self {
            ForwardedProto::Http => "http",
            ForwardedProto::Https => "https",
            ForwardedProto::Ws => "ws",
            ForwardedProto::Wss => "wss",
        }
    }
}

/// Strip hop-by-hop headers, then set the `X-Forwarded-*` / `X-Real-IP` set.
pub fn rewrite_headers(
    headers: &mut HeaderMap,
    client_ip: IpAddr,
    proto: ForwardedProto,
    original_host: &str,
) {
    strip_hop_by_hop(headers);

    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");

    let ip_str = client_ip.to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let combined = format!("{}, {}", existing, ip_str);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&ip_str) {
        headers.insert(XFF.clone(), v);
    }

    if let Ok(v) = HeaderValue::from_str(&ip_str) {
        headers.insert(XRI.clone(), v);
    }

    headers.insert(XFP.clone(), HeaderValue::from_static(proto.as_str()));

    if !original_host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(original_host) {
            headers.insert(XFH.clone(), v);
        }
    }
}

/// Client IP resolution order: first `X-Forwarded-For` entry, else
/// `X-Real-IP`, else the socket peer address.
pub fn resolve_client_ip(headers: &HeaderMap, peer: IpAddr) -> IpAddr {
    if let Some(xff) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = xff.split(',').next() {
            if let Ok(ip) = first.trim().parse::<IpAddr>() {
                return ip;
            }
        }
    }
    if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if let Ok(ip) = xri.trim().parse::<IpAddr>() {
            return ip;
        }
    }
    peer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_connection_listed_header() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("x-custom"));
        headers.insert("x-custom", HeaderValue::from_static("value"));
        strip_hop_by_hop(&mut headers);
        assert!(!headers.contains_key("x-custom"));
        assert!(!headers.contains_key(CONNECTION));
    }

    #[test]
    fn resolves_from_xff_first() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        let peer: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(resolve_client_ip(&headers, peer).to_string(), "10.0.0.1");
    }

    #[test]
    fn falls_back_to_peer() {
        let headers = HeaderMap::new();
        let peer: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(resolve_client_ip(&headers, peer), peer);
    }
}
