use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::ConnectInfo;
use axum::http::{header, HeaderMap, Request};
use ipnet::IpNet;
use tracing::warn;

use crate::limits::UNKNOWN_CLIENT;

/// Origin of a request as used by the upload limiter. Inserted into request
/// extensions by [`crate::middleware::record_client_key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKey(pub String);

impl ClientKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Networks whose forwarding headers are believed.
#[derive(Clone, Default)]
pub struct TrustedProxyList {
    networks: Arc<Vec<IpNet>>,
}

impl TrustedProxyList {
    pub fn new(networks: Vec<IpNet>) -> Self {
        Self {
            networks: Arc::new(networks),
        }
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        let ip = addr.ip();
        self.networks.iter().any(|net| net.contains(&ip))
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

/// Parses a comma or whitespace separated CIDR list. Bad entries are skipped.
pub fn parse_trusted_proxies(text: &str) -> Vec<IpNet> {
    let mut networks = Vec::new();
    for cidr in text
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
    {
        if cidr.is_empty() || cidr.starts_with('#') {
            continue;
        }

        match cidr.parse::<IpNet>() {
            Ok(net) => networks.push(net),
            Err(err) => warn!("Skipping invalid trusted proxy CIDR {} ({})", cidr, err),
        }
    }
    networks
}

/// Derives the client key for `req`, preferring one already recorded in its
/// extensions.
pub fn client_key<B>(req: &Request<B>, trusted: &TrustedProxyList) -> ClientKey {
    if let Some(key) = req.extensions().get::<ClientKey>() {
        return key.clone();
    }

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    ClientKey(extract_client_addr(req.headers(), peer, trusted))
}

/// Forwarding headers are only honoured when the TCP peer is a trusted proxy.
pub fn extract_client_addr(
    headers: &HeaderMap,
    peer_addr: Option<SocketAddr>,
    trusted: &TrustedProxyList,
) -> String {
    let Some(peer_addr) = peer_addr else {
        return UNKNOWN_CLIENT.to_string();
    };

    if trusted.contains(&peer_addr) {
        if let Some(forwarded) = forwarded_client(headers) {
            return forwarded;
        }
    }

    peer_addr.ip().to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: impl header::AsHeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Reduces a forwarded `ip`, `ip:port`, `[v6]` or `[v6]:port` to the bare
/// address so the source port never becomes part of the key.
fn normalize_addr(raw: &str) -> String {
    let raw = raw.trim().trim_matches('"');
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return addr.ip().to_string();
    }
    let unbracketed = raw
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .unwrap_or(raw);
    match unbracketed.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => raw.to_string(),
    }
}

fn forwarded_client(headers: &HeaderMap) -> Option<String> {
    // "ip:port", where ip may itself be IPv6.
    if let Some(viewer) = header_str(headers, "cloudfront-viewer-address") {
        let ip = viewer.rsplit_once(':').map_or(viewer, |(ip, _)| ip);
        return Some(normalize_addr(ip));
    }

    if let Some(ip) = header_str(headers, "cf-connecting-ip") {
        return Some(normalize_addr(ip));
    }

    if let Some(forwarded) = header_str(headers, header::FORWARDED) {
        for part in forwarded.split([';', ',']) {
            if let Some(value) = part.trim().strip_prefix("for=") {
                return Some(normalize_addr(value));
            }
        }
    }

    if let Some(xff) = header_str(headers, "x-forwarded-for") {
        if let Some(ip) = xff.split(',').next() {
            return Some(normalize_addr(ip));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn trusted() -> TrustedProxyList {
        TrustedProxyList::new(parse_trusted_proxies("10.0.0.0/8, 2001:db8::/32"))
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn peer(addr: &str) -> Option<SocketAddr> {
        Some(addr.parse().expect("valid socket address"))
    }

    #[test]
    fn missing_peer_collapses_to_unknown() {
        let key = extract_client_addr(&HeaderMap::new(), None, &trusted());
        assert_eq!(key, UNKNOWN_CLIENT);
    }

    #[test]
    fn untrusted_peer_headers_are_ignored() {
        let h = headers(&[("x-forwarded-for", "198.51.100.9")]);
        let key = extract_client_addr(&h, peer("203.0.113.4:5000"), &trusted());
        assert_eq!(key, "203.0.113.4");
    }

    #[test]
    fn trusted_peer_uses_cloudfront_viewer_address() {
        let h = headers(&[
            ("cloudfront-viewer-address", "198.51.100.9:44321"),
            ("x-forwarded-for", "192.0.2.1"),
        ]);
        let key = extract_client_addr(&h, peer("10.1.2.3:443"), &trusted());
        assert_eq!(key, "198.51.100.9");
    }

    #[test]
    fn cloudfront_ipv6_viewer_keeps_address() {
        let h = headers(&[("cloudfront-viewer-address", "2001:db8:1::7:8443")]);
        let key = extract_client_addr(&h, peer("10.1.2.3:443"), &trusted());
        assert_eq!(key, "2001:db8:1::7");
    }

    #[test]
    fn trusted_peer_falls_through_header_precedence() {
        let h = headers(&[("forwarded", "proto=https;for=\"192.0.2.60\"")]);
        assert_eq!(
            extract_client_addr(&h, peer("10.0.0.1:80"), &trusted()),
            "192.0.2.60"
        );

        let h = headers(&[("x-forwarded-for", "192.0.2.61, 10.0.0.2")]);
        assert_eq!(
            extract_client_addr(&h, peer("10.0.0.1:80"), &trusted()),
            "192.0.2.61"
        );

        assert_eq!(
            extract_client_addr(&HeaderMap::new(), peer("10.0.0.1:80"), &trusted()),
            "10.0.0.1"
        );
    }

    #[test]
    fn forwarded_ports_do_not_change_the_key() {
        let forwarded = |value: &'static str| {
            let h = headers(&[("forwarded", value)]);
            extract_client_addr(&h, peer("10.0.0.1:80"), &trusted())
        };
        assert_eq!(forwarded("for=\"192.0.2.60:47011\""), "192.0.2.60");
        assert_eq!(
            forwarded("for=\"192.0.2.60:47011\""),
            forwarded("for=\"192.0.2.60:47012\"")
        );
        assert_eq!(forwarded("for=\"[2001:db8::1]:4711\""), "2001:db8::1");
        assert_eq!(forwarded("for=\"[2001:db8::1]\""), "2001:db8::1");
        assert_eq!(forwarded("for=unknown"), "unknown");
    }

    #[test]
    fn forwarded_for_entries_drop_ports() {
        let h = headers(&[("x-forwarded-for", "1.2.3.4:5678, 10.0.0.2")]);
        assert_eq!(
            extract_client_addr(&h, peer("10.0.0.1:80"), &trusted()),
            "1.2.3.4"
        );

        let h = headers(&[("x-forwarded-for", "2001:db8::5")]);
        assert_eq!(
            extract_client_addr(&h, peer("10.0.0.1:80"), &trusted()),
            "2001:db8::5"
        );
    }

    #[test]
    fn invalid_cidrs_are_skipped() {
        let nets = parse_trusted_proxies("10.0.0.0/8,not-a-cidr\n 192.168.0.0/16");
        assert_eq!(nets.len(), 2);
        assert!(parse_trusted_proxies("").is_empty());
    }

    #[test]
    fn recorded_key_takes_precedence() {
        let mut req = Request::new(());
        req.extensions_mut()
            .insert(ClientKey("198.51.100.1".to_string()));
        req.extensions_mut()
            .insert(ConnectInfo("203.0.113.4:1".parse::<SocketAddr>().unwrap()));
        assert_eq!(client_key(&req, &trusted()).as_str(), "198.51.100.1");
    }
}
