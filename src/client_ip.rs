//! Client IP resolution with trusted-proxy support.
//!
//! Forwarded headers are spoofable by any client, so `X-Real-IP` and
//! `X-Forwarded-For` are only honoured when the immediate peer is listed in
//! the configured trusted proxies.

use std::net::{IpAddr, Ipv6Addr};

use actix_web::HttpRequest;
use ipnet::IpNet;
use tracing::warn;

const X_REAL_IP: &str = "x-real-ip";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Reported when the transport exposes no peer address (only seen with
/// hand-built test requests).
const UNKNOWN_PEER: &str = "unknown";

/// A parsed list of trusted reverse proxies. Entries are plain IPs
/// (`10.0.0.1`) or CIDR ranges (`10.0.0.0/8`).
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    entries: Vec<TrustedEntry>,
}

#[derive(Debug, Clone)]
enum TrustedEntry {
    Ip(IpAddr),
    Net(IpNet),
}

impl TrustedProxies {
    /// Parse a list of IP / CIDR strings. Invalid entries are skipped with a
    /// warning rather than failing the whole list.
    pub fn parse<I>(entries: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut parsed = Vec::new();
        for raw in entries {
            let raw = raw.as_ref().trim();
            if raw.is_empty() {
                continue;
            }
            if raw.contains('/') {
                match raw.parse::<IpNet>() {
                    Ok(net) => parsed.push(TrustedEntry::Net(net)),
                    Err(e) => warn!(entry = raw, error = %e, "ignoring invalid trusted-proxy CIDR"),
                }
            } else {
                match raw.parse::<IpAddr>() {
                    Ok(ip) => parsed.push(TrustedEntry::Ip(ip)),
                    Err(e) => warn!(entry = raw, error = %e, "ignoring invalid trusted-proxy IP"),
                }
            }
        }
        Self { entries: parsed }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if `ip` matches any trusted entry.
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.entries.iter().any(|entry| match entry {
            TrustedEntry::Ip(trusted) => *trusted == ip,
            TrustedEntry::Net(net) => net.contains(&ip),
        })
    }

    /// Like [`contains`](Self::contains) but for textual addresses; anything
    /// unparseable is treated as untrusted.
    pub fn contains_str(&self, raw: &str) -> bool {
        raw.trim()
            .parse::<IpAddr>()
            .map(|ip| self.contains(ip))
            .unwrap_or(false)
    }
}

/// Resolve the real client IP for a request.
///
/// 1. If the peer is not a trusted proxy (or no proxies are configured),
///    the peer address wins and forwarded headers are ignored.
/// 2. Otherwise `X-Real-IP` is used when present.
/// 3. Otherwise `X-Forwarded-For` is walked right-to-left and the first
///    untrusted entry wins; if every entry is trusted, the leftmost is used.
pub fn client_ip(req: &HttpRequest, trusted: &TrustedProxies) -> String {
    let Some(peer_ip) = req.peer_addr().map(|addr| addr.ip()) else {
        return UNKNOWN_PEER.to_string();
    };

    if trusted.is_empty() || !trusted.contains(peer_ip) {
        return normalize_addr(peer_ip);
    }

    if let Some(real_ip) = header_value(req, X_REAL_IP) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return normalize_ip(real_ip);
        }
    }

    if let Some(xff) = header_value(req, X_FORWARDED_FOR) {
        let parts: Vec<&str> = xff.split(',').collect();
        for part in parts.iter().rev() {
            let candidate = part.trim();
            if candidate.is_empty() {
                continue;
            }
            if !trusted.contains_str(candidate) {
                return normalize_ip(candidate);
            }
        }
        // Every hop is one of ours; the leftmost entry is the best guess.
        if let Some(first) = parts.first().map(|p| p.trim()) {
            if !first.is_empty() {
                return normalize_ip(first);
            }
        }
    }

    normalize_addr(peer_ip)
}

fn header_value<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Normalise a textual IP: trim, parse and re-serialise so that variants
/// such as IPv4-mapped IPv6 collapse to a canonical form. Unparseable input
/// is returned trimmed but otherwise untouched.
pub fn normalize_ip(raw: &str) -> String {
    let raw = raw.trim();
    match raw.parse::<IpAddr>() {
        Ok(ip) => normalize_addr(ip),
        Err(_) => raw.to_string(),
    }
}

fn normalize_addr(ip: IpAddr) -> String {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        IpAddr::V4(v4) => v4.to_string(),
    }
}

/// Mask an IPv6 address to its /64 so that limits stay fair against cheap
/// address rotation within one allocation. IPv4 passes through unchanged.
pub fn coarsen_ipv6(ip: &str) -> String {
    let Ok(parsed) = ip.trim().parse::<IpAddr>() else {
        return ip.to_string();
    };
    match parsed {
        IpAddr::V4(_) => ip.to_string(),
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            let masked = Ipv6Addr::new(seg[0], seg[1], seg[2], seg[3], 0, 0, 0, 0);
            format!("{}/64", masked)
        }
    }
}

#[cfg(test)]
mod tests {
    use actix_web::test::TestRequest;

    use super::*;

    #[test]
    fn peer_address_direct() {
        let req = TestRequest::default()
            .peer_addr("192.168.1.100:12345".parse().unwrap())
            .to_http_request();
        assert_eq!(client_ip(&req, &TrustedProxies::default()), "192.168.1.100");
    }

    #[test]
    fn peer_address_ipv6() {
        let req = TestRequest::default()
            .peer_addr("[::1]:12345".parse().unwrap())
            .to_http_request();
        assert_eq!(client_ip(&req, &TrustedProxies::default()), "::1");
    }

    #[test]
    fn forwarded_headers_ignored_without_trusted_proxies() {
        let req = TestRequest::default()
            .peer_addr("10.0.0.7:443".parse().unwrap())
            .insert_header(("X-Forwarded-For", "203.0.113.9, 10.0.0.2"))
            .insert_header(("X-Real-IP", "203.0.113.9"))
            .to_http_request();
        assert_eq!(client_ip(&req, &TrustedProxies::default()), "10.0.0.7");
    }

    #[test]
    fn forwarded_for_walked_right_to_left() {
        let trusted = TrustedProxies::parse(["10.0.0.0/8"]);
        let req = TestRequest::default()
            .peer_addr("10.0.0.7:443".parse().unwrap())
            .insert_header(("X-Forwarded-For", "203.0.113.9, 10.0.0.2"))
            .to_http_request();
        assert_eq!(client_ip(&req, &trusted), "203.0.113.9");
    }

    #[test]
    fn real_ip_preferred_over_forwarded_for() {
        let trusted = TrustedProxies::parse(["10.0.0.0/8"]);
        let req = TestRequest::default()
            .peer_addr("10.0.0.7:443".parse().unwrap())
            .insert_header(("X-Real-IP", "198.51.100.4"))
            .insert_header(("X-Forwarded-For", "203.0.113.9"))
            .to_http_request();
        assert_eq!(client_ip(&req, &trusted), "198.51.100.4");
    }

    #[test]
    fn all_trusted_falls_back_to_leftmost() {
        let trusted = TrustedProxies::parse(["10.0.0.0/8"]);
        let req = TestRequest::default()
            .peer_addr("10.0.0.7:443".parse().unwrap())
            .insert_header(("X-Forwarded-For", "10.0.0.9, 10.0.0.2"))
            .to_http_request();
        assert_eq!(client_ip(&req, &trusted), "10.0.0.9");
    }

    #[test]
    fn untrusted_peer_wins_even_with_trusted_list() {
        let trusted = TrustedProxies::parse(["10.0.0.0/8"]);
        let req = TestRequest::default()
            .peer_addr("203.0.113.50:443".parse().unwrap())
            .insert_header(("X-Forwarded-For", "198.51.100.4"))
            .to_http_request();
        assert_eq!(client_ip(&req, &trusted), "203.0.113.50");
    }

    #[test]
    fn normalize_cases() {
        assert_eq!(normalize_ip("192.168.1.1"), "192.168.1.1");
        assert_eq!(normalize_ip("::1"), "::1");
        assert_eq!(normalize_ip("  10.0.0.1 "), "10.0.0.1");
        assert_eq!(normalize_ip("::ffff:192.168.1.1"), "192.168.1.1");
        assert_eq!(normalize_ip("not-an-ip"), "not-an-ip");
    }

    #[test]
    fn trusted_list_membership() {
        let trusted = TrustedProxies::parse(["10.0.0.0/8", "172.16.0.1"]);
        assert!(trusted.contains_str("10.0.0.1"));
        assert!(trusted.contains_str("10.255.255.255"));
        assert!(trusted.contains_str("172.16.0.1"));
        assert!(!trusted.contains_str("172.16.0.2"));
        assert!(!trusted.contains_str("192.168.1.1"));
        assert!(!trusted.contains_str("garbage"));
    }

    #[test]
    fn invalid_entries_are_skipped() {
        let trusted = TrustedProxies::parse(["10.0.0.0/8", "not-a-cidr/99", "bogus"]);
        assert!(trusted.contains_str("10.1.2.3"));
        assert!(!trusted.contains_str("192.0.2.1"));
    }

    #[test]
    fn coarsen_masks_ipv6_to_slash_64() {
        assert_eq!(coarsen_ipv6("192.168.1.1"), "192.168.1.1");
        assert_eq!(
            coarsen_ipv6("2001:db8:85a3::8a2e:370:7334"),
            "2001:db8:85a3::/64"
        );
        assert_eq!(coarsen_ipv6("junk"), "junk");
    }
}
