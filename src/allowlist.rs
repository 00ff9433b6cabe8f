//! Bypass rules evaluated before any bucket is touched.

use std::net::IpAddr;

use actix_web::HttpRequest;

use crate::client_ip::{client_ip, TrustedProxies};

/// A predicate that lets matching requests skip rate limiting entirely.
/// Rules are pure and evaluated in order; the first match wins.
#[derive(Debug, Clone)]
pub enum AllowRule {
    /// Requests whose path starts with any of the given prefixes
    /// (e.g. `/healthz`).
    PathPrefixes(Vec<String>),

    /// Requests whose resolved client IP is a loopback address
    /// (`127.0.0.0/8` or `::1`). Handy for local development.
    Loopback,

    /// Requests whose resolved client IP is in the given IP/CIDR list.
    IpRange(TrustedProxies),

    /// Requests carrying an exact header value, for service-to-service
    /// traffic with an internal token. In production the configured value
    /// should itself be a hashed shared secret, never the raw one.
    HeaderEquals { name: String, value: String },
}

impl AllowRule {
    pub fn matches(&self, req: &HttpRequest, trusted: &TrustedProxies) -> bool {
        match self {
            AllowRule::PathPrefixes(prefixes) => {
                prefixes.iter().any(|p| req.path().starts_with(p.as_str()))
            }
            AllowRule::Loopback => client_ip(req, trusted)
                .parse::<IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false),
            AllowRule::IpRange(allowed) => allowed.contains_str(&client_ip(req, trusted)),
            AllowRule::HeaderEquals { name, value } => req
                .headers()
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .map(|v| v == value)
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use actix_web::test::TestRequest;

    use super::*;

    fn no_proxies() -> TrustedProxies {
        TrustedProxies::default()
    }

    #[test]
    fn path_prefix_match() {
        let rule = AllowRule::PathPrefixes(vec!["/healthz".into(), "/metrics".into()]);
        let req = TestRequest::get().uri("/healthz/live").to_http_request();
        assert!(rule.matches(&req, &no_proxies()));

        let req = TestRequest::get().uri("/api/users").to_http_request();
        assert!(!rule.matches(&req, &no_proxies()));
    }

    #[test]
    fn loopback_match() {
        let rule = AllowRule::Loopback;
        let req = TestRequest::default()
            .peer_addr("127.0.0.1:5000".parse().unwrap())
            .to_http_request();
        assert!(rule.matches(&req, &no_proxies()));

        let req = TestRequest::default()
            .peer_addr("[::1]:5000".parse().unwrap())
            .to_http_request();
        assert!(rule.matches(&req, &no_proxies()));

        let req = TestRequest::default()
            .peer_addr("8.8.8.8:5000".parse().unwrap())
            .to_http_request();
        assert!(!rule.matches(&req, &no_proxies()));
    }

    #[test]
    fn ip_range_match() {
        let rule = AllowRule::IpRange(TrustedProxies::parse(["192.0.2.0/24"]));
        let req = TestRequest::default()
            .peer_addr("192.0.2.77:5000".parse().unwrap())
            .to_http_request();
        assert!(rule.matches(&req, &no_proxies()));

        let req = TestRequest::default()
            .peer_addr("198.51.100.1:5000".parse().unwrap())
            .to_http_request();
        assert!(!rule.matches(&req, &no_proxies()));
    }

    #[test]
    fn header_equals_match() {
        let rule = AllowRule::HeaderEquals {
            name: "X-Internal-Token".into(),
            value: "c0ffee".into(),
        };
        let req = TestRequest::default()
            .insert_header(("X-Internal-Token", "c0ffee"))
            .to_http_request();
        assert!(rule.matches(&req, &no_proxies()));

        let req = TestRequest::default()
            .insert_header(("X-Internal-Token", "decaf"))
            .to_http_request();
        assert!(!rule.matches(&req, &no_proxies()));

        let req = TestRequest::default().to_http_request();
        assert!(!rule.matches(&req, &no_proxies()));
    }
}
