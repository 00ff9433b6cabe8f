//! Key derivation: who is being rate limited.
//!
//! A key is an opaque `<tag>:<payload>` string. Payloads are either textual
//! principal identifiers (IP, user id, path) or a 16-hex truncation of a
//! SHA-256 digest. Raw secrets (bearer tokens, emails, user agents) never
//! appear in a key, in logs or in stored state.

use std::fmt;
use std::sync::Arc;

use actix_web::http::{header, Method};
use actix_web::{HttpMessage, HttpRequest};
use sha2::{Digest, Sha256};

use crate::client_ip::{client_ip, TrustedProxies};

/// The tag part of a key, also recorded in deny-log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Token,
    User,
    Session,
    Ip,
    IpUa,
    IpRoute,
    IpIdent,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Token => "token",
            KeyKind::User => "user",
            KeyKind::Session => "session",
            KeyKind::Ip => "ip",
            KeyKind::IpUa => "ipua",
            KeyKind::IpRoute => "iproute",
            KeyKind::IpIdent => "ipident",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authenticated principal for a request, inserted into request
/// extensions by the embedding application's auth middleware. This is the
/// only thing the limiter knows about authentication.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: String,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

type CustomKeyFn = Arc<dyn Fn(&HttpRequest) -> (String, KeyKind) + Send + Sync>;

/// How to compute the rate-limit key for a request.
///
/// The presets cover the common cases; [`KeyStrategy::custom`] accepts any
/// closure (for example a session-cookie hash tagged [`KeyKind::Session`]).
#[derive(Clone)]
pub enum KeyStrategy {
    /// `ip:<addr>`
    Ip,
    /// `user:<principal_id>` when authenticated, else by IP.
    UserElseIp,
    /// `token:<hash>` for bearer requests, else user, else IP.
    TokenElseUserElseIp,
    /// `ipident:<ip>:<hash>` of a normalised form/query field, e.g. `email`.
    /// Limits brute-force attempts on one account even across slight IP
    /// rotation, without storing the identifier itself.
    IpAndIdentifier(String),
    /// `iproute:<ip>:<path>` for per-endpoint limits.
    IpAndRoute,
    /// `ipua:<ip>:<hash>` of the user agent.
    IpAndUa,
    Custom(CustomKeyFn),
}

impl KeyStrategy {
    pub fn by_ip() -> Self {
        Self::Ip
    }

    pub fn by_user_else_ip() -> Self {
        Self::UserElseIp
    }

    pub fn by_token_else_user_else_ip() -> Self {
        Self::TokenElseUserElseIp
    }

    pub fn by_ip_and_identifier(field: impl Into<String>) -> Self {
        Self::IpAndIdentifier(field.into())
    }

    pub fn by_ip_and_route() -> Self {
        Self::IpAndRoute
    }

    pub fn by_ip_and_ua() -> Self {
        Self::IpAndUa
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&HttpRequest) -> (String, KeyKind) + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Whether the middleware should buffer the request body before keying.
    /// Only the identifier strategy reads form bodies, and only for methods
    /// that carry one.
    pub(crate) fn needs_body(&self, method: &Method) -> bool {
        matches!(self, KeyStrategy::IpAndIdentifier(_))
            && (*method == Method::POST || *method == Method::PUT)
    }

    /// Compute `(key, kind)` for a request. `form_body` is the buffered
    /// urlencoded body when [`needs_body`](Self::needs_body) asked for it.
    pub fn key_for(
        &self,
        req: &HttpRequest,
        form_body: Option<&[u8]>,
        trusted: &TrustedProxies,
    ) -> (String, KeyKind) {
        match self {
            KeyStrategy::Ip => ip_key(req, trusted),
            KeyStrategy::UserElseIp => user_key(req).unwrap_or_else(|| ip_key(req, trusted)),
            KeyStrategy::TokenElseUserElseIp => {
                if let Some(token) = extract_bearer_token(req) {
                    (format!("token:{}", hash16(&token)), KeyKind::Token)
                } else if let Some(user) = user_key(req) {
                    user
                } else {
                    ip_key(req, trusted)
                }
            }
            KeyStrategy::IpAndIdentifier(field) => {
                let ip = client_ip(req, trusted);
                let identifier = extract_identifier(req, form_body, field);
                (
                    format!("ipident:{}:{}", ip, hash16(&identifier)),
                    KeyKind::IpIdent,
                )
            }
            KeyStrategy::IpAndRoute => {
                let ip = client_ip(req, trusted);
                (format!("iproute:{}:{}", ip, req.path()), KeyKind::IpRoute)
            }
            KeyStrategy::IpAndUa => {
                let ip = client_ip(req, trusted);
                let ua = req
                    .headers()
                    .get(header::USER_AGENT)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                (format!("ipua:{}:{}", ip, hash16(ua)), KeyKind::IpUa)
            }
            KeyStrategy::Custom(f) => f(req),
        }
    }
}

fn ip_key(req: &HttpRequest, trusted: &TrustedProxies) -> (String, KeyKind) {
    (format!("ip:{}", client_ip(req, trusted)), KeyKind::Ip)
}

fn user_key(req: &HttpRequest) -> Option<(String, KeyKind)> {
    req.extensions()
        .get::<Principal>()
        .map(|principal| (format!("user:{}", principal.id), KeyKind::User))
}

/// Pull a bearer token from the `Authorization` header. The scheme match is
/// case-insensitive and the token is trimmed.
pub(crate) fn extract_bearer_token(req: &HttpRequest) -> Option<String> {
    let value = req
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    const PREFIX: &str = "bearer ";
    if value.len() > PREFIX.len() && value[..PREFIX.len()].eq_ignore_ascii_case(PREFIX) {
        let token = value[PREFIX.len()..].trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    None
}

/// Read `field` from the buffered form body (if any), falling back to the
/// query string, and normalise it (trim + lowercase).
fn extract_identifier(req: &HttpRequest, form_body: Option<&[u8]>, field: &str) -> String {
    if let Some(body) = form_body {
        if let Some(value) = find_field(serde_urlencoded::from_bytes(body), field) {
            return value;
        }
    }
    find_field(serde_urlencoded::from_str(req.query_string()), field).unwrap_or_default()
}

fn find_field(
    pairs: Result<Vec<(String, String)>, serde_urlencoded::de::Error>,
    field: &str,
) -> Option<String> {
    let pairs = pairs.ok()?;
    pairs
        .into_iter()
        .find(|(name, value)| name == field && !value.is_empty())
        .map(|(_, value)| value.trim().to_lowercase())
}

/// First 16 hex characters of the SHA-256 digest. Safe to log and store;
/// the original value cannot be recovered.
pub fn hash16(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    let hex = format!("{:x}", digest);
    hex[..16].to_string()
}

#[cfg(test)]
mod tests {
    use actix_web::test::TestRequest;

    use super::*;

    fn no_proxies() -> TrustedProxies {
        TrustedProxies::default()
    }

    #[test]
    fn by_ip_shape() {
        let req = TestRequest::default()
            .peer_addr("1.2.3.4:9999".parse().unwrap())
            .to_http_request();
        let (key, kind) = KeyStrategy::by_ip().key_for(&req, None, &no_proxies());
        assert_eq!(kind, KeyKind::Ip);
        assert_eq!(key, "ip:1.2.3.4");
    }

    #[test]
    fn by_ip_and_route_shape() {
        let req = TestRequest::get()
            .uri("/api/export")
            .peer_addr("10.0.0.1:1234".parse().unwrap())
            .to_http_request();
        let (key, kind) = KeyStrategy::by_ip_and_route().key_for(&req, None, &no_proxies());
        assert_eq!(kind, KeyKind::IpRoute);
        assert_eq!(key, "iproute:10.0.0.1:/api/export");
    }

    #[test]
    fn by_ip_and_ua_hashes_the_agent() {
        let req = TestRequest::default()
            .peer_addr("10.0.0.1:1234".parse().unwrap())
            .insert_header(("User-Agent", "Mozilla/5.0"))
            .to_http_request();
        let (key, kind) = KeyStrategy::by_ip_and_ua().key_for(&req, None, &no_proxies());
        assert_eq!(kind, KeyKind::IpUa);
        assert!(key.starts_with("ipua:10.0.0.1:"));
        assert!(!key.contains("Mozilla"), "raw user agent must not leak");
    }

    #[test]
    fn user_key_preferred_when_principal_present() {
        let req = TestRequest::default()
            .peer_addr("1.2.3.4:1234".parse().unwrap())
            .to_http_request();
        req.extensions_mut().insert(Principal::new("42"));
        let (key, kind) = KeyStrategy::by_user_else_ip().key_for(&req, None, &no_proxies());
        assert_eq!(kind, KeyKind::User);
        assert_eq!(key, "user:42");
    }

    #[test]
    fn user_key_falls_back_to_ip() {
        let req = TestRequest::default()
            .peer_addr("1.2.3.4:1234".parse().unwrap())
            .to_http_request();
        let (key, kind) = KeyStrategy::by_user_else_ip().key_for(&req, None, &no_proxies());
        assert_eq!(kind, KeyKind::Ip);
        assert_eq!(key, "ip:1.2.3.4");
    }

    #[test]
    fn token_takes_precedence_over_user() {
        let req = TestRequest::default()
            .peer_addr("1.2.3.4:1234".parse().unwrap())
            .insert_header(("Authorization", "Bearer my-secret-token"))
            .to_http_request();
        req.extensions_mut().insert(Principal::new("42"));
        let (key, kind) =
            KeyStrategy::by_token_else_user_else_ip().key_for(&req, None, &no_proxies());
        assert_eq!(kind, KeyKind::Token);
        assert!(key.starts_with("token:"));
        assert!(!key.contains("my-secret-token"), "raw token must not leak");
    }

    #[test]
    fn bearer_extraction() {
        let req = TestRequest::default()
            .insert_header(("Authorization", "Bearer my-secret-token"))
            .to_http_request();
        assert_eq!(
            extract_bearer_token(&req).as_deref(),
            Some("my-secret-token")
        );

        let req = TestRequest::default()
            .insert_header(("Authorization", "bEaReR  spaced-token  "))
            .to_http_request();
        assert_eq!(extract_bearer_token(&req).as_deref(), Some("spaced-token"));

        let req = TestRequest::default().to_http_request();
        assert_eq!(extract_bearer_token(&req), None);

        let req = TestRequest::default()
            .insert_header(("Authorization", "Basic dXNlcjpwYXNz"))
            .to_http_request();
        assert_eq!(extract_bearer_token(&req), None);
    }

    #[test]
    fn identifier_key_normalises_case_and_whitespace() {
        let strategy = KeyStrategy::by_ip_and_identifier("email");
        let req = TestRequest::post()
            .uri("/login")
            .peer_addr("10.0.0.5:1234".parse().unwrap())
            .to_http_request();

        let (key_a, kind) =
            strategy.key_for(&req, Some(b"email=Alice%40example.com"), &no_proxies());
        assert_eq!(kind, KeyKind::IpIdent);
        // trailing space, different case: same account, same key
        let (key_b, _) =
            strategy.key_for(&req, Some(b"email=alice%40example.com+"), &no_proxies());
        assert_eq!(key_a, key_b);

        let (key_c, _) = strategy.key_for(&req, Some(b"email=bob%40example.com"), &no_proxies());
        assert_ne!(key_a, key_c);
        assert!(!key_a.contains("alice"), "raw identifier must not leak");
    }

    #[test]
    fn identifier_falls_back_to_query_string() {
        let strategy = KeyStrategy::by_ip_and_identifier("email");
        let req = TestRequest::get()
            .uri("/reset?email=Carol%40example.com")
            .peer_addr("10.0.0.5:1234".parse().unwrap())
            .to_http_request();
        let (from_query, _) = strategy.key_for(&req, None, &no_proxies());

        let post = TestRequest::post()
            .uri("/reset")
            .peer_addr("10.0.0.5:1234".parse().unwrap())
            .to_http_request();
        let (from_body, _) =
            strategy.key_for(&post, Some(b"email=carol%40example.com"), &no_proxies());
        assert_eq!(from_query, from_body);
    }

    #[test]
    fn hash16_properties() {
        let a = hash16("test@example.com");
        let b = hash16("test@example.com");
        assert_eq!(a, b, "hash must be deterministic");
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        assert_ne!(hash16("alice@example.com"), hash16("bob@example.com"));
    }
}
