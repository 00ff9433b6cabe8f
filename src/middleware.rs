use std::rc::Rc;
use std::sync::Arc;

use actix_web::body::EitherBody;
use actix_web::dev::{
    forward_ready, Payload, Service, ServiceRequest, ServiceResponse, Transform,
};
use actix_web::error::PayloadError;
use actix_web::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use actix_web::http::StatusCode;
use actix_web::{web, HttpMessage, HttpRequest, HttpResponse, HttpResponseBuilder};
use futures_util::future::{ready, LocalBoxFuture, Ready};
use futures_util::StreamExt as _;
use tracing::warn;

use crate::allowlist::AllowRule;
use crate::bucket::Decision;
use crate::client_ip::{client_ip, TrustedProxies};
use crate::config::ResponseFormat;
use crate::error::Error;
use crate::keys::{KeyKind, KeyStrategy};
use crate::log::{LogEntry, LogStore, NopLogStore};
use crate::policy::Policy;
use crate::store::{ConcurrencyStore, MemConcurrencyStore, Store};
use crate::utils::RateLimitStatus;

/// Callback invoked when a request is denied. Returning `Some` response
/// takes over the 429 rendering; `None` falls through to the default body.
pub type OnLimitFn = Arc<dyn Fn(&HttpRequest, &Decision) -> Option<HttpResponse> + Send + Sync>;

/// Rate-limit middleware for `actix-web`.
///
/// Wraps a downstream service and decides, per request, whether it is
/// admitted or rejected with a 429. `X-RateLimit-Limit`, `-Remaining` and
/// `-Reset` headers are set on every limited response, including admissions.
///
/// ```no_run
/// use std::sync::Arc;
/// use actix_web::{web, App, HttpResponse, HttpServer};
/// use gohst_ratelimit::allowlist::AllowRule;
/// use gohst_ratelimit::keys::KeyStrategy;
/// use gohst_ratelimit::middleware::RateLimit;
/// use gohst_ratelimit::policy::Policy;
/// use gohst_ratelimit::store::{MemStore, Store};
///
/// # async fn run() -> anyhow::Result<()> {
/// let store: Arc<dyn Store> = Arc::new(MemStore::default());
/// let limiter = RateLimit::new(store, Policy::auth_sensitive(), KeyStrategy::by_ip())?
///     .with_allowlist(vec![AllowRule::PathPrefixes(vec!["/healthz".into()])]);
///
/// HttpServer::new(move || {
///     App::new()
///         .wrap(limiter.clone())
///         .route("/login", web::post().to(|| async { HttpResponse::Ok().finish() }))
/// })
/// .bind(("127.0.0.1", 8080))?
/// .run()
/// .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RateLimit {
    inner: Inner,
}

#[derive(Clone)]
struct Inner {
    store: Arc<dyn Store>,
    concurrency: Option<Arc<dyn ConcurrencyStore>>,
    policy: Policy,
    keys: KeyStrategy,
    trusted: TrustedProxies,
    allowlist: Vec<AllowRule>,
    log_store: Arc<dyn LogStore>,
    on_limit: Option<OnLimitFn>,
    response_format: ResponseFormat,
    enabled: bool,
}

impl RateLimit {
    /// Create a limiter. Fails if the policy cannot produce a working
    /// bucket (zero limit or zero window).
    pub fn new(
        store: Arc<dyn Store>,
        policy: Policy,
        keys: KeyStrategy,
    ) -> Result<Self, Error> {
        policy.validate()?;
        Ok(Self {
            inner: Inner {
                store,
                concurrency: None,
                policy,
                keys,
                trusted: TrustedProxies::default(),
                allowlist: Vec::new(),
                log_store: Arc::new(NopLogStore),
                on_limit: None,
                response_format: ResponseFormat::Json,
                enabled: true,
            },
        })
    }

    /// Generous limiter for anonymous page browsing, keyed by user-else-IP.
    pub fn public_browse(store: Arc<dyn Store>) -> Result<Self, Error> {
        Self::new(store, Policy::public_browse(), KeyStrategy::by_user_else_ip())
    }

    /// Standard limiter for API endpoints, keyed by token, user, then IP.
    pub fn api_default(store: Arc<dyn Store>) -> Result<Self, Error> {
        Self::new(
            store,
            Policy::api_default(),
            KeyStrategy::by_token_else_user_else_ip(),
        )
    }

    /// Tight limiter for login and reset endpoints. `identifier_field` is
    /// the form field (e.g. `email`) combined with the IP so brute-force on
    /// one account stays limited even across slight IP rotation.
    pub fn auth_sensitive(
        store: Arc<dyn Store>,
        identifier_field: impl Into<String>,
    ) -> Result<Self, Error> {
        Self::new(
            store,
            Policy::auth_sensitive(),
            KeyStrategy::by_ip_and_identifier(identifier_field),
        )
    }

    /// Very tight limiter with a concurrency cap of one, for heavy exports.
    pub fn exports(
        store: Arc<dyn Store>,
        concurrency: Arc<dyn ConcurrencyStore>,
    ) -> Result<Self, Error> {
        Ok(Self::new(
            store,
            Policy::exports(),
            KeyStrategy::by_token_else_user_else_ip(),
        )?
        .with_concurrency(concurrency))
    }

    /// Master on/off switch, typically fed from configuration. A disabled
    /// limiter passes every request through untouched.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.inner.enabled = enabled;
        self
    }

    /// Proxies whose forwarded headers are honoured when resolving the
    /// client IP.
    pub fn with_trusted_proxies(mut self, trusted: TrustedProxies) -> Self {
        self.inner.trusted = trusted;
        self
    }

    /// Bypass rules, evaluated in order before any bucket is touched.
    pub fn with_allowlist(mut self, rules: Vec<AllowRule>) -> Self {
        self.inner.allowlist = rules;
        self
    }

    /// Attach a concurrency store; only consulted when the policy sets a
    /// `concurrency_limit`.
    pub fn with_concurrency(mut self, concurrency: Arc<dyn ConcurrencyStore>) -> Self {
        self.inner.concurrency = Some(concurrency);
        self
    }

    /// Attach a sink for denied-request records.
    pub fn with_log_store(mut self, log_store: Arc<dyn LogStore>) -> Self {
        self.inner.log_store = log_store;
        self
    }

    /// Default body format for 429 responses. Clients advertising JSON in
    /// `Accept` get JSON regardless.
    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.inner.response_format = format;
        self
    }

    /// Custom 429 handler.
    pub fn with_on_limit<F>(mut self, f: F) -> Self
    where
        F: Fn(&HttpRequest, &Decision) -> Option<HttpResponse> + Send + Sync + 'static,
    {
        self.inner.on_limit = Some(Arc::new(f));
        self
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimit
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = S::Error;
    type Transform = RateLimitService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RateLimitService {
            inner: Arc::new(self.inner.clone()),
            service: Rc::new(service),
        }))
    }
}

pub struct RateLimitService<S> {
    inner: Arc<Inner>,
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for RateLimitService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = S::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, mut svc: ServiceRequest) -> Self::Future {
        let inner = self.inner.clone();
        let service = self.service.clone();

        Box::pin(async move {
            if !inner.enabled || !inner.policy.enabled {
                let res = service.call(svc).await?;
                return Ok(res.map_into_left_body());
            }

            if inner
                .allowlist
                .iter()
                .any(|rule| rule.matches(svc.request(), &inner.trusted))
            {
                let res = service.call(svc).await?;
                return Ok(res.map_into_left_body());
            }

            let form_body = if inner.keys.needs_body(svc.request().method()) {
                Some(buffer_payload(&mut svc).await)
            } else {
                None
            };
            let (key, key_type) =
                inner
                    .keys
                    .key_for(svc.request(), form_body.as_deref(), &inner.trusted);
            let cost = inner.policy.cost.max(1);

            // The guard releases the slot when this future completes or is
            // dropped, including during an unwind out of the handler.
            let mut _slot: Option<SlotGuard> = None;
            if inner.policy.concurrency_limit > 0 {
                if let Some(concurrency) = &inner.concurrency {
                    if concurrency
                        .acquire(&key, inner.policy.concurrency_limit)
                        .await
                    {
                        _slot = Some(SlotGuard::new(concurrency.clone(), key.clone()));
                    } else {
                        let decision = Decision {
                            allowed: false,
                            limit: inner.policy.concurrency_limit,
                            remaining: 0,
                            retry_after: 1,
                            reset_at: 0,
                        };
                        let resp = inner
                            .deny(svc.request(), &decision, &key, key_type, "concurrency")
                            .await;
                        return Ok(ServiceResponse::new(
                            svc.request().clone(),
                            resp.map_into_right_body(),
                        ));
                    }
                }
            }

            let decision = inner.store.allow(&key, &inner.policy, cost).await;

            if !decision.allowed {
                let resp = inner
                    .deny(svc.request(), &decision, &key, key_type, "rate")
                    .await;
                return Ok(ServiceResponse::new(
                    svc.request().clone(),
                    resp.map_into_right_body(),
                ));
            }

            RateLimitStatus::attach(svc.request(), decision.clone());

            let mut res = service.call(svc).await?;
            set_rate_limit_headers(res.headers_mut(), &decision);
            Ok(res.map_into_left_body())
        })
    }
}

impl Inner {
    async fn deny(
        &self,
        req: &HttpRequest,
        decision: &Decision,
        key: &str,
        key_type: KeyKind,
        reason: &str,
    ) -> HttpResponse {
        warn!(
            method = %req.method(),
            path = %req.path(),
            key_type = %key_type,
            scope = %self.policy.scope,
            key = %truncate_key(key),
            retry_after = decision.retry_after,
            reason,
            "request denied"
        );

        let entry = LogEntry {
            method: req.method().to_string(),
            path: req.path().to_string(),
            key_type,
            key_hash: truncate_key(key),
            scope: self.policy.scope.clone(),
            retry_after: decision.retry_after,
            client_ip: client_ip(req, &self.trusted),
        };
        if let Err(e) = self.log_store.log(entry).await {
            warn!(error = %e, "failed to write deny-log entry");
        }

        if let Some(on_limit) = &self.on_limit {
            if let Some(resp) = on_limit(req, decision) {
                return resp;
            }
        }

        let format = if accepts_json(req) {
            ResponseFormat::Json
        } else {
            self.response_format
        };

        let mut builder = HttpResponseBuilder::new(StatusCode::TOO_MANY_REQUESTS);
        builder
            .insert_header((header::RETRY_AFTER, decision.retry_after.to_string()))
            .insert_header((HEADER_LIMIT, HeaderValue::from(decision.limit)))
            .insert_header((HEADER_REMAINING, HeaderValue::from(decision.remaining)))
            .insert_header((HEADER_RESET, HeaderValue::from(decision.reset_at)));

        match format {
            ResponseFormat::Json => builder
                .content_type("application/json; charset=utf-8")
                .body(
                    serde_json::json!({
                        "error": "Too Many Requests",
                        "retry_after": decision.retry_after,
                        "message": "Rate limit exceeded. Please slow down and try again later.",
                    })
                    .to_string(),
                ),
            ResponseFormat::Html => builder
                .content_type("text/html; charset=utf-8")
                .body(format!(
                    "<!DOCTYPE html>\n\
                     <html><head><title>429 Too Many Requests</title></head>\n\
                     <body>\n\
                     <h1>Too Many Requests</h1>\n\
                     <p>You have exceeded the rate limit. Please try again in {} seconds.</p>\n\
                     </body></html>",
                    decision.retry_after
                )),
        }
    }
}

const HEADER_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const HEADER_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const HEADER_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

fn set_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(HEADER_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(HEADER_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(HEADER_RESET, HeaderValue::from(decision.reset_at));
}

/// Plain substring check on the `Accept` header. Deliberately not a full
/// media-type parse: `Accept: application/json;q=0` still counts as JSON.
fn accepts_json(req: &HttpRequest) -> bool {
    req.headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("application/json") || accept.contains("text/json"))
        .unwrap_or(false)
}

/// Safe-to-log version of a key: at most 40 characters of the (already
/// hashed) key, never a raw secret.
fn truncate_key(key: &str) -> String {
    if key.len() <= 40 {
        return key.to_string();
    }
    let mut end = 40;
    while !key.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &key[..end])
}

/// Drain the request body into memory and replace the payload with a replay
/// stream so the downstream extractor still sees it.
async fn buffer_payload(svc: &mut ServiceRequest) -> web::Bytes {
    let mut payload = svc.take_payload();
    let mut buf = web::BytesMut::new();
    while let Some(chunk) = payload.next().await {
        match chunk {
            Ok(bytes) => buf.extend_from_slice(&bytes),
            Err(_) => break,
        }
    }
    let body = buf.freeze();

    let replay = body.clone();
    let stream = futures_util::stream::once(async move { Ok::<_, PayloadError>(replay) });
    let payload: Payload = Payload::Stream {
        payload: Box::pin(stream),
    };
    svc.set_payload(payload);

    body
}

/// Releases a concurrency slot on drop, which also covers unwinds out of
/// the downstream handler. The release itself is async, so it is spawned
/// rather than awaited.
struct SlotGuard {
    store: Arc<dyn ConcurrencyStore>,
    key: Option<String>,
}

impl SlotGuard {
    fn new(store: Arc<dyn ConcurrencyStore>, key: String) -> Self {
        Self {
            store,
            key: Some(key),
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let store = self.store.clone();
            actix_web::rt::spawn(async move {
                store.release(&key).await;
            });
        }
    }
}

/// Build the store named by the configuration: `redis` when the
/// `redis-store` feature is compiled in, otherwise in-memory.
pub fn store_from_config(cfg: &crate::config::RateLimitConfig) -> Arc<dyn Store> {
    match cfg.store.as_str() {
        "redis" => {
            #[cfg(feature = "redis-store")]
            {
                match crate::store::RedisStore::from_config(cfg) {
                    Ok(store) => {
                        tracing::debug!("using redis rate-limit store");
                        return Arc::new(store);
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to build redis store, falling back to memory")
                    }
                }
            }
            #[cfg(not(feature = "redis-store"))]
            warn!(
                "redis store requested but the `redis-store` feature is not enabled, using memory"
            );
        }
        "memory" => tracing::debug!("using in-memory rate-limit store"),
        other => warn!(store = other, "unknown store type, using memory"),
    }
    Arc::new(crate::store::MemStore::default())
}

/// Build an in-process concurrency store. The Redis variant is constructed
/// explicitly by the embedding application because it shares the client.
pub fn mem_concurrency_store() -> Arc<dyn ConcurrencyStore> {
    Arc::new(MemConcurrencyStore::new())
}
