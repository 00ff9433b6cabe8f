use actix_web::{HttpMessage, HttpRequest};

use crate::bucket::Decision;

/// The admission decision for the current request, stored in request
/// extensions by the middleware so handlers can inspect it (for example to
/// surface remaining quota in an API response body).
#[derive(Debug, Clone)]
pub struct RateLimitStatus {
    decision: Decision,
}

impl RateLimitStatus {
    pub(crate) fn attach(req: &HttpRequest, decision: Decision) {
        req.extensions_mut().insert(RateLimitStatus { decision });
    }

    /// Fetch the status recorded for this request, if the limiter ran.
    pub fn from_request(req: &HttpRequest) -> Option<RateLimitStatus> {
        req.extensions().get::<RateLimitStatus>().cloned()
    }

    pub fn decision(&self) -> &Decision {
        &self.decision
    }
}

#[cfg(test)]
mod tests {
    use actix_web::test::TestRequest;

    use super::*;

    #[test]
    fn round_trips_through_extensions() {
        let req = TestRequest::default().to_http_request();
        assert!(RateLimitStatus::from_request(&req).is_none());

        let decision = Decision {
            allowed: true,
            limit: 10,
            remaining: 9,
            retry_after: 0,
            reset_at: 1_700_000_000,
        };
        RateLimitStatus::attach(&req, decision.clone());

        let status = RateLimitStatus::from_request(&req).unwrap();
        assert_eq!(*status.decision(), decision);
    }
}
