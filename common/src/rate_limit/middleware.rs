use std::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, Response},
    response::IntoResponse,
};
use tower::{Layer, Service};

use crate::{error::ApiError, rate_limit::RateLimiter};

/// A Tower layer that rate-limits requests by the direct peer address.
///
/// Behavior:
/// - Identity is `ConnectInfo<SocketAddr>` only; forwarded headers are
///   ignored (they are trivially spoofable).
/// - If `ConnectInfo` is absent (no `into_make_service_with_connect_info`),
///   the request passes through.
/// - On denial: `429 Too Many Requests` with a JSON body, before any work.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: RateLimiter,
}

impl RateLimitLayer {
    pub fn new(limiter: RateLimiter) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    limiter: RateLimiter,
}

impl<S> Service<Request<Body>> for RateLimitMiddleware<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let limiter = self.limiter.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() else {
                return inner.call(req).await;
            };

            if !limiter.check(addr.ip()) {
                return Ok(ApiError::Throttled.into_response());
            }

            inner.call(req).await
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{Router, body::Body, http::StatusCode, routing::get};
    use tower::ServiceExt;

    use super::*;
    use crate::rate_limit::RateLimiterConfig;

    fn app(limiter: RateLimiter) -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(RateLimitLayer::new(limiter))
    }

    fn request_from(addr: &str) -> Request<Body> {
        let mut req = Request::builder().uri("/").body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo::<SocketAddr>(addr.parse().unwrap()));
        req
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_two_then_429_other_peer_unaffected() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            rate_per_sec: 1.0,
            burst: 2.0,
            idle_evict: Duration::from_secs(300),
        });
        let app = app(limiter);

        let mut statuses = Vec::new();
        for port in [1000, 1001, 1002] {
            let req = request_from(&format!("10.0.0.1:{port}"));
            statuses.push(app.clone().oneshot(req).await.unwrap().status());
        }
        assert_eq!(
            statuses,
            vec![StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]
        );

        // A different peer within the same second is admitted.
        let res = app.oneshot(request_from("10.0.0.2:1000")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_connect_info_passes_through() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            rate_per_sec: 1.0,
            burst: 1.0,
            idle_evict: Duration::from_secs(300),
        });
        let app = app(limiter);
        for _ in 0..5 {
            let req = Request::builder().uri("/").body(Body::empty()).unwrap();
            let res = app.clone().oneshot(req).await.unwrap();
            assert_eq!(res.status(), StatusCode::OK);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn denial_body_is_json() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            rate_per_sec: 1.0,
            burst: 1.0,
            idle_evict: Duration::from_secs(300),
        });
        let app = app(limiter);
        let _ = app.clone().oneshot(request_from("10.0.0.1:1000")).await;
        let res = app.oneshot(request_from("10.0.0.1:1001")).await.unwrap();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        let content_type = res
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("application/json"));
    }
}
