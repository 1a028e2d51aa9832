//! The policy stages composing a route's pipeline.
//!
//! Ordering is fixed by the builder and observable: request id before
//! logging, auth before rate limiting, the timeout envelope around breaker
//! and forwarding, the breaker outside the forward stage's retry loop so one
//! rejected request trips it at most once.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::FutureExt;
use serde_json::json;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::auth::TokenVerifier;
use crate::breaker::{BreakerRegistry, CircuitPolicy};
use crate::config::{CorsConfig, KeyStrategy};
use crate::context::{RequestContext, REQUEST_ID_HEADER};
use crate::error::GatewayError;
use crate::metrics::Metrics;
use crate::pipeline::{Next, PipelineRequest, Stage};
use crate::ratelimit::{bucket_key, LimiterRegistry};
use crate::trace;
use crate::upstream::{RouteTarget, UpstreamClient};

// ---------------------------------------------------------------------------
// Request id
// ---------------------------------------------------------------------------

/// Reuses the inbound `X-Request-ID` or generates a UUIDv4, and always emits
/// the id on the response.
pub struct RequestIdStage;

#[async_trait]
impl Stage for RequestIdStage {
    async fn handle(&self, mut req: PipelineRequest, next: Next) -> Response {
        let id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Some(ctx) = RequestContext::of_mut(&mut req) {
            ctx.request_id = id.clone();
        }
        let mut response = next.run(req).await;
        if let Ok(value) = HeaderValue::from_str(&id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }
}

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

/// Structured request logging: one line per request at unwind.
pub struct LoggerStage;

#[async_trait]
impl Stage for LoggerStage {
    async fn handle(&self, req: PipelineRequest, next: Next) -> Response {
        let start = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let (request_id, remote_ip) = match RequestContext::of(&req) {
            Some(ctx) => (ctx.request_id.clone(), ctx.client_addr.ip().to_string()),
            None => (String::new(), String::new()),
        };

        let response = next.run(req).await;

        let status = response.status();
        let duration_ms = start.elapsed().as_millis() as u64;
        if status.is_server_error() {
            error!(
                method = %method,
                path = %path,
                status = status.as_u16(),
                duration_ms,
                request_id = %request_id,
                remote_ip = %remote_ip,
                "request failed"
            );
        } else {
            info!(
                method = %method,
                path = %path,
                status = status.as_u16(),
                duration_ms,
                request_id = %request_id,
                remote_ip = %remote_ip,
                "request completed"
            );
        }
        response
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// In-flight gauge plus duration histogram and status-class counter.
pub struct MetricsStage {
    pub metrics: Arc<Metrics>,
}

#[async_trait]
impl Stage for MetricsStage {
    async fn handle(&self, req: PipelineRequest, next: Next) -> Response {
        let method = req.method().clone();
        let path = RequestContext::of(&req)
            .map(|ctx| ctx.route_id.clone())
            .unwrap_or_else(|| req.uri().path().to_string());
        let start = Instant::now();
        self.metrics.request_started();
        let response = next.run(req).await;
        self.metrics
            .request_finished(&method, &path, response.status(), start.elapsed());
        response
    }
}

// ---------------------------------------------------------------------------
// CORS
// ---------------------------------------------------------------------------

/// Precomputed CORS policy shared across pipelines.
pub struct CorsPolicy {
    origins: Vec<String>,
    wildcard: bool,
    allow_methods: String,
    allow_headers: String,
    allow_credentials: &'static str,
    expose_headers: Option<String>,
    max_age: Option<String>,
}

impl From<&CorsConfig> for CorsPolicy {
    fn from(config: &CorsConfig) -> Self {
        Self {
            origins: config.allow_origins.clone(),
            wildcard: config.allow_origins.iter().any(|o| o == "*"),
            allow_methods: config.allow_methods.join(", "),
            allow_headers: config.allow_headers.join(", "),
            allow_credentials: if config.allow_credentials { "true" } else { "false" },
            expose_headers: (!config.expose_headers.is_empty())
                .then(|| config.expose_headers.join(", ")),
            max_age: (config.max_age > 0).then(|| config.max_age.to_string()),
        }
    }
}

impl CorsPolicy {
    /// The `Access-Control-Allow-Origin` to emit for this request, if any.
    fn allowed_origin(&self, origin: &str) -> Option<String> {
        if self.wildcard {
            if self.origins.len() == 1 {
                return Some("*".to_string());
            }
            if origin.is_empty() {
                return Some("*".to_string());
            }
            return Some(origin.to_string());
        }
        (!origin.is_empty() && self.origins.iter().any(|o| o == origin))
            .then(|| origin.to_string())
    }

    fn apply(&self, headers: &mut HeaderMap, allowed_origin: &str) {
        let set = |headers: &mut HeaderMap, name: &'static str, value: &str| {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(name, value);
            }
        };
        set(headers, "access-control-allow-origin", allowed_origin);
        set(headers, "access-control-allow-methods", &self.allow_methods);
        set(headers, "access-control-allow-headers", &self.allow_headers);
        set(headers, "access-control-allow-credentials", self.allow_credentials);
        if let Some(expose) = &self.expose_headers {
            set(headers, "access-control-expose-headers", expose);
        }
        if let Some(max_age) = &self.max_age {
            set(headers, "access-control-max-age", max_age);
        }
    }
}

/// Emits access-control headers for allowed origins and answers preflight
/// `OPTIONS` with 204.
pub struct CorsStage {
    pub policy: Arc<CorsPolicy>,
}

#[async_trait]
impl Stage for CorsStage {
    async fn handle(&self, req: PipelineRequest, next: Next) -> Response {
        let origin = req
            .headers()
            .get("origin")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let allowed = self.policy.allowed_origin(&origin);

        if req.method() == Method::OPTIONS {
            let mut response = StatusCode::NO_CONTENT.into_response();
            if let Some(allowed) = &allowed {
                self.policy.apply(response.headers_mut(), allowed);
            }
            return response;
        }

        let mut response = next.run(req).await;
        if let Some(allowed) = &allowed {
            self.policy.apply(response.headers_mut(), allowed);
        }
        response
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Parses `Authorization: Bearer <token>` and stores verified claims in the
/// context; responds 401 otherwise.
pub struct AuthStage {
    pub verifier: Arc<TokenVerifier>,
}

#[async_trait]
impl Stage for AuthStage {
    async fn handle(&self, mut req: PipelineRequest, next: Next) -> Response {
        let header = req
            .headers()
            .get(http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if header.is_empty() {
            return GatewayError::Unauthorized {
                reason: "missing authorization header".to_string(),
            }
            .into_response();
        }

        let mut parts = header.splitn(2, ' ');
        let scheme = parts.next().unwrap_or_default();
        let token = parts.next().unwrap_or_default().trim();
        if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
            return GatewayError::Unauthorized {
                reason: "invalid authorization header format".to_string(),
            }
            .into_response();
        }

        let claims = match self.verifier.verify(token) {
            Ok(claims) => claims,
            Err(err) => return err.into_response(),
        };
        if let Some(ctx) = RequestContext::of_mut(&mut req) {
            ctx.identity = crate::context::Identity::User {
                subject: claims.subject.clone(),
                claims: claims.raw,
            };
        }
        next.run(req).await
    }
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// Which limiter installation a stage consults; only affects wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateScope {
    Global,
    Route,
}

/// Consults a token bucket and responds 429 with a retry hint on deny.
pub struct RateLimitStage {
    pub registry: Arc<LimiterRegistry>,
    pub scope: String,
    pub rps: u32,
    pub burst: u32,
    pub key_by: KeyStrategy,
    pub kind: RateScope,
}

#[async_trait]
impl Stage for RateLimitStage {
    async fn handle(&self, req: PipelineRequest, next: Next) -> Response {
        let Some(ctx) = RequestContext::of(&req) else {
            return GatewayError::Internal.into_response();
        };
        let key = bucket_key(self.key_by, ctx);
        if self.registry.allow(&self.scope, self.rps, self.burst, &key) {
            return next.run(req).await;
        }

        warn!(scope = %self.scope, key = %key, "rate limit exceeded");
        let message = match self.kind {
            RateScope::Global => "global rate limit exceeded",
            RateScope::Route => "rate limit exceeded",
        };
        (
            StatusCode::TOO_MANY_REQUESTS,
            [(http::header::RETRY_AFTER, "1")],
            Json(json!({ "error": message, "retry_after": "1s" })),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Wraps the inner chain in a span and guarantees a `traceparent` in the
/// context for upstream propagation.
pub struct TracingStage;

#[async_trait]
impl Stage for TracingStage {
    async fn handle(&self, mut req: PipelineRequest, next: Next) -> Response {
        let inbound = req
            .headers()
            .get(trace::TRACEPARENT_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        if let Some(ctx) = RequestContext::of_mut(&mut req) {
            ctx.traceparent = Some(trace::child_of(inbound.as_deref()));
        }

        let (method, path, request_id) = match RequestContext::of(&req) {
            Some(ctx) => (
                req.method().to_string(),
                req.uri().path().to_string(),
                ctx.request_id.clone(),
            ),
            None => (req.method().to_string(), req.uri().path().to_string(), String::new()),
        };
        let span = tracing::info_span!(
            "request",
            method = %method,
            path = %path,
            request_id = %request_id,
            status = tracing::field::Empty,
        );
        let response = next.run(req).instrument(span.clone()).await;
        span.record("status", response.status().as_u16());
        response
    }
}

// ---------------------------------------------------------------------------
// Timeout
// ---------------------------------------------------------------------------

/// Binds the request deadline into the context and converts an overrun into
/// a 504. The deadline spans everything inside it, including the forward
/// stage's whole retry budget.
pub struct TimeoutStage {
    pub timeout: Duration,
}

#[async_trait]
impl Stage for TimeoutStage {
    async fn handle(&self, mut req: PipelineRequest, next: Next) -> Response {
        let deadline = Instant::now() + self.timeout;
        if let Some(ctx) = RequestContext::of_mut(&mut req) {
            ctx.deadline = Some(deadline);
        }
        match tokio::time::timeout(self.timeout, next.run(req)).await {
            Ok(response) => response,
            Err(_) => GatewayError::Timeout.into_response(),
        }
    }
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// Catches panics from deeper stages and answers 500.
pub struct RecoveryStage;

#[async_trait]
impl Stage for RecoveryStage {
    async fn handle(&self, req: PipelineRequest, next: Next) -> Response {
        match AssertUnwindSafe(next.run(req)).catch_unwind().await {
            Ok(response) => response,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(panic = %message, "panic recovered");
                GatewayError::Internal.into_response()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Gates the upstream behind its circuit and records the outcome.
pub struct BreakerStage {
    pub registry: Arc<BreakerRegistry>,
    pub upstream: String,
    pub policy: CircuitPolicy,
}

#[async_trait]
impl Stage for BreakerStage {
    async fn handle(&self, req: PipelineRequest, next: Next) -> Response {
        if !self.registry.allow(&self.upstream, &self.policy) {
            warn!(upstream = %self.upstream, "circuit open, failing fast");
            return GatewayError::ServiceUnavailable.into_response();
        }
        let response = next.run(req).await;
        let success = response.status().as_u16() < 500;
        self.registry.record(&self.upstream, success, &self.policy);
        response
    }
}

// ---------------------------------------------------------------------------
// Forward (terminal)
// ---------------------------------------------------------------------------

/// Terminal stage: hands the buffered request to the upstream client.
pub struct ForwardStage {
    pub client: UpstreamClient,
    pub target: Arc<RouteTarget>,
}

#[async_trait]
impl Stage for ForwardStage {
    async fn handle(&self, req: PipelineRequest, _next: Next) -> Response {
        self.client.forward(&self.target, req).await
    }
}
