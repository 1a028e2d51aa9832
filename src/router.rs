//! Builds the HTTP routing table from a configuration snapshot.
//!
//! User routes are grouped by path and merged into one method router per
//! path, so a known path with a non-configured method answers 405 with an
//! `Allow` header while unknown paths fall through to the 404 envelope.
//! The fixed endpoints (`/health`, `/ready`, `/metrics`, `/openapi.json`,
//! `/docs`) bypass the policy pipeline entirely.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, MethodFilter, MethodRouter};
use axum::{Json, Router};
use serde_json::json;
use tracing::warn;

use crate::auth::TokenVerifier;
use crate::breaker::BreakerRegistry;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::metrics::Metrics;
use crate::openapi;
use crate::pipeline::builder::{self, PipelineDeps};
use crate::pipeline::stages::CorsPolicy;
use crate::pipeline::Pipeline;
use crate::ratelimit::LimiterRegistry;
use crate::upstream::{PoolOptions, UpstreamClient};

/// Process-global collaborators that survive configuration reloads.
pub struct GatewayState {
    pub limiters: Arc<LimiterRegistry>,
    pub breakers: Arc<BreakerRegistry>,
    pub metrics: Arc<Metrics>,
    pub client: UpstreamClient,
}

impl GatewayState {
    pub fn new() -> Result<Self, GatewayError> {
        Ok(Self {
            limiters: Arc::new(LimiterRegistry::new()),
            breakers: Arc::new(BreakerRegistry::new()),
            metrics: Arc::new(Metrics::new()),
            client: UpstreamClient::new(PoolOptions::default())?,
        })
    }
}

/// Build the full routing table for one configuration snapshot.
pub fn build_router(config: &Arc<GatewayConfig>, state: &GatewayState) -> Router {
    let verifier = (!config.jwt.secret.is_empty())
        .then(|| Arc::new(TokenVerifier::new(&config.jwt.secret, &config.jwt.issuer)));
    let deps = PipelineDeps {
        limiters: Arc::clone(&state.limiters),
        breakers: Arc::clone(&state.breakers),
        metrics: Arc::clone(&state.metrics),
        client: state.client.clone(),
        verifier,
        cors: Arc::new(CorsPolicy::from(&config.cors)),
        global_rate_limit: config.global_rate_limit.clone(),
    };

    let mut router = fixed_endpoints(config, state);

    // One method router per path; several routes may share a path with
    // disjoint method sets.
    let mut by_path: BTreeMap<&str, MethodRouter> = BTreeMap::new();
    for route in &config.routes {
        let pipeline = Arc::new(builder::build(route, &deps));
        let entry = by_path.entry(route.path.as_str()).or_default();
        for method in &route.methods {
            let Some(filter) = method_filter(method) else {
                warn!(path = %route.path, method = %method, "skipping unknown method");
                continue;
            };
            let taken = std::mem::take(entry);
            *entry = taken.on(filter, pipeline_handler(Arc::clone(&pipeline)));
        }
    }
    for (path, method_router) in by_path {
        router = router.route(path, method_router);
    }

    router.fallback(not_found)
}

fn fixed_endpoints(config: &Arc<GatewayConfig>, state: &GatewayState) -> Router {
    let metrics = Arc::clone(&state.metrics);
    let openapi_config = Arc::clone(config);
    Router::new()
        .route("/health", get(|| async { Json(json!({ "status": "ok" })) }))
        .route("/ready", get(|| async { Json(json!({ "status": "ready" })) }))
        .route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&metrics);
                async move { render_metrics(&metrics) }
            }),
        )
        .route(
            "/openapi.json",
            get(move || {
                let config = Arc::clone(&openapi_config);
                async move { Json(openapi::document(&config)) }
            }),
        )
        .route("/docs", get(|| async { Html(openapi::SWAGGER_UI_HTML) }))
}

fn pipeline_handler(
    pipeline: Arc<Pipeline>,
) -> impl Fn(ConnectInfo<SocketAddr>, Request) -> futures_util::future::BoxFuture<'static, Response>
       + Clone
       + Send
       + Sync
       + 'static {
    move |ConnectInfo(addr): ConnectInfo<SocketAddr>, req: Request| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move { pipeline.execute(addr, req).await })
    }
}

fn render_metrics(metrics: &Metrics) -> Response {
    match metrics.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(error) => {
            warn!(%error, "failed to encode metrics");
            GatewayError::Internal.into_response()
        }
    }
}

async fn not_found() -> Response {
    GatewayError::NotFound.into_response()
}

fn method_filter(method: &str) -> Option<MethodFilter> {
    match method.to_ascii_uppercase().as_str() {
        "GET" => Some(MethodFilter::GET),
        "POST" => Some(MethodFilter::POST),
        "PUT" => Some(MethodFilter::PUT),
        "DELETE" => Some(MethodFilter::DELETE),
        "PATCH" => Some(MethodFilter::PATCH),
        "OPTIONS" => Some(MethodFilter::OPTIONS),
        "HEAD" => Some(MethodFilter::HEAD),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_filters_cover_known_methods() {
        for method in ["GET", "post", "Put", "DELETE", "PATCH", "OPTIONS", "HEAD"] {
            assert!(method_filter(method).is_some(), "{method}");
        }
        assert!(method_filter("FETCH").is_none());
    }
}
