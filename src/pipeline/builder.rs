//! Assembles a route's stage chain from its spec.
//!
//! Conditional stages (auth, rate limits, timeout, breaker) are omitted when
//! their configuration is absent; everything the stages need is captured at
//! build time, so a built pipeline never reads configuration again.

use std::sync::Arc;

use crate::auth::TokenVerifier;
use crate::breaker::{BreakerRegistry, CircuitPolicy};
use crate::config::{KeyStrategy, RateLimitSpec, RouteSpec};
use crate::metrics::Metrics;
use crate::pipeline::stages::{
    AuthStage, BreakerStage, CorsPolicy, CorsStage, ForwardStage, LoggerStage, MetricsStage,
    RateLimitStage, RateScope, RecoveryStage, RequestIdStage, TimeoutStage, TracingStage,
};
use crate::pipeline::{Pipeline, Stage};
use crate::ratelimit::LimiterRegistry;
use crate::upstream::{RouteTarget, UpstreamClient};

/// Shared collaborators captured by stage builders.
pub struct PipelineDeps {
    pub limiters: Arc<LimiterRegistry>,
    pub breakers: Arc<BreakerRegistry>,
    pub metrics: Arc<Metrics>,
    pub client: UpstreamClient,
    pub verifier: Option<Arc<TokenVerifier>>,
    pub cors: Arc<CorsPolicy>,
    pub global_rate_limit: Option<RateLimitSpec>,
}

/// Build the ordered stage chain for one route.
pub fn build(route: &RouteSpec, deps: &PipelineDeps) -> Pipeline {
    let mut stages: Vec<Arc<dyn Stage>> = vec![
        Arc::new(RequestIdStage),
        Arc::new(LoggerStage),
        Arc::new(MetricsStage {
            metrics: Arc::clone(&deps.metrics),
        }),
        Arc::new(CorsStage {
            policy: Arc::clone(&deps.cors),
        }),
    ];

    if route.auth_required {
        // Validation guarantees a secret exists when any route requires auth.
        if let Some(verifier) = &deps.verifier {
            stages.push(Arc::new(AuthStage {
                verifier: Arc::clone(verifier),
            }));
        }
    }

    if let Some(global) = &deps.global_rate_limit {
        stages.push(Arc::new(RateLimitStage {
            registry: Arc::clone(&deps.limiters),
            scope: "global".to_string(),
            rps: global.rps,
            burst: global.burst,
            key_by: global.key_by_or(KeyStrategy::Global),
            kind: RateScope::Global,
        }));
    }

    if let Some(rate_limit) = &route.rate_limit {
        stages.push(Arc::new(RateLimitStage {
            registry: Arc::clone(&deps.limiters),
            scope: format!("route:{}", route.path),
            rps: rate_limit.rps,
            burst: rate_limit.burst,
            key_by: rate_limit.key_by_or(KeyStrategy::Ip),
            kind: RateScope::Route,
        }));
    }

    stages.push(Arc::new(TracingStage));

    if let Some(timeout) = route.timeout() {
        stages.push(Arc::new(TimeoutStage { timeout }));
    }

    stages.push(Arc::new(RecoveryStage));

    let target = Arc::new(RouteTarget::from_route(route));

    if let Some(retry) = &route.retry {
        if retry.attempts > 0 {
            stages.push(Arc::new(BreakerStage {
                registry: Arc::clone(&deps.breakers),
                upstream: target.upstream.clone(),
                policy: CircuitPolicy {
                    threshold: retry.attempts,
                    backoff: retry.backoff(),
                },
            }));
        }
    }

    stages.push(Arc::new(ForwardStage {
        client: deps.client.clone(),
        target,
    }));

    Pipeline::new(route.path.clone(), stages)
}
