//! Pooled upstream HTTP client and the forwarding logic.
//!
//! The inbound body is buffered once at pipeline entry, so every retry
//! attempt re-sends the same bytes. Retry parameters live on the built route
//! and are consumed here rather than by a pipeline stage that would re-run
//! the rest of the chain.

use std::time::{Duration, Instant};

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use crate::auth::render_template;
use crate::config::{RetrySpec, RouteSpec};
use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::pipeline::PipelineRequest;
use crate::trace::TRACEPARENT_HEADER;

/// Connection-pool tuning for the shared upstream client.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_idle_per_host: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(90),
            max_idle_per_host: 32,
        }
    }
}

/// Retry parameters resolved from a route's retry spec.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Additional attempts after the first; 0 means a single try.
    pub attempts: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    fn none() -> Self {
        Self {
            attempts: 0,
            backoff: Duration::ZERO,
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl From<&RetrySpec> for RetryPolicy {
    fn from(spec: &RetrySpec) -> Self {
        Self {
            attempts: spec.attempts,
            backoff: spec.backoff(),
            max_backoff: spec.max_backoff(),
        }
    }
}

/// Forwarding parameters captured from a route at pipeline build time.
#[derive(Debug, Clone)]
pub struct RouteTarget {
    /// Upstream base URL with any trailing slash trimmed.
    pub upstream: String,
    pub strip_prefix: Option<String>,
    /// Header-injection templates, applied after the forwarded headers.
    pub headers: Vec<(String, String)>,
    pub retry: RetryPolicy,
}

impl RouteTarget {
    pub fn from_route(route: &RouteSpec) -> Self {
        Self {
            upstream: route.upstream.trim_end_matches('/').to_string(),
            strip_prefix: route.strip_prefix.clone(),
            headers: route
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            retry: route.retry.as_ref().map(RetryPolicy::from).unwrap_or_else(RetryPolicy::none),
        }
    }
}

/// Shared pooled HTTPS-capable client, one per gateway process.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl UpstreamClient {
    pub fn new(options: PoolOptions) -> Result<Self, GatewayError> {
        // rustls needs a process-wide crypto provider before any connector
        // is built; repeat installs are fine.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.set_nodelay(true);
        http_connector.set_connect_timeout(Some(options.connect_timeout));

        let https_connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|err| {
                GatewayError::ConfigInvalid(format!("failed to load native TLS roots: {err}"))
            })?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(options.max_idle_per_host)
            .pool_idle_timeout(options.idle_timeout)
            .build(https_connector);

        Ok(Self { client })
    }

    /// Forward a buffered request to the route's upstream, honoring the
    /// remaining deadline and the route's retry policy, and map the upstream
    /// response back verbatim (status, first header value per key, body).
    pub async fn forward(&self, target: &RouteTarget, req: PipelineRequest) -> Response {
        let (parts, body) = req.into_parts();
        let Some(ctx) = parts.extensions.get::<RequestContext>() else {
            return GatewayError::Internal.into_response();
        };

        let uri = match build_target_uri(
            &target.upstream,
            parts.uri.path(),
            parts.uri.query(),
            target.strip_prefix.as_deref(),
        ) {
            Ok(uri) => uri,
            Err(err) => {
                warn!(upstream = %target.upstream, error = %err, "invalid upstream URL");
                return GatewayError::BadGateway {
                    details: "invalid upstream URL".to_string(),
                }
                .into_response();
            }
        };

        let headers = outbound_headers(&parts.headers, target, ctx);
        let deadline = ctx.deadline;
        let attempts = target.retry.attempts + 1;
        let mut backoff = target.retry.backoff;
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 && !backoff.is_zero() {
                if let Some(deadline) = deadline {
                    // Do not schedule an attempt that cannot start in time.
                    if Instant::now() + backoff >= deadline {
                        return GatewayError::Timeout.into_response();
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(target.retry.max_backoff);
            }

            let mut builder = Request::builder().method(parts.method.clone()).uri(uri.clone());
            let Some(outbound_headers) = builder.headers_mut() else {
                return GatewayError::Internal.into_response();
            };
            *outbound_headers = headers.clone();
            let outbound = match builder.body(Full::new(body.clone())) {
                Ok(outbound) => outbound,
                Err(err) => {
                    warn!(error = %err, "failed to build upstream request");
                    return GatewayError::BadGateway {
                        details: "failed to build upstream request".to_string(),
                    }
                    .into_response();
                }
            };

            match self.attempt(outbound, deadline).await {
                Attempt::Response { status, headers, body } => {
                    if status.as_u16() >= 500 && attempt + 1 < attempts {
                        debug!(%status, attempt, "upstream error, retrying");
                        last_error = format!("upstream responded {status}");
                        continue;
                    }
                    return write_back(status, headers, body);
                }
                Attempt::Transport(error) => {
                    debug!(error = %error, attempt, "upstream transport failure");
                    last_error = error;
                }
                Attempt::DeadlineExceeded => {
                    return GatewayError::Timeout.into_response();
                }
            }
        }

        GatewayError::BadGateway {
            details: last_error,
        }
        .into_response()
    }

    async fn attempt(
        &self,
        outbound: Request<Full<Bytes>>,
        deadline: Option<Instant>,
    ) -> Attempt {
        let exchange = async {
            let response = self.client.request(outbound).await.map_err(|e| e.to_string())?;
            let (parts, incoming) = response.into_parts();
            let body = incoming
                .collect()
                .await
                .map_err(|e| format!("failed to read upstream body: {e}"))?
                .to_bytes();
            Ok::<_, String>((parts.status, parts.headers, body))
        };

        let result = match deadline {
            Some(deadline) => {
                let deadline = tokio::time::Instant::from_std(deadline);
                match tokio::time::timeout_at(deadline, exchange).await {
                    Ok(result) => result,
                    Err(_) => return Attempt::DeadlineExceeded,
                }
            }
            None => exchange.await,
        };

        match result {
            Ok((status, headers, body)) => Attempt::Response { status, headers, body },
            Err(error) => Attempt::Transport(error),
        }
    }
}

enum Attempt {
    Response {
        status: http::StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Transport(String),
    DeadlineExceeded,
}

/// Derive the upstream URI: base + inbound path after prefix stripping,
/// preserving the raw query string.
fn build_target_uri(
    upstream: &str,
    path: &str,
    query: Option<&str>,
    strip_prefix: Option<&str>,
) -> Result<Uri, http::uri::InvalidUri> {
    let mut path = match strip_prefix {
        Some(prefix) => path.strip_prefix(prefix).unwrap_or(path),
        None => path,
    };
    if path.is_empty() {
        path = "/";
    }
    let target = match query {
        Some(query) => format!("{upstream}{path}?{query}"),
        None => format!("{upstream}{path}"),
    };
    target.parse()
}

/// Clone forwardable inbound headers, add trace propagation, then apply the
/// route's injection templates (overwriting any forwarded value).
fn outbound_headers(inbound: &HeaderMap, target: &RouteTarget, ctx: &RequestContext) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + target.headers.len() + 1);
    for (name, value) in inbound {
        if !is_connection_header(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }
    if let Some(traceparent) = &ctx.traceparent {
        if let Ok(value) = HeaderValue::from_str(traceparent) {
            headers.insert(TRACEPARENT_HEADER, value);
        }
    }
    for (name, template) in &target.headers {
        let rendered = render_template(template, ctx);
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&rendered),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "skipping invalid injected header"),
        }
    }
    headers
}

/// Headers tied to the inbound connection or its encoding. Bodies are
/// re-buffered between the two legs, so encoding headers do not carry over.
fn is_connection_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailers")
        || name.eq_ignore_ascii_case("upgrade")
        || name.eq_ignore_ascii_case("transfer-encoding")
}

fn write_back(status: http::StatusCode, upstream_headers: HeaderMap, body: Bytes) -> Response {
    let mut builder = Response::builder().status(status);
    for name in upstream_headers.keys() {
        if is_connection_header(name.as_str()) {
            continue;
        }
        if let Some(value) = upstream_headers.get(name) {
            builder = builder.header(name, value);
        }
    }
    match builder.body(Body::from(body)) {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "failed to assemble upstream response");
            GatewayError::Internal.into_response()
        }
    }
}
