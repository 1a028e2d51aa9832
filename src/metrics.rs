//! Prometheus metrics for the request pipeline.
//!
//! Status labels are bucketed (`2xx`..`5xx`) and the path label is the
//! configured route pattern, keeping label cardinality bounded by the route
//! set rather than by request traffic.

use std::time::Duration;

use axum::http::{Method, StatusCode};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

const DURATION_BUCKETS: [f64; 10] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub method: String,
    pub path: String,
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DurationLabels {
    pub method: String,
    pub path: String,
}

/// Registry plus the gateway's metric families.
pub struct Metrics {
    registry: Registry,
    requests_total: Family<RequestLabels, Counter>,
    request_duration_seconds: Family<DurationLabels, Histogram>,
    in_flight: Gauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "http_requests",
            "Total number of HTTP requests",
            requests_total.clone(),
        );

        let request_duration_seconds =
            Family::<DurationLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(DURATION_BUCKETS.iter().copied())
            });
        registry.register(
            "http_request_duration_seconds",
            "HTTP request duration in seconds",
            request_duration_seconds.clone(),
        );

        let in_flight = Gauge::default();
        registry.register(
            "http_requests_in_flight",
            "Number of HTTP requests currently being processed",
            in_flight.clone(),
        );

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            in_flight,
        }
    }

    pub fn request_started(&self) {
        self.in_flight.inc();
    }

    pub fn request_finished(
        &self,
        method: &Method,
        path: &str,
        status: StatusCode,
        elapsed: Duration,
    ) {
        self.in_flight.dec();
        self.requests_total
            .get_or_create(&RequestLabels {
                method: method.to_string(),
                path: path.to_string(),
                status: status_bucket(status).to_string(),
            })
            .inc();
        self.request_duration_seconds
            .get_or_create(&DurationLabels {
                method: method.to_string(),
                path: path.to_string(),
            })
            .observe(elapsed.as_secs_f64());
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

/// Collapse a status code into its class.
pub fn status_bucket(status: StatusCode) -> &'static str {
    match status.as_u16() {
        500.. => "5xx",
        400.. => "4xx",
        300.. => "3xx",
        200.. => "2xx",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_buckets() {
        assert_eq!(status_bucket(StatusCode::OK), "2xx");
        assert_eq!(status_bucket(StatusCode::TEMPORARY_REDIRECT), "3xx");
        assert_eq!(status_bucket(StatusCode::TOO_MANY_REQUESTS), "4xx");
        assert_eq!(status_bucket(StatusCode::BAD_GATEWAY), "5xx");
        assert_eq!(status_bucket(StatusCode::CONTINUE), "other");
    }

    #[test]
    fn records_and_encodes() {
        let metrics = Metrics::new();
        metrics.request_started();
        metrics.request_finished(
            &Method::GET,
            "/api/users",
            StatusCode::OK,
            Duration::from_millis(12),
        );
        let text = metrics.encode_text().unwrap();
        assert!(text.contains("http_requests_total"));
        assert!(text.contains("http_request_duration_seconds"));
        assert!(text.contains("http_requests_in_flight 0"));
        assert!(text.contains("path=\"/api/users\""));
        assert!(text.contains("status=\"2xx\""));
    }
}
