//! Configuration schema.
//!
//! Field names and defaults mirror the YAML surface: millisecond integers for
//! durations (`*_ms`), with typed accessors for the rest of the crate.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub jwt: JwtConfig,
    #[serde(default)]
    pub otel: OtelConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub global_rate_limit: Option<RateLimitSpec>,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
}

/// Listener binding and socket timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "defaults::host")]
    pub host: String,
    #[serde(default = "defaults::port")]
    pub port: u16,
    #[serde(default = "defaults::read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "defaults::write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "defaults::idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: defaults::host(),
            port: defaults::port(),
            read_timeout_ms: defaults::read_timeout_ms(),
            write_timeout_ms: defaults::write_timeout_ms(),
            idle_timeout_ms: defaults::idle_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Signing key and expected issuer for bearer-token validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JwtConfig {
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub issuer: String,
}

/// Tracing export target (the exporter itself is external).
#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "defaults::service_name")]
    pub service_name: String,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            service_name: defaults::service_name(),
        }
    }
}

/// Cross-origin policy applied by the CORS stage.
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "defaults::allow_origins")]
    pub allow_origins: Vec<String>,
    #[serde(default = "defaults::allow_methods")]
    pub allow_methods: Vec<String>,
    #[serde(default = "defaults::allow_headers")]
    pub allow_headers: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
    #[serde(default)]
    pub expose_headers: Vec<String>,
    #[serde(default = "defaults::cors_max_age")]
    pub max_age: u32,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origins: defaults::allow_origins(),
            allow_methods: defaults::allow_methods(),
            allow_headers: defaults::allow_headers(),
            allow_credentials: false,
            expose_headers: Vec::new(),
            max_age: defaults::cors_max_age(),
        }
    }
}

/// How limiter bucket keys are derived from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrategy {
    /// One shared bucket.
    Global,
    /// Per client address.
    Ip,
    /// Per authenticated subject, falling back to the client address.
    #[serde(alias = "per-user")]
    User,
}

/// Token-bucket parameters for one limiter installation.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSpec {
    pub rps: u32,
    pub burst: u32,
    /// Defaults to `ip` on routes and `global` at the gateway level.
    #[serde(default)]
    pub key_by: Option<KeyStrategy>,
}

impl RateLimitSpec {
    pub fn key_by_or(&self, default: KeyStrategy) -> KeyStrategy {
        self.key_by.unwrap_or(default)
    }
}

/// Retry parameters consumed by the forward stage.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySpec {
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "defaults::retry_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "defaults::retry_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl RetrySpec {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// One proxied route: a path pattern, the policies wrapped around it, and the
/// upstream it forwards to. Immutable once the pipeline is built.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteSpec {
    pub path: String,
    pub upstream: String,
    #[serde(default = "defaults::methods")]
    pub methods: Vec<String>,
    #[serde(default)]
    pub strip_prefix: Option<String>,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub rate_limit: Option<RateLimitSpec>,
    /// Per-request deadline in milliseconds; 0 disables the timeout stage.
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: Option<RetrySpec>,
    /// Header-injection templates; values may reference `{{.UserID}}` or any
    /// `{{.<claim>}}`.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl RouteSpec {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

mod defaults {
    pub fn host() -> String {
        "0.0.0.0".to_string()
    }

    pub fn port() -> u16 {
        8080
    }

    pub fn read_timeout_ms() -> u64 {
        5000
    }

    pub fn write_timeout_ms() -> u64 {
        5000
    }

    pub fn idle_timeout_ms() -> u64 {
        60_000
    }

    pub fn service_name() -> String {
        "routegate".to_string()
    }

    pub fn allow_origins() -> Vec<String> {
        vec!["*".to_string()]
    }

    pub fn allow_methods() -> Vec<String> {
        ["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS"]
            .map(str::to_string)
            .to_vec()
    }

    pub fn allow_headers() -> Vec<String> {
        ["Origin", "Content-Type", "Accept", "Authorization", "X-Request-ID"]
            .map(str::to_string)
            .to_vec()
    }

    pub fn cors_max_age() -> u32 {
        300
    }

    pub fn methods() -> Vec<String> {
        vec!["GET".to_string()]
    }

    pub fn retry_backoff_ms() -> u64 {
        100
    }

    pub fn retry_max_backoff_ms() -> u64 {
        5000
    }
}
