//! Gateway configuration: schema, loading, validation, hot reload.

pub mod error;
pub mod loader;
pub mod schema;
pub mod watcher;

pub use error::ConfigError;
pub use schema::{
    CorsConfig, GatewayConfig, JwtConfig, KeyStrategy, OtelConfig, RateLimitSpec, RetrySpec,
    RouteSpec, ServerConfig,
};
pub use watcher::ReloadHandle;
