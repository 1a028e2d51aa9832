//! routegate: a configurable HTTP reverse-proxy gateway.
//!
//! Each inbound request is matched to a route and run through an ordered
//! stage pipeline (request id, logging, metrics, CORS, auth, rate limits,
//! tracing, timeout, recovery, circuit breaker) before being forwarded to
//! the route's upstream. The shared state behind the policies, the
//! token-bucket registry and the per-upstream circuit registry, is
//! process-global; the pipeline set itself is rebuilt and swapped atomically
//! on configuration reload without dropping in-flight requests.

pub mod auth;
pub mod breaker;
pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod openapi;
pub mod pipeline;
pub mod ratelimit;
pub mod router;
pub mod server;
pub mod trace;
pub mod upstream;

pub use config::{ConfigError, GatewayConfig, ReloadHandle};
pub use error::GatewayError;
pub use router::{build_router, GatewayState};
pub use server::{Server, ServerError};
