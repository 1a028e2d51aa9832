//! Configuration loading and validation.
//!
//! Loading flow: read file → substitute environment variables → parse YAML →
//! validate. Secrets stay out of the file via `${VAR}` / `${VAR:-default}`
//! references.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use super::error::ConfigError;
use super::schema::{GatewayConfig, KeyStrategy, RateLimitSpec, RouteSpec};

/// Methods a route may declare.
const KNOWN_METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS", "HEAD"];

/// Paths owned by the gateway itself.
const RESERVED_PATHS: [&str; 5] = ["/health", "/ready", "/metrics", "/openapi.json", "/docs"];

/// Load and validate a configuration file.
pub fn load(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if contents.trim().is_empty() {
        return Err(ConfigError::Empty);
    }
    let contents = substitute_env_vars(&contents)?;
    let config: GatewayConfig = serde_saphyr::from_str(&contents)?;
    validate(&config)?;
    Ok(config)
}

// Matches ${VAR} and ${VAR:-default}.
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid regex")
});

/// Substitute environment variable references in the raw config text.
///
/// `${VAR}` must be set; `${VAR:-default}` falls back to the default.
pub fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let mut result = content.to_string();
    let matches: Vec<_> = ENV_VAR_PATTERN
        .captures_iter(content)
        .filter_map(|cap| {
            let full = cap.get(0)?.as_str().to_string();
            let var = cap.get(1)?.as_str().to_string();
            let default = cap.get(2).map(|m| m.as_str().to_string());
            Some((full, var, default))
        })
        .collect();

    for (full, var, default) in matches {
        match std::env::var(&var) {
            Ok(value) => result = result.replace(&full, &value),
            Err(_) => match default {
                Some(fallback) => result = result.replace(&full, &fallback),
                None => return Err(ConfigError::MissingEnvVar { var }),
            },
        }
    }
    Ok(result)
}

/// Validate a parsed configuration.
pub fn validate(config: &GatewayConfig) -> Result<(), ConfigError> {
    if let Some(global) = &config.global_rate_limit {
        validate_rate_limit(global, "global_rate_limit")?;
    }

    let mut seen: HashSet<(String, String)> = HashSet::new();
    for route in &config.routes {
        validate_route(route)?;
        for method in &route.methods {
            let method = method.to_ascii_uppercase();
            if !seen.insert((route.path.clone(), method.clone())) {
                return Err(ConfigError::InvalidRoute {
                    path: route.path.clone(),
                    reason: format!("method {method} configured more than once for this path"),
                });
            }
        }
    }

    let auth_in_use = config.routes.iter().any(|r| r.auth_required);
    if auth_in_use && config.jwt.secret.is_empty() {
        return Err(ConfigError::Invalid(
            "jwt.secret is required when any route sets auth_required".to_string(),
        ));
    }

    Ok(())
}

fn validate_route(route: &RouteSpec) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidRoute {
        path: route.path.clone(),
        reason,
    };

    if route.path.is_empty() || !route.path.starts_with('/') {
        return Err(invalid("path must be non-empty and start with '/'".to_string()));
    }

    if RESERVED_PATHS.contains(&route.path.as_str()) {
        return Err(invalid("path is reserved by the gateway".to_string()));
    }

    match url::Url::parse(&route.upstream) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {}
        Ok(url) => {
            return Err(invalid(format!(
                "upstream scheme '{}' is not supported",
                url.scheme()
            )))
        }
        Err(_) => return Err(invalid("upstream must be an absolute URL".to_string())),
    }

    if route.methods.is_empty() {
        return Err(invalid("at least one method is required".to_string()));
    }
    for method in &route.methods {
        let upper = method.to_ascii_uppercase();
        if !KNOWN_METHODS.contains(&upper.as_str()) {
            return Err(invalid(format!("unknown method '{method}'")));
        }
    }

    if let Some(rate_limit) = &route.rate_limit {
        validate_rate_limit(rate_limit, &route.path)?;
    }

    if let Some(retry) = &route.retry {
        if retry.backoff_ms > retry.max_backoff_ms {
            return Err(invalid(format!(
                "retry backoff_ms {} exceeds max_backoff_ms {}",
                retry.backoff_ms, retry.max_backoff_ms
            )));
        }
    }

    Ok(())
}

fn validate_rate_limit(spec: &RateLimitSpec, context: &str) -> Result<(), ConfigError> {
    if spec.rps == 0 || spec.burst == 0 {
        return Err(ConfigError::Invalid(format!(
            "{context}: rate limit requires both rps and burst to be positive"
        )));
    }
    // key_by is an enum; any parsed value is valid. Global strategy is
    // permitted on routes (one shared bucket for the route).
    let _ = spec.key_by_or(KeyStrategy::Ip);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
routes:
  - path: /api/users
    upstream: http://users:9000
    methods: [GET, POST]
"#;

    fn parse(yaml: &str) -> GatewayConfig {
        serde_saphyr::from_str(yaml).unwrap()
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = parse(MINIMAL);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].methods, vec!["GET", "POST"]);
        assert!(config.routes[0].rate_limit.is_none());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn parses_full_route() {
        let config = parse(
            r#"
server:
  host: 127.0.0.1
  port: 9090
jwt:
  secret: s3cret
  issuer: routegate
global_rate_limit:
  rps: 100
  burst: 150
routes:
  - path: /api/orders
    upstream: http://orders:9000
    methods: [GET, POST]
    strip_prefix: /api
    auth_required: true
    rate_limit:
      rps: 10
      burst: 2
      key_by: user
    timeout_ms: 2000
    retry:
      attempts: 2
      backoff_ms: 50
    headers:
      X-User: "{{.UserID}}"
"#,
        );
        assert!(validate(&config).is_ok());
        let route = &config.routes[0];
        assert_eq!(route.strip_prefix.as_deref(), Some("/api"));
        assert!(route.auth_required);
        let rl = route.rate_limit.as_ref().unwrap();
        assert_eq!(rl.key_by_or(KeyStrategy::Ip), KeyStrategy::User);
        let retry = route.retry.as_ref().unwrap();
        assert_eq!(retry.attempts, 2);
        assert_eq!(retry.max_backoff_ms, 5000);
        let global = config.global_rate_limit.as_ref().unwrap();
        assert_eq!(global.key_by_or(KeyStrategy::Global), KeyStrategy::Global);
    }

    #[test]
    fn rejects_relative_upstream() {
        let config = parse(
            r#"
routes:
  - path: /a
    upstream: users:9000
"#,
        );
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidRoute { .. })
        ));
    }

    #[test]
    fn rejects_reserved_path() {
        let config = parse(
            r#"
routes:
  - path: /metrics
    upstream: http://u:1
"#,
        );
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidRoute { .. })
        ));
    }

    #[test]
    fn rejects_unknown_method() {
        let config = parse(
            r#"
routes:
  - path: /a
    upstream: http://u:1
    methods: [FETCH]
"#,
        );
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidRoute { .. })
        ));
    }

    #[test]
    fn rejects_zero_burst_with_positive_rps() {
        let config = parse(
            r#"
routes:
  - path: /a
    upstream: http://u:1
    rate_limit:
      rps: 10
      burst: 0
"#,
        );
        assert!(matches!(validate(&config), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_backoff_above_cap() {
        let config = parse(
            r#"
routes:
  - path: /a
    upstream: http://u:1
    retry:
      attempts: 1
      backoff_ms: 10000
      max_backoff_ms: 5000
"#,
        );
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidRoute { .. })
        ));
    }

    #[test]
    fn rejects_auth_without_secret() {
        let config = parse(
            r#"
routes:
  - path: /a
    upstream: http://u:1
    auth_required: true
"#,
        );
        assert!(matches!(validate(&config), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_duplicate_path_method() {
        let config = parse(
            r#"
routes:
  - path: /a
    upstream: http://u:1
    methods: [GET]
  - path: /a
    upstream: http://v:1
    methods: [get]
"#,
        );
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidRoute { .. })
        ));
    }

    #[test]
    fn env_substitution_required_and_default() {
        std::env::set_var("ROUTEGATE_TEST_SECRET", "from-env");
        let out = substitute_env_vars("secret: ${ROUTEGATE_TEST_SECRET}").unwrap();
        assert_eq!(out, "secret: from-env");
        std::env::remove_var("ROUTEGATE_TEST_SECRET");

        let out = substitute_env_vars("port: ${ROUTEGATE_TEST_MISSING:-8080}").unwrap();
        assert_eq!(out, "port: 8080");

        let err = substitute_env_vars("secret: ${ROUTEGATE_TEST_MISSING}");
        assert!(matches!(err, Err(ConfigError::MissingEnvVar { .. })));
    }
}
