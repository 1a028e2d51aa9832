//! OpenAPI document generation and the docs UI shell.
//!
//! The document is derived from the live route set, so it stays truthful
//! across configuration reloads.

use serde_json::{json, Map, Value};

use crate::config::GatewayConfig;

/// Build an OpenAPI 3 document describing the configured routes plus the
/// gateway's fixed endpoints.
pub fn document(config: &GatewayConfig) -> Value {
    let mut paths = Map::new();

    paths.insert(
        "/health".to_string(),
        json!({ "get": { "summary": "Liveness probe", "responses": { "200": { "description": "OK" } } } }),
    );
    paths.insert(
        "/ready".to_string(),
        json!({ "get": { "summary": "Readiness probe", "responses": { "200": { "description": "OK" } } } }),
    );

    for route in &config.routes {
        let mut operations = Map::new();
        for method in &route.methods {
            let mut operation = Map::new();
            operation.insert(
                "summary".to_string(),
                json!(format!("Proxy to {}", route.upstream)),
            );
            operation.insert(
                "responses".to_string(),
                json!({ "default": { "description": "Upstream response" } }),
            );
            if route.auth_required {
                operation.insert("security".to_string(), json!([{ "bearerAuth": [] }]));
            }
            operations.insert(method.to_ascii_lowercase(), Value::Object(operation));
        }
        merge_path(&mut paths, &route.path, operations);
    }

    json!({
        "openapi": "3.0.3",
        "info": {
            "title": "routegate",
            "description": "Configurable HTTP reverse-proxy gateway",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "paths": Value::Object(paths),
        "components": {
            "securitySchemes": {
                "bearerAuth": { "type": "http", "scheme": "bearer", "bearerFormat": "JWT" }
            }
        },
    })
}

// Two routes may share a path with disjoint methods.
fn merge_path(paths: &mut Map<String, Value>, path: &str, operations: Map<String, Value>) {
    match paths.get_mut(path) {
        Some(Value::Object(existing)) => existing.extend(operations),
        _ => {
            paths.insert(path.to_string(), Value::Object(operations));
        }
    }
}

/// Minimal Swagger UI shell pointing at `/openapi.json`.
pub const SWAGGER_UI_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>routegate - API docs</title>
    <link rel="stylesheet" href="https://cdn.jsdelivr.net/npm/swagger-ui-dist@5/swagger-ui.css">
    <style>body { margin: 0; }</style>
</head>
<body>
    <div id="swagger-ui"></div>
    <script src="https://cdn.jsdelivr.net/npm/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
    <script>
        window.onload = function() {
            SwaggerUIBundle({
                url: '/openapi.json',
                dom_id: '#swagger-ui',
                deepLinking: true,
            });
        };
    </script>
</body>
</html>"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteSpec;
    use std::collections::BTreeMap;

    fn route(path: &str, methods: &[&str], auth: bool) -> RouteSpec {
        RouteSpec {
            path: path.to_string(),
            upstream: "http://backend:9000".to_string(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
            strip_prefix: None,
            auth_required: auth,
            rate_limit: None,
            timeout_ms: 0,
            retry: None,
            headers: BTreeMap::new(),
        }
    }

    #[test]
    fn document_lists_routes_and_methods() {
        let config = GatewayConfig {
            routes: vec![route("/api/users", &["GET", "POST"], true)],
            ..GatewayConfig::default()
        };
        let doc = document(&config);
        assert_eq!(doc["openapi"], "3.0.3");
        assert!(doc["paths"]["/api/users"]["get"].is_object());
        assert!(doc["paths"]["/api/users"]["post"].is_object());
        assert_eq!(
            doc["paths"]["/api/users"]["get"]["security"][0]["bearerAuth"],
            json!([])
        );
        assert!(doc["paths"]["/health"]["get"].is_object());
    }

    #[test]
    fn routes_sharing_a_path_merge_methods() {
        let config = GatewayConfig {
            routes: vec![route("/a", &["GET"], false), route("/a", &["POST"], false)],
            ..GatewayConfig::default()
        };
        let doc = document(&config);
        assert!(doc["paths"]["/a"]["get"].is_object());
        assert!(doc["paths"]["/a"]["post"].is_object());
    }
}
