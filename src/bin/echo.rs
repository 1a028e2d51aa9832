//! Echo upstream fixture for local development and demos.
//!
//! Answers every request with its own method, path, headers, and body as
//! JSON. `PORT` overrides the default listen port.

use axum::extract::Request;
use axum::http::header::CONTENT_TYPE;
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(9000);
    let app = Router::new().fallback(echo);

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .expect("failed to bind echo listener");
    info!(port, "echo service listening");
    axum::serve(listener, app).await.expect("echo server failed");
}

async fn echo(req: Request) -> Json<Value> {
    let (parts, body) = req.into_parts();
    let mut headers = Map::new();
    for (name, value) in &parts.headers {
        headers.insert(
            name.to_string(),
            json!(value.to_str().unwrap_or_default()),
        );
    }
    let body = match body.collect().await {
        Ok(collected) => String::from_utf8_lossy(&collected.to_bytes()).into_owned(),
        Err(_) => String::new(),
    };
    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    Json(json!({
        "method": parts.method.as_str(),
        "path": parts.uri.path(),
        "query": parts.uri.query().unwrap_or_default(),
        "content_type": content_type,
        "headers": Value::Object(headers),
        "body": body,
    }))
}
