//! The per-request policy pipeline.
//!
//! A stage is one policy layer with a uniform shape: given the request and
//! the rest of the chain, it either writes a response (short-circuit) or
//! calls through. Stages run in a fixed order and unwind in reverse, all
//! within the request's task. Chains are immutable once built; hot reload
//! swaps whole chains, never mutates one.

pub mod builder;
pub mod stages;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::Request;
use http_body_util::BodyExt;
use tracing::warn;

use crate::context::RequestContext;
use crate::error::GatewayError;

/// A request traveling the pipeline: the inbound parts with the body already
/// buffered, carrying the [`RequestContext`] in its extensions.
pub type PipelineRequest = Request<Bytes>;

/// One policy layer.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Handle the request, either short-circuiting with a response or
    /// delegating to `next`.
    async fn handle(&self, req: PipelineRequest, next: Next) -> Response;
}

/// Handle to the remaining stages of the chain.
#[derive(Clone)]
pub struct Next {
    stages: Arc<[Arc<dyn Stage>]>,
    index: usize,
}

impl Next {
    fn new(stages: Arc<[Arc<dyn Stage>]>) -> Self {
        Self { stages, index: 0 }
    }

    /// Run the next stage. The terminal stage never calls through, so
    /// falling off the end means the chain was assembled incorrectly.
    pub async fn run(mut self, req: PipelineRequest) -> Response {
        let Some(stage) = self.stages.get(self.index).cloned() else {
            warn!("pipeline chain exhausted without a terminal stage");
            return GatewayError::Internal.into_response();
        };
        self.index += 1;
        stage.handle(req, self).await
    }
}

/// An immutable, ordered stage chain for one route.
pub struct Pipeline {
    route_id: String,
    stages: Arc<[Arc<dyn Stage>]>,
}

impl Pipeline {
    pub fn new(route_id: impl Into<String>, stages: Vec<Arc<dyn Stage>>) -> Self {
        Self {
            route_id: route_id.into(),
            stages: stages.into(),
        }
    }

    /// Path pattern of the route this pipeline serves.
    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    /// Entry point: buffer the body, seed the context, run the chain.
    pub async fn execute(&self, client_addr: SocketAddr, req: Request<axum::body::Body>) -> Response {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(error) => {
                warn!(%error, "failed to buffer request body");
                return GatewayError::Internal.into_response();
            }
        };
        let mut req = Request::from_parts(parts, body);
        req.extensions_mut()
            .insert(RequestContext::new(self.route_id.clone(), client_addr));
        Next::new(Arc::clone(&self.stages)).run(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    struct Tag(&'static str, Arc<parking_lot::Mutex<Vec<String>>>);

    #[async_trait]
    impl Stage for Tag {
        async fn handle(&self, req: PipelineRequest, next: Next) -> Response {
            self.1.lock().push(format!("enter:{}", self.0));
            let resp = next.run(req).await;
            self.1.lock().push(format!("leave:{}", self.0));
            resp
        }
    }

    struct Terminal;

    #[async_trait]
    impl Stage for Terminal {
        async fn handle(&self, _req: PipelineRequest, _next: Next) -> Response {
            StatusCode::OK.into_response()
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Stage for ShortCircuit {
        async fn handle(&self, _req: PipelineRequest, _next: Next) -> Response {
            StatusCode::TOO_MANY_REQUESTS.into_response()
        }
    }

    fn request() -> PipelineRequest {
        let mut req = Request::builder().uri("/x").body(Bytes::new()).unwrap();
        req.extensions_mut()
            .insert(RequestContext::new("/x", "1.2.3.4:1".parse().unwrap()));
        req
    }

    #[tokio::test]
    async fn stages_unwind_in_reverse_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(Tag("outer", Arc::clone(&log))),
            Arc::new(Tag("inner", Arc::clone(&log))),
            Arc::new(Terminal),
        ];
        let resp = Next::new(stages.into()).run(request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            *log.lock(),
            vec!["enter:outer", "enter:inner", "leave:inner", "leave:outer"]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_deeper_stages() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(Tag("outer", Arc::clone(&log))),
            Arc::new(ShortCircuit),
            Arc::new(Tag("never", Arc::clone(&log))),
            Arc::new(Terminal),
        ];
        let resp = Next::new(stages.into()).run(request()).await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(*log.lock(), vec!["enter:outer", "leave:outer"]);
    }

    #[tokio::test]
    async fn exhausted_chain_is_an_internal_error() {
        let stages: Vec<Arc<dyn Stage>> = Vec::new();
        let resp = Next::new(stages.into()).run(request()).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
