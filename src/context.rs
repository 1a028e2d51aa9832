//! Per-request context carrier.
//!
//! A [`RequestContext`] is seeded at pipeline entry and rides in the request's
//! extensions so every stage can read or enrich it. It never outlives its
//! request task.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use http::Request;
use serde_json::{Map, Value};

/// Header carrying the request id on both legs.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Resolved caller identity for the current request.
#[derive(Debug, Clone, Default)]
pub enum Identity {
    /// No credentials presented (or the route does not require them).
    #[default]
    Anonymous,
    /// A verified bearer token.
    User {
        /// Subject (`sub`) claim.
        subject: String,
        /// The full raw claim map.
        claims: Map<String, Value>,
    },
}

/// State shared across pipeline stages for a single request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Request id, inherited from the inbound header or generated.
    pub request_id: String,
    /// Path pattern of the matched route.
    pub route_id: String,
    /// Remote address of the client connection.
    pub client_addr: SocketAddr,
    /// Caller identity, resolved by the auth stage.
    pub identity: Identity,
    /// W3C `traceparent` value propagated to the upstream.
    pub traceparent: Option<String>,
    /// Absolute deadline for the request, set by the timeout stage.
    pub deadline: Option<Instant>,
}

impl RequestContext {
    /// Create a fresh context for a matched route.
    pub fn new(route_id: impl Into<String>, client_addr: SocketAddr) -> Self {
        Self {
            request_id: String::new(),
            route_id: route_id.into(),
            client_addr,
            identity: Identity::Anonymous,
            traceparent: None,
            deadline: None,
        }
    }

    /// Borrow the context from a request, if seeded.
    pub fn of<B>(req: &Request<B>) -> Option<&Self> {
        req.extensions().get::<Self>()
    }

    /// Mutably borrow the context from a request, if seeded.
    pub fn of_mut<B>(req: &mut Request<B>) -> Option<&mut Self> {
        req.extensions_mut().get_mut::<Self>()
    }

    /// Subject of the authenticated caller, if any.
    pub fn subject(&self) -> Option<&str> {
        match &self.identity {
            Identity::User { subject, .. } if !subject.is_empty() => Some(subject),
            _ => None,
        }
    }

    /// Raw claim map of the authenticated caller, if any.
    pub fn claims(&self) -> Option<&Map<String, Value>> {
        match &self.identity {
            Identity::User { claims, .. } => Some(claims),
            Identity::Anonymous => None,
        }
    }

    /// Time left until the deadline; `None` when no deadline is bound.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}
