//! Per-request mutable state shared by every filter of one request.
//!
//! # Responsibilities
//! - Keep the original request head for reference after filters rewrite it
//! - Carry the in-progress request and response
//! - Hold filter-to-filter attributes
//! - Record the first failure and timing markers
//!
//! # Design Decisions
//! - Owned by exactly one in-flight request and passed by `&mut` through the
//!   chain, so it needs no locking
//! - Bodies are `axum::body::Body` regardless of the connection's protocol

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, Response, Uri, Version};
use tokio::time::Instant;

use crate::filters::unit::{FilterError, FilterUnit, Phase};
use crate::net::connection::ConnectionState;

/// Header carrying the request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Snapshot of the request as it arrived, before any filter ran.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

/// A failure recorded in the context's error slot.
#[derive(Debug)]
pub struct FilterFailure {
    pub filter: Arc<str>,
    pub phase: Phase,
    pub critical: bool,
    pub error: FilterError,
}

impl FilterFailure {
    pub(crate) fn from_unit(unit: &FilterUnit, error: FilterError) -> Self {
        Self {
            filter: unit.shared_name(),
            phase: unit.phase(),
            critical: unit.is_critical(),
            error,
        }
    }

    /// Failure of the routing step toward the origin.
    pub(crate) fn origin(error: FilterError) -> Self {
        Self {
            filter: Arc::from("origin"),
            phase: Phase::Routing,
            critical: false,
            error,
        }
    }
}

/// Mutable state of one request as it moves through the filter chain.
#[derive(Debug)]
pub struct RequestContext {
    id: String,
    original: RequestHead,
    request: Request<Body>,
    response: Option<Response<Body>>,
    attributes: HashMap<String, serde_json::Value>,
    failure: Option<FilterFailure>,
    connection: Option<Arc<ConnectionState>>,
    started: Instant,
    marks: Vec<(&'static str, Duration)>,
}

impl RequestContext {
    /// Wrap a decoded request. The ID comes from `x-request-id` when present.
    pub fn new(request: Request<Body>) -> Self {
        let id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let original = RequestHead {
            method: request.method().clone(),
            uri: request.uri().clone(),
            version: request.version(),
            headers: request.headers().clone(),
        };

        Self {
            id,
            original,
            request,
            response: None,
            attributes: HashMap::new(),
            failure: None,
            connection: None,
            started: Instant::now(),
            marks: Vec::new(),
        }
    }

    pub fn with_connection(mut self, connection: Arc<ConnectionState>) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The request as received from the client.
    pub fn original(&self) -> &RequestHead {
        &self.original
    }

    /// The request as rewritten so far.
    pub fn request(&self) -> &Request<Body> {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request<Body> {
        &mut self.request
    }

    /// Move the request body out, leaving an empty one behind.
    pub fn take_request_body(&mut self) -> Body {
        std::mem::take(self.request.body_mut())
    }

    pub fn response(&self) -> Option<&Response<Body>> {
        self.response.as_ref()
    }

    pub fn response_mut(&mut self) -> Option<&mut Response<Body>> {
        self.response.as_mut()
    }

    pub fn set_response(&mut self, response: Response<Body>) {
        self.response = Some(response);
    }

    pub fn take_response(&mut self) -> Option<Response<Body>> {
        self.response.take()
    }

    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }

    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn failure(&self) -> Option<&FilterFailure> {
        self.failure.as_ref()
    }

    pub fn has_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Record a failure. Only the first one is kept.
    pub fn record_failure(&mut self, failure: FilterFailure) {
        if self.failure.is_none() {
            self.failure = Some(failure);
        }
    }

    /// Connection the request arrived on, when served by a listener.
    pub fn connection(&self) -> Option<&ConnectionState> {
        self.connection.as_deref()
    }

    /// Record the time elapsed since the request started under `label`.
    pub fn mark(&mut self, label: &'static str) {
        self.marks.push((label, self.started.elapsed()));
    }

    pub fn marks(&self) -> &[(&'static str, Duration)] {
        &self.marks
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Finish the request, yielding the response to write.
    pub fn into_response(self) -> Option<Response<Body>> {
        self.response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_incoming_request_id() {
        let request = Request::get("/")
            .header(REQUEST_ID_HEADER, "abc-123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(RequestContext::new(request).id(), "abc-123");
    }

    #[test]
    fn generates_request_id_when_missing() {
        let ctx = RequestContext::new(Request::get("/").body(Body::empty()).unwrap());
        assert!(uuid::Uuid::parse_str(ctx.id()).is_ok());
    }

    #[test]
    fn original_head_survives_rewrites() {
        let mut ctx = RequestContext::new(Request::get("/a").body(Body::empty()).unwrap());
        *ctx.request_mut().uri_mut() = "/b".parse().unwrap();
        assert_eq!(ctx.original().uri.path(), "/a");
        assert_eq!(ctx.request().uri().path(), "/b");
    }

    #[test]
    fn first_failure_wins() {
        let mut ctx = RequestContext::new(Request::get("/").body(Body::empty()).unwrap());
        ctx.record_failure(FilterFailure::origin(FilterError::failed("first")));
        ctx.record_failure(FilterFailure::origin(FilterError::failed("second")));
        assert_eq!(ctx.failure().unwrap().error.to_string(), "first");
    }
}
