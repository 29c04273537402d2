//! Per-connection request service.
//!
//! # Responsibilities
//! - Admit requests through the connection lifecycle (refuse while draining)
//! - Strip proxy headers the connection is not trusted to send
//! - Normalize the request body and run the filter chain engine
//! - Mark the last HTTP/1 response of a draining connection with `Connection: close`
//!
//! # Design Decisions
//! - Identical for HTTP/1.1 and HTTP/2; filters only see `Request<Body>`
//! - Request ids are assigned by `SetRequestIdLayer` before this service runs
//!   and copied onto the response by `PropagateRequestIdLayer`

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes, HttpBody};
use axum::http::header::{CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderValue, Request, Response, StatusCode};
use futures_util::future::BoxFuture;
use tokio::time::Instant;
use tower::Service;

use crate::engine::FilterChainEngine;
use crate::filters::context::RequestContext;
use crate::lifecycle::ConnectionLifecycle;
use crate::net::connection::{AppProtocol, ConnectionState};
use crate::observability::metrics;
use crate::pipeline::proxy_headers::strip_untrusted;

/// Entry point from a terminal stage into the filter engine.
#[derive(Clone)]
pub struct GatewayService {
    engine: Arc<FilterChainEngine>,
    connection: Arc<ConnectionState>,
    lifecycle: Arc<ConnectionLifecycle>,
}

impl GatewayService {
    pub fn new(
        engine: Arc<FilterChainEngine>,
        connection: Arc<ConnectionState>,
        lifecycle: Arc<ConnectionLifecycle>,
    ) -> Self {
        Self {
            engine,
            connection,
            lifecycle,
        }
    }

    /// Handle one request. Never fails; failures become error responses.
    pub async fn handle(&self, request: Request<Body>) -> Response<Body> {
        let started = Instant::now();
        let method = request.method().clone();

        let Some(guard) = self.lifecycle.begin_request() else {
            tracing::debug!(
                connection_id = %self.connection.id(),
                "Refusing request on draining connection"
            );
            return refused();
        };

        let (mut parts, body) = request.into_parts();
        if !self.connection.proxy_headers_trusted() {
            let removed = strip_untrusted(&mut parts.headers);
            if removed > 0 {
                tracing::debug!(
                    connection_id = %self.connection.id(),
                    removed,
                    "Stripped untrusted proxy headers"
                );
            }
        }

        let ctx = RequestContext::new(Request::from_parts(parts, body))
            .with_connection(Arc::clone(&self.connection));
        let ctx = self.engine.execute(ctx).await;
        let request_id = ctx.id().to_string();

        let mut response = match ctx.into_response() {
            Some(response) => response,
            None => {
                tracing::error!(request_id = %request_id, "Filter chain finished without a response");
                plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        };

        if guard.closing() && self.connection.protocol() == Some(AppProtocol::Http1) {
            response
                .headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("close"));
        }
        drop(guard);

        metrics::record_request(
            self.connection.listener(),
            method.as_str(),
            response.status().as_u16(),
            started.elapsed(),
        );
        response
    }
}

impl<B> Service<Request<B>> for GatewayService
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<axum::BoxError>,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let this = self.clone();
        let request = request.map(Body::new);
        Box::pin(async move { Ok(this.handle(request).await) })
    }
}

fn refused() -> Response<Body> {
    let mut response = plain(StatusCode::SERVICE_UNAVAILABLE, "connection closing");
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

fn plain(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
