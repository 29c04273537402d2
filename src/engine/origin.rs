//! The routing step toward the backend.
//!
//! # Responsibilities
//! - Forward the (filter-rewritten) request to the origin
//! - Strip hop-by-hop headers in both directions
//! - Bound the upstream exchange with a timeout
//!
//! # Design Decisions
//! - The request is re-issued as HTTP/1.1 whatever the client negotiated;
//!   filters and the origin both see the normalized model
//! - Request bodies stream through, nothing is buffered

use std::str::FromStr;
use std::time::Duration;

use axum::body::Body;
use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Uri};
use futures_util::future::BoxFuture;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;

use crate::config::OriginConfig;
use crate::filters::context::{RequestContext, REQUEST_ID_HEADER};

/// Error type for the origin request.
#[derive(Debug, Error)]
pub enum OriginError {
    #[error("invalid origin address '{0}'")]
    InvalidAddress(String),

    #[error("failed to build upstream request: {0}")]
    Request(#[from] axum::http::Error),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),
}

impl OriginError {
    pub fn status(&self) -> StatusCode {
        match self {
            OriginError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Sends a request to the backend and returns its response.
pub trait Origin: Send + Sync {
    fn forward<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, Result<Response<Body>, OriginError>>;
}

/// Headers that describe one hop and must not be forwarded.
static HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named by `Connection` are hop-by-hop too.
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_str(name.trim()).ok())
        .collect();
    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

/// Origin reached over plain HTTP through a pooled hyper client.
#[derive(Clone)]
pub struct HttpOrigin {
    client: Client<HttpConnector, Body>,
    authority: Authority,
    request_timeout: Duration,
}

impl HttpOrigin {
    pub fn new(config: &OriginConfig) -> Result<Self, OriginError> {
        let authority = Authority::from_str(&config.address)
            .map_err(|_| OriginError::InvalidAddress(config.address.clone()))?;

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(config.connect_timeout_secs)));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Self {
            client,
            authority,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    fn upstream_request(&self, ctx: &mut RequestContext) -> Result<Request<Body>, OriginError> {
        let body = ctx.take_request_body();
        let request = ctx.request();

        let mut uri_parts = request.uri().clone().into_parts();
        uri_parts.scheme = Some(Scheme::HTTP);
        uri_parts.authority = Some(self.authority.clone());
        if uri_parts.path_and_query.is_none() {
            uri_parts.path_and_query = Some(PathAndQuery::from_static("/"));
        }
        let uri = Uri::from_parts(uri_parts).map_err(axum::http::Error::from)?;

        let mut builder = Request::builder().method(request.method().clone()).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in request.headers() {
                headers.append(name.clone(), value.clone());
            }
            strip_hop_by_hop(headers);
            if let Ok(id) = HeaderValue::from_str(ctx.id()) {
                headers.insert(REQUEST_ID_HEADER, id);
            }
        }

        Ok(builder.body(body)?)
    }
}

impl Origin for HttpOrigin {
    fn forward<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, Result<Response<Body>, OriginError>> {
        Box::pin(async move {
            let request = self.upstream_request(ctx)?;

            tracing::debug!(
                request_id = %ctx.id(),
                method = %request.method(),
                uri = %request.uri(),
                "Forwarding to origin"
            );

            let response = tokio::time::timeout(self.request_timeout, self.client.request(request))
                .await
                .map_err(|_| OriginError::Timeout(self.request_timeout))??;

            let (mut parts, body) = response.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            Ok(Response::from_parts(parts, Body::new(body)))
        })
    }
}
