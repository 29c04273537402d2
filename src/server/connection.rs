//! Connection driver: walks a listener's pipeline for one accepted socket.
//!
//! # Responsibilities
//! - Run the pre-terminal stages in order (PROXY header, TLS, ALPN)
//! - Serve the chosen terminal stage with hyper until the connection closes
//! - Turn lifecycle drains and process shutdown into a graceful close
//! - Report open and close events to the usage notifier
//!
//! # Design Decisions
//! - Stages run strictly in order on the connection's own task
//! - Dropping the hyper connection cancels any in-flight filter chain
//! - A drain that overruns its deadline drops the connection

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::TimeoutConfig;
use crate::engine::{ConnectionEvent, ConnectionUsage, FilterChainEngine, UsageNotifier};
use crate::lifecycle::{CloseReason, ConnectionLifecycle, LifecyclePolicy};
use crate::net::connection::{AppProtocol, ConnectionId, ConnectionState, TlsSession};
use crate::net::proxy_protocol::{self, ProxyProtocolError};
use crate::pipeline::alpn::{AlpnNegotiator, ProtocolNegotiationError};
use crate::pipeline::proxy_headers::ProxyHeaderTrust;
use crate::pipeline::stage::{Http1Settings, Http2Settings, Pipeline, Stage, TerminalStage};
use crate::server::service::GatewayService;

const PROXY_HEADER_TIMEOUT: Duration = Duration::from_secs(5);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a connection ended before reaching its terminal stage.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    ProxyProtocol(#[from] ProxyProtocolError),
    #[error("timed out waiting for the {0}")]
    Timeout(&'static str),
    #[error(transparent)]
    Negotiation(#[from] ProtocolNegotiationError),
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),
    #[error("pipeline has no terminal stage")]
    NoTerminal,
    #[error("gateway shutting down")]
    ShuttingDown,
}

/// Everything a connection task needs besides its socket.
#[derive(Clone)]
pub struct ConnectionServices {
    pub engine: Arc<FilterChainEngine>,
    pub notifier: Arc<dyn UsageNotifier>,
}

/// Socket after the pre-terminal stages.
enum Transport {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

/// Drive one connection through `pipeline` until it closes.
pub async fn drive(
    pipeline: Arc<Pipeline>,
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    services: ConnectionServices,
    mut shutdown: broadcast::Receiver<()>,
) -> CloseReason {
    let mut state = ConnectionState::new(id, pipeline.shared_name(), peer);
    let listener = pipeline.shared_name();
    let notify = |protocol: Option<AppProtocol>, event: ConnectionEvent| {
        services.notifier.connection_event(ConnectionUsage {
            connection: id,
            listener: Arc::clone(&listener),
            protocol,
            event,
        });
    };
    notify(None, ConnectionEvent::Open);

    let prepared = tokio::select! {
        prepared = prepare(&pipeline, stream, &mut state) => prepared,
        _ = shutdown.recv() => Err(ConnectionError::ShuttingDown),
    };

    let reason = match prepared {
        Ok((transport, terminal, lifecycle)) => {
            tracing::debug!(
                connection_id = %id,
                listener = %pipeline.name(),
                client_addr = %state.client_addr(),
                protocol = ?state.protocol(),
                stages = ?terminal.stage_names(),
                "Connection ready"
            );
            let state = Arc::new(state);
            let service = GatewayService::new(
                Arc::clone(&services.engine),
                Arc::clone(&state),
                Arc::clone(&lifecycle),
            );
            let reason = match transport {
                Transport::Plain(io) => serve(io, &terminal, service, &lifecycle, &mut shutdown).await,
                Transport::Tls(io) => serve(*io, &terminal, service, &lifecycle, &mut shutdown).await,
            };
            notify(state.protocol(), ConnectionEvent::Close(reason));
            reason
        }
        Err(e) => {
            tracing::debug!(
                connection_id = %id,
                listener = %pipeline.name(),
                peer_addr = %peer,
                error = %e,
                "Connection closed before serving requests"
            );
            let reason = match e {
                ConnectionError::ShuttingDown => CloseReason::Shutdown,
                _ => CloseReason::ProtocolError,
            };
            notify(state.protocol(), ConnectionEvent::Close(reason));
            reason
        }
    };

    tracing::trace!(connection_id = %id, reason = %reason, "Connection finished");
    reason
}

/// Run every stage up to the terminal one.
async fn prepare(
    pipeline: &Pipeline,
    stream: TcpStream,
    state: &mut ConnectionState,
) -> Result<(Transport, TerminalStage, Arc<ConnectionLifecycle>), ConnectionError> {
    let mut transport = Transport::Plain(stream);
    let mut trust: Option<&ProxyHeaderTrust> = None;
    let mut lifecycle = None;
    let mut terminal = None;

    for stage in pipeline.stages() {
        match stage {
            Stage::ProxyProtocol => {
                let Transport::Plain(stream) = &mut transport else {
                    continue;
                };
                let header = tokio::time::timeout(PROXY_HEADER_TIMEOUT, proxy_protocol::read_v1(stream))
                    .await
                    .map_err(|_| ConnectionError::Timeout("PROXY header"))??;
                if let Some(client) = header {
                    state.set_client_addr(client);
                }
            }
            Stage::ProxyHeaders(policy) => trust = Some(policy),
            Stage::Tls(tls) => {
                let Transport::Plain(stream) = transport else {
                    return Err(ConnectionError::NoTerminal);
                };
                let stream = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, tls.acceptor.accept(stream))
                    .await
                    .map_err(|_| ConnectionError::Timeout("TLS handshake"))?
                    .map_err(ConnectionError::Handshake)?;

                let (_, session) = stream.get_ref();
                state.set_tls(TlsSession {
                    client_certificate: session.peer_certificates().is_some_and(|c| !c.is_empty()),
                    server_name: session.server_name().map(str::to_string),
                });
                transport = Transport::Tls(Box::new(stream));
            }
            Stage::Lifecycle(policy) => lifecycle = Some(Arc::new(ConnectionLifecycle::new(policy))),
            Stage::Http1(settings) => {
                state.set_protocol(AppProtocol::Http1);
                terminal = Some(TerminalStage::Http1(settings.clone()));
            }
            Stage::Alpn(alpn) => {
                let negotiated = match &transport {
                    Transport::Tls(stream) => stream.get_ref().1.alpn_protocol().map(<[u8]>::to_vec),
                    Transport::Plain(_) => None,
                };
                let mut negotiator = AlpnNegotiator::new(alpn);
                terminal = Some(negotiator.on_handshake_complete(negotiated.as_deref(), state)?);
            }
        }
    }

    if let Some(trust) = trust {
        let verified = state.tls().is_some_and(|tls| tls.client_certificate);
        state.set_proxy_headers_trusted(trust.trusts(state.peer_addr().ip(), verified));
    }

    let terminal = terminal.ok_or(ConnectionError::NoTerminal)?;
    let lifecycle = lifecycle.unwrap_or_else(|| {
        Arc::new(ConnectionLifecycle::new(&LifecyclePolicy::for_listener(
            pipeline.kind(),
            &TimeoutConfig::default(),
        )))
    });
    Ok((transport, terminal, lifecycle))
}

/// Serve HTTP on the prepared transport until the connection closes.
async fn serve<IO>(
    io: IO,
    terminal: &TerminalStage,
    service: GatewayService,
    lifecycle: &ConnectionLifecycle,
    shutdown: &mut broadcast::Receiver<()>,
) -> CloseReason
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(io);
    let service = ServiceBuilder::new()
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .service(service);
    let service = TowerToHyperService::new(service);

    match terminal {
        TerminalStage::Http1(settings) => {
            let conn = http1_builder(settings).serve_connection(io, service);
            tokio::pin!(conn);
            let outcome = run_until_closed(conn.as_mut(), |c| c.graceful_shutdown(), lifecycle, shutdown).await;
            close_reason(outcome, lifecycle, false)
        }
        TerminalStage::Http2(settings) => {
            let conn = http2_builder(settings).serve_connection(io, service);
            tokio::pin!(conn);
            let outcome = run_until_closed(conn.as_mut(), |c| c.graceful_shutdown(), lifecycle, shutdown).await;
            close_reason(outcome, lifecycle, settings.error_guard)
        }
    }
}

fn http1_builder(settings: &Http1Settings) -> http1::Builder {
    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .keep_alive(true)
        .header_read_timeout(settings.header_read_timeout);
    builder
}

fn http2_builder(settings: &Http2Settings) -> http2::Builder<TokioExecutor> {
    let mut builder = http2::Builder::new(TokioExecutor::new());
    builder
        .timer(TokioTimer::new())
        .max_concurrent_streams(settings.max_concurrent_streams)
        .max_header_list_size(settings.max_header_list_size);
    if let Some(interval) = settings.keep_alive_interval {
        builder.keep_alive_interval(interval);
    }
    builder
}

enum Outcome {
    /// The connection future finished on its own.
    Finished(Result<(), hyper::Error>),
    /// A graceful close was requested and completed (or timed out).
    Drained { reason: CloseReason, timed_out: bool },
}

async fn run_until_closed<C, F>(
    mut conn: Pin<&mut C>,
    begin_shutdown: F,
    lifecycle: &ConnectionLifecycle,
    shutdown: &mut broadcast::Receiver<()>,
) -> Outcome
where
    C: Future<Output = Result<(), hyper::Error>>,
    F: FnOnce(Pin<&mut C>),
{
    let reason = tokio::select! {
        result = conn.as_mut() => return Outcome::Finished(result),
        reason = lifecycle.wait_for_close() => reason,
        _ = shutdown.recv() => {
            lifecycle.start_drain(CloseReason::Shutdown);
            lifecycle.drain_reason().unwrap_or(CloseReason::Shutdown)
        }
    };

    begin_shutdown(conn.as_mut());
    let timed_out = match tokio::time::timeout(lifecycle.drain_timeout(), conn.as_mut()).await {
        Ok(Ok(())) => false,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "Connection error while draining");
            false
        }
        Err(_) => true,
    };
    Outcome::Drained { reason, timed_out }
}

fn close_reason(outcome: Outcome, lifecycle: &ConnectionLifecycle, error_guard: bool) -> CloseReason {
    match outcome {
        Outcome::Drained { reason, timed_out } => {
            if timed_out {
                tracing::warn!(
                    reason = %reason,
                    in_flight = lifecycle.in_flight(),
                    "Drain deadline passed; dropping connection"
                );
            }
            reason
        }
        // Closed by us after `Connection: close`, or by the peer.
        Outcome::Finished(Ok(())) => lifecycle.drain_reason().unwrap_or(CloseReason::PeerClosed),
        Outcome::Finished(Err(e)) => {
            let reason = classify_error(ErrorClass::of(&e), error_guard);
            match (reason, error_guard) {
                (CloseReason::ProtocolError, true) => {
                    tracing::warn!(error = %e, "HTTP/2 connection error; closing connection")
                }
                (CloseReason::ProtocolError, false) => {
                    tracing::debug!(error = %e, "Protocol error; closing connection")
                }
                _ => tracing::trace!(error = %e, "Connection ended with error"),
            }
            reason
        }
    }
}

/// Coarse shape of a connection-level `hyper::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    Timeout,
    /// The peer went away mid-message or the connection was canceled.
    Aborted,
    /// Malformed input or misuse of the protocol.
    Malformed,
    Other,
}

impl ErrorClass {
    fn of(error: &hyper::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_incomplete_message() || error.is_canceled() {
            Self::Aborted
        } else if error.is_parse() || error.is_user() {
            Self::Malformed
        } else {
            Self::Other
        }
    }
}

/// The HTTP/2 error guard only changes classification: any error the stream
/// layer surfaces that is not a timeout or an abort counts as a protocol
/// error and is logged at warn. hyper has already sent GOAWAY and closed the
/// connection by the time the error reaches us.
fn classify_error(class: ErrorClass, error_guard: bool) -> CloseReason {
    match class {
        ErrorClass::Timeout => CloseReason::Idle,
        ErrorClass::Aborted => CloseReason::PeerClosed,
        ErrorClass::Malformed => CloseReason::ProtocolError,
        ErrorClass::Other if error_guard => CloseReason::ProtocolError,
        ErrorClass::Other => CloseReason::PeerClosed,
    }
}
