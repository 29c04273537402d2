//! Listener pipeline construction.
//!
//! # Responsibilities
//! - Turn one `ListenerConfig` into an ordered stage list
//! - Load TLS material through the injected provider
//! - Choose between a fixed HTTP/1.1 terminal and ALPN negotiation
//!
//! # Design Decisions
//! - Pure function of configuration plus TLS material; no I/O besides the
//!   provider call
//! - Stage order is fixed:
//!   `[proxy_protocol] → proxy_headers → [tls] → lifecycle → http1 | alpn`
//! - Listener kinds differ only in defaults (ALPN offer, client auth,
//!   lifecycle timeouts), never in code paths
//! - Every failure is a `ListenerBuildError` for that listener alone

use std::sync::Arc;

use thiserror::Error;
use tokio_rustls::TlsAcceptor;

use crate::config::validation::validate_listener;
use crate::config::{ClientAuth, ListenerConfig, ListenerKind, ValidationError};
use crate::lifecycle::LifecyclePolicy;
use crate::net::listener::ListenerError;
use crate::net::tls::{server_config, TlsError, TlsMaterialProvider};
use crate::pipeline::proxy_headers::ProxyHeaderTrust;
use crate::pipeline::stage::{AlpnStage, Http1Settings, Http2Settings, Pipeline, Stage, TlsStage};

pub const ALPN_H2: &str = "h2";
pub const ALPN_HTTP11: &str = "http/1.1";

/// A listener could not be built; it stays down, the others are unaffected.
#[derive(Debug, Error)]
pub enum ListenerBuildError {
    #[error("invalid listener configuration: {}", join(.0))]
    Invalid(Vec<ValidationError>),
    #[error("`{}` listeners require TLS", .0.as_str())]
    TlsRequired(ListenerKind),
    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Bind(#[from] ListenerError),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Builds listener pipelines.
#[derive(Clone)]
pub struct ProtocolPipelineBuilder {
    tls: Arc<dyn TlsMaterialProvider>,
}

impl ProtocolPipelineBuilder {
    pub fn new(tls: Arc<dyn TlsMaterialProvider>) -> Self {
        Self { tls }
    }

    pub fn build(&self, name: &str, config: &ListenerConfig) -> Result<Pipeline, ListenerBuildError> {
        validate_listener(name, config).map_err(ListenerBuildError::Invalid)?;
        let kind = config.kind;

        let mut stages = Vec::with_capacity(5);
        if config.proxy_protocol {
            stages.push(Stage::ProxyProtocol);
        }
        stages.push(Stage::ProxyHeaders(ProxyHeaderTrust::new(
            config.allow_proxy_headers,
            config.trusted_peers.clone(),
        )));

        let offered = match &config.tls {
            Some(tls) => {
                let client_auth = match kind {
                    ListenerKind::MutualTls => ClientAuth::Require,
                    _ => tls.client_auth,
                };
                let offered: Arc<[String]> = match &tls.alpn {
                    Some(alpn) => alpn.clone().into(),
                    None => default_alpn(kind).into(),
                };

                let material = self.tls.load(tls)?;
                let server = server_config(material, client_auth, &offered)?;
                stages.push(Stage::Tls(TlsStage {
                    acceptor: TlsAcceptor::from(server),
                    client_auth,
                    alpn: Arc::clone(&offered),
                }));
                Some(offered)
            }
            None if kind.requires_tls() => return Err(ListenerBuildError::TlsRequired(kind)),
            None => None,
        };

        stages.push(Stage::Lifecycle(LifecyclePolicy::for_listener(kind, &config.timeouts)));

        let http1 = Http1Settings::from(&config.http1);
        match offered {
            Some(offered) if negotiates(&offered) => stages.push(Stage::Alpn(AlpnStage {
                http1,
                http2: Http2Settings::from(&config.http2),
            })),
            _ => stages.push(Stage::Http1(http1)),
        }

        let pipeline = Pipeline::new(name, kind, stages);
        tracing::debug!(
            listener = %name,
            kind = kind.as_str(),
            stages = ?pipeline.stage_names(),
            "Pipeline built"
        );
        Ok(pipeline)
    }
}

fn default_alpn(kind: ListenerKind) -> Vec<String> {
    match kind {
        ListenerKind::Http2 => vec![ALPN_H2.to_string(), ALPN_HTTP11.to_string()],
        _ => vec![ALPN_HTTP11.to_string()],
    }
}

/// ALPN decides the terminal only when HTTP/2 or several protocols are offered.
fn negotiates(offered: &[String]) -> bool {
    offered.len() > 1 || offered.iter().any(|p| p == ALPN_H2)
}
