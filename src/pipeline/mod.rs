//! Per-listener connection pipelines.
//!
//! # Data Flow
//! ```text
//! ListenerConfig
//!     → builder.rs (validate, load TLS material, pick stages)
//!     → Pipeline: [proxy_protocol] → proxy_headers → [tls] → lifecycle → http1 | alpn
//!
//! Per connection (driven by server::connection):
//!     → proxy_headers.rs (trust decision, strip untrusted headers)
//!     → alpn.rs (Negotiating → Http1Selected | Http2Selected | Closed)
//!     → TerminalStage (HTTP/1.1 or the HTTP/2 subtree) → filter engine
//! ```
//!
//! # Design Decisions
//! - One builder parameterized by listener kind, no per-kind types
//! - Pipelines are immutable and shared by all connections of a listener;
//!   ALPN returns a terminal stage instead of editing the pipeline

pub mod alpn;
pub mod builder;
pub mod proxy_headers;
pub mod stage;

pub use alpn::{AlpnNegotiator, NegotiationState, ProtocolNegotiationError};
pub use builder::{ListenerBuildError, ProtocolPipelineBuilder};
pub use proxy_headers::ProxyHeaderTrust;
pub use stage::{AlpnStage, Http1Settings, Http2Settings, Pipeline, Stage, TerminalStage, TlsStage};
