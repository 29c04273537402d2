//! ALPN negotiation state machine.
//!
//! ```text
//! Negotiating ──"h2"──────────────────▶ Http2Selected ──▶ Closed
//!      │      ──"http/1.1" / none ───▶ Http1Selected ──▶ Closed
//!      └──── handshake failure / unsupported token ─────▶ Closed
//! ```
//!
//! The negotiator never mutates the listener's pipeline; it returns the
//! terminal stage this connection should use.

use thiserror::Error;

use crate::net::connection::{AppProtocol, ConnectionState};
use crate::pipeline::stage::{AlpnStage, Http1Settings, Http2Settings, TerminalStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Negotiating,
    Http1Selected,
    Http2Selected,
    Closed,
}

/// The connection could not agree on a usable protocol and is closed.
#[derive(Debug, Error)]
pub enum ProtocolNegotiationError {
    #[error("unsupported application protocol `{0}`")]
    Unsupported(String),
    #[error("TLS handshake failed: {0}")]
    Handshake(String),
    #[error("negotiation already finished in state {0:?}")]
    AlreadyNegotiated(NegotiationState),
}

/// One per connection, installed right after the TLS stage.
#[derive(Debug)]
pub struct AlpnNegotiator {
    state: NegotiationState,
    http1: Http1Settings,
    http2: Http2Settings,
}

impl AlpnNegotiator {
    pub fn new(stage: &AlpnStage) -> Self {
        Self {
            state: NegotiationState::Negotiating,
            http1: stage.http1.clone(),
            http2: stage.http2.clone(),
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Pick the terminal stage from the protocol agreed in the handshake and
    /// record it on the connection.
    pub fn on_handshake_complete(
        &mut self,
        negotiated: Option<&[u8]>,
        connection: &mut ConnectionState,
    ) -> Result<TerminalStage, ProtocolNegotiationError> {
        if self.state != NegotiationState::Negotiating {
            return Err(ProtocolNegotiationError::AlreadyNegotiated(self.state));
        }

        match negotiated {
            Some(b"h2") => {
                self.state = NegotiationState::Http2Selected;
                connection.set_protocol(AppProtocol::Http2);
                Ok(TerminalStage::Http2(self.http2.clone()))
            }
            None | Some(b"http/1.1") | Some(b"http/1.0") => {
                self.state = NegotiationState::Http1Selected;
                connection.set_protocol(AppProtocol::Http1);
                Ok(TerminalStage::Http1(self.http1.clone()))
            }
            Some(other) => {
                self.state = NegotiationState::Closed;
                Err(ProtocolNegotiationError::Unsupported(
                    String::from_utf8_lossy(other).into_owned(),
                ))
            }
        }
    }

    pub fn on_handshake_failed(&mut self, error: impl std::fmt::Display) -> ProtocolNegotiationError {
        self.state = NegotiationState::Closed;
        ProtocolNegotiationError::Handshake(error.to_string())
    }

    /// Connection gone. Terminal.
    pub fn close(&mut self) {
        self.state = NegotiationState::Closed;
    }
}
