//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → proxy_protocol.rs (optional PROXY v1 header, real client address)
//!     → tls.rs (rustls config built from the listener's TLS material)
//!     → connection.rs (ConnectionState, live connection tracking)
//!     → Hand off to the connection pipeline
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - TLS is optional per listener

pub mod connection;
pub mod listener;
pub mod proxy_protocol;
pub mod tls;
