//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Per connection (manager.rs):
//!     request begins/ends → activity recorded
//!     idle / expired / request budget spent → drain
//!     drain → refuse new requests → finish in-flight → close
//!
//! Process (shutdown.rs, signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger → listeners stop accepting
//!         → every connection drains → exit after the drain deadline
//! ```
//!
//! # Design Decisions
//! - Lifecycle limits are protocol independent; the connection driver maps a
//!   drain to the protocol's own graceful close
//! - Shutdown has a deadline: connections still open after it are dropped

pub mod manager;
pub mod shutdown;
pub mod signals;

pub use manager::{CloseReason, ConnectionLifecycle, LifecycleAction, LifecyclePolicy, RequestGuard};
pub use shutdown::Shutdown;
