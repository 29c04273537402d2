//! Serving subsystem: listeners, connection drivers, the request service.
//!
//! # Data Flow
//! ```text
//! listener_set.rs: accept (connection slot held)
//!     → connection.rs: pipeline stages (PROXY header, TLS, ALPN)
//!     → connection.rs: hyper HTTP/1.1 or HTTP/2 terminal
//!     → request id + trace layers
//!     → service.rs: lifecycle admission, proxy header stripping
//!     → engine::FilterChainEngine::execute
//! ```

pub mod connection;
pub mod listener_set;
pub mod service;

pub use connection::{ConnectionError, ConnectionServices};
pub use listener_set::ListenerSet;
pub use service::GatewayService;
