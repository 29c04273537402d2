//! Edge gateway library.
//!
//! Accepts client connections on named listeners, negotiates HTTP/1.1 or
//! HTTP/2 per connection, and runs every request through a hot-swappable
//! chain of filters before proxying it to the origin.

pub mod config;
pub mod engine;
pub mod filters;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod pipeline;
pub mod registry;
pub mod server;

pub use config::GatewayConfig;
pub use engine::FilterChainEngine;
pub use lifecycle::Shutdown;
pub use server::ListenerSet;
