//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! gateway.toml
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (gateway-wide semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → listener sections validated again, one by one, when the
//!       listener set is built (a bad listener is skipped, not fatal)
//!
//! Filter definitions are not part of this file:
//!     watcher.rs nudges the filter source watcher when the
//!     filter directory changes
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded and passed explicitly to each subsystem
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{
    AllowProxyHeaders, ClientAuth, EngineSettings, FilterSourceConfig, GatewayConfig, Http1Config,
    Http2Config, ListenerConfig, ListenerKind, LogFormat, ObservabilityConfig, OriginConfig,
    TimeoutConfig, TlsConfig,
};
pub use validation::ValidationError;
