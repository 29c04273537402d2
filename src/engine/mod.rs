//! Filter chain execution subsystem.
//!
//! # Data Flow
//! ```text
//! RequestContext (from the terminal stage)
//!     → chain.rs: inbound filters
//!     → chain.rs: routing filters
//!     → origin.rs: forward to backend (skipped if a filter responded)
//!     → chain.rs: outbound filters
//!     ↳ on failure: error filters → fallback response → always-run outbound filters
//!     → response written by the terminal stage
//!
//! Every invocation:
//!     → notifier.rs (applied / skipped / failed + duration, non-blocking)
//! ```
//!
//! # Design Decisions
//! - Execution order is a pure function of the snapshot and the context
//! - Failures are contained per filter and per request
//! - The origin and the usage notifier are collaborators behind traits

pub mod chain;
pub mod notifier;
pub mod origin;

pub use chain::{EngineConfig, FilterChainEngine};
pub use notifier::{
    ChannelNotifier, ConnectionEvent, ConnectionUsage, FilterStatus, FilterUsage, MetricsNotifier,
    NoopNotifier, UsageCounters, UsageEvent, UsageNotifier,
};
pub use origin::{HttpOrigin, Origin, OriginError};
