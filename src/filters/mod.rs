//! Filter model subsystem.
//!
//! # Data Flow
//! ```text
//! definition text (TOML)
//!     → definition.rs (FilterDefinition, Condition)
//!     → factory.rs (FilterFactory::compile → FilterUnit | FilterCompilationError)
//!     → registry snapshot
//!
//! Per request:
//!     context.rs (RequestContext) is threaded through every FilterUnit
//! ```
//!
//! # Design Decisions
//! - Filters see one normalized request/response model whatever the
//!   connection negotiated
//! - Units are immutable; reloading replaces them, never edits them
//! - Filters must tolerate cancellation: a closed connection drops the chain
//!   mid-flight and nothing already applied is rolled back

mod builtin;
pub mod context;
pub mod definition;
pub mod factory;
pub mod unit;

pub use context::{FilterFailure, RequestContext, RequestHead};
pub use definition::{Condition, FilterDefinition};
pub use factory::{FilterCompilationError, FilterFactory, StaticFilterFactory};
pub use unit::{from_fn, Filter, FilterError, FilterOutcome, FilterResult, FilterUnit, Phase};
