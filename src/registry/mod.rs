//! Filter registry subsystem.
//!
//! # Data Flow
//! ```text
//! FilterSource (directory / memory)
//!     → watcher.rs (poll, checksum diff, compile via FilterFactory)
//!     → store.rs (FilterRegistry::publish, atomic swap)
//!     → snapshot.rs (FilterSnapshot, immutable, per-phase ordered)
//!     → FilterChainEngine loads one snapshot per request
//! ```
//!
//! # Design Decisions
//! - Single writer, many readers: readers never block
//! - Snapshots are never mutated after publication
//! - Compile failures are isolated to the failing definition

pub mod snapshot;
pub mod source;
pub mod store;
pub mod watcher;

pub use snapshot::FilterSnapshot;
pub use source::{DirectorySource, FilterSource, MemorySource, SourceEntry, SourceError};
pub use store::FilterRegistry;
pub use watcher::{FilterSourceWatcher, PollReport};
