//! The registry: an atomically swapped pointer to the current snapshot.
//!
//! # Design Decisions
//! - `ArcSwap` gives lock-free reads; a request loads the pointer once and
//!   keeps its `Arc` for the whole chain
//! - Publishing installs a brand-new snapshot; old ones are freed when the
//!   last in-flight request drops them
//! - There is exactly one writer (the source watcher), so versions are
//!   derived from the current snapshot without extra coordination

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::filters::unit::FilterUnit;
use crate::observability::metrics;
use crate::registry::snapshot::FilterSnapshot;

/// Holds the active filter snapshot.
#[derive(Debug)]
pub struct FilterRegistry {
    current: ArcSwap<FilterSnapshot>,
}

impl FilterRegistry {
    /// Registry with an empty snapshot at version 0.
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(FilterSnapshot::empty()),
        }
    }

    /// Registry whose first snapshot (version 1) holds `units`.
    pub fn with_units(units: impl IntoIterator<Item = Arc<FilterUnit>>) -> Self {
        Self {
            current: ArcSwap::from_pointee(FilterSnapshot::from_units(1, units)),
        }
    }

    /// The snapshot new requests should execute against.
    pub fn snapshot(&self) -> Arc<FilterSnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version()
    }

    /// Atomically replace the active set. Returns the new version.
    pub fn publish(&self, units: impl IntoIterator<Item = Arc<FilterUnit>>) -> u64 {
        let version = self.version() + 1;
        let snapshot = FilterSnapshot::from_units(version, units);
        let filters = snapshot.len();
        self.current.store(Arc::new(snapshot));

        metrics::record_snapshot_published(version, filters);
        tracing::info!(version, filters, "Filter snapshot published");
        version
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::unit::{from_fn, FilterOutcome, Phase};

    fn unit(name: &str) -> Arc<FilterUnit> {
        Arc::new(FilterUnit::new(
            name,
            Phase::Inbound,
            from_fn(|_| Ok(FilterOutcome::Continue)),
        ))
    }

    #[test]
    fn held_snapshot_survives_publish() {
        let registry = FilterRegistry::with_units(vec![unit("old")]);
        let held = registry.snapshot();

        let version = registry.publish(vec![unit("new")]);

        assert_eq!(version, 2);
        assert_eq!(held.names(Phase::Inbound), vec!["old"]);
        assert_eq!(registry.snapshot().names(Phase::Inbound), vec!["new"]);
    }

    #[test]
    fn starts_empty() {
        let registry = FilterRegistry::new();
        assert_eq!(registry.version(), 0);
        assert!(registry.snapshot().is_empty());
    }
}
