//! Immutable, versioned view of the active filters.

use std::sync::Arc;

use crate::filters::unit::{FilterUnit, Phase};

/// Ordered filters per phase, as seen by one request from start to finish.
#[derive(Debug, Default)]
pub struct FilterSnapshot {
    version: u64,
    phases: [Vec<Arc<FilterUnit>>; 4],
}

impl FilterSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from units given in insertion order.
    ///
    /// Each phase is sorted by ascending priority; the sort is stable, so
    /// equal priorities keep their insertion order.
    pub fn from_units(version: u64, units: impl IntoIterator<Item = Arc<FilterUnit>>) -> Self {
        let mut phases: [Vec<Arc<FilterUnit>>; 4] = Default::default();
        for unit in units {
            phases[unit.phase().index()].push(unit);
        }
        for list in &mut phases {
            list.sort_by_key(|unit| unit.priority());
        }
        Self { version, phases }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Filters of one phase in execution order.
    pub fn phase(&self, phase: Phase) -> &[Arc<FilterUnit>] {
        &self.phases[phase.index()]
    }

    pub fn get(&self, name: &str) -> Option<&Arc<FilterUnit>> {
        self.phases.iter().flatten().find(|unit| unit.name() == name)
    }

    pub fn names(&self, phase: Phase) -> Vec<&str> {
        self.phase(phase).iter().map(|unit| unit.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.phases.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
