//! Filter compilation.
//!
//! # Responsibilities
//! - Turn a definition into a `FilterUnit` or a `FilterCompilationError`
//! - Keep the mapping from `kind` to implementation pluggable
//!
//! # Design Decisions
//! - `FilterFactory` is the seam; `StaticFilterFactory` is the strategy that
//!   maps kinds to constructors registered at startup
//! - Phase/kind mismatches and bad settings fail compilation, never execution

use std::collections::HashMap;

use thiserror::Error;

use crate::filters::builtin;
use crate::filters::definition::FilterDefinition;
use crate::filters::unit::{Filter, FilterUnit, Phase};

/// A filter definition failed to compile or validate.
#[derive(Debug, Error)]
pub enum FilterCompilationError {
    #[error("invalid definition: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unknown filter kind '{0}'")]
    UnknownKind(String),

    #[error("filter kind '{kind}' cannot run in the {phase} phase")]
    PhaseNotSupported { kind: String, phase: Phase },

    #[error("always_run is only meaningful for outbound filters, not {0}")]
    AlwaysRunOutsideOutbound(Phase),

    #[error("invalid setting '{key}': {reason}")]
    InvalidSetting { key: String, reason: String },
}

impl FilterCompilationError {
    pub fn invalid_setting(key: &str, reason: impl Into<String>) -> Self {
        FilterCompilationError::InvalidSetting {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Compiles filter definitions into units.
pub trait FilterFactory: Send + Sync {
    fn compile(&self, definition: &FilterDefinition) -> Result<FilterUnit, FilterCompilationError>;

    /// Parse raw definition text and compile it.
    ///
    /// The identity names the filter when the definition carries no name.
    fn compile_text(
        &self,
        identity: &str,
        text: &str,
        checksum: &str,
    ) -> Result<FilterUnit, FilterCompilationError> {
        let mut definition = FilterDefinition::parse(text)?;
        if definition.name.is_none() {
            definition.name = Some(identity.to_string());
        }
        Ok(self.compile(&definition)?.with_checksum(checksum))
    }
}

type Constructor =
    Box<dyn Fn(&toml::Table) -> Result<Box<dyn Filter>, FilterCompilationError> + Send + Sync>;

struct Registration {
    phases: Vec<Phase>,
    construct: Constructor,
}

/// Factory over a fixed set of registered filter kinds.
#[derive(Default)]
pub struct StaticFilterFactory {
    kinds: HashMap<String, Registration>,
}

impl StaticFilterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with the built-in kinds registered.
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        builtin::register(&mut factory);
        factory
    }

    /// Register a kind usable in the given phases. Re-registering replaces it.
    pub fn register<F>(&mut self, kind: &str, phases: &[Phase], construct: F)
    where
        F: Fn(&toml::Table) -> Result<Box<dyn Filter>, FilterCompilationError>
            + Send
            + Sync
            + 'static,
    {
        self.kinds.insert(
            kind.to_string(),
            Registration {
                phases: phases.to_vec(),
                construct: Box::new(construct),
            },
        );
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }
}

impl FilterFactory for StaticFilterFactory {
    fn compile(&self, definition: &FilterDefinition) -> Result<FilterUnit, FilterCompilationError> {
        let registration = self
            .kinds
            .get(&definition.kind)
            .ok_or_else(|| FilterCompilationError::UnknownKind(definition.kind.clone()))?;

        if !registration.phases.contains(&definition.phase) {
            return Err(FilterCompilationError::PhaseNotSupported {
                kind: definition.kind.clone(),
                phase: definition.phase,
            });
        }

        if definition.always_run && definition.phase != Phase::Outbound {
            return Err(FilterCompilationError::AlwaysRunOutsideOutbound(definition.phase));
        }

        let filter = (registration.construct)(&definition.settings)?;
        let name = definition.name.as_deref().unwrap_or(&definition.kind);

        let mut unit = FilterUnit::from_boxed(name, definition.phase, filter)
            .with_priority(definition.priority);
        if definition.always_run {
            unit = unit.always_run();
        }
        if definition.critical {
            unit = unit.critical();
        }
        if let Some(condition) = &definition.when {
            unit = unit.with_condition(condition.clone());
        }
        Ok(unit)
    }
}
