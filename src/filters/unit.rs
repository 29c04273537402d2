//! The filter unit: one ordered step of request/response processing.
//!
//! # Design Decisions
//! - `FilterUnit` is immutable once compiled; a changed definition produces a
//!   brand-new unit and the old one lives until the last snapshot holding it is dropped
//! - The transform is a trait object returning a boxed future so filters may
//!   suspend (e.g. on an external lookup) without blocking the connection task
//! - `always_run` is an explicit flag, never inferred from the filter's kind

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::origin::OriginError;
use crate::filters::context::RequestContext;
use crate::filters::definition::Condition;

/// Stage of the request lifecycle a filter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Inbound,
    Routing,
    Outbound,
    Error,
}

impl Phase {
    /// All phases, in execution order.
    pub const ALL: [Phase; 4] = [Phase::Inbound, Phase::Routing, Phase::Outbound, Phase::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Inbound => "inbound",
            Phase::Routing => "routing",
            Phase::Outbound => "outbound",
            Phase::Error => "error",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Phase::Inbound => 0,
            Phase::Routing => 1,
            Phase::Outbound => 2,
            Phase::Error => 3,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a filter asks the engine to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Run the next filter.
    Continue,
    /// End the current phase early without error.
    ///
    /// From inbound or routing this skips straight to the outbound phase,
    /// which is how a filter that produced the response itself short-circuits
    /// the origin.
    Stop,
}

/// A filter failed while executing.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("{message}")]
    Failed { status: StatusCode, message: String },

    #[error("filter timed out after {0:?}")]
    Timeout(Duration),

    #[error("filter panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Origin(#[from] OriginError),
}

impl FilterError {
    /// A generic failure surfaced to the client as a 500.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn with_status(status: StatusCode, message: impl Into<String>) -> Self {
        FilterError::Failed {
            status,
            message: message.into(),
        }
    }

    /// Status of the error response synthesized for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            FilterError::Failed { status, .. } => *status,
            FilterError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            FilterError::Panicked(_) => StatusCode::INTERNAL_SERVER_ERROR,
            FilterError::Origin(err) => err.status(),
        }
    }
}

/// Result of one filter invocation.
pub type FilterResult = Result<FilterOutcome, FilterError>;

/// Behavior of a filter. Implemented by every filter kind the factory knows.
pub trait Filter: Send + Sync {
    /// Kind-specific applicability check, combined with the unit's condition.
    fn should_apply(&self, _ctx: &RequestContext) -> bool {
        true
    }

    /// Transform the context.
    fn apply<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, FilterResult>;
}

/// Adapter turning a synchronous closure into a [`Filter`].
pub struct FnFilter<F>(F);

impl<F> Filter for FnFilter<F>
where
    F: Fn(&mut RequestContext) -> FilterResult + Send + Sync,
{
    fn apply<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, FilterResult> {
        Box::pin(async move { (self.0)(ctx) })
    }
}

/// Build a filter from a synchronous closure.
pub fn from_fn<F>(f: F) -> FnFilter<F>
where
    F: Fn(&mut RequestContext) -> FilterResult + Send + Sync,
{
    FnFilter(f)
}

/// Compiled, immutable filter descriptor.
pub struct FilterUnit {
    name: Arc<str>,
    checksum: String,
    phase: Phase,
    priority: i32,
    always_run: bool,
    critical: bool,
    condition: Option<Condition>,
    filter: Box<dyn Filter>,
}

impl FilterUnit {
    pub fn new(name: impl Into<Arc<str>>, phase: Phase, filter: impl Filter + 'static) -> Self {
        Self::from_boxed(name, phase, Box::new(filter))
    }

    pub fn from_boxed(name: impl Into<Arc<str>>, phase: Phase, filter: Box<dyn Filter>) -> Self {
        Self {
            name: name.into(),
            checksum: String::new(),
            phase,
            priority: 0,
            always_run: false,
            critical: false,
            condition: None,
            filter,
        }
    }

    /// Lower priorities run first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Run this outbound filter even after a failure, for response hygiene.
    pub fn always_run(mut self) -> Self {
        self.always_run = true;
        self
    }

    /// A failure of this filter skips the always-run outbound pass.
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = checksum.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    /// Checksum of the definition this unit was compiled from.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_always_run(&self) -> bool {
        self.always_run
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }

    /// The unit's condition and the filter's own check must both pass.
    pub fn should_apply(&self, ctx: &RequestContext) -> bool {
        self.condition.as_ref().map_or(true, |c| c.matches(ctx)) && self.filter.should_apply(ctx)
    }

    pub fn apply<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, FilterResult> {
        self.filter.apply(ctx)
    }
}

impl fmt::Debug for FilterUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterUnit")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("priority", &self.priority)
            .field("always_run", &self.always_run)
            .field("critical", &self.critical)
            .field("checksum", &self.checksum)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;

    fn ctx(path: &str) -> RequestContext {
        RequestContext::new(Request::get(path).body(Body::empty()).unwrap())
    }

    #[test]
    fn phase_parses_lowercase() {
        let phase: Phase = serde_json::from_str("\"outbound\"").unwrap();
        assert_eq!(phase, Phase::Outbound);
        assert_eq!(Phase::Error.to_string(), "error");
    }

    #[test]
    fn condition_gates_should_apply() {
        let unit = FilterUnit::new("gated", Phase::Inbound, from_fn(|_| Ok(FilterOutcome::Continue)))
            .with_condition(Condition {
                path_prefix: Some("/api".into()),
                ..Condition::default()
            });

        assert!(unit.should_apply(&ctx("/api/users")));
        assert!(!unit.should_apply(&ctx("/static/app.js")));
    }

    #[tokio::test]
    async fn fn_filter_mutates_context() {
        let unit = FilterUnit::new(
            "tag",
            Phase::Inbound,
            from_fn(|ctx| {
                ctx.set_attribute("tagged", true);
                Ok(FilterOutcome::Continue)
            }),
        );
        let mut ctx = ctx("/");
        assert_eq!(unit.apply(&mut ctx).await.unwrap(), FilterOutcome::Continue);
        assert_eq!(ctx.attribute("tagged"), Some(&serde_json::Value::Bool(true)));
    }

    #[test]
    fn error_statuses() {
        assert_eq!(FilterError::failed("boom").status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            FilterError::Timeout(Duration::from_millis(5)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            FilterError::with_status(StatusCode::UNAUTHORIZED, "no").status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
