//! The filter chain engine.
//!
//! # Responsibilities
//! - Run inbound, routing, origin and outbound steps for one request
//! - Isolate each filter: errors, panics and timeouts become a recorded failure
//! - On failure run the error phase, then the always-run outbound filters
//! - Report timing and status of every filter to the usage notifier
//!
//! # Design Decisions
//! - The snapshot is loaded once per request; a hot swap mid-flight never
//!   changes what an in-flight request runs
//! - Filters of one request run sequentially; a suspended filter resumes in
//!   place because the chain is a single `async` call stack
//! - Dropping the returned future (connection closed) cancels the chain;
//!   effects already applied are not rolled back

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Response, StatusCode};
use futures_util::FutureExt;
use tokio::time::Instant;

use crate::config::EngineSettings;
use crate::engine::notifier::{FilterStatus, FilterUsage, UsageNotifier};
use crate::engine::origin::Origin;
use crate::filters::context::{FilterFailure, RequestContext};
use crate::filters::unit::{FilterError, FilterOutcome, FilterUnit, Phase};
use crate::registry::{FilterRegistry, FilterSnapshot};

/// Engine settings.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Upper bound on one filter invocation.
    pub filter_timeout: Option<Duration>,
}

impl From<&EngineSettings> for EngineConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            filter_timeout: settings.filter_timeout_ms.map(Duration::from_millis),
        }
    }
}

enum Invocation {
    Skipped,
    Completed(FilterOutcome),
    Failed(FilterError),
}

enum PhaseFlow {
    Completed,
    /// Stopped by the filter at this index.
    Stopped(usize),
    /// Failed at this index; the failure is recorded on the context.
    Failed(usize),
}

/// Runs requests through the active filter snapshot.
pub struct FilterChainEngine {
    registry: Arc<FilterRegistry>,
    origin: Arc<dyn Origin>,
    notifier: Arc<dyn UsageNotifier>,
    config: EngineConfig,
}

impl FilterChainEngine {
    pub fn new(
        registry: Arc<FilterRegistry>,
        origin: Arc<dyn Origin>,
        notifier: Arc<dyn UsageNotifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            origin,
            notifier,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<FilterRegistry> {
        &self.registry
    }

    /// Run the request against the current snapshot.
    ///
    /// The returned context always carries a response.
    pub async fn execute(&self, ctx: RequestContext) -> RequestContext {
        let snapshot = self.registry.snapshot();
        self.execute_with(&snapshot, ctx).await
    }

    /// Run the request against a specific snapshot.
    pub async fn execute_with(
        &self,
        snapshot: &FilterSnapshot,
        mut ctx: RequestContext,
    ) -> RequestContext {
        let resume_outbound_at = if self.request_phases(snapshot, &mut ctx).await {
            let flow = self.run_phase(snapshot, Phase::Outbound, &mut ctx).await;
            ctx.mark("outbound");
            match flow {
                PhaseFlow::Completed => None,
                PhaseFlow::Stopped(index) => {
                    self.run_always(snapshot, index + 1, &mut ctx).await;
                    None
                }
                PhaseFlow::Failed(index) => Some(index + 1),
            }
        } else {
            Some(0)
        };

        if let Some(resume_at) = resume_outbound_at {
            self.recover(snapshot, resume_at, &mut ctx).await;
            ctx.mark("error");
        }

        tracing::debug!(
            request_id = %ctx.id(),
            snapshot = snapshot.version(),
            failed = ctx.has_failed(),
            elapsed_us = ctx.elapsed().as_micros() as u64,
            "Filter chain finished"
        );
        ctx
    }

    /// Inbound, routing, then the origin. Returns false on failure.
    async fn request_phases(&self, snapshot: &FilterSnapshot, ctx: &mut RequestContext) -> bool {
        for phase in [Phase::Inbound, Phase::Routing] {
            let flow = self.run_phase(snapshot, phase, ctx).await;
            ctx.mark(phase.as_str());
            match flow {
                PhaseFlow::Completed => {}
                PhaseFlow::Failed(_) => return false,
                PhaseFlow::Stopped(index) => {
                    if ctx.has_response() {
                        return true;
                    }
                    let unit = &snapshot.phase(phase)[index];
                    ctx.record_failure(FilterFailure::from_unit(
                        unit,
                        FilterError::failed("filter stopped the chain without a response"),
                    ));
                    return false;
                }
            }
        }

        if ctx.has_response() {
            return true;
        }

        match self.origin.forward(ctx).await {
            Ok(response) => {
                ctx.set_response(response);
                ctx.mark("origin");
                true
            }
            Err(error) => {
                tracing::warn!(request_id = %ctx.id(), error = %error, "Origin request failed");
                ctx.record_failure(FilterFailure::origin(error.into()));
                false
            }
        }
    }

    async fn run_phase(
        &self,
        snapshot: &FilterSnapshot,
        phase: Phase,
        ctx: &mut RequestContext,
    ) -> PhaseFlow {
        for (index, unit) in snapshot.phase(phase).iter().enumerate() {
            match self.invoke(unit, ctx).await {
                Invocation::Skipped | Invocation::Completed(FilterOutcome::Continue) => {}
                Invocation::Completed(FilterOutcome::Stop) => {
                    tracing::debug!(request_id = %ctx.id(), filter = %unit.name(), phase = %phase, "Filter stopped phase");
                    return PhaseFlow::Stopped(index);
                }
                Invocation::Failed(error) => {
                    ctx.record_failure(FilterFailure::from_unit(unit, error));
                    return PhaseFlow::Failed(index);
                }
            }
        }
        PhaseFlow::Completed
    }

    /// Error phase, a fallback response, then response hygiene.
    ///
    /// Whatever response existed before the failure is discarded; the client
    /// sees the one shaped by the error phase.
    async fn recover(&self, snapshot: &FilterSnapshot, resume_at: usize, ctx: &mut RequestContext) {
        if ctx.take_response().is_some() {
            tracing::debug!(request_id = %ctx.id(), "Discarding response produced before the failure");
        }
        self.run_tolerant(snapshot.phase(Phase::Error).iter(), ctx).await;

        if !ctx.has_response() {
            let response = default_error_response(ctx);
            ctx.set_response(response);
        }

        if ctx.failure().is_some_and(|f| f.critical) {
            tracing::debug!(request_id = %ctx.id(), "Critical filter failed, skipping always-run filters");
            return;
        }
        self.run_always(snapshot, resume_at, ctx).await;
    }

    async fn run_always(&self, snapshot: &FilterSnapshot, from: usize, ctx: &mut RequestContext) {
        let outbound = snapshot.phase(Phase::Outbound);
        let pending = outbound
            .get(from..)
            .unwrap_or_default()
            .iter()
            .filter(|unit| unit.is_always_run());
        self.run_tolerant(pending, ctx).await;
    }

    /// Run units after a failure: further failures are logged, not recorded.
    async fn run_tolerant<'u>(
        &self,
        units: impl Iterator<Item = &'u Arc<FilterUnit>>,
        ctx: &mut RequestContext,
    ) {
        for unit in units {
            match self.invoke(unit, ctx).await {
                Invocation::Completed(FilterOutcome::Stop) => break,
                Invocation::Failed(error) => tracing::warn!(
                    request_id = %ctx.id(),
                    filter = %unit.name(),
                    error = %error,
                    "Filter failed while handling an earlier failure"
                ),
                Invocation::Skipped | Invocation::Completed(FilterOutcome::Continue) => {}
            }
        }
    }

    async fn invoke(&self, unit: &FilterUnit, ctx: &mut RequestContext) -> Invocation {
        if !unit.should_apply(ctx) {
            self.report(unit, FilterStatus::Skipped, Duration::ZERO);
            return Invocation::Skipped;
        }

        let started = Instant::now();
        // The call itself must happen inside the guard; `apply` may panic before
        // returning a future.
        let guarded = AssertUnwindSafe(async { unit.apply(ctx).await }).catch_unwind();
        let result = match self.config.filter_timeout {
            Some(limit) => tokio::time::timeout(limit, guarded)
                .await
                .unwrap_or(Ok(Err(FilterError::Timeout(limit)))),
            None => guarded.await,
        };
        let result = result.unwrap_or_else(|panic| Err(FilterError::Panicked(panic_message(&*panic))));
        let elapsed = started.elapsed();

        match result {
            Ok(outcome) => {
                self.report(unit, FilterStatus::Applied, elapsed);
                Invocation::Completed(outcome)
            }
            Err(error) => {
                tracing::warn!(
                    request_id = %ctx.id(),
                    filter = %unit.name(),
                    phase = %unit.phase(),
                    error = %error,
                    "Filter failed"
                );
                self.report(unit, FilterStatus::Failed, elapsed);
                Invocation::Failed(error)
            }
        }
    }

    fn report(&self, unit: &FilterUnit, status: FilterStatus, duration: Duration) {
        self.notifier.filter_used(FilterUsage {
            filter: unit.shared_name(),
            phase: unit.phase(),
            status,
            duration,
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Response used when no error-phase filter produced one.
fn default_error_response(ctx: &RequestContext) -> Response<Body> {
    let status = ctx
        .failure()
        .map(|f| f.error.status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({
        "status": status.as_u16(),
        "error": status.canonical_reason().unwrap_or("Error"),
        "request_id": ctx.id(),
    });

    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::notifier::UsageCounters;
    use crate::engine::origin::OriginError;
    use crate::filters::unit::{from_fn, Filter, FilterResult};
    use axum::http::Request;
    use futures_util::future::BoxFuture;

    struct OkOrigin;

    impl Origin for OkOrigin {
        fn forward<'a>(
            &'a self,
            _ctx: &'a mut RequestContext,
        ) -> BoxFuture<'a, Result<Response<Body>, OriginError>> {
            Box::pin(async { Ok(Response::new(Body::from("origin"))) })
        }
    }

    struct Sleepy(Duration);

    impl Filter for Sleepy {
        fn apply<'a>(&'a self, _ctx: &'a mut RequestContext) -> BoxFuture<'a, FilterResult> {
            Box::pin(async move {
                tokio::time::sleep(self.0).await;
                Ok(FilterOutcome::Continue)
            })
        }
    }

    fn engine(units: Vec<FilterUnit>, config: EngineConfig) -> (FilterChainEngine, Arc<UsageCounters>) {
        let counters = Arc::new(UsageCounters::new());
        let registry = Arc::new(FilterRegistry::with_units(units.into_iter().map(Arc::new)));
        let engine = FilterChainEngine::new(registry, Arc::new(OkOrigin), counters.clone(), config);
        (engine, counters)
    }

    fn request() -> RequestContext {
        RequestContext::new(Request::get("/").body(Body::empty()).unwrap())
    }

    #[tokio::test]
    async fn panicking_filter_becomes_failure() {
        let (engine, counters) = engine(
            vec![FilterUnit::new("boom", Phase::Inbound, from_fn(|_| panic!("kaboom")))],
            EngineConfig::default(),
        );

        let ctx = engine.execute(request()).await;

        let failure = ctx.failure().unwrap();
        assert_eq!(&*failure.filter, "boom");
        assert!(matches!(&failure.error, FilterError::Panicked(m) if m == "kaboom"));
        assert_eq!(ctx.response().unwrap().status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(counters.count("boom", FilterStatus::Failed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_filter_times_out() {
        let (engine, _) = engine(
            vec![FilterUnit::new("slow", Phase::Inbound, Sleepy(Duration::from_secs(10)))],
            EngineConfig {
                filter_timeout: Some(Duration::from_millis(50)),
            },
        );

        let ctx = engine.execute(request()).await;

        assert!(matches!(ctx.failure().unwrap().error, FilterError::Timeout(_)));
        assert_eq!(ctx.response().unwrap().status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn stop_without_response_is_failure() {
        let (engine, _) = engine(
            vec![FilterUnit::new("halt", Phase::Inbound, from_fn(|_| Ok(FilterOutcome::Stop)))],
            EngineConfig::default(),
        );

        let ctx = engine.execute(request()).await;

        assert_eq!(&*ctx.failure().unwrap().filter, "halt");
        assert_eq!(ctx.response().unwrap().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn critical_failure_skips_always_run() {
        let (engine, counters) = engine(
            vec![
                FilterUnit::new("guard", Phase::Inbound, from_fn(|_| Err(FilterError::failed("denied"))))
                    .critical(),
                FilterUnit::new("hygiene", Phase::Outbound, from_fn(|_| Ok(FilterOutcome::Continue)))
                    .always_run(),
            ],
            EngineConfig::default(),
        );

        let ctx = engine.execute(request()).await;

        assert!(ctx.has_failed());
        assert_eq!(counters.count("hygiene", FilterStatus::Applied), 0);
    }

    #[tokio::test]
    async fn records_phase_marks() {
        let (engine, _) = engine(Vec::new(), EngineConfig::default());
        let ctx = engine.execute(request()).await;
        let labels: Vec<&str> = ctx.marks().iter().map(|(label, _)| *label).collect();
        assert_eq!(labels, vec!["inbound", "routing", "origin", "outbound"]);
    }

    #[tokio::test]
    async fn failed_request_has_no_outbound_mark() {
        let (engine, _) = engine(
            vec![FilterUnit::new("deny", Phase::Inbound, from_fn(|_| Err(FilterError::failed("denied"))))],
            EngineConfig::default(),
        );
        let ctx = engine.execute(request()).await;
        let labels: Vec<&str> = ctx.marks().iter().map(|(label, _)| *label).collect();
        assert_eq!(labels, vec!["inbound", "error"]);
    }
}
