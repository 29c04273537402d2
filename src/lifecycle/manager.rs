//! Connection lifecycle: idle timeout, expiry, request budget, graceful close.
//!
//! # Responsibilities
//! - Track last activity and in-flight requests for one connection
//! - Decide when the connection must drain (idle, expired, request budget, shutdown)
//! - Refuse new requests once draining, while in-flight ones finish
//!
//! # Design Decisions
//! - Independent of the negotiated protocol; the connection driver turns a
//!   drain decision into HTTP/1 `Connection: close` or an HTTP/2 GOAWAY
//! - Idle only counts while nothing is in flight; expiry counts regardless
//! - Expiry is jittered per connection so a fleet does not reconnect in lockstep
//! - Uses `tokio::time::Instant` so tests can run on a paused clock

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::{ListenerKind, TimeoutConfig};

const DEFAULT_IDLE: Duration = Duration::from_secs(65);
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(20 * 60);
const PUSH_MAX_AGE: Duration = Duration::from_secs(30 * 60);

/// Lifecycle limits installed on a listener's connections.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecyclePolicy {
    pub idle_timeout: Option<Duration>,
    pub max_age: Option<Duration>,
    /// Fraction of `max_age` randomly shaved off per connection, in `[0, 1)`.
    pub max_age_jitter: f64,
    pub max_requests: Option<u64>,
    /// How long a draining connection may take to finish in-flight work.
    pub drain_timeout: Duration,
}

impl LifecyclePolicy {
    /// Resolve configured timeouts against the defaults of a listener kind.
    ///
    /// Push listeners hold long-lived streams, so they have no idle limit and
    /// a longer expiry by default. A configured `0` disables a limit.
    pub fn for_listener(kind: ListenerKind, timeouts: &TimeoutConfig) -> Self {
        let (idle_default, age_default) = match kind {
            ListenerKind::Push => (None, Some(PUSH_MAX_AGE)),
            _ => (Some(DEFAULT_IDLE), Some(DEFAULT_MAX_AGE)),
        };
        let resolve = |configured: Option<u64>, default: Option<Duration>| match configured {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => default,
        };

        Self {
            idle_timeout: resolve(timeouts.idle_secs, idle_default),
            max_age: resolve(timeouts.max_age_secs, age_default),
            max_age_jitter: timeouts.max_age_jitter,
            max_requests: timeouts.max_requests.filter(|n| *n > 0),
            drain_timeout: Duration::from_secs(timeouts.drain_secs),
        }
    }

    /// Expiry for one new connection, jitter applied.
    pub fn connection_max_age(&self) -> Option<Duration> {
        self.max_age.map(|age| {
            if self.max_age_jitter > 0.0 {
                let cut = rand::thread_rng().gen_range(0.0..self.max_age_jitter);
                age.mul_f64(1.0 - cut)
            } else {
                age
            }
        })
    }
}

/// Why a connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Idle,
    Expired,
    MaxRequests,
    Shutdown,
    ProtocolError,
    PeerClosed,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Idle => "idle",
            CloseReason::Expired => "expired",
            CloseReason::MaxRequests => "max_requests",
            CloseReason::Shutdown => "shutdown",
            CloseReason::ProtocolError => "protocol_error",
            CloseReason::PeerClosed => "peer_closed",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of evaluating the limits at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    /// Keep serving; evaluate again at `next_check` (never, if `None`).
    Continue { next_check: Option<Instant> },
    /// Stop accepting requests and close once in-flight work is done.
    Drain(CloseReason),
}

/// Lifecycle state of one connection, shared by its driver and its requests.
#[derive(Debug)]
pub struct ConnectionLifecycle {
    created: Instant,
    idle_timeout: Option<Duration>,
    max_age: Option<Duration>,
    max_requests: Option<u64>,
    drain_timeout: Duration,
    /// Milliseconds after `created` of the last request start or finish.
    last_activity_ms: AtomicU64,
    in_flight: AtomicUsize,
    served: AtomicU64,
    drain: OnceLock<CloseReason>,
    wake: Notify,
}

impl ConnectionLifecycle {
    pub fn new(policy: &LifecyclePolicy) -> Self {
        Self {
            created: Instant::now(),
            idle_timeout: policy.idle_timeout,
            max_age: policy.connection_max_age(),
            max_requests: policy.max_requests,
            drain_timeout: policy.drain_timeout,
            last_activity_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            served: AtomicU64::new(0),
            drain: OnceLock::new(),
            wake: Notify::new(),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Expiry actually applied to this connection.
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn requests_served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.drain.get().is_some()
    }

    pub fn drain_reason(&self) -> Option<CloseReason> {
        self.drain.get().copied()
    }

    /// Begin a graceful close. Returns false if one was already under way.
    pub fn start_drain(&self, reason: CloseReason) -> bool {
        let started = self.drain.set(reason).is_ok();
        if started {
            self.wake.notify_one();
        }
        started
    }

    /// Admit a request. `None` once the connection is draining.
    ///
    /// The request that uses up the request budget is still served; it
    /// starts the drain.
    pub fn begin_request(self: &Arc<Self>) -> Option<RequestGuard> {
        if self.is_draining() {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch();

        let served = self.served.fetch_add(1, Ordering::SeqCst) + 1;
        if self.max_requests.is_some_and(|max| served >= max) {
            self.start_drain(CloseReason::MaxRequests);
        }
        Some(RequestGuard {
            lifecycle: Arc::clone(self),
        })
    }

    fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(elapsed, Ordering::SeqCst);
    }

    /// Apply the limits at `now`.
    pub fn evaluate(&self, now: Instant) -> LifecycleAction {
        if let Some(reason) = self.drain_reason() {
            return LifecycleAction::Drain(reason);
        }

        let expires_at = self.max_age.map(|age| self.created + age);
        if expires_at.is_some_and(|at| now >= at) {
            return LifecycleAction::Drain(CloseReason::Expired);
        }

        let idle_check = self.idle_timeout.map(|idle| {
            if self.in_flight() == 0 {
                let last = self.created
                    + Duration::from_millis(self.last_activity_ms.load(Ordering::SeqCst));
                last + idle
            } else {
                // Busy: look again one idle period from now.
                now + idle
            }
        });
        if self.in_flight() == 0 && idle_check.is_some_and(|at| now >= at) {
            return LifecycleAction::Drain(CloseReason::Idle);
        }

        let next_check = match (expires_at, idle_check) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        LifecycleAction::Continue { next_check }
    }

    /// Resolve once the connection should drain, returning why.
    pub async fn wait_for_close(&self) -> CloseReason {
        loop {
            match self.evaluate(Instant::now()) {
                LifecycleAction::Drain(reason) => {
                    self.start_drain(reason);
                    return self.drain_reason().unwrap_or(reason);
                }
                LifecycleAction::Continue { next_check } => {
                    let deadline = async {
                        match next_check {
                            Some(at) => tokio::time::sleep_until(at).await,
                            None => std::future::pending::<()>().await,
                        }
                    };
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = deadline => {}
                    }
                }
            }
        }
    }
}

/// Marks a request in flight; finishing the request counts as activity.
#[derive(Debug)]
pub struct RequestGuard {
    lifecycle: Arc<ConnectionLifecycle>,
}

impl RequestGuard {
    /// Whether the connection began draining, so the response should say so.
    pub fn closing(&self) -> bool {
        self.lifecycle.is_draining()
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.lifecycle.touch();
        self.lifecycle.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.lifecycle.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(idle: Option<u64>, max_age: Option<u64>) -> LifecyclePolicy {
        LifecyclePolicy {
            idle_timeout: idle.map(Duration::from_secs),
            max_age: max_age.map(Duration::from_secs),
            max_age_jitter: 0.0,
            max_requests: None,
            drain_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn listener_kind_defaults() {
        let http = LifecyclePolicy::for_listener(ListenerKind::Http, &TimeoutConfig::default());
        assert_eq!(http.idle_timeout, Some(DEFAULT_IDLE));
        assert_eq!(http.max_age, Some(DEFAULT_MAX_AGE));

        let push = LifecyclePolicy::for_listener(ListenerKind::Push, &TimeoutConfig::default());
        assert_eq!(push.idle_timeout, None);
        assert_eq!(push.max_age, Some(PUSH_MAX_AGE));

        let disabled = LifecyclePolicy::for_listener(
            ListenerKind::Http,
            &TimeoutConfig {
                idle_secs: Some(0),
                max_age_secs: Some(0),
                max_requests: Some(0),
                ..TimeoutConfig::default()
            },
        );
        assert_eq!(disabled.idle_timeout, None);
        assert_eq!(disabled.max_age, None);
        assert_eq!(disabled.max_requests, None);
    }

    #[test]
    fn jitter_only_shortens() {
        let policy = LifecyclePolicy {
            max_age_jitter: 0.5,
            ..policy(None, Some(100))
        };
        for _ in 0..50 {
            let age = policy.connection_max_age().unwrap();
            assert!(age <= Duration::from_secs(100));
            assert!(age > Duration::from_secs(50));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_drains() {
        let lifecycle = ConnectionLifecycle::new(&policy(Some(10), None));
        let start = Instant::now();

        let reason = lifecycle.wait_for_close().await;

        assert_eq!(reason, CloseReason::Idle);
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(lifecycle.is_draining());
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_request_holds_off_idle() {
        let lifecycle = Arc::new(ConnectionLifecycle::new(&policy(Some(10), None)));
        let guard = lifecycle.begin_request().unwrap();

        let waited = tokio::time::timeout(Duration::from_secs(60), lifecycle.wait_for_close()).await;
        assert!(waited.is_err(), "busy connection must not idle out");
        assert!(!lifecycle.is_draining());

        drop(guard);
        let start = Instant::now();
        assert_eq!(lifecycle.wait_for_close().await, CloseReason::Idle);
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_applies_even_when_busy() {
        let lifecycle = Arc::new(ConnectionLifecycle::new(&policy(Some(10), Some(60))));
        let _guard = lifecycle.begin_request().unwrap();

        let reason = lifecycle.wait_for_close().await;

        assert_eq!(reason, CloseReason::Expired);
        assert!(lifecycle.begin_request().is_none());
        assert_eq!(lifecycle.in_flight(), 1);
    }

    #[tokio::test]
    async fn request_budget_starts_drain() {
        let lifecycle = Arc::new(ConnectionLifecycle::new(&LifecyclePolicy {
            max_requests: Some(2),
            ..policy(None, None)
        }));

        let first = lifecycle.begin_request().unwrap();
        assert!(!first.closing());
        let second = lifecycle.begin_request().unwrap();
        assert!(second.closing());
        assert!(lifecycle.begin_request().is_none());
        assert_eq!(lifecycle.drain_reason(), Some(CloseReason::MaxRequests));
        assert_eq!(lifecycle.requests_served(), 2);
    }

    #[tokio::test]
    async fn shutdown_drain_wakes_waiter() {
        let lifecycle = Arc::new(ConnectionLifecycle::new(&policy(None, None)));
        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.wait_for_close().await })
        };
        tokio::task::yield_now().await;

        assert!(lifecycle.start_drain(CloseReason::Shutdown));
        assert!(!lifecycle.start_drain(CloseReason::Idle));
        assert_eq!(waiter.await.unwrap(), CloseReason::Shutdown);
    }
}
