//! Usage notification: per-filter and per-connection events.
//!
//! # Design Decisions
//! - Notifiers are called inline on the request path and must never block;
//!   `ChannelNotifier` hands events to a bounded queue and drops on overflow
//! - Delivery is best effort

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::filters::unit::Phase;
use crate::lifecycle::manager::CloseReason;
use crate::net::connection::{AppProtocol, ConnectionId};
use crate::observability::metrics;

/// How a filter took part in a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterStatus {
    Applied,
    Skipped,
    Failed,
}

impl FilterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterStatus::Applied => "applied",
            FilterStatus::Skipped => "skipped",
            FilterStatus::Failed => "failed",
        }
    }
}

/// One filter invocation (or skip) within one request.
#[derive(Debug, Clone)]
pub struct FilterUsage {
    pub filter: Arc<str>,
    pub phase: Phase,
    pub status: FilterStatus,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Open,
    Close(CloseReason),
}

/// A connection opened or closed.
#[derive(Debug, Clone)]
pub struct ConnectionUsage {
    pub connection: ConnectionId,
    pub listener: Arc<str>,
    pub protocol: Option<AppProtocol>,
    pub event: ConnectionEvent,
}

/// Receives usage events. Implementations must return promptly.
pub trait UsageNotifier: Send + Sync {
    fn filter_used(&self, usage: FilterUsage);

    fn connection_event(&self, usage: ConnectionUsage);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl UsageNotifier for NoopNotifier {
    fn filter_used(&self, _usage: FilterUsage) {}

    fn connection_event(&self, _usage: ConnectionUsage) {}
}

/// Records events through the `metrics` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsNotifier;

impl UsageNotifier for MetricsNotifier {
    fn filter_used(&self, usage: FilterUsage) {
        metrics::record_filter_usage(&usage);
    }

    fn connection_event(&self, usage: ConnectionUsage) {
        metrics::record_connection_event(&usage);
    }
}

/// Any usage event.
#[derive(Debug, Clone)]
pub enum UsageEvent {
    Filter(FilterUsage),
    Connection(ConnectionUsage),
}

/// Buffers events in a bounded channel for a background consumer.
#[derive(Debug)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<UsageEvent>,
    dropped: AtomicU64,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<UsageEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events lost because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drain the queue into another notifier until every sender is gone.
    pub fn forward(
        mut rx: mpsc::Receiver<UsageEvent>,
        sink: Arc<dyn UsageNotifier>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    UsageEvent::Filter(usage) => sink.filter_used(usage),
                    UsageEvent::Connection(usage) => sink.connection_event(usage),
                }
            }
        })
    }

    fn send(&self, event: UsageEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl UsageNotifier for ChannelNotifier {
    fn filter_used(&self, usage: FilterUsage) {
        self.send(UsageEvent::Filter(usage));
    }

    fn connection_event(&self, usage: ConnectionUsage) {
        self.send(UsageEvent::Connection(usage));
    }
}

/// In-memory tallies keyed by filter and status.
#[derive(Debug, Default)]
pub struct UsageCounters {
    filters: DashMap<(Arc<str>, FilterStatus), u64>,
    opened: AtomicU64,
    closed: AtomicU64,
}

impl UsageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, filter: &str, status: FilterStatus) -> u64 {
        self.filters
            .get(&(Arc::from(filter), status))
            .map(|v| *v)
            .unwrap_or(0)
    }

    pub fn connections_opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn connections_closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }
}

impl UsageNotifier for UsageCounters {
    fn filter_used(&self, usage: FilterUsage) {
        *self.filters.entry((usage.filter, usage.status)).or_insert(0) += 1;
    }

    fn connection_event(&self, usage: ConnectionUsage) {
        match usage.event {
            ConnectionEvent::Open => self.opened.fetch_add(1, Ordering::Relaxed),
            ConnectionEvent::Close(_) => self.closed.fetch_add(1, Ordering::Relaxed),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(status: FilterStatus) -> FilterUsage {
        FilterUsage {
            filter: Arc::from("auth"),
            phase: Phase::Inbound,
            status,
            duration: Duration::from_micros(10),
        }
    }

    #[test]
    fn channel_notifier_drops_when_full() {
        let (notifier, mut rx) = ChannelNotifier::new(1);
        notifier.filter_used(usage(FilterStatus::Applied));
        notifier.filter_used(usage(FilterStatus::Applied));

        assert_eq!(notifier.dropped(), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forwarder_delivers_to_sink() {
        let counters = Arc::new(UsageCounters::new());
        let (notifier, rx) = ChannelNotifier::new(16);
        let handle = ChannelNotifier::forward(rx, counters.clone());

        notifier.filter_used(usage(FilterStatus::Failed));
        notifier.filter_used(usage(FilterStatus::Skipped));
        drop(notifier);
        handle.await.unwrap();

        assert_eq!(counters.count("auth", FilterStatus::Failed), 1);
        assert_eq!(counters.count("auth", FilterStatus::Skipped), 1);
        assert_eq!(counters.count("auth", FilterStatus::Applied), 0);
    }
}
