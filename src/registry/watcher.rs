//! Polls a filter source and publishes accepted changes.
//!
//! # Responsibilities
//! - Compile new and changed definitions (by checksum)
//! - Isolate compile failures to the failing definition
//! - Drop removed definitions and honor soft-disable
//! - Publish one new snapshot per poll that changed anything
//!
//! # Design Decisions
//! - Polls run in a single task and take `&mut self`, so they never overlap
//! - A failed definition keeps its previous unit; its failing checksum is
//!   remembered so the same broken text is not recompiled every poll
//! - Units keep the sequence number of their first appearance, so an update
//!   does not move a filter among equal priorities

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};

use crate::filters::factory::FilterFactory;
use crate::filters::unit::FilterUnit;
use crate::observability::metrics;
use crate::registry::source::{FilterSource, SourceEntry, SourceError};
use crate::registry::store::FilterRegistry;

struct TrackedFilter {
    checksum: String,
    unit: Arc<FilterUnit>,
    seq: u64,
    disabled: bool,
}

/// What one poll did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub disabled: Vec<String>,
    pub enabled: Vec<String>,
    /// Definitions that failed to compile, with the error.
    pub failed: Vec<(String, String)>,
    /// Definitions the source could not read.
    pub unreadable: Vec<String>,
    /// Version published by this poll, if any.
    pub published: Option<u64>,
}

impl PollReport {
    /// Whether the active set changed.
    pub fn changed(&self) -> bool {
        !(self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.disabled.is_empty()
            && self.enabled.is_empty())
    }
}

/// Keeps the registry in sync with a filter source.
pub struct FilterSourceWatcher {
    source: Arc<dyn FilterSource>,
    factory: Arc<dyn FilterFactory>,
    registry: Arc<FilterRegistry>,
    poll_interval: Duration,
    tracked: HashMap<String, TrackedFilter>,
    rejected: HashMap<String, String>,
    next_seq: u64,
}

impl FilterSourceWatcher {
    pub fn new(
        source: Arc<dyn FilterSource>,
        factory: Arc<dyn FilterFactory>,
        registry: Arc<FilterRegistry>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            factory,
            registry,
            poll_interval,
            tracked: HashMap::new(),
            rejected: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Checksum of the last accepted version of a definition.
    pub fn accepted_checksum(&self, identity: &str) -> Option<&str> {
        self.tracked.get(identity).map(|t| t.checksum.as_str())
    }

    /// Run one poll.
    ///
    /// A list-level source error changes nothing.
    pub async fn poll(&mut self) -> Result<PollReport, SourceError> {
        let source = Arc::clone(&self.source);
        let items = tokio::task::spawn_blocking(move || source.list())
            .await
            .map_err(|e| SourceError::Failed(e.to_string()))??;

        let mut report = PollReport::default();
        let mut seen = HashSet::new();

        for item in items {
            let entry = match item {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(filter = %err.identity, reason = %err.reason, "Filter definition unreadable, keeping last version");
                    seen.insert(err.identity.clone());
                    report.unreadable.push(err.identity);
                    continue;
                }
            };
            seen.insert(entry.identity.clone());

            let current = self
                .tracked
                .get(&entry.identity)
                .map(|t| (t.checksum == entry.checksum, t.disabled));

            match current {
                Some((true, was_disabled)) => {
                    if was_disabled != entry.disabled {
                        if let Some(tracked) = self.tracked.get_mut(&entry.identity) {
                            tracked.disabled = entry.disabled;
                        }
                        if entry.disabled {
                            report.disabled.push(entry.identity);
                        } else {
                            report.enabled.push(entry.identity);
                        }
                    }
                }
                _ => self.accept(entry, &mut report),
            }
        }

        let removed: Vec<String> = self
            .tracked
            .keys()
            .filter(|identity| !seen.contains(*identity))
            .cloned()
            .collect();
        for identity in removed {
            self.tracked.remove(&identity);
            report.removed.push(identity);
        }
        self.rejected.retain(|identity, _| seen.contains(identity));

        if report.changed() {
            report.published = Some(self.publish());
        }
        Ok(report)
    }

    fn accept(&mut self, entry: SourceEntry, report: &mut PollReport) {
        if self.rejected.get(&entry.identity) == Some(&entry.checksum) {
            return;
        }

        let unit = match self
            .factory
            .compile_text(&entry.identity, &entry.text, &entry.checksum)
        {
            Ok(unit) => Arc::new(unit),
            Err(error) => {
                tracing::error!(
                    filter = %entry.identity,
                    error = %error,
                    "Filter failed to compile, keeping previous version"
                );
                metrics::record_compile_failure(&entry.identity);
                report.failed.push((entry.identity.clone(), error.to_string()));
                self.rejected.insert(entry.identity, entry.checksum);
                return;
            }
        };
        self.rejected.remove(&entry.identity);

        match self.tracked.get_mut(&entry.identity) {
            Some(tracked) => {
                tracked.checksum = entry.checksum;
                tracked.unit = unit;
                if tracked.disabled != entry.disabled {
                    tracked.disabled = entry.disabled;
                    if entry.disabled {
                        report.disabled.push(entry.identity.clone());
                    }
                }
                report.updated.push(entry.identity);
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                report.added.push(entry.identity.clone());
                self.tracked.insert(
                    entry.identity,
                    TrackedFilter {
                        checksum: entry.checksum,
                        unit,
                        seq,
                        disabled: entry.disabled,
                    },
                );
            }
        }
    }

    fn publish(&self) -> u64 {
        let mut active: Vec<&TrackedFilter> =
            self.tracked.values().filter(|t| !t.disabled).collect();
        active.sort_by_key(|t| t.seq);
        self.registry
            .publish(active.into_iter().map(|t| Arc::clone(&t.unit)))
    }

    async fn poll_and_log(&mut self) {
        match self.poll().await {
            Ok(report) if report.changed() || !report.failed.is_empty() => {
                tracing::info!(
                    added = report.added.len(),
                    updated = report.updated.len(),
                    removed = report.removed.len(),
                    disabled = report.disabled.len(),
                    enabled = report.enabled.len(),
                    failed = report.failed.len(),
                    version = ?report.published,
                    "Filter source polled"
                );
            }
            Ok(_) => tracing::trace!("Filter source unchanged"),
            Err(e) => tracing::error!(
                source = %self.source.describe(),
                error = %e,
                "Filter source poll failed, keeping active filters"
            ),
        }
    }

    /// Poll on the configured interval until shutdown.
    ///
    /// `nudges` triggers an extra poll as soon as the source reports a change.
    pub async fn run(
        mut self,
        mut shutdown: broadcast::Receiver<()>,
        mut nudges: Option<mpsc::Receiver<()>>,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            source = %self.source.describe(),
            interval_secs = self.poll_interval.as_secs(),
            "Filter source watcher started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Some(()) = next_nudge(&mut nudges) => {
                    tracing::debug!("Filter source changed, polling early");
                }
                _ = shutdown.recv() => {
                    tracing::info!("Filter source watcher stopping");
                    break;
                }
            }
            self.poll_and_log().await;
        }
    }
}

async fn next_nudge(nudges: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match nudges {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::factory::StaticFilterFactory;
    use crate::filters::unit::Phase;
    use crate::registry::source::MemorySource;

    const HEADER_A: &str = "kind = \"set_request_header\"\nphase = \"inbound\"\npriority = 1\n[settings]\nname = \"x-a\"\nvalue = \"1\"";
    const HEADER_A2: &str = "kind = \"set_request_header\"\nphase = \"inbound\"\npriority = 1\n[settings]\nname = \"x-a\"\nvalue = \"2\"";
    const HEADER_B: &str = "kind = \"set_request_header\"\nphase = \"inbound\"\npriority = 2\n[settings]\nname = \"x-b\"\nvalue = \"1\"";
    const BROKEN: &str = "kind = \"set_request_header\"\nphase = \"inbound\"";

    fn watcher(source: Arc<MemorySource>) -> (FilterSourceWatcher, Arc<FilterRegistry>) {
        let registry = Arc::new(FilterRegistry::new());
        let watcher = FilterSourceWatcher::new(
            source,
            Arc::new(StaticFilterFactory::with_builtins()),
            Arc::clone(&registry),
            Duration::from_secs(5),
        );
        (watcher, registry)
    }

    #[tokio::test]
    async fn publishes_only_on_change() {
        let source = Arc::new(MemorySource::new());
        source.insert("a", HEADER_A);
        let (mut watcher, registry) = watcher(Arc::clone(&source));

        let report = watcher.poll().await.unwrap();
        assert_eq!(report.added, vec!["a"]);
        assert_eq!(report.published, Some(1));

        let report = watcher.poll().await.unwrap();
        assert!(!report.changed());
        assert_eq!(report.published, None);
        assert_eq!(registry.version(), 1);
    }

    #[tokio::test]
    async fn compile_failure_keeps_previous_version() {
        let source = Arc::new(MemorySource::new());
        source.insert("a", HEADER_A);
        source.insert("b", HEADER_B);
        let (mut watcher, registry) = watcher(Arc::clone(&source));
        watcher.poll().await.unwrap();
        let before = registry.snapshot();
        let checksum_b = watcher.accepted_checksum("b").unwrap().to_string();

        source.insert("a", BROKEN);
        let report = watcher.poll().await.unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "a");
        assert_eq!(report.published, None);
        assert_eq!(watcher.accepted_checksum("b"), Some(checksum_b.as_str()));
        let after = registry.snapshot();
        assert!(Arc::ptr_eq(&before, &after));

        // The same broken text is not reported again.
        let report = watcher.poll().await.unwrap();
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn update_and_removal() {
        let source = Arc::new(MemorySource::new());
        source.insert("a", HEADER_A);
        source.insert("b", HEADER_B);
        let (mut watcher, registry) = watcher(Arc::clone(&source));
        watcher.poll().await.unwrap();

        source.insert("a", HEADER_A2);
        source.remove("b");
        let report = watcher.poll().await.unwrap();

        assert_eq!(report.updated, vec!["a"]);
        assert_eq!(report.removed, vec!["b"]);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.names(Phase::Inbound), vec!["a"]);
        assert_eq!(
            snapshot.get("a").unwrap().checksum(),
            crate::registry::source::checksum(HEADER_A2.as_bytes())
        );
    }

    #[tokio::test]
    async fn disable_and_enable_without_recompiling() {
        let source = Arc::new(MemorySource::new());
        source.insert("a", HEADER_A);
        let (mut watcher, registry) = watcher(Arc::clone(&source));
        watcher.poll().await.unwrap();
        let compiled = Arc::clone(registry.snapshot().get("a").unwrap());

        source.set_disabled("a", true);
        let report = watcher.poll().await.unwrap();
        assert_eq!(report.disabled, vec!["a"]);
        assert!(registry.snapshot().is_empty());
        assert!(watcher.accepted_checksum("a").is_some());

        source.set_disabled("a", false);
        let report = watcher.poll().await.unwrap();
        assert_eq!(report.enabled, vec!["a"]);
        let restored = Arc::clone(registry.snapshot().get("a").unwrap());
        assert!(Arc::ptr_eq(&compiled, &restored));
    }

    #[tokio::test]
    async fn unavailable_source_changes_nothing() {
        let source = Arc::new(MemorySource::new());
        source.insert("a", HEADER_A);
        let (mut watcher, registry) = watcher(Arc::clone(&source));
        watcher.poll().await.unwrap();

        source.set_unavailable(true);
        assert!(watcher.poll().await.is_err());
        assert_eq!(registry.snapshot().names(Phase::Inbound), vec!["a"]);

        source.set_unavailable(false);
        source.break_item("a", "io error");
        let report = watcher.poll().await.unwrap();
        assert_eq!(report.unreadable, vec!["a"]);
        assert!(report.removed.is_empty());
        assert_eq!(registry.version(), 1);
    }
}
