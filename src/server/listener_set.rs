//! The set of named listeners served by one gateway process.
//!
//! # Responsibilities
//! - Build and bind every configured listener, isolating failures
//! - Accept connections and spawn one driver task per connection
//! - Stop accepting on shutdown
//!
//! # Design Decisions
//! - A listener that fails to build or bind is reported and skipped; the
//!   remaining listeners start normally
//! - Connection slots (the listener semaphore) are held by the driver task

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::config::ListenerConfig;
use crate::lifecycle::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{Listener, ListenerError};
use crate::pipeline::builder::{ListenerBuildError, ProtocolPipelineBuilder};
use crate::pipeline::stage::Pipeline;
use crate::server::connection::{self, ConnectionServices};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

struct BoundListener {
    pipeline: Arc<Pipeline>,
    listener: Listener,
}

/// Listeners that started, plus the ones that did not.
pub struct ListenerSet {
    bound: Vec<BoundListener>,
    failures: Vec<(String, ListenerBuildError)>,
}

impl ListenerSet {
    /// Build and bind every listener. Never fails as a whole.
    pub async fn bind(
        configs: &BTreeMap<String, ListenerConfig>,
        builder: &ProtocolPipelineBuilder,
    ) -> Self {
        let mut bound = Vec::with_capacity(configs.len());
        let mut failures = Vec::new();

        for (name, config) in configs {
            let result = match builder.build(name, config) {
                Ok(pipeline) => Listener::bind(&config.bind_address, config.max_connections)
                    .await
                    .map(|listener| (pipeline, listener))
                    .map_err(ListenerBuildError::from),
                Err(e) => Err(e),
            };

            match result {
                Ok((pipeline, listener)) => {
                    tracing::info!(
                        listener = %name,
                        kind = config.kind.as_str(),
                        address = ?listener.local_addr().ok(),
                        stages = ?pipeline.stage_names(),
                        "Listener ready"
                    );
                    bound.push(BoundListener {
                        pipeline: Arc::new(pipeline),
                        listener,
                    });
                }
                Err(e) => {
                    tracing::error!(listener = %name, error = %e, "Listener failed to start; skipping");
                    failures.push((name.clone(), e));
                }
            }
        }

        Self { bound, failures }
    }

    pub fn names(&self) -> Vec<&str> {
        self.bound.iter().map(|b| b.pipeline.name()).collect()
    }

    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.bound
            .iter()
            .find(|b| b.pipeline.name() == name)
            .and_then(|b| b.listener.local_addr().ok())
    }

    pub fn pipeline(&self, name: &str) -> Option<&Pipeline> {
        self.bound
            .iter()
            .find(|b| b.pipeline.name() == name)
            .map(|b| b.pipeline.as_ref())
    }

    pub fn failures(&self) -> &[(String, ListenerBuildError)] {
        &self.failures
    }

    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }

    /// Accept on every listener until `shutdown` fires.
    ///
    /// Returns once all accept loops stopped. Connections keep draining in
    /// their own tasks; use `tracker` to wait for them.
    pub async fn serve(self, services: ConnectionServices, shutdown: Shutdown, tracker: ConnectionTracker) {
        let mut loops = JoinSet::new();
        for bound in self.bound {
            loops.spawn(accept_loop(bound, services.clone(), shutdown.clone(), tracker.clone()));
        }
        while loops.join_next().await.is_some() {}
        tracing::info!("All listeners stopped accepting");
    }
}

async fn accept_loop(
    bound: BoundListener,
    services: ConnectionServices,
    shutdown: Shutdown,
    tracker: ConnectionTracker,
) {
    let mut stop = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = stop.recv() => break,
            accepted = bound.listener.accept() => match accepted {
                Ok((stream, peer, permit)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(peer_addr = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let pipeline = Arc::clone(&bound.pipeline);
                    let services = services.clone();
                    let connection_shutdown = shutdown.subscribe();
                    let guard = tracker.track();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let id = guard.id();
                        connection::drive(pipeline, id, stream, peer, services, connection_shutdown).await;
                        drop(guard);
                    });
                }
                Err(ListenerError::Closed) => break,
                Err(e) => {
                    tracing::warn!(listener = %bound.pipeline.name(), error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
    tracing::info!(listener = %bound.pipeline.name(), "Listener stopped accepting");
}
