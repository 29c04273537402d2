//! Shared utilities for gateway integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use edge_gateway::config::{ListenerConfig, OriginConfig};
use edge_gateway::engine::{EngineConfig, FilterChainEngine, HttpOrigin, UsageCounters};
use edge_gateway::lifecycle::Shutdown;
use edge_gateway::net::connection::ConnectionTracker;
use edge_gateway::net::tls::PemFileProvider;
use edge_gateway::pipeline::ProtocolPipelineBuilder;
use edge_gateway::registry::FilterRegistry;
use edge_gateway::server::{ConnectionServices, ListenerSet};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Headers the echo backend reports back in its body.
const ECHOED: [&str; 3] = ["x-a", "x-b", "x-forwarded-for"];

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

/// Start a backend that answers every request with its path and a few
/// request headers, e.g. `GET /a x-a=1`.
pub async fn start_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut buf = Vec::with_capacity(1024);
                        let mut chunk = [0u8; 1024];
                        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                            match socket.read(&mut chunk).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                            }
                        }

                        let head = String::from_utf8_lossy(&buf).to_string();
                        let mut lines = head.split("\r\n");
                        let request_line = lines.next().unwrap_or_default();
                        let mut parts = request_line.split(' ');
                        let method = parts.next().unwrap_or_default();
                        let path = parts.next().unwrap_or_default();

                        let mut body = format!("{method} {path}");
                        for line in lines {
                            if let Some((name, value)) = line.split_once(':') {
                                let name = name.trim().to_ascii_lowercase();
                                if ECHOED.contains(&name.as_str()) {
                                    body.push_str(&format!(" {name}={}", value.trim()));
                                }
                            }
                        }

                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Backend: echo\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// A listener on an ephemeral loopback port.
pub fn listener(kind: edge_gateway::config::ListenerKind) -> ListenerConfig {
    ListenerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        kind,
        ..ListenerConfig::default()
    }
}

/// A gateway running in-process.
pub struct TestGateway {
    pub listeners: ListenerSetInfo,
    pub registry: Arc<FilterRegistry>,
    pub usage: Arc<UsageCounters>,
    pub shutdown: Shutdown,
    pub tracker: ConnectionTracker,
    serving: JoinHandle<()>,
}

/// Addresses of started listeners and names of failed ones.
pub struct ListenerSetInfo {
    pub addresses: BTreeMap<String, SocketAddr>,
    pub failed: Vec<String>,
}

impl TestGateway {
    pub fn addr(&self, listener: &str) -> SocketAddr {
        self.listeners.addresses[listener]
    }

    pub fn url(&self, listener: &str, path: &str) -> String {
        format!("http://{}{}", self.addr(listener), path)
    }

    /// Trigger shutdown and wait for listeners and connections to finish.
    pub async fn stop(self) -> u64 {
        self.shutdown.trigger();
        let _ = self.serving.await;
        self.tracker.wait_for_shutdown(Duration::from_secs(5)).await
    }
}

pub async fn start_gateway(
    listeners: BTreeMap<String, ListenerConfig>,
    registry: Arc<FilterRegistry>,
    origin: SocketAddr,
) -> TestGateway {
    let usage = Arc::new(UsageCounters::new());
    let origin = HttpOrigin::new(&OriginConfig {
        address: origin.to_string(),
        connect_timeout_secs: 1,
        request_timeout_secs: 5,
    })
    .unwrap();
    let engine = Arc::new(FilterChainEngine::new(
        Arc::clone(&registry),
        Arc::new(origin),
        usage.clone(),
        EngineConfig::default(),
    ));

    let builder = ProtocolPipelineBuilder::new(Arc::new(PemFileProvider));
    let set = ListenerSet::bind(&listeners, &builder).await;
    let info = ListenerSetInfo {
        addresses: set
            .names()
            .into_iter()
            .filter_map(|name| set.local_addr(name).map(|addr| (name.to_string(), addr)))
            .collect(),
        failed: set.failures().iter().map(|(name, _)| name.clone()).collect(),
    };

    let shutdown = Shutdown::new();
    let tracker = ConnectionTracker::new();
    let services = ConnectionServices {
        engine,
        notifier: usage.clone(),
    };
    let serving = tokio::spawn(set.serve(services, shutdown.clone(), tracker.clone()));

    TestGateway {
        listeners: info,
        registry,
        usage,
        shutdown,
        tracker,
        serving,
    }
}
