//! End-to-end tests: real listeners, real sockets, an echo origin.

use std::collections::BTreeMap;
use std::fs;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, Version};
use edge_gateway::config::{AllowProxyHeaders, ClientAuth, ListenerConfig, ListenerKind, TlsConfig};
use edge_gateway::filters::StaticFilterFactory;
use edge_gateway::registry::{DirectorySource, FilterRegistry, FilterSourceWatcher};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

mod common;

use common::{fixture, listener, start_echo_backend, start_gateway};

const SET_REQUEST_HEADER: &str = r#"
kind = "set_request_header"
phase = "inbound"

[settings]
name = "x-a"
value = "1"
"#;

const TAG_RESPONSE: &str = r#"
kind = "set_response_header"
phase = "outbound"

[settings]
name = "x-tag"
value = "edge"
"#;

const HEALTH: &str = r#"
kind = "static_response"
phase = "inbound"
priority = -100

[when]
path_prefix = "/healthz"

[settings]
body = "ok"
"#;

fn single(name: &str, config: ListenerConfig) -> BTreeMap<String, ListenerConfig> {
    BTreeMap::from([(name.to_string(), config)])
}

fn tls(alpn: Option<&[&str]>) -> TlsConfig {
    TlsConfig {
        cert_path: fixture("server.crt"),
        key_path: fixture("server.key"),
        trust_store_path: None,
        client_auth: ClientAuth::None,
        protocols: vec!["TLSv1.3".to_string(), "TLSv1.2".to_string()],
        alpn: alpn.map(|offered| offered.iter().map(|p| p.to_string()).collect()),
    }
}

#[tokio::test]
async fn filters_loaded_from_directory_shape_proxied_requests() {
    let origin = start_echo_backend().await;

    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("request.toml"), SET_REQUEST_HEADER).unwrap();
    fs::write(dir.path().join("tag.toml"), TAG_RESPONSE).unwrap();
    fs::write(dir.path().join("health.toml"), HEALTH).unwrap();
    fs::write(dir.path().join("README.md"), "not a filter").unwrap();

    let registry = Arc::new(FilterRegistry::new());
    let mut watcher = FilterSourceWatcher::new(
        Arc::new(DirectorySource::new(dir.path())),
        Arc::new(StaticFilterFactory::with_builtins()),
        registry.clone(),
        Duration::from_secs(60),
    );
    let report = watcher.poll().await.unwrap();
    assert_eq!(report.added.len(), 3);
    assert!(report.failed.is_empty());

    let gateway = start_gateway(single("web", listener(ListenerKind::Http)), registry, origin).await;
    let client = reqwest::Client::new();

    let response = client.get(gateway.url("web", "/api/items")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-tag"], "edge");
    assert_eq!(response.headers()["x-backend"], "echo");
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(response.text().await.unwrap(), "GET /api/items x-a=1");

    // Answered by a filter, the origin is never asked.
    let response = client.get(gateway.url("web", "/healthz")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key("x-backend"));
    assert_eq!(response.headers()["x-tag"], "edge");
    assert_eq!(response.text().await.unwrap(), "ok");

    // Soft-disable one filter; the next poll drops it from the chain.
    fs::write(dir.path().join("tag.disabled"), "").unwrap();
    let report = watcher.poll().await.unwrap();
    assert_eq!(report.disabled, vec!["tag"]);

    let response = client.get(gateway.url("web", "/api/items")).send().await.unwrap();
    assert!(!response.headers().contains_key("x-tag"));

    gateway.stop().await;
}

#[tokio::test]
async fn proxy_headers_only_survive_from_trusted_peers() {
    let origin = start_echo_backend().await;

    let mut listeners = BTreeMap::new();
    listeners.insert("strict".to_string(), listener(ListenerKind::Http));
    listeners.insert(
        "behind-lb".to_string(),
        ListenerConfig {
            allow_proxy_headers: AllowProxyHeaders::Allowlist,
            trusted_peers: vec!["127.0.0.1".parse().unwrap()],
            ..listener(ListenerKind::Http)
        },
    );
    let gateway = start_gateway(listeners, Arc::new(FilterRegistry::new()), origin).await;
    let client = reqwest::Client::new();

    let body = client
        .get(gateway.url("strict", "/"))
        .header("x-forwarded-for", "203.0.113.7")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "GET /");

    let body = client
        .get(gateway.url("behind-lb", "/"))
        .header("x-forwarded-for", "203.0.113.7")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "GET / x-forwarded-for=203.0.113.7");

    gateway.stop().await;
}

#[tokio::test]
async fn broken_listener_does_not_block_the_others() {
    let origin = start_echo_backend().await;

    let mut listeners = BTreeMap::new();
    listeners.insert("web".to_string(), listener(ListenerKind::Http));
    listeners.insert(
        "secure".to_string(),
        ListenerConfig {
            tls: Some(TlsConfig {
                cert_path: fixture("missing.crt"),
                ..tls(None)
            }),
            ..listener(ListenerKind::Http2)
        },
    );
    listeners.insert(
        "push".to_string(),
        ListenerConfig {
            bind_address: "not-an-address".to_string(),
            ..listener(ListenerKind::Push)
        },
    );

    let gateway = start_gateway(listeners, Arc::new(FilterRegistry::new()), origin).await;
    assert_eq!(gateway.listeners.failed, vec!["push", "secure"]);
    assert_eq!(gateway.listeners.addresses.len(), 1);

    let response = reqwest::get(gateway.url("web", "/still-up")).await.unwrap();
    assert_eq!(response.text().await.unwrap(), "GET /still-up");

    gateway.stop().await;
}

#[tokio::test]
async fn request_budget_closes_the_connection() {
    let origin = start_echo_backend().await;
    let config = ListenerConfig {
        timeouts: edge_gateway::config::TimeoutConfig {
            max_requests: Some(1),
            ..Default::default()
        },
        ..listener(ListenerKind::Http)
    };
    let gateway = start_gateway(single("web", config), Arc::new(FilterRegistry::new()), origin).await;
    let client = reqwest::Client::new();

    for _ in 0..3 {
        let response = client.get(gateway.url("web", "/")).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["connection"], "close");
        response.text().await.unwrap();
    }

    let usage = gateway.usage.clone();
    assert_eq!(gateway.stop().await, 0);
    assert_eq!(usage.connections_opened(), 3);
    assert_eq!(usage.connections_closed(), 3);
}

#[tokio::test]
async fn shutdown_closes_idle_keep_alive_connections() {
    let origin = start_echo_backend().await;
    let gateway = start_gateway(
        single("web", listener(ListenerKind::Http)),
        Arc::new(FilterRegistry::new()),
        origin,
    )
    .await;

    let client = reqwest::Client::new();
    let response = client.get(gateway.url("web", "/")).send().await.unwrap();
    response.text().await.unwrap();
    assert_eq!(gateway.tracker.active_count(), 1);

    let usage = gateway.usage.clone();
    let remaining = tokio::time::timeout(Duration::from_secs(10), gateway.stop())
        .await
        .unwrap();
    assert_eq!(remaining, 0);
    assert_eq!(usage.connections_opened(), usage.connections_closed());
}

async fn tls_client(addr: std::net::SocketAddr, alpn: &[&[u8]]) -> tokio_rustls::client::TlsStream<TcpStream> {
    let mut roots = rustls::RootCertStore::empty();
    let mut reader = BufReader::new(fs::File::open(fixture("ca.crt")).unwrap());
    for cert in rustls_pemfile::certs(&mut reader) {
        roots.add(cert.unwrap()).unwrap();
    }

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    let stream = TcpStream::connect(addr).await.unwrap();
    TlsConnector::from(Arc::new(config))
        .connect(ServerName::try_from("localhost").unwrap(), stream)
        .await
        .unwrap()
}

#[tokio::test]
async fn alpn_selects_http2_on_a_tls_listener() {
    let origin = start_echo_backend().await;
    let config = ListenerConfig {
        tls: Some(tls(None)),
        ..listener(ListenerKind::Http2)
    };
    let gateway = start_gateway(single("h2", config), Arc::new(FilterRegistry::new()), origin).await;

    let stream = tls_client(gateway.addr("h2"), &[b"h2"]).await;
    assert_eq!(stream.get_ref().1.alpn_protocol(), Some(&b"h2"[..]));

    let (mut sender, conn) = hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    for path in ["/one", "/two"] {
        let request = Request::get(format!("https://localhost{path}"))
            .body(Body::empty())
            .unwrap();
        let response = sender.send_request(request).await.unwrap();
        assert_eq!(response.version(), Version::HTTP_2);
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(Body::new(response.into_body()), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], format!("GET {path}").as_bytes());
    }

    drop(sender);
    gateway.stop().await;
}

#[tokio::test]
async fn alpn_falls_back_to_http1() {
    let origin = start_echo_backend().await;
    let config = ListenerConfig {
        tls: Some(tls(None)),
        ..listener(ListenerKind::Http2)
    };
    let gateway = start_gateway(single("h2", config), Arc::new(FilterRegistry::new()), origin).await;

    let stream = tls_client(gateway.addr("h2"), &[b"http/1.1"]).await;
    assert_eq!(stream.get_ref().1.alpn_protocol(), Some(&b"http/1.1"[..]));

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let request = Request::get("/legacy")
        .header("host", "localhost")
        .body(Body::empty())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    assert_eq!(response.version(), Version::HTTP_11);
    let body = axum::body::to_bytes(Body::new(response.into_body()), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"GET /legacy");

    drop(sender);
    gateway.stop().await;
}
