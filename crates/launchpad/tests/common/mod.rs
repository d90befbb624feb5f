#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};

use launchpad::Runner;
use launchpad_core::RunnerConfig;
use launchpad_driver::InMemoryMesh;
use launchpad_state::ScaleStore;

pub const OPERATOR_SECRET: &str = "operator-secret";
pub const REPORTER_SECRET: &str = "reporter-secret";

pub struct TestRunner {
    pub runner: Runner,
    pub mesh: InMemoryMesh,
    pub client: Client<HttpConnector, Full<Bytes>>,
    _dir: tempfile::TempDir,
}

pub fn config(interval_secs: u64) -> RunnerConfig {
    let mut config = RunnerConfig {
        port: 0,
        proxy_port: 0,
        ..Default::default()
    };
    config.auth.secret = OPERATOR_SECRET.to_string();
    config.auth.proxy_secret = REPORTER_SECRET.to_string();
    config.autoscale.interval_secs = interval_secs;
    config.autoscale.channel_capacity = 256;
    config
}

pub async fn start(mut config: RunnerConfig) -> TestRunner {
    let dir = tempfile::tempdir().unwrap();
    config.data_dir = dir.path().to_path_buf();
    let store = ScaleStore::open(&config.store_path()).unwrap();

    let mesh = InMemoryMesh::new();
    mesh.set_auto_ready(Some(Duration::from_millis(50)));
    let runner = Runner::start(&config, store, Arc::new(mesh.clone()))
        .await
        .unwrap();

    TestRunner {
        runner,
        mesh,
        client: Client::builder(TokioExecutor::new()).build_http(),
        _dir: dir,
    }
}

pub fn token(secret: &str) -> String {
    encode(
        &Header::new(Algorithm::HS256),
        &json!({ "id": "admin", "role": "admin" }),
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

impl TestRunner {
    /// POST to the front door, returning status and JSON body.
    pub async fn post(&self, path: &str, secret: &str, body: Value) -> (u16, Value) {
        let request = http::Request::builder()
            .method("POST")
            .uri(format!("http://{}{path}", local(self.runner.api_addr())))
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", token(secret)))
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap();
        let response = self.client.request(request).await.unwrap();
        let status = response.status().as_u16();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    /// Send a request through the cold-start proxy as a redirected route
    /// would, targeting `upstream_port` on localhost.
    pub async fn proxy_get(&self, path: &str, upstream_port: u16) -> (u16, Bytes) {
        let request = http::Request::builder()
            .method("GET")
            .uri(format!("http://{}{path}", local(self.runner.proxy_addr())))
            .header("x-og-project", "shop")
            .header("x-og-service", "api")
            .header("x-og-env", "production")
            .header("x-og-host", "127.0.0.1")
            .header("x-og-port", upstream_port.to_string())
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = self.client.request(request).await.unwrap();
        let status = response.status().as_u16();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, bytes)
    }
}

fn local(addr: SocketAddr) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], addr.port()))
}

pub fn service(replicas: u32, min: u32, max: u32, concurrency: u32) -> Value {
    json!({
        "id": "api",
        "projectId": "shop",
        "environment": "production",
        "scale": {
            "replicas": replicas,
            "minReplicas": min,
            "maxReplicas": max,
            "concurrency": concurrency
        },
        "tasks": [{
            "id": "main",
            "ports": [{ "name": "http", "protocol": "http", "port": 8080 }],
            "docker": { "image": "shop/api:1.0" }
        }]
    })
}

/// Local HTTP backend standing in for the service's pods. Returns its port
/// and a hit counter.
pub async fn backend() -> (u16, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let app = axum::Router::new().fallback(move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            "order list"
        }
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (port, hits)
}

/// Poll `check` every 20 ms until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
