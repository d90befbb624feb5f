//! launchpad-api: HTTP front door of the runner.
//!
//! # API Routes
//!
//! | Method | Path | Token | Description |
//! |---|---|---|---|
//! | POST | `/v1/launchpad/project` | operator | Create a project namespace |
//! | POST | `/v1/launchpad/service` | operator | Create or update a service |
//! | POST | `/v1/launchpad/metrics` | reporter | Report active request counts |

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::routing::post;
use axum::Router;

use launchpad_autoscale::AccessRecorder;
use launchpad_driver::Driver;

pub use auth::{AuthError, Claims, TokenVerifier};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct AppState {
    pub driver: Arc<dyn Driver>,
    pub recorder: AccessRecorder,
    pub verifier: Arc<TokenVerifier>,
}

pub fn build_router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/project", post(handlers::apply_project))
        .route("/service", post(handlers::apply_service))
        .route("/metrics", post(handlers::report_metrics))
        .with_state(state);

    Router::new().nest("/v1/launchpad", routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use launchpad_core::{AuthConfig, DriverConfig, ServiceKey};
    use launchpad_driver::memory::Verb;
    use launchpad_driver::{InMemoryMesh, IstioDriver};
    use launchpad_state::ScaleStore;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const OPERATOR_SECRET: &str = "operator-secret";
    const REPORTER_SECRET: &str = "reporter-secret";

    struct Harness {
        mesh: InMemoryMesh,
        router: Router,
        receiver: launchpad_autoscale::AccessReceiver,
    }

    fn harness() -> Harness {
        let mesh = InMemoryMesh::new();
        let driver = Arc::new(IstioDriver::new(
            DriverConfig::default(),
            Arc::new(mesh.clone()),
        ));
        let (recorder, receiver) = AccessRecorder::channel(10);
        let verifier = Arc::new(TokenVerifier::new(&AuthConfig {
            secret: OPERATOR_SECRET.to_string(),
            proxy_secret: REPORTER_SECRET.to_string(),
        }));
        let router = build_router(AppState {
            driver,
            recorder,
            verifier,
        });
        Harness {
            mesh,
            router,
            receiver,
        }
    }

    fn token(secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &Claims {
                id: "admin".to_string(),
                role: "admin".to_string(),
                exp: None,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn post(path: &str, secret: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", token(secret)))
            .body(body.into())
            .unwrap()
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn service_body() -> String {
        json!({
            "id": "api",
            "projectId": "shop",
            "environment": "production",
            "scale": { "replicas": 1, "minReplicas": 0, "maxReplicas": 5, "concurrency": 10 },
            "tasks": [{
                "id": "main",
                "ports": [{ "name": "http", "protocol": "http", "port": 8080 }],
                "resources": { "cpu": 250, "memory": 512 },
                "docker": { "image": "shop/api:1.0" }
            }]
        })
        .to_string()
    }

    #[tokio::test]
    async fn project_creates_namespace() {
        let h = harness();
        let (status, body) = send(
            &h.router,
            post("/v1/launchpad/project", OPERATOR_SECRET, r#"{"id":"shop"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({}));
        assert!(h.mesh.namespace("shop").is_some());
    }

    #[tokio::test]
    async fn service_is_applied() {
        let h = harness();
        let (status, _) = send(
            &h.router,
            post("/v1/launchpad/service", OPERATOR_SECRET, service_body()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(h.mesh.deployment("shop", "api-v1").is_some());
        assert!(h.mesh.virtual_service("shop", "api").is_some());
    }

    #[tokio::test]
    async fn wrong_token_is_unauthorized() {
        let h = harness();
        let (status, body) = send(
            &h.router,
            post("/v1/launchpad/service", REPORTER_SECRET, service_body()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].as_str().unwrap().starts_with("invalid token"));

        let request = Request::builder()
            .method("POST")
            .uri("/v1/launchpad/project")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"id":"shop"}"#))
            .unwrap();
        let (status, body) = send(&h.router, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "missing bearer token");
        assert!(h.mesh.namespace("shop").is_none());
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let h = harness();
        let (status, body) = send(
            &h.router,
            post("/v1/launchpad/service", OPERATOR_SECRET, r#"{"id": 7}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn unusable_scale_policy_is_bad_request() {
        let h = harness();
        let mut service: Value = serde_json::from_str(&service_body()).unwrap();
        service["scale"] = json!({ "replicas": 1, "minReplicas": 0, "concurrency": 10 });

        let (status, body) = send(
            &h.router,
            post("/v1/launchpad/service", OPERATOR_SECRET, service.to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("maxReplicas"));
        assert!(h.mesh.ops().is_empty());
    }

    #[tokio::test]
    async fn driver_failure_is_internal_error() {
        let h = harness();
        h.mesh.fail_on(Verb::Create, "Deployment");
        let (status, body) = send(
            &h.router,
            post("/v1/launchpad/service", OPERATOR_SECRET, service_body()),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn metrics_are_recorded() {
        let h = harness();
        let events = json!([
            { "project": "shop", "service": "api", "nodeId": "node-a", "activeRequests": 12 },
            { "project": "shop", "service": "api", "nodeId": "node-b", "activeRequests": 30 }
        ]);
        let (status, _) = send(
            &h.router,
            post("/v1/launchpad/metrics", REPORTER_SECRET, events.to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            &h.router,
            post("/v1/launchpad/metrics", OPERATOR_SECRET, events.to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let store = ScaleStore::open_in_memory().unwrap();
        let (_tx, rx) = tokio::sync::watch::channel(false);
        launchpad_autoscale::spawn_workers(h.receiver, store.clone(), 2, rx);

        let key = ServiceKey::new("shop", "api", "v1");
        let mut recorded = 0;
        for _ in 0..100 {
            recorded = store
                .get_active_requests(&key)
                .unwrap()
                .map(|r| r.active_requests)
                .unwrap_or(0);
            if recorded == 42 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorded, 42);
    }
}
