//! Cold-start forwarding.
//!
//! Requests for a scaled-to-zero service arrive here with routing headers
//! naming the original destination. The handler records the access, wakes
//! the service once per burst, then replays the buffered request against the
//! service until it stops answering 404/503 or the attempts run out.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use bytes::Bytes;
use http::header::{CONNECTION, HOST};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::json;
use tracing::{debug, info, warn};

use launchpad_autoscale::AccessRecorder;
use launchpad_core::{AccessEvent, ProxyConfig};
use launchpad_driver::Driver;

use crate::debounce::Debouncer;
use crate::headers::{self, RoutingHeaders};

type HttpClient = Client<HttpConnector, Full<Bytes>>;

pub struct ProxyState {
    driver: Arc<dyn Driver>,
    recorder: AccessRecorder,
    debouncer: Debouncer<Result<(), String>>,
    client: HttpClient,
    config: ProxyConfig,
}

impl ProxyState {
    pub fn new(driver: Arc<dyn Driver>, recorder: AccessRecorder, config: ProxyConfig) -> Self {
        Self {
            driver,
            recorder,
            debouncer: Debouncer::new(),
            client: Client::builder(TokioExecutor::new()).build_http(),
            config,
        }
    }
}

/// Router that forwards every request.
pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new().fallback(forward).with_state(state)
}

async fn forward(State(state): State<Arc<ProxyState>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();

    let routing = match RoutingHeaders::from_headers(&parts.headers) {
        Ok(routing) => routing,
        Err(e) => {
            debug!(error = %e, uri = %parts.uri, "rejecting request without routing headers");
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    };
    let key = routing.key();

    let uri = match upstream_uri(&routing, &parts.uri) {
        Ok(uri) => uri,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let mut headers = parts.headers;
    headers::strip(&mut headers);
    headers.remove(CONNECTION);
    match HeaderValue::from_str(&routing.host) {
        Ok(host) => {
            headers.insert(HOST, host);
        }
        Err(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("invalid upstream host {:?}", routing.host),
            );
        }
    }

    state.recorder.record(AccessEvent::proxied(&key));

    let driver = state.driver.clone();
    let wake_key = key.clone();
    let woken = state
        .debouncer
        .wait(&routing.debounce_key(), || async move {
            driver
                .wait_for_service(&wake_key)
                .await
                .map_err(|e| e.to_string())
        })
        .await;
    if let Err(e) = woken {
        warn!(project = %key.project_id, service = %key.service_id, error = %e, "service did not start");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, e);
    }

    let body = match axum::body::to_bytes(body, state.config.max_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("could not read request body: {e}"),
            );
        }
    };

    let upstream = Upstream {
        method: parts.method,
        uri,
        headers,
        body,
    };
    match send_with_retry(&state, &upstream).await {
        Ok(response) => response,
        Err(e) => {
            warn!(project = %key.project_id, service = %key.service_id, uri = %upstream.uri, error = %e, "forwarding failed");
            error_response(StatusCode::BAD_GATEWAY, e)
        }
    }
}

/// A buffered request that can be sent more than once.
struct Upstream {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
}

impl Upstream {
    fn to_request(&self) -> Result<http::Request<Full<Bytes>>, http::Error> {
        let mut request = http::Request::builder()
            .method(self.method.clone())
            .uri(self.uri.clone())
            .body(Full::new(self.body.clone()))?;
        *request.headers_mut() = self.headers.clone();
        Ok(request)
    }
}

async fn send_with_retry(state: &ProxyState, upstream: &Upstream) -> Result<Response, String> {
    let attempts = state.config.max_attempts.max(1);
    let timeout = Duration::from_secs(state.config.request_timeout_secs);
    let backoff = Duration::from_millis(state.config.retry_backoff_ms);

    let mut attempt = 1;
    loop {
        let request = upstream.to_request().map_err(|e| e.to_string())?;
        let response: hyper::Response<Incoming> =
            match tokio::time::timeout(timeout, state.client.request(request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return Err(format!("upstream request failed: {e}")),
                Err(_) => return Err(format!("upstream request timed out after {timeout:?}")),
            };

        let status = response.status();
        let retryable = status == StatusCode::NOT_FOUND || status == StatusCode::SERVICE_UNAVAILABLE;
        if !retryable || attempt >= attempts {
            if retryable {
                info!(uri = %upstream.uri, %status, attempts = attempt, "giving up on cold service");
            }
            return Ok(response.map(Body::new));
        }

        debug!(uri = %upstream.uri, %status, attempt, "service not ready yet, retrying");
        drop(response);
        tokio::time::sleep(backoff).await;
        attempt += 1;
    }
}

fn upstream_uri(routing: &RoutingHeaders, original: &Uri) -> Result<Uri, http::Error> {
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Uri::builder()
        .scheme("http")
        .authority(routing.authority())
        .path_and_query(path_and_query)
        .build()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}
