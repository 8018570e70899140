//! HTTP handlers for the Burrow service host.
//!
//! Exposes the service's health checks and a publish endpoint.

use crate::config::Config;
use crate::metrics;
use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use burrow_core::{BrokerError, PublishOptions, Service};
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Request headers with this prefix are forwarded as message headers.
pub const FORWARDED_HEADER_PREFIX: &str = "x-burrow-";

/// Shared server state.
pub struct AppState {
    /// The hosted service.
    pub service: Arc<Service>,
    /// Liveness probe timeout.
    pub probe_timeout: Duration,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(service: Arc<Service>, probe_timeout: Duration) -> Self {
        Self {
            service,
            probe_timeout,
        }
    }
}

/// Broker failures as HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The payload or headers cannot be encoded.
    #[error("{0}")]
    BadRequest(BrokerError),

    /// The broker is unreachable or failing.
    #[error("{0}")]
    Unavailable(BrokerError),
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Unavailable(_) => "unavailable",
        }
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Protocol(_) | BrokerError::Config(_) => ApiError::BadRequest(err),
            other => ApiError::Unavailable(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, self.to_string()).into_response()
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/ready", get(ready_handler))
        .route("/health/live", get(live_handler))
        .route("/events/:event", post(publish_handler))
        .with_state(state)
}

/// Run the HTTP server until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn run_server(
    config: &Config,
    service: Arc<Service>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let state = Arc::new(AppState::new(service, config.probe_timeout()));
    let app = router(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Burrow server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": state.service.name(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Readiness: the broker connection is up.
async fn ready_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.readiness() {
        Ok(()) => (StatusCode::OK, "ready").into_response(),
        Err(e) => {
            debug!(error = %e, "Readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

/// Liveness: a probe message makes the round trip in time.
async fn live_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.liveness_within(state.probe_timeout).await {
        Ok(rtt) => {
            metrics::record_probe(Some(rtt));
            (StatusCode::OK, "live").into_response()
        }
        Err(e) => {
            metrics::record_probe(None);
            warn!(error = %e, "Liveness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

/// Publish the raw request body as `event` on the service's exchange.
async fn publish_handler(
    State(state): State<Arc<AppState>>,
    Path(event): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let size = body.len();
    let options = forwarded_headers(&headers);

    match state.service.publish(&event, body, options).await {
        Ok(()) => {
            metrics::record_publish(size);
            debug!(event = %event, bytes = size, "Published");
            Ok(StatusCode::ACCEPTED)
        }
        Err(e) => {
            let err = ApiError::from(e);
            metrics::record_publish_error(err.kind());
            warn!(event = %event, error = %err, "Publish failed");
            Err(err)
        }
    }
}

/// Collect `x-burrow-*` request headers as message headers.
fn forwarded_headers(headers: &HeaderMap) -> Option<PublishOptions> {
    let mut options = PublishOptions::default();
    let mut any = false;

    for (name, value) in headers {
        let Some(key) = name.as_str().strip_prefix(FORWARDED_HEADER_PREFIX) else {
            continue;
        };
        match value.to_str() {
            Ok(value) if !key.is_empty() => {
                options = options.header(key, value);
                any = true;
            }
            _ => debug!(header = %name, "Skipping unusable forwarded header"),
        }
    }

    any.then_some(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use burrow_core::{BrokerConfig, Delivery};
    use burrow_transport::MemoryBroker;
    use tokio::sync::mpsc;

    async fn state(memory: &MemoryBroker) -> Arc<AppState> {
        let config = BrokerConfig::from_dsn("memory://local");
        let service = Service::start("orders", &config, Arc::new(memory.connector()))
            .await
            .unwrap();
        Arc::new(AppState::new(Arc::new(service), Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn test_health_reports_service() {
        let memory = MemoryBroker::new();
        let state = state(&memory).await;

        let response = health_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ready_and_live() {
        let memory = MemoryBroker::new();
        let state = state(&memory).await;

        assert_eq!(ready_handler(State(state.clone())).await.status(), StatusCode::OK);
        assert_eq!(live_handler(State(state.clone())).await.status(), StatusCode::OK);

        memory.drop_connections();
        assert_eq!(
            ready_handler(State(state.clone())).await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            live_handler(State(state)).await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_publish_accepted() {
        let memory = MemoryBroker::new();
        let state = state(&memory).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        state
            .service
            .subscribe(
                "orders",
                "created",
                move |delivery: Delivery| {
                    let _ = tx.send((
                        delivery.payload().clone(),
                        delivery.header("tenant").map(str::to_string),
                    ));
                    async {}
                },
                None,
            )
            .await
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-burrow-tenant", HeaderValue::from_static("acme"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let status = publish_handler(
            State(state),
            Path("created".to_string()),
            headers,
            Bytes::from_static(b"{\"id\":1}"),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        let (payload, tenant) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, Bytes::from_static(b"{\"id\":1}"));
        assert_eq!(tenant.as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn test_publish_error_statuses() {
        let memory = MemoryBroker::new();
        let state = state(&memory).await;

        let bad = publish_handler(
            State(state.clone()),
            Path("created".to_string()),
            HeaderMap::new(),
            Bytes::from_static(&[0xff, 0xfe]),
        )
        .await
        .unwrap_err();
        assert_eq!(bad.into_response().status(), StatusCode::BAD_REQUEST);

        memory.drop_connections();
        let down = publish_handler(
            State(state),
            Path("created".to_string()),
            HeaderMap::new(),
            Bytes::from_static(b"x"),
        )
        .await
        .unwrap_err();
        assert!(matches!(down, ApiError::Unavailable(BrokerError::NotConnected)));
        assert_eq!(down.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_forwarded_headers() {
        let mut headers = HeaderMap::new();
        assert!(forwarded_headers(&headers).is_none());

        headers.insert("x-burrow-trace", HeaderValue::from_static("abc"));
        headers.insert("accept", HeaderValue::from_static("*/*"));
        let options = forwarded_headers(&headers).unwrap();
        assert_eq!(options.headers.len(), 1);
        assert!(options.headers.contains_key("trace"));
    }
}
