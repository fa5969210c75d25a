use crate::error::{ReceiverError, RetryDriverError};
use crate::receiver::{IncomingDelivery, IngestOutcome, WebhookReceiver};
use crate::retry_driver::RetryDriver;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const DELIVERY_HEADER: &str = "x-github-delivery";
pub const EVENT_HEADER: &str = "x-github-event";
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

#[derive(Clone)]
pub struct ServerState {
    pub receiver: Arc<WebhookReceiver>,
    pub driver: Arc<RetryDriver>,
    /// Required bearer token for `POST /retry`; `None` disables the route.
    pub retry_auth_token: Option<String>,
}

impl IntoResponse for ReceiverError {
    fn into_response(self) -> Response {
        let status = match &self {
            ReceiverError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ReceiverError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ReceiverError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: ServerState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", post(handle_webhook))
        .route("/webhook", post(handle_webhook))
        .route("/health", get(handle_health))
        .route("/retry", post(handle_retry))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves. In-flight requests are allowed to finish.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "webhook receiver listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn handle_webhook(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ReceiverError> {
    let delivery_id = header_str(&headers, DELIVERY_HEADER);
    let delivery = IncomingDelivery {
        delivery_id,
        event: header_str(&headers, EVENT_HEADER),
        signature: header_str(&headers, SIGNATURE_HEADER),
        body: &body,
    };

    let outcome = state.receiver.ingest(delivery).await?;
    let delivery_id = delivery_id.unwrap_or_default();
    let response = match outcome {
        IngestOutcome::Accepted { sequence } => (
            StatusCode::CREATED,
            Json(json!({ "status": "accepted", "delivery_id": delivery_id, "sequence": sequence })),
        ),
        IngestOutcome::Duplicate => (
            StatusCode::OK,
            Json(json!({ "status": "duplicate", "delivery_id": delivery_id })),
        ),
        IngestOutcome::Ignored => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "ignored", "delivery_id": delivery_id })),
        ),
    };
    Ok(response.into_response())
}

async fn handle_health(State(state): State<ServerState>) -> Response {
    match state.receiver.store().count_events().await {
        Ok(events) => Json(json!({ "status": "healthy", "events": events })).into_response(),
        Err(e) => {
            error!(error = %e, "health check could not reach the store");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unhealthy", "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Bearer check for the retry trigger. Without a configured token the route
/// answers 503.
fn authorize_retry(headers: &HeaderMap, expected: Option<&str>) -> Result<(), Response> {
    let Some(expected) = expected else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "retry endpoint is disabled (RETRY_AUTH_TOKEN not configured)" })),
        )
            .into_response());
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid token" })),
        )
            .into_response()),
        None => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing Authorization header. Expected: Bearer <token>" })),
        )
            .into_response()),
    }
}

async fn handle_retry(State(state): State<ServerState>, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize_retry(&headers, state.retry_auth_token.as_deref()) {
        warn!("rejected unauthenticated retry trigger");
        return rejection;
    }

    match state.driver.run_pass().await {
        Ok(summary) => {
            let status = if summary.timed_out {
                StatusCode::GATEWAY_TIMEOUT
            } else {
                StatusCode::OK
            };
            (status, Json(summary)).into_response()
        }
        Err(RetryDriverError::AlreadyRunning) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "a retry pass is already running" })),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "retry pass aborted");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
