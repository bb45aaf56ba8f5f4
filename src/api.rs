use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tracing::{warn, Instrument};
use uuid::Uuid;

use crate::directory::DirectoryStore;
use crate::metrics;

/// Middleware to add request ID to all requests
async fn add_request_id(mut request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4();
    request.extensions_mut().insert(request_id);

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %request.method(),
        uri = %request.uri()
    );

    async move { next.run(request).await }
        .instrument(span)
        .await
}

pub type AppState = Arc<dyn DirectoryStore>;

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

#[derive(Serialize)]
struct HealthStatus {
    status: &'static str,
    directory: bool,
    active_sessions: i64,
    timestamp: String,
}

async fn health_check(State(directory): State<AppState>) -> impl IntoResponse {
    let healthy = match directory.health_check().await {
        Ok(healthy) => healthy,
        Err(e) => {
            warn!("Directory health check failed: {}", e);
            false
        }
    };

    let health = HealthStatus {
        status: if healthy { "healthy" } else { "unhealthy" },
        directory: healthy,
        active_sessions: metrics::active_sessions(),
        timestamp: Utc::now().to_rfc3339(),
    };

    let http_status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (http_status, Json(ApiResponse::success(health)))
}

async fn render_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

/// Create the operational HTTP router
pub fn create_router(directory: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .layer(middleware::from_fn(add_request_id))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .with_state(directory)
}
