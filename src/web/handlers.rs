//! HTTP request handlers
//!
//! Thin adapters between axum and the forwarder/orchestrator. Handlers
//! publish per-response facts ([`ResponseLogInfo`]) through response
//! extensions for the logging middleware.

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use super::middleware::TraceId;
use super::AppState;
use crate::errors::GatewayError;
use crate::forward::ForwardRequest;
use crate::traffic_log::{truncate_body, ResponseLogInfo};

/// Liveness probe, outside the authenticated surface
pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `/{method} /api/{env}/{rest}` — the standard proxy surface
pub async fn proxy_request(
    State(state): State<AppState>,
    Path((env, rest)): Path<(String, String)>,
    request: Request,
) -> Response {
    let trace_id = request
        .extensions()
        .get::<TraceId>()
        .map(|t| t.0.clone())
        .unwrap_or_default();

    let (parts, body) = request.into_parts();
    let forward = ForwardRequest {
        env,
        rest,
        method: parts.method.clone(),
        raw_query: parts.uri.query().unwrap_or_default().to_string(),
        request_host: parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost")
            .to_string(),
        request_scheme: parts
            .headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("http")
            .to_string(),
        headers: parts.headers,
        body,
    };

    match state.forwarder.forward(&state.registry, forward).await {
        Ok(response) => {
            eprintln!("DEBUG handler headers: {:?}", response.headers());
            response
        },
        Err(e) => {
            if e.status_code() == StatusCode::INTERNAL_SERVER_ERROR {
                error!(trace_id = %trace_id, "Proxy request failed: {}", e);
            }
            e.into_response()
        }
    }
}

/// `POST /api/{env}/composite/{name}` — composite workflows
pub async fn run_composite(
    State(state): State<AppState>,
    Path((env, name)): Path<(String, String)>,
    request: Request,
) -> Response {
    let trace_id = request
        .extensions()
        .get::<TraceId>()
        .map(|t| t.0.clone())
        .unwrap_or_default();

    if !state.orchestrator.environment_allowed(&env) {
        return GatewayError::EnvironmentNotAllowed(env).into_response();
    }

    let Some(definition) = state.registry.composite(&name).cloned() else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Composite '{name}' not found") })),
        )
            .into_response();
    };

    let bytes = match axum::body::to_bytes(request.into_body(), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(trace_id = %trace_id, "Failed to read composite request body: {}", e);
            return GatewayError::InvalidJsonBody.into_response();
        }
    };
    let request_body: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(_) => return GatewayError::InvalidJsonBody.into_response(),
    };

    let outcome = state
        .orchestrator
        .execute(&state.registry, &env, &definition, request_body)
        .await;

    let (status, payload) = match outcome {
        Ok(result) => (StatusCode::OK, json!(result)),
        Err(failure) => (
            StatusCode::BAD_REQUEST,
            json!({
                "error": failure.message,
                "step": failure.step,
                "details": failure.details,
                "result": failure.partial,
            }),
        ),
    };

    json_response_with_log_info(&state, status, &payload, &name)
}

/// Serialize a composite outcome, attaching the response facts the logging
/// middleware needs (size, optional captured body, endpoint name).
fn json_response_with_log_info(
    state: &AppState,
    status: StatusCode,
    payload: &serde_json::Value,
    composite_name: &str,
) -> Response {
    let body = payload.to_string();
    let capture_cfg = &state.config.traffic_log;
    let captured = capture_cfg
        .capture_response_body
        .then(|| truncate_body(&body, capture_cfg.max_body_capture_size_bytes));
    let size = body.len() as u64;

    let mut response = (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        Body::from(body),
    )
        .into_response();

    response.extensions_mut().insert(ResponseLogInfo {
        endpoint_name: Some(composite_name.to_string()),
        target_url: None,
        response_size: Some(size),
        response_body: captured,
    });

    response
}
