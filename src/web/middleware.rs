//! HTTP middleware
//!
//! Cross-cutting concerns for the `/api/**` surface: bearer token
//! authentication and the traffic logging producer.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, warn};

use super::AppState;
use crate::models::TrafficLogEntry;
use crate::traffic_log::{redact_headers, truncate_body, ResponseLogInfo};

/// Trace id assigned at the entry of the logging middleware, available to
/// handlers through request extensions for correlated log lines.
#[derive(Debug, Clone)]
pub struct TraceId(pub String);

/// Username resolved by the auth middleware. Inserted into the request for
/// handlers and echoed into the response for the logging middleware.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Option<String>);

/// Bearer token authentication
///
/// Missing or malformed `Authorization` header: 401. Unknown token: 403.
pub async fn bearer_auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let Some(header_value) = header_value else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Missing Authorization header" })),
        )
            .into_response();
    };

    let Some(token) = header_value.strip_prefix("Bearer ") else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Authorization header is not a bearer token" })),
        )
            .into_response();
    };

    match state.verifier.verify(token.trim()).await {
        Some(verified) => {
            let user = AuthUser(verified.username);
            request.extensions_mut().insert(user.clone());
            let mut response = next.run(request).await;
            response.extensions_mut().insert(user);
            response
        }
        None => (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "Invalid token" })),
        )
            .into_response(),
    }
}

/// Traffic logging producer
///
/// Assigns the trace id, captures request metadata (and optionally the
/// buffered request body), measures duration, merges handler-published
/// response facts, and enqueues exactly one entry when the request
/// completes. Never blocks the request on the sink.
pub async fn traffic_log_middleware(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    mut request: Request,
    next: Next,
) -> Response {
    let trace_id = format!("{:08x}", fastrand::u32(..));
    request.extensions_mut().insert(TraceId(trace_id.clone()));

    let start = Instant::now();
    let timestamp = Utc::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let query = request.uri().query().unwrap_or_default().to_string();
    let (env, endpoint_guess) = parse_api_path(&path);
    let request_headers = redact_headers(request.headers());
    let client_ip = client_ip(&request, connect_info.as_ref());

    let mut request_size = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    // Request-body capture buffers the inbound body; the forward path gets
    // the same bytes back and stays unaware
    let mut request_body = None;
    let capture_cfg = &state.config.traffic_log;
    if state.sink.is_some() && capture_cfg.capture_request_body {
        let (parts, body) = request.into_parts();
        match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => {
                request_size = bytes.len() as u64;
                request_body = Some(truncate_body(
                    &String::from_utf8_lossy(&bytes),
                    capture_cfg.max_body_capture_size_bytes,
                ));
                request = Request::from_parts(parts, Body::from(bytes));
            }
            Err(e) => {
                warn!(trace_id = %trace_id, "Failed to buffer request body for capture: {}", e);
                request = Request::from_parts(parts, Body::empty());
            }
        }
    }

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status = response.status();
    let log_info = response
        .extensions()
        .get::<ResponseLogInfo>()
        .cloned()
        .unwrap_or_default();
    let username = response
        .extensions()
        .get::<AuthUser>()
        .and_then(|u| u.0.clone());

    let response_size = log_info.response_size.unwrap_or_else(|| {
        response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
    });

    info!(
        trace_id = %trace_id,
        method = %method,
        path = %path,
        status = status.as_u16(),
        duration_ms = duration.as_millis() as u64,
        "Request completed"
    );

    if let Some(sink) = &state.sink {
        sink.enqueue(TrafficLogEntry {
            trace_id,
            timestamp,
            method,
            path,
            query,
            env,
            endpoint_name: log_info.endpoint_name.unwrap_or(endpoint_guess),
            target_url: log_info.target_url.unwrap_or_default(),
            status_code: status.as_u16(),
            request_size,
            response_size,
            duration_ms: duration.as_millis() as u64,
            username,
            client_ip,
            request_body,
            response_body: log_info.response_body,
            request_headers,
        });
    }

    response
}

/// Pull `{env}` and the leading endpoint-name token out of an `/api/` path
fn parse_api_path(path: &str) -> (String, String) {
    let mut segments = path.trim_start_matches('/').split('/');
    if segments.next() != Some("api") {
        return (String::new(), String::new());
    }
    let env = segments.next().unwrap_or_default().to_string();
    let endpoint = segments
        .next()
        .unwrap_or_default()
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    (env, endpoint)
}

fn client_ip(request: &Request, connect_info: Option<&ConnectInfo<SocketAddr>>) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    connect_info
        .map(|info| info.0.ip().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_api_path() {
        assert_eq!(
            parse_api_path("/api/dev/Items"),
            ("dev".to_string(), "Items".to_string())
        );
        assert_eq!(
            parse_api_path("/api/600/Accounts(123)"),
            ("600".to_string(), "Accounts".to_string())
        );
        assert_eq!(
            parse_api_path("/api/dev/composite/SalesOrder"),
            ("dev".to_string(), "composite".to_string())
        );
        assert_eq!(
            parse_api_path("/health"),
            (String::new(), String::new())
        );
        assert_eq!(
            parse_api_path("/api"),
            ("".to_string(), "".to_string())
        );
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let request = Request::builder()
            .uri("/api/dev/Items")
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(Body::empty())
            .unwrap();

        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(
            client_ip(&request, Some(&ConnectInfo(addr))),
            "203.0.113.9"
        );
    }

    #[test]
    fn test_client_ip_falls_back_to_peer_address() {
        let request = Request::builder()
            .uri("/api/dev/Items")
            .body(Body::empty())
            .unwrap();

        let addr: SocketAddr = "192.0.2.4:1234".parse().unwrap();
        assert_eq!(client_ip(&request, Some(&ConnectInfo(addr))), "192.0.2.4");
        assert_eq!(client_ip(&request, None), "");
    }
}
