//! Error type definitions for the proxy gateway
//!
//! This module defines the error types used throughout the application,
//! providing a hierarchical error system that makes debugging and error
//! handling more straightforward. `GatewayError` is the caller-observable
//! taxonomy: every variant maps onto exactly one HTTP status code, and the
//! 500 mapping never exposes internal detail.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Request-level errors surfaced to gateway callers
///
/// The display strings double as the `error` field of the JSON body sent to
/// the client, except for the 500 family which is always genericized.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The environment path segment is not in the configured allow-list
    #[error("Environment '{0}' is not allowed.")]
    EnvironmentNotAllowed(String),

    /// No endpoint name could be extracted from the request path
    #[error("No endpoint name found in request path")]
    MissingEndpointName,

    /// The endpoint is not present in the registry
    #[error("Endpoint '{0}' not found")]
    EndpointNotFound(String),

    /// The endpoint exists but is private or composite-only
    #[error("Endpoint not accessible directly")]
    EndpointNotAccessible,

    /// The HTTP method is not in the endpoint's allowed set
    #[error("Method '{method}' not allowed for endpoint '{endpoint}'")]
    MethodNotAllowed { endpoint: String, method: String },

    /// The computed upstream URL failed the safety check
    #[error("Target URL is not allowed")]
    TargetUrlBlocked,

    /// The upstream target URL could not be parsed
    #[error("Invalid upstream URL for endpoint '{0}'")]
    InvalidUpstreamUrl(String),

    /// Network or protocol failure while dispatching upstream
    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    /// The request body is not valid JSON where JSON is required
    #[error("Request body is not valid JSON")]
    InvalidJsonBody,

    /// Any other failure inside the request handler
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The HTTP status code this error maps to
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::EnvironmentNotAllowed(_) => StatusCode::BAD_REQUEST,
            GatewayError::MissingEndpointName => StatusCode::BAD_REQUEST,
            GatewayError::EndpointNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::EndpointNotAccessible => StatusCode::FORBIDDEN,
            GatewayError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::TargetUrlBlocked => StatusCode::FORBIDDEN,
            GatewayError::InvalidUpstreamUrl(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::InvalidJsonBody => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // 500s never leak internals to the caller
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "Internal Server Error".to_string()
        } else {
            self.to_string()
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Endpoint registry loading errors
///
/// Per-file failures are logged and skipped during a scan; these variants
/// describe why a single definition was rejected.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Failed to read endpoint file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse endpoint file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid endpoint definition in {path}: {reason}")]
    Invalid { path: String, reason: String },
}

/// Traffic log pipeline errors
#[derive(Error, Debug)]
pub enum TrafficLogError {
    #[error("Traffic log file write failed: {0}")]
    File(#[from] std::io::Error),

    #[error("Traffic log database write failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Traffic log serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::EnvironmentNotAllowed("qa".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::EndpointNotFound("Items".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::EndpointNotAccessible.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::MethodNotAllowed {
                endpoint: "Items".into(),
                method: "DELETE".into()
            }
            .status_code(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            GatewayError::Internal("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_environment_message_format() {
        let err = GatewayError::EnvironmentNotAllowed("qa".into());
        assert_eq!(err.to_string(), "Environment 'qa' is not allowed.");
    }
}
