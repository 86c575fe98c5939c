//! Proxy forwarder
//!
//! Handles `{method} /api/{env}/{rest}`: validates the environment and
//! endpoint, reassembles the upstream URL, applies the header policy,
//! streams the request body upstream, and relays the response with its
//! body passed through the URL rewriter.
//!
//! Request validation maps onto the caller-visible taxonomy: unknown env
//! 400, unextractable endpoint name 400, unknown endpoint 404, private or
//! composite endpoint 403, disallowed method 405, unsafe target URL 403.
//! Upstream non-2xx statuses are relayed verbatim; only network/protocol
//! failures become a generic 500.

use axum::{
    body::Body,
    http::{HeaderMap, Method, StatusCode},
    response::Response,
};
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::config::EnvironmentSettings;
use crate::errors::GatewayError;
use crate::registry::EndpointRegistry;
use crate::rewrite;
use crate::safety::UrlSafetyCheck;
use crate::traffic_log::{truncate_body, ResponseLogInfo};

/// Methods that carry a request body upstream. `MERGE` is the proprietary
/// OData partial-update method some upstreams still require.
const BODY_METHODS: [&str; 6] = ["POST", "PUT", "PATCH", "DELETE", "OPTIONS", "MERGE"];

/// Everything the forwarder needs from the inbound request
pub struct ForwardRequest {
    pub env: String,
    /// Path remainder after `/api/{env}/`, starting with the endpoint name
    pub rest: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub raw_query: String,
    pub body: Body,
    /// Host the client addressed, used as the proxy base for rewriting
    pub request_host: String,
    pub request_scheme: String,
}

/// Response-body capture settings, mirrored from the traffic log config
#[derive(Debug, Clone, Copy)]
pub struct ResponseCapture {
    pub enabled: bool,
    pub max_bytes: usize,
}

pub struct ProxyForwarder {
    client: reqwest::Client,
    server_name: String,
    environments: Arc<EnvironmentSettings>,
    safety: Arc<dyn UrlSafetyCheck>,
    capture: ResponseCapture,
}

impl ProxyForwarder {
    pub fn new(
        client: reqwest::Client,
        server_name: String,
        environments: Arc<EnvironmentSettings>,
        safety: Arc<dyn UrlSafetyCheck>,
        capture: ResponseCapture,
    ) -> Self {
        Self {
            client,
            server_name,
            environments,
            safety,
            capture,
        }
    }

    /// Forward one request. Errors are returned for the handler to convert;
    /// a relayed upstream response (any status) is a success here.
    pub async fn forward(
        &self,
        registry: &EndpointRegistry,
        mut request: ForwardRequest,
    ) -> Result<Response, GatewayError> {
        if !self.environments.allows(&request.env) {
            return Err(GatewayError::EnvironmentNotAllowed(request.env));
        }

        let (endpoint_name, remainder) =
            extract_endpoint_name(&request.rest).ok_or(GatewayError::MissingEndpointName)?;

        let endpoint = registry
            .get(endpoint_name)
            .ok_or_else(|| GatewayError::EndpointNotFound(endpoint_name.to_string()))?
            .clone();

        if !endpoint.directly_accessible() {
            return Err(GatewayError::EndpointNotAccessible);
        }

        if !endpoint.allows_method(request.method.as_str()) {
            return Err(GatewayError::MethodNotAllowed {
                endpoint: endpoint.name.clone(),
                method: request.method.as_str().to_string(),
            });
        }

        let target = build_target_url(&endpoint.url, &encode_remainder(remainder), &request.raw_query);
        let target_url = Url::parse(&target)
            .map_err(|_| GatewayError::InvalidUpstreamUrl(endpoint.name.clone()))?;

        if !self.safety.is_allowed(&target_url) {
            return Err(GatewayError::TargetUrlBlocked);
        }

        debug!(
            "Forwarding {} /api/{}/{} -> {}",
            request.method, request.env, request.rest, target
        );

        let endpoint_name = endpoint_name.to_string();
        let body = std::mem::replace(&mut request.body, Body::empty());
        let upstream = self
            .dispatch(&request.method, &request.headers, &request.env, body, &target)
            .await?;

        self.relay_response(
            upstream,
            &request.request_scheme,
            &request.request_host,
            &request.env,
            &request.rest,
            &endpoint_name,
            &endpoint.url,
            target,
        )
        .await
    }

    /// Build and send the upstream request
    async fn dispatch(
        &self,
        method: &Method,
        headers: &HeaderMap,
        env: &str,
        body: Body,
        target: &str,
    ) -> Result<reqwest::Response, GatewayError> {
        let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|_| GatewayError::Internal("unsupported method token".to_string()))?;

        let forward_body = BODY_METHODS
            .iter()
            .any(|m| method.as_str().eq_ignore_ascii_case(m));

        let headers = build_upstream_headers(headers, env, &self.server_name, forward_body)?;

        let mut builder = self.client.request(method, target).headers(headers);

        if forward_body {
            // The body is streamed through; nothing is buffered here
            builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        Ok(builder.send().await?)
    }

    /// Relay status and headers, rewriting URL references in the body
    async fn relay_response(
        &self,
        upstream: reqwest::Response,
        request_scheme: &str,
        request_host: &str,
        env: &str,
        rest: &str,
        endpoint_name: &str,
        endpoint_url: &str,
        target: String,
    ) -> Result<Response, GatewayError> {
        let status = StatusCode::from_u16(upstream.status().as_u16())
            .map_err(|_| GatewayError::Internal("invalid upstream status".to_string()))?;

        // Collect relayable headers before the body consumes the response
        let mut relayed: Vec<(String, Vec<u8>)> = Vec::new();
        let mut has_content_type = false;
        for (name, value) in upstream.headers() {
            if !is_relayable_response_header(name.as_str()) {
                continue;
            }
            if name.as_str().eq_ignore_ascii_case("content-type") {
                has_content_type = true;
            }
            relayed.push((name.as_str().to_string(), value.as_bytes().to_vec()));
        }

        let raw_body = upstream.bytes().await?;

        // Binary payloads are relayed untouched; only text is rewritten
        let (final_body, captured) = match std::str::from_utf8(&raw_body) {
            Ok(text) => {
                let (original_host, original_path) = split_upstream_base(endpoint_url)
                    .map_err(|_| GatewayError::InvalidUpstreamUrl(endpoint_name.to_string()))?;
                let proxy_host = format!("{}://{}", request_scheme, request_host);
                let proxy_path = format!("/api/{}/{}", env, endpoint_name);

                let rewritten = rewrite::rewrite(
                    text,
                    &original_host,
                    &original_path,
                    &proxy_host,
                    &proxy_path,
                );
                let captured = self
                    .capture
                    .enabled
                    .then(|| truncate_body(&rewritten, self.capture.max_bytes));
                (rewritten.into_bytes(), captured)
            }
            Err(_) => (raw_body.to_vec(), None),
        };

        let mut builder = Response::builder().status(status);
        for (name, value) in relayed {
            builder = builder.header(name, value);
        }
        if !has_content_type {
            builder = builder.header("content-type", "application/json");
        }

        let response_size = final_body.len() as u64;
        let mut response = builder
            .body(Body::from(final_body))
            .map_err(|e| GatewayError::Internal(format!("response build failed: {e}")))?;
        eprintln!("DEBUG relay_response headers: {:?}", response.headers());

        response.extensions_mut().insert(ResponseLogInfo {
            endpoint_name: Some(endpoint_name.to_string()),
            target_url: Some(target),
            response_size: Some(response_size),
            response_body: captured,
        });

        if !status.is_success() {
            debug!("Upstream returned {} for {}", status, rest);
        }

        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// URL assembly
// ---------------------------------------------------------------------------

/// Split `rest` into the leading endpoint name (`[A-Za-z0-9_]+`) and the
/// remainder with its separator stripped.
pub fn extract_endpoint_name(rest: &str) -> Option<(&str, &str)> {
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    let (name, tail) = rest.split_at(end);
    Some((name, tail.strip_prefix('/').unwrap_or(tail)))
}

/// Percent-encode the path remainder as a single segment. A fully
/// parenthesized remainder keeps its parentheses and encodes only the
/// inner content (OData entity keys).
pub fn encode_remainder(remainder: &str) -> String {
    if remainder.is_empty() {
        return String::new();
    }
    if remainder.len() >= 2 && remainder.starts_with('(') && remainder.ends_with(')') {
        let inner = &remainder[1..remainder.len() - 1];
        return format!("({})", urlencoding::encode(inner));
    }
    urlencoding::encode(remainder).into_owned()
}

/// `endpoint.url + ("/" + encoded)? + ("?" + query)?`
pub fn build_target_url(base: &str, encoded_remainder: &str, raw_query: &str) -> String {
    let mut target = base.to_string();
    if !encoded_remainder.is_empty() {
        target.push('/');
        target.push_str(encoded_remainder);
    }
    if !raw_query.is_empty() {
        target.push('?');
        target.push_str(raw_query);
    }
    target
}

/// The rewriter's original base: `scheme://host:port` and the trimmed path
/// of the endpoint's upstream URL.
fn split_upstream_base(endpoint_url: &str) -> Result<(String, String), url::ParseError> {
    let url = Url::parse(endpoint_url)?;
    let host = url.host_str().unwrap_or_default();
    let original_host = match url.port_or_known_default() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    };
    let original_path = url.path().trim_end_matches('/').to_string();
    Ok((original_host, original_path))
}

// ---------------------------------------------------------------------------
// Header policy
// ---------------------------------------------------------------------------

/// Inbound headers dropped before dispatch. `Host` is the client's, the
/// context headers are re-injected with gateway values, and content headers
/// only travel with a forwarded body.
fn is_forwardable_request_header(name: &str, forward_body: bool) -> bool {
    let lower = name.to_ascii_lowercase();
    if matches!(lower.as_str(), "host" | "databasename" | "servername") {
        return false;
    }
    if lower.starts_with("content-") {
        // Content-Length is always dropped; hyper frames the outbound body
        return forward_body && lower != "content-length";
    }
    true
}

/// `Content-Length` is recomputed after rewriting and `Transfer-Encoding`
/// belongs to the upstream connection, not the relayed response.
fn is_relayable_response_header(name: &str) -> bool {
    !matches!(
        name.to_ascii_lowercase().as_str(),
        "content-length" | "transfer-encoding" | "connection"
    )
}

fn build_upstream_headers(
    inbound: &HeaderMap,
    env: &str,
    server_name: &str,
    forward_body: bool,
) -> Result<reqwest::header::HeaderMap, GatewayError> {
    let mut outbound = reqwest::header::HeaderMap::new();

    for (name, value) in inbound {
        if !is_forwardable_request_header(name.as_str(), forward_body) {
            continue;
        }
        let converted_name =
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes());
        let converted_value = reqwest::header::HeaderValue::from_bytes(value.as_bytes());
        if let (Ok(header_name), Ok(header_value)) = (converted_name, converted_value) {
            outbound.append(header_name, header_value);
        }
    }

    let env_value = reqwest::header::HeaderValue::from_str(env)
        .map_err(|_| GatewayError::Internal("environment is not header-safe".to_string()))?;
    let server_value = reqwest::header::HeaderValue::from_str(server_name)
        .map_err(|_| GatewayError::Internal("server name is not header-safe".to_string()))?;
    outbound.insert("databasename", env_value);
    outbound.insert("servername", server_value);

    Ok(outbound)
}
