//! End-to-end tests for the standard proxy surface: auth gates, input
//! validation, header policy, URL assembly, and response rewriting against
//! a live mock upstream.

use axum::{
    body::Body,
    extract::Request as AxumRequest,
    http::{HeaderMap, Method, Request, StatusCode},
    routing::{any, get},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower::ServiceExt;

use async_trait::async_trait;
use proxy_gateway::{
    auth::StaticTokenVerifier,
    composite::CompositeOrchestrator,
    config::{Config, EnvironmentSettings, SafetyConfig},
    errors::TrafficLogError,
    forward::{ProxyForwarder, ResponseCapture},
    models::TrafficLogEntry,
    registry::EndpointRegistry,
    safety::RuleBasedSafetyCheck,
    traffic_log::{TrafficLogDriver, TrafficLogSink},
    web::{build_router, AppState},
};

const TOKEN: &str = "tok-valid";

/// Spin up a mock upstream on an ephemeral port
async fn spawn_upstream() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = upstream_router(addr);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn upstream_router(addr: SocketAddr) -> Router {
    Router::new()
        .route(
            "/items",
            get(move || async move {
                Json(json!({"d": {"url": format!("http://{addr}/items/1")}}))
            }),
        )
        .route(
            "/echo",
            any(|request: AxumRequest| async move {
                let path = request.uri().path().to_string();
                let query = request.uri().query().unwrap_or_default().to_string();
                let headers: Value = request
                    .headers()
                    .iter()
                    .map(|(k, v)| {
                        (
                            k.as_str().to_string(),
                            Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()),
                        )
                    })
                    .collect::<serde_json::Map<_, _>>()
                    .into();
                Json(json!({"path": path, "query": query, "headers": headers}))
            }),
        )
        .route("/echo/:key", any(|request: AxumRequest| async move {
            Json(json!({"path": request.uri().path()}))
        }))
        .route(
            "/teapot",
            get(|| async { (StatusCode::IM_A_TEAPOT, Json(json!({"kind": "teapot"}))) }),
        )
}

fn write_endpoint(root: &Path, name: &str, body: Value) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("endpoint.json"),
        serde_json::to_string_pretty(&body).unwrap(),
    )
    .unwrap();
}

fn seed_endpoints(root: &Path, upstream: SocketAddr) {
    write_endpoint(
        root,
        "Items",
        json!({"Url": format!("http://{upstream}/items"), "Methods": ["GET"]}),
    );
    write_endpoint(
        root,
        "Echo",
        json!({"Url": format!("http://{upstream}/echo"), "Methods": ["GET", "POST", "MERGE"]}),
    );
    write_endpoint(
        root,
        "Teapot",
        json!({"Url": format!("http://{upstream}/teapot"), "Methods": ["GET"]}),
    );
    write_endpoint(
        root,
        "SalesOrderLine",
        json!({
            "Url": format!("http://{upstream}/echo"),
            "Methods": ["POST"],
            "IsPrivate": true
        }),
    );
    write_endpoint(
        root,
        "HiddenFlow",
        json!({
            "Url": format!("http://{upstream}/echo"),
            "Methods": ["POST"],
            "Type": "Composite",
            "CompositeConfig": {
                "Steps": [{"Name": "Step1", "Endpoint": "Echo", "Method": "POST"}]
            }
        }),
    );
}

fn temp_endpoint_root(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "proxy-gateway-routes-{}-{}",
        tag,
        uuid::Uuid::new_v4()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn build_state(endpoints_root: &Path, safety: SafetyConfig) -> AppState {
    let mut config = Config::default();
    config.traffic_log.enabled = false;
    let config = Arc::new(config);

    let environments = Arc::new(EnvironmentSettings {
        server_name: "gateway-01".to_string(),
        allowed_environments: vec!["dev".to_string(), "600".to_string()],
    });
    let registry = Arc::new(EndpointRegistry::load(endpoints_root).unwrap());
    let client = reqwest::Client::new();
    let safety = Arc::new(RuleBasedSafetyCheck::new(&safety));

    AppState {
        config: config.clone(),
        registry,
        environments: environments.clone(),
        forwarder: Arc::new(ProxyForwarder::new(
            client.clone(),
            environments.server_name.clone(),
            environments.clone(),
            safety,
            ResponseCapture {
                enabled: false,
                max_bytes: 4096,
            },
        )),
        orchestrator: Arc::new(CompositeOrchestrator::new(
            client,
            environments.server_name.clone(),
            environments,
        )),
        verifier: Arc::new(StaticTokenVerifier::from_pairs([(
            TOKEN,
            Some("svc-account"),
        )])),
        sink: None,
    }
}

fn open_safety() -> SafetyConfig {
    SafetyConfig {
        allowed_schemes: vec!["http".to_string(), "https".to_string()],
        blocked_hosts: Vec::new(),
        block_private_networks: false,
    }
}

async fn gateway_app(tag: &str) -> (Router, SocketAddr) {
    let upstream = spawn_upstream().await;
    let root = temp_endpoint_root(tag);
    seed_endpoints(&root, upstream);
    let state = build_state(&root, open_safety());
    (build_router(state), upstream)
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, HeaderMap, String) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("host", "localhost");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }

    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    eprintln!("DEBUG test send headers: {:?}", headers);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, String::from_utf8_lossy(&bytes).into_owned())
}

fn as_json(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or(json!({}))
}

#[tokio::test]
async fn test_missing_authorization_is_401() {
    let (app, _) = gateway_app("auth-missing").await;
    let (status, _, body) = send(&app, Method::GET, "/api/dev/Items", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(as_json(&body).get("error").is_some());
}

#[tokio::test]
async fn test_unknown_token_is_403() {
    let (app, _) = gateway_app("auth-bad").await;
    let (status, _, body) =
        send(&app, Method::GET, "/api/dev/Items", Some("wrong"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(as_json(&body)["error"], "Invalid token");
}

#[tokio::test]
async fn test_disallowed_environment_is_400() {
    let (app, _) = gateway_app("env").await;
    let (status, _, body) = send(&app, Method::GET, "/api/qa/Items", Some(TOKEN), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(as_json(&body)["error"], "Environment 'qa' is not allowed.");
}

#[tokio::test]
async fn test_unknown_endpoint_is_404() {
    let (app, _) = gateway_app("notfound").await;
    let (status, _, _) = send(&app, Method::GET, "/api/dev/Nope", Some(TOKEN), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_method_gate_is_405() {
    let (app, _) = gateway_app("method").await;
    let (status, _, _) = send(&app, Method::POST, "/api/dev/Items", Some(TOKEN), Some(json!({}))).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_private_endpoint_is_403() {
    let (app, _) = gateway_app("private").await;
    let (status, _, body) = send(
        &app,
        Method::POST,
        "/api/dev/SalesOrderLine",
        Some(TOKEN),
        Some(json!({"No": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(as_json(&body)["error"], "Endpoint not accessible directly");
}

#[tokio::test]
async fn test_composite_endpoint_is_not_directly_callable() {
    let (app, _) = gateway_app("composite-direct").await;
    let (status, _, body) = send(
        &app,
        Method::POST,
        "/api/dev/HiddenFlow",
        Some(TOKEN),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(as_json(&body)["error"], "Endpoint not accessible directly");
}

#[tokio::test]
async fn test_standard_get_rewrites_body_and_strips_content_length() {
    let (app, upstream) = gateway_app("rewrite").await;
    let (status, headers, body) =
        send(&app, Method::GET, "/api/dev/Items?$top=2", Some(TOKEN), None).await;

    assert_eq!(status, StatusCode::OK);
    // Upstream body carried its own absolute URL; the client sees the proxy URL
    let json = as_json(&body);
    assert_eq!(json["d"]["url"], "http://localhost/api/dev/Items/1");
    assert!(!body.contains(&upstream.to_string()));
    // Content-Length is dropped because rewriting changed the length
    assert!(headers.get("content-length").is_none());
}

#[tokio::test]
async fn test_context_headers_and_query_are_forwarded() {
    let (app, _) = gateway_app("headers").await;
    let (status, _, body) = send(
        &app,
        Method::GET,
        "/api/600/Echo?$filter=No%20eq%201",
        Some(TOKEN),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let json = as_json(&body);
    assert_eq!(json["headers"]["databasename"], "600");
    assert_eq!(json["headers"]["servername"], "gateway-01");
    // The bearer token travels upstream untouched (it is not a context header)
    assert_eq!(
        json["headers"]["authorization"],
        format!("Bearer {TOKEN}")
    );
    // Host is the upstream's, not the client's
    assert_ne!(json["headers"]["host"], "localhost");
    assert_eq!(json["query"], "$filter=No%20eq%201");
}

#[tokio::test]
async fn test_parenthesized_remainder_keeps_parentheses() {
    let (app, _) = gateway_app("parens").await;

    // OData-style key glued to the endpoint name
    let (status, _, body) = send(&app, Method::GET, "/api/dev/Echo(123)", Some(TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(as_json(&body)["path"], "/echo/(123)");

    // Same key behind a separator
    let (status, _, body) =
        send(&app, Method::GET, "/api/dev/Echo/(123)", Some(TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(as_json(&body)["path"], "/echo/(123)");
}

#[tokio::test]
async fn test_body_is_forwarded_for_post() {
    let (app, _) = gateway_app("post-body").await;
    let (status, _, body) = send(
        &app,
        Method::POST,
        "/api/dev/Echo",
        Some(TOKEN),
        Some(json!({"No": 7})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    // The echo upstream saw a content-type, which only travels with a body
    let json = as_json(&body);
    assert_eq!(json["headers"]["content-type"], "application/json");
}

#[tokio::test]
async fn test_upstream_non_2xx_is_relayed_verbatim() {
    let (app, _) = gateway_app("teapot").await;
    let (status, _, body) = send(&app, Method::GET, "/api/dev/Teapot", Some(TOKEN), None).await;
    assert_eq!(status, StatusCode::IM_A_TEAPOT);
    assert_eq!(as_json(&body)["kind"], "teapot");
}

#[tokio::test]
async fn test_unreachable_upstream_is_500_with_generic_body() {
    let root = temp_endpoint_root("unreachable");
    // Port 9 is discard; nothing is listening there
    write_endpoint(
        &root,
        "Dead",
        json!({"Url": "http://127.0.0.1:9/dead", "Methods": ["GET"]}),
    );
    let app = build_router(build_state(&root, open_safety()));

    let (status, _, body) = send(&app, Method::GET, "/api/dev/Dead", Some(TOKEN), None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(as_json(&body)["error"], "Internal Server Error");
}

#[tokio::test]
async fn test_blocked_target_url_is_403() {
    let upstream = spawn_upstream().await;
    let root = temp_endpoint_root("blocked");
    seed_endpoints(&root, upstream);

    let state = build_state(
        &root,
        SafetyConfig {
            allowed_schemes: vec!["http".to_string()],
            blocked_hosts: vec!["127.0.0.1".to_string()],
            block_private_networks: false,
        },
    );
    let app = build_router(state);

    let (status, _, _) = send(&app, Method::GET, "/api/dev/Items", Some(TOKEN), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_health_does_not_require_auth() {
    let (app, _) = gateway_app("health").await;
    let (status, _, body) = send(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(as_json(&body)["status"], "healthy");
}

struct RecordingDriver {
    entries: Arc<std::sync::Mutex<Vec<TrafficLogEntry>>>,
}

#[async_trait]
impl TrafficLogDriver for RecordingDriver {
    async fn write_batch(&self, entries: &[TrafficLogEntry]) -> Result<(), TrafficLogError> {
        self.entries.lock().unwrap().extend_from_slice(entries);
        Ok(())
    }
}

#[tokio::test]
async fn test_traffic_log_entry_is_recorded_per_request() {
    let upstream = spawn_upstream().await;
    let root = temp_endpoint_root("traffic-log");
    seed_endpoints(&root, upstream);

    let entries = Arc::new(std::sync::Mutex::new(Vec::new()));
    let driver = Arc::new(RecordingDriver {
        entries: entries.clone(),
    });
    let (sink, worker) = TrafficLogSink::start(&Config::default().traffic_log, driver);

    let mut state = build_state(&root, open_safety());
    state.sink = Some(sink.clone());
    let app = build_router(state);

    let (status, _, _) = send(&app, Method::GET, "/api/dev/Items?$top=2", Some(TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);

    // Auth failures are logged like any other outcome
    let (status, _, _) = send(&app, Method::GET, "/api/dev/Items", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    sink.shutdown(worker).await;

    let entries = entries.lock().unwrap();
    assert_eq!(entries.len(), 2);

    let ok = &entries[0];
    assert_eq!(ok.env, "dev");
    assert_eq!(ok.endpoint_name, "Items");
    assert_eq!(ok.status_code, 200);
    assert_eq!(ok.query, "$top=2");
    assert_eq!(ok.username.as_deref(), Some("svc-account"));
    assert_eq!(ok.trace_id.len(), 8);
    assert!(ok.target_url.contains("/items"));
    assert!(ok.response_size > 0);
    assert_eq!(ok.request_headers["authorization"], "[REDACTED]");

    let denied = &entries[1];
    assert_eq!(denied.status_code, 401);
    assert!(denied.username.is_none());
    assert!(denied.target_url.is_empty());

    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test]
async fn test_merge_method_reaches_upstream() {
    let (app, _) = gateway_app("merge").await;
    let merge = Method::from_bytes(b"MERGE").unwrap();
    let (status, _, body) = send(
        &app,
        merge,
        "/api/dev/Echo",
        Some(TOKEN),
        Some(json!({"No": 1, "Patch": true})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    // MERGE carries a body, so content headers travel with it
    assert_eq!(as_json(&body)["headers"]["content-type"], "application/json");
}
