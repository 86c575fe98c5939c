//! Web layer
//!
//! HTTP interface of the gateway: the axum router, the shared application
//! state, and the server lifecycle. Handlers stay thin and delegate to the
//! forwarder and orchestrator; cross-cutting concerns (bearer auth,
//! traffic logging) live in middleware.
//!
//! Route surface:
//! - `/health` — liveness, no auth
//! - `POST /api/{env}/composite/{name}` — composite workflows
//! - `/api/{env}/{endpoint}/{remainder?}` — the standard proxy surface,
//!   any method
//!
//! Middleware order (outermost first): traffic logging, then bearer auth.
//! The logging middleware assigns the trace id at entry, so auth failures
//! are logged like any other outcome.

use anyhow::Result;
use axum::{
    routing::{any, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::TokenVerifier;
use crate::composite::CompositeOrchestrator;
use crate::config::{Config, EnvironmentSettings};
use crate::forward::ProxyForwarder;
use crate::registry::EndpointRegistry;
use crate::traffic_log::TrafficLogSink;

pub mod handlers;
pub mod middleware;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<EndpointRegistry>,
    pub environments: Arc<EnvironmentSettings>,
    pub forwarder: Arc<ProxyForwarder>,
    pub orchestrator: Arc<CompositeOrchestrator>,
    pub verifier: Arc<dyn TokenVerifier>,
    /// `None` when traffic logging is disabled
    pub sink: Option<TrafficLogSink>,
}

/// Build the full application router
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/:env/composite/:name", post(handlers::run_composite))
        .route("/api/:env/*rest", any(handlers::proxy_request))
        ;

    Router::new()
        .route("/health", get(handlers::health_check))
        .merge(api)
        .with_state(state)
}

/// Web server configuration and lifecycle
pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(state: AppState) -> Result<Self> {
        let addr: SocketAddr = format!(
            "{}:{}",
            state.config.web.host, state.config.web.port
        )
        .parse()?;

        Ok(Self {
            app: build_router(state),
            addr,
        })
    }

    /// Serve until ctrl-c, then return so the caller can drain the sink.
    pub async fn serve(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;
        Ok(())
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received");
}
