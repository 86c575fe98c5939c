use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proxy_gateway::{
    auth::StaticTokenVerifier,
    composite::CompositeOrchestrator,
    config::{Config, EnvironmentSettings},
    forward::{ProxyForwarder, ResponseCapture},
    registry::EndpointRegistry,
    safety::RuleBasedSafetyCheck,
    traffic_log::{FileTrafficLogDriver, SqlTrafficLogDriver, TrafficLogDriver, TrafficLogSink},
    web::{AppState, WebServer},
};

#[derive(Parser)]
#[command(name = "proxy-gateway")]
#[command(version = "0.1.0")]
#[command(about = "A configuration-driven reverse proxy gateway with composite workflows and traffic logging")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("proxy_gateway={}", cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting proxy-gateway v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config);

    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    let config = Arc::new(config);

    let environments = Arc::new(EnvironmentSettings::load(&config.proxy.environments_file)?);
    info!(
        "Environment settings: server '{}', {} allowed environments",
        environments.server_name,
        environments.allowed_environments.len()
    );
    if config.proxy.use_default_credentials {
        warn!("use_default_credentials is set but has no effect with this client stack");
    }

    let registry = Arc::new(EndpointRegistry::load(&config.proxy.endpoints_path)?);

    let verifier = Arc::new(StaticTokenVerifier::load(&config.auth.tokens_file));
    let safety = Arc::new(RuleBasedSafetyCheck::new(&config.safety));

    // Single shared client: connection reuse across forwarder and steps
    let client = reqwest::Client::builder().build()?;

    let (sink, worker) = if config.traffic_log.enabled {
        let driver: Arc<dyn TrafficLogDriver> = match config.traffic_log.driver.as_str() {
            "sql" => Arc::new(SqlTrafficLogDriver::new(&config.traffic_log.sql).await?),
            "file" => Arc::new(FileTrafficLogDriver::new(&config.traffic_log.file)?),
            other => {
                warn!("Unknown traffic log driver '{}', using file driver", other);
                Arc::new(FileTrafficLogDriver::new(&config.traffic_log.file)?)
            }
        };
        let (sink, worker) = TrafficLogSink::start(&config.traffic_log, driver);
        info!(
            "Traffic logging enabled ({} driver, queue capacity {})",
            config.traffic_log.driver, config.traffic_log.queue_capacity
        );
        (Some(sink), Some(worker))
    } else {
        info!("Traffic logging disabled");
        (None, None)
    };

    let forwarder = Arc::new(ProxyForwarder::new(
        client.clone(),
        environments.server_name.clone(),
        environments.clone(),
        safety,
        ResponseCapture {
            enabled: config.traffic_log.enabled && config.traffic_log.capture_response_body,
            max_bytes: config.traffic_log.max_body_capture_size_bytes,
        },
    ));
    let orchestrator = Arc::new(CompositeOrchestrator::new(
        client,
        environments.server_name.clone(),
        environments.clone(),
    ));

    let state = AppState {
        config,
        registry,
        environments,
        forwarder,
        orchestrator,
        verifier,
        sink: sink.clone(),
    };

    let server = WebServer::new(state)?;
    info!("Starting web server on {}:{}", server.host(), server.port());
    server.serve().await?;

    // Drain the traffic log before exit; late entries are dropped
    if let (Some(sink), Some(worker)) = (sink, worker) {
        info!("Draining traffic log queue");
        sink.shutdown(worker).await;
    }

    info!("Shutdown complete");
    Ok(())
}
