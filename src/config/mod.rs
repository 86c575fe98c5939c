//! Configuration for the proxy gateway
//!
//! Two configuration surfaces exist:
//! - `config.toml`: process-level settings (listen address, paths, traffic
//!   log pipeline tuning). Written with defaults on first run.
//! - `environments/settings.json`: the deployment-format environment file
//!   carrying `ServerName` and the environment allow-list (PascalCase JSON,
//!   shared with existing deployments).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub web: WebConfig,
    pub proxy: ProxyConfig,
    pub auth: AuthConfig,
    pub safety: SafetyConfig,
    pub traffic_log: TrafficLogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Root of the endpoint definition tree (one directory per endpoint)
    pub endpoints_path: PathBuf,
    /// Environment settings file (ServerName, AllowedEnvironments)
    pub environments_file: PathBuf,
    /// Accepted for deployment-file compatibility; the rustls client stack
    /// has no OS default-credential mode, so this is inert.
    pub use_default_credentials: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// JSON file mapping bearer tokens to usernames
    pub tokens_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    pub allowed_schemes: Vec<String>,
    pub blocked_hosts: Vec<String>,
    pub block_private_networks: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficLogConfig {
    pub enabled: bool,
    /// "file" or "sql"
    pub driver: String,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub capture_request_body: bool,
    pub capture_response_body: bool,
    pub max_body_capture_size_bytes: usize,
    pub file: FileDriverConfig,
    pub sql: SqlDriverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDriverConfig {
    pub directory: PathBuf,
    pub prefix: String,
    pub max_file_size_mb: u64,
    pub max_file_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlDriverConfig {
    pub url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            web: WebConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            proxy: ProxyConfig {
                endpoints_path: PathBuf::from("./endpoints"),
                environments_file: PathBuf::from("./environments/settings.json"),
                use_default_credentials: false,
            },
            auth: AuthConfig {
                tokens_file: PathBuf::from("./tokens.json"),
            },
            safety: SafetyConfig {
                allowed_schemes: vec!["http".to_string(), "https".to_string()],
                blocked_hosts: Vec::new(),
                block_private_networks: false,
            },
            traffic_log: TrafficLogConfig {
                enabled: true,
                driver: "file".to_string(),
                queue_capacity: 1024,
                batch_size: 64,
                flush_interval_ms: 1000,
                capture_request_body: false,
                capture_response_body: false,
                max_body_capture_size_bytes: 4096,
                file: FileDriverConfig {
                    directory: PathBuf::from("./log/traffic"),
                    prefix: "traffic".to_string(),
                    max_file_size_mb: 16,
                    max_file_count: 10,
                },
                sql: SqlDriverConfig {
                    url: "sqlite://./traffic-logs.db".to_string(),
                },
            },
        }
    }
}

impl Config {
    /// Load configuration from `path`, writing the defaults there first if
    /// the file does not exist yet.
    pub fn load(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {path}"))?;
            Ok(toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {path}"))?)
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(path, contents)
                .with_context(|| format!("Failed to write default config to {path}"))?;
            Ok(default_config)
        }
    }
}

/// `environments/settings.json` wrapper object
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SettingsFile {
    pub environment: EnvironmentSettings,
}

/// Process-wide environment settings, read-only after startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EnvironmentSettings {
    /// Injected into every upstream request as the `ServerName` header
    pub server_name: String,
    /// Environments accepted as the `{env}` path segment
    pub allowed_environments: Vec<String>,
}

impl EnvironmentSettings {
    /// ASCII case-insensitive allow-list check
    pub fn allows(&self, env: &str) -> bool {
        self.allowed_environments
            .iter()
            .any(|e| e.eq_ignore_ascii_case(env))
    }

    /// Load the settings file, creating it with defaults when missing so a
    /// fresh checkout starts serving without manual setup.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let settings: SettingsFile = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(settings.environment)
        } else {
            let defaults = EnvironmentSettings {
                server_name: "localhost".to_string(),
                allowed_environments: vec!["dev".to_string(), "test".to_string()],
            };
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let wrapper = SettingsFile {
                environment: defaults.clone(),
            };
            std::fs::write(path, serde_json::to_string_pretty(&wrapper)?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            Ok(defaults)
        }
    }
}
