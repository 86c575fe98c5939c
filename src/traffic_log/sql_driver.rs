//! SQL storage driver for the traffic log
//!
//! Persists entries into a single `ProxyTrafficLogs` SQLite table, indexed
//! on timestamp, trace id, and endpoint name. Each flush writes its whole
//! batch inside one transaction.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::migrate::MigrateDatabase;
use sqlx::{Sqlite, SqlitePool};
use tracing::info;

use super::TrafficLogDriver;
use crate::config::SqlDriverConfig;
use crate::errors::TrafficLogError;
use crate::models::TrafficLogEntry;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ProxyTrafficLogs (
    Id INTEGER PRIMARY KEY AUTOINCREMENT,
    TraceId TEXT NOT NULL,
    Timestamp TEXT NOT NULL,
    Method TEXT NOT NULL,
    Path TEXT NOT NULL,
    QueryString TEXT NOT NULL,
    Environment TEXT NOT NULL,
    EndpointName TEXT NOT NULL,
    TargetUrl TEXT NOT NULL,
    StatusCode INTEGER NOT NULL,
    RequestSize INTEGER NOT NULL,
    ResponseSize INTEGER NOT NULL,
    DurationMs INTEGER NOT NULL,
    Username TEXT,
    ClientIp TEXT NOT NULL,
    RequestBody TEXT,
    ResponseBody TEXT,
    RequestHeaders TEXT NOT NULL
)
"#;

const CREATE_INDEXES: [&str; 3] = [
    "CREATE INDEX IF NOT EXISTS IX_ProxyTrafficLogs_Timestamp ON ProxyTrafficLogs(Timestamp)",
    "CREATE INDEX IF NOT EXISTS IX_ProxyTrafficLogs_TraceId ON ProxyTrafficLogs(TraceId)",
    "CREATE INDEX IF NOT EXISTS IX_ProxyTrafficLogs_EndpointName ON ProxyTrafficLogs(EndpointName)",
];

const INSERT_ENTRY: &str = r#"
INSERT INTO ProxyTrafficLogs (
    TraceId, Timestamp, Method, Path, QueryString, Environment, EndpointName,
    TargetUrl, StatusCode, RequestSize, ResponseSize, DurationMs, Username,
    ClientIp, RequestBody, ResponseBody, RequestHeaders
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

pub struct SqlTrafficLogDriver {
    pool: SqlitePool,
}

impl SqlTrafficLogDriver {
    pub async fn new(config: &SqlDriverConfig) -> Result<Self> {
        if !Sqlite::database_exists(&config.url).await.unwrap_or(false) {
            Sqlite::create_database(&config.url).await?;
        }

        let pool = SqlitePool::connect(&config.url).await?;
        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        for statement in CREATE_INDEXES {
            sqlx::query(statement).execute(&pool).await?;
        }
        info!("Traffic log database ready at {}", config.url);

        Ok(Self { pool })
    }
}

#[async_trait]
impl TrafficLogDriver for SqlTrafficLogDriver {
    async fn write_batch(&self, entries: &[TrafficLogEntry]) -> Result<(), TrafficLogError> {
        let mut tx = self.pool.begin().await?;

        for entry in entries {
            let headers = serde_json::to_string(&entry.request_headers)?;
            sqlx::query(INSERT_ENTRY)
                .bind(&entry.trace_id)
                .bind(entry.timestamp.to_rfc3339())
                .bind(&entry.method)
                .bind(&entry.path)
                .bind(&entry.query)
                .bind(&entry.env)
                .bind(&entry.endpoint_name)
                .bind(&entry.target_url)
                .bind(entry.status_code as i64)
                .bind(entry.request_size as i64)
                .bind(entry.response_size as i64)
                .bind(entry.duration_ms as i64)
                .bind(&entry.username)
                .bind(&entry.client_ip)
                .bind(&entry.request_body)
                .bind(&entry.response_body)
                .bind(headers)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TrafficLogError> {
        self.pool.close().await;
        Ok(())
    }
}
