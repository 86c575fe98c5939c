//! Traffic logging pipeline
//!
//! Decouples request serving from log persistence: handlers enqueue a
//! [`TrafficLogEntry`] per request into a bounded queue, and a single
//! background worker batches entries through a storage driver. Logging
//! latency and I/O failures never block the proxy path.
//!
//! Queue semantics:
//! - multi-producer / single-consumer, bounded capacity
//! - overflow evicts the stalest pending entry (drop-oldest); the newest
//!   enqueue is always admitted, and evictions are counted
//! - producers never block; a failed enqueue only emits a warning
//! - the worker preserves enqueue order within a flushed batch
//! - shutdown drains the queue with a final flush; producer writes that
//!   arrive after shutdown began are dropped

use async_trait::async_trait;
use axum::http::HeaderMap;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::TrafficLogConfig;
use crate::errors::TrafficLogError;
use crate::models::TrafficLogEntry;

pub mod file_driver;
pub mod sql_driver;

pub use file_driver::FileTrafficLogDriver;
pub use sql_driver::SqlTrafficLogDriver;

/// Per-response facts published by handlers through response extensions so
/// the logging middleware can complete the traffic log entry.
#[derive(Debug, Clone, Default)]
pub struct ResponseLogInfo {
    pub endpoint_name: Option<String>,
    pub target_url: Option<String>,
    pub response_size: Option<u64>,
    /// Truncated response body when response capture is enabled
    pub response_body: Option<String>,
}

/// Storage backend for flushed batches
#[async_trait]
pub trait TrafficLogDriver: Send + Sync {
    async fn write_batch(&self, entries: &[TrafficLogEntry]) -> Result<(), TrafficLogError>;

    /// Called once after the final drain
    async fn close(&self) -> Result<(), TrafficLogError> {
        Ok(())
    }
}

struct SinkShared {
    queue: Mutex<VecDeque<TrafficLogEntry>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    shutting_down: AtomicBool,
}

/// Producer handle to the traffic log queue. Cheap to clone.
#[derive(Clone)]
pub struct TrafficLogSink {
    shared: Arc<SinkShared>,
}

impl TrafficLogSink {
    /// Create a sink and start its background worker.
    pub fn start(
        config: &TrafficLogConfig,
        driver: Arc<dyn TrafficLogDriver>,
    ) -> (Self, JoinHandle<()>) {
        let sink = Self::with_capacity(config.queue_capacity);
        let worker = sink.spawn_worker(
            driver,
            config.batch_size,
            Duration::from_millis(config.flush_interval_ms),
        );
        (sink, worker)
    }

    /// Create a sink without a worker. Entries pile up until
    /// [`spawn_worker`](Self::spawn_worker) is called.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(SinkShared {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity: capacity.max(1),
                notify: Notify::new(),
                dropped: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Start the single consumer task for this sink.
    pub fn spawn_worker(
        &self,
        driver: Arc<dyn TrafficLogDriver>,
        batch_size: usize,
        flush_interval: Duration,
    ) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(run_worker(shared, driver, batch_size.max(1), flush_interval))
    }

    /// Non-blocking enqueue. On overflow the stalest entry is evicted so
    /// this entry is always admitted.
    pub fn enqueue(&self, entry: TrafficLogEntry) {
        if self.shared.shutting_down.load(Ordering::Acquire) {
            debug!("Traffic log sink is shutting down, dropping entry");
            return;
        }

        match self.shared.queue.lock() {
            Ok(mut queue) => {
                if queue.len() >= self.shared.capacity {
                    queue.pop_front();
                    let total = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        "Traffic log queue full, evicted oldest entry ({} evicted so far)",
                        total
                    );
                }
                queue.push_back(entry);
            }
            Err(_) => {
                warn!("Traffic log queue lock poisoned, dropping entry");
                return;
            }
        }

        self.shared.notify.notify_one();
    }

    /// Entries lost to the drop-oldest policy since startup
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Entries currently waiting to be flushed
    pub fn queued_count(&self) -> usize {
        self.shared.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Signal the worker to drain and stop, then wait for it to finish.
    pub async fn shutdown(&self, worker: JoinHandle<()>) {
        self.shared.shutting_down.store(true, Ordering::Release);
        self.shared.notify.notify_one();
        if let Err(e) = worker.await {
            error!("Traffic log worker did not shut down cleanly: {}", e);
        }
    }
}

async fn run_worker(
    shared: Arc<SinkShared>,
    driver: Arc<dyn TrafficLogDriver>,
    batch_size: usize,
    flush_interval: Duration,
) {
    loop {
        let batch = drain(&shared, batch_size);

        if !batch.is_empty() {
            if let Err(e) = driver.write_batch(&batch).await {
                error!(
                    "Traffic log flush failed, dropping batch of {}: {}",
                    batch.len(),
                    e
                );
            }
            continue;
        }

        if shared.shutting_down.load(Ordering::Acquire) {
            break;
        }

        tokio::select! {
            _ = shared.notify.notified() => {}
            _ = tokio::time::sleep(flush_interval) => {}
        }
    }

    if let Err(e) = driver.close().await {
        error!("Traffic log driver close failed: {}", e);
    }
}

fn drain(shared: &SinkShared, batch_size: usize) -> Vec<TrafficLogEntry> {
    match shared.queue.lock() {
        Ok(mut queue) => {
            let take = queue.len().min(batch_size);
            queue.drain(..take).collect()
        }
        Err(_) => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Capture helpers
// ---------------------------------------------------------------------------

const REDACTED: &str = "[REDACTED]";

/// Convert inbound headers to a loggable map with sensitive values redacted
pub fn redact_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (name, value) in headers {
        let name_str = name.as_str();
        let logged = if is_sensitive_header(name_str) {
            REDACTED.to_string()
        } else {
            String::from_utf8_lossy(value.as_bytes()).into_owned()
        };
        map.insert(name_str.to_string(), logged);
    }
    map
}

fn is_sensitive_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    matches!(
        lower.as_str(),
        "authorization" | "cookie" | "secret" | "credential" | "password"
    ) || lower.ends_with("-token")
        || lower.ends_with("-key")
}

/// Cap a captured body at `max_bytes`, marking truncation with an ellipsis
pub fn truncate_body(body: &str, max_bytes: usize) -> String {
    if body.len() <= max_bytes {
        return body.to_string();
    }
    let mut cut = max_bytes;
    while cut > 0 && !body.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &body[..cut])
}
