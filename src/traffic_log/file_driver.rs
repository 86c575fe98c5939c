//! File storage driver for the traffic log
//!
//! Writes newline-delimited JSON. Log files live in a single directory,
//! named `{prefix}_{yyyyMMdd_HHmmss}.log`. When the projected size after
//! writing the next batch would exceed the configured maximum, a fresh file
//! is opened and the oldest files beyond the retention count are deleted.
//! All writes go through a mutex around the active file.

use async_trait::async_trait;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::TrafficLogDriver;
use crate::config::FileDriverConfig;
use crate::errors::TrafficLogError;
use crate::models::TrafficLogEntry;

struct ActiveFile {
    file: File,
    written: u64,
}

pub struct FileTrafficLogDriver {
    directory: PathBuf,
    prefix: String,
    max_file_size: u64,
    max_file_count: usize,
    active: Mutex<Option<ActiveFile>>,
}

impl FileTrafficLogDriver {
    pub fn new(config: &FileDriverConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.directory)?;
        Ok(Self {
            directory: config.directory.clone(),
            prefix: config.prefix.clone(),
            max_file_size: config.max_file_size_mb.max(1) * 1024 * 1024,
            max_file_count: config.max_file_count.max(1),
            active: Mutex::new(None),
        })
    }

    fn open_new_file(&self) -> std::io::Result<ActiveFile> {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let mut path = self.directory.join(format!("{}_{}.log", self.prefix, stamp));

        // Rollovers within the same second get a numeric suffix
        let mut attempt = 1;
        while path.exists() {
            path = self
                .directory
                .join(format!("{}_{}_{}.log", self.prefix, stamp, attempt));
            attempt += 1;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!("Opened traffic log file {}", path.display());

        self.prune_old_files(&path);
        Ok(ActiveFile { file, written: 0 })
    }

    /// Delete the oldest log files beyond the retention count. Timestamped
    /// names sort lexicographically, so a name sort is a time sort.
    fn prune_old_files(&self, active_path: &Path) {
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to list traffic log directory: {}", e);
                return;
            }
        };

        let marker = format!("{}_", self.prefix);
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| {
                        let name = n.to_string_lossy();
                        name.starts_with(&marker) && name.ends_with(".log")
                    })
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        if files.len() <= self.max_file_count {
            return;
        }

        let excess = files.len() - self.max_file_count;
        for path in files.into_iter().take(excess) {
            if path == active_path {
                continue;
            }
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Failed to remove old traffic log {}: {}", path.display(), e);
            }
        }
    }
}

#[async_trait]
impl TrafficLogDriver for FileTrafficLogDriver {
    async fn write_batch(&self, entries: &[TrafficLogEntry]) -> Result<(), TrafficLogError> {
        let mut buffer = String::new();
        for entry in entries {
            buffer.push_str(&serde_json::to_string(entry)?);
            buffer.push('\n');
        }
        let batch_len = buffer.len() as u64;

        let mut active = self.active.lock().await;

        let needs_rollover = match active.as_ref() {
            None => true,
            Some(current) => current.written + batch_len > self.max_file_size,
        };
        if needs_rollover {
            *active = Some(self.open_new_file()?);
        }

        if let Some(current) = active.as_mut() {
            current.file.write_all(buffer.as_bytes())?;
            current.written += batch_len;
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), TrafficLogError> {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_mut() {
            current.file.flush()?;
        }
        *active = None;
        Ok(())
    }
}
