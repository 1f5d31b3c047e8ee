//! Append-only activity journal.
//!
//! One newline-delimited JSON file per run. Every entry is flushed as soon
//! as it is written so the file is usable after a crash or power loss.
//!
//! ```text
//! {"timestamp":"2025-03-14T09:26:53.123456+01:00","event_type":"sensor_block_updated","details":{"block_size":6}}
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local, SecondsFormat};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::JournalConfig;

/// One journal line.
#[derive(Debug, Serialize)]
struct JournalEntry<'a> {
    timestamp: String,
    event_type: &'a str,
    details: serde_json::Value,
}

#[derive(Debug)]
struct JournalInner {
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
}

/// Shared handle to the run's journal file.
///
/// Clones write to the same file. I/O failures are reported through
/// `tracing` and never returned to the caller.
#[derive(Debug, Clone)]
pub struct Journal {
    inner: Arc<Mutex<JournalInner>>,
}

impl Journal {
    /// Open the journal described by the configuration.
    ///
    /// Falls back to a disabled journal when the directory or file cannot be
    /// created.
    pub fn open(config: &JournalConfig) -> Self {
        if !config.enabled {
            tracing::info!("Activity journal disabled by configuration");
            return Self::disabled();
        }
        Self::open_at(&config.dir, &config.file_prefix, Local::now())
    }

    /// Open a journal file named after `started` inside `dir`.
    pub fn open_at(dir: &Path, prefix: &str, started: DateTime<Local>) -> Self {
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::error!(dir = %dir.display(), error = %e, "Could not create journal directory, journal disabled");
            return Self::disabled();
        }

        let path = dir.join(file_name(prefix, started));
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                tracing::info!(path = %path.display(), "Logging activity to journal");
                Self {
                    inner: Arc::new(Mutex::new(JournalInner {
                        writer: Some(BufWriter::new(file)),
                        path: Some(path),
                    })),
                }
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Could not open journal file, journal disabled");
                Self::disabled()
            }
        }
    }

    /// A journal that drops every entry.
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(Mutex::new(JournalInner {
                writer: None,
                path: None,
            })),
        }
    }

    /// Path of the journal file, if one is open.
    pub fn path(&self) -> Option<PathBuf> {
        self.inner.lock().path.clone()
    }

    /// Whether entries are being written.
    pub fn is_enabled(&self) -> bool {
        self.inner.lock().writer.is_some()
    }

    /// Append an entry.
    pub fn record(&self, event_type: &str, details: serde_json::Value) {
        let mut inner = self.inner.lock();
        let Some(writer) = inner.writer.as_mut() else {
            return;
        };

        let entry = JournalEntry {
            timestamp: Local::now().to_rfc3339_opts(SecondsFormat::Micros, false),
            event_type,
            details,
        };

        let result = serde_json::to_writer(&mut *writer, &entry)
            .map_err(std::io::Error::from)
            .and_then(|()| writer.write_all(b"\n"))
            .and_then(|()| writer.flush());

        if let Err(e) = result {
            tracing::error!(event_type = %event_type, error = %e, "Failed to write journal entry");
        }
    }

    /// Flush and close the file. Later entries are dropped.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if let Some(mut writer) = inner.writer.take() {
            if let Err(e) = writer.flush() {
                tracing::error!(error = %e, "Failed to flush journal on close");
            }
            if let Some(path) = &inner.path {
                tracing::info!(path = %path.display(), "Journal closed");
            }
        }
    }
}

fn file_name(prefix: &str, started: DateTime<Local>) -> String {
    format!("{}_{}.jsonl", prefix, started.format("%Y-%m-%d_%H-%M-%S"))
}
