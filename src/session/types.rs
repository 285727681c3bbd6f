//! Session persistence data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File locations for one persisted session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPaths {
    pub raw: PathBuf,
    pub markers: PathBuf,
    pub metadata: PathBuf,
}

impl SessionPaths {
    pub fn new(dir: impl AsRef<Path>, session: &str) -> Self {
        let dir = dir.as_ref();
        Self {
            raw: dir.join(format!("{session}_raw.npy")),
            markers: dir.join(format!("{session}_markers.csv")),
            metadata: dir.join(format!("{session}_session.json")),
        }
    }
}

/// Metadata written next to the raw store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Session name, also the file prefix
    pub name: String,
    pub channel_names: Vec<String>,
    /// Sampling rate in Hz
    pub sample_rate: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Samples per channel in the raw store
    pub total_samples: u64,
    pub marker_count: u64,
    /// False when any write failed or was dropped
    pub complete: bool,
}

impl SessionMetadata {
    pub fn new(name: impl Into<String>, channel_names: Vec<String>, sample_rate: f64) -> Self {
        Self {
            name: name.into(),
            channel_names,
            sample_rate,
            started_at: Utc::now(),
            ended_at: None,
            total_samples: 0,
            marker_count: 0,
            complete: true,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channel_names.len()
    }

    /// Recorded duration in seconds
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate > 0.0 {
            self.total_samples as f64 / self.sample_rate
        } else {
            0.0
        }
    }
}

/// Outcome of a session's persistence, returned by the writer on shutdown
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistenceReport {
    pub session: String,
    pub directory: PathBuf,
    pub samples_written: u64,
    pub markers_written: u64,
    /// Write failures on the writer thread
    pub write_errors: u64,
    /// Items that could not be enqueued in time
    pub dropped: u64,
    pub complete: bool,
}

impl PersistenceReport {
    /// Report for a session that was not persisted at all
    pub fn disabled() -> Self {
        Self {
            complete: true,
            ..Default::default()
        }
    }

    /// Report for a session whose store could not be created
    pub fn start_failed(session: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            session: session.into(),
            directory: directory.into(),
            write_errors: 1,
            complete: false,
            ..Default::default()
        }
    }
}
