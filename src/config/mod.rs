//! Configuration module for erd-stream
//!
//! A session is described by one TOML file that is loaded and validated once,
//! then shared read-only (`Arc<SessionConfig>`) by every component.
//!
//! # Example
//!
//! ```toml
//! sampling_freq = 500.0
//! epoch_pre_stimulus_seconds = 2.0
//! epoch_post_stimulus_seconds = 2.0
//! bandpass_low = 8.0
//! bandpass_high = 13.0
//! focus_channels_indices = [7, 39, 42, 11]
//! focus_markers = ["S  1", "S  2"]
//!
//! [marker_labels]
//! "S  1" = "thumb"
//! "S  2" = "index"
//!
//! [source]
//! kind = "live"
//! host = "169.254.1.147"
//! port = 51244
//! ```
//!
//! # Data Location
//!
//! When `persistence.output_dir` is unset, sessions are written below the
//! platform data directory:
//! - **Linux**: `~/.local/share/erd-stream/sessions/`
//! - **macOS**: `~/Library/Application Support/erd-stream/sessions/`
//! - **Windows**: `%APPDATA%\erd-stream\sessions\`

pub mod settings;

pub use settings::*;

use crate::error::{ErdError, Result};
use crate::types::{ErdMethod, StreamInfo, WindowScale};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Application identifier for data directories
pub const APP_ID: &str = "erd-stream";

/// Default TOML file looked up when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "erd-stream.toml";

/// Minimum history the buffer keeps regardless of epoch length
pub const MIN_RETENTION_SECONDS: f64 = 10.0;

/// Retention multiple of the epoch length
pub const RETENTION_EPOCH_FACTOR: f64 = 1.5;

/// Default broadcast port
pub const DEFAULT_BROADCAST_PORT: u16 = 50000;

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Session configuration consumed by every pipeline component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Expected sampling rate in Hz; must match the source
    pub sampling_freq: f64,
    /// Baseline length before each marker
    pub epoch_pre_stimulus_seconds: f64,
    /// Analysis length from each marker on
    pub epoch_post_stimulus_seconds: f64,
    /// Band-pass low cutoff in Hz
    pub bandpass_low: f64,
    /// Band-pass high cutoff in Hz
    pub bandpass_high: f64,
    /// Butterworth order
    pub filter_order: usize,
    /// Expected channel names; empty adopts the source's names
    pub channel_names: Vec<String>,
    /// Channels reported in results; empty means all channels
    pub focus_channels_indices: Vec<usize>,
    /// Metric computed for each marker
    pub method: ErdMethod,
    /// Moving-window length in samples
    pub moving_average_window_size: usize,
    pub moving_window_scale: WindowScale,
    /// Marker descriptions that trigger an epoch; empty accepts all
    pub focus_markers: Vec<String>,
    /// Category label per marker description
    pub marker_labels: BTreeMap<String, String>,
    /// Explicit buffer retention; derived from the epoch length when unset
    pub buffer_retention_seconds: Option<f64>,
    /// Extra history kept beyond the epoch length
    pub buffer_safety_margin_seconds: f64,
    pub broadcast_enabled: bool,
    pub broadcast_host: String,
    pub broadcast_port: u16,
    /// Outgoing records queued per consumer before it is dropped
    pub broadcast_queue_capacity: usize,
    pub source: SourceSettings,
    pub persistence: PersistenceSettings,
    pub logging: LoggingSettings,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sampling_freq: 500.0,
            epoch_pre_stimulus_seconds: 2.0,
            epoch_post_stimulus_seconds: 2.0,
            bandpass_low: 8.0,
            bandpass_high: 13.0,
            filter_order: 5,
            channel_names: Vec::new(),
            focus_channels_indices: Vec::new(),
            method: ErdMethod::BandpassPower,
            moving_average_window_size: 100,
            moving_window_scale: WindowScale::Percent,
            focus_markers: Vec::new(),
            marker_labels: BTreeMap::new(),
            buffer_retention_seconds: None,
            buffer_safety_margin_seconds: 1.0,
            broadcast_enabled: true,
            broadcast_host: "127.0.0.1".to_string(),
            broadcast_port: DEFAULT_BROADCAST_PORT,
            broadcast_queue_capacity: 64,
            source: SourceSettings::default(),
            persistence: PersistenceSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl SessionConfig {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ErdError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config = Self::from_toml(&content)
            .map_err(|e| e.with_context(format!("Invalid config file {:?}", path)))?;
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ErdError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file, returning defaults if it does not exist
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Save the configuration as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| ErdError::Serialization(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            ErdError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    /// Check internal consistency. Stream-dependent checks happen in
    /// [`SessionConfig::bind_stream`].
    pub fn validate(&self) -> Result<()> {
        let fs = self.sampling_freq;
        if !(fs.is_finite() && fs > 0.0) {
            return Err(ErdError::Config(format!(
                "sampling_freq must be positive, got {}",
                fs
            )));
        }
        if !(self.epoch_pre_stimulus_seconds > 0.0 && self.epoch_post_stimulus_seconds > 0.0) {
            return Err(ErdError::Config(
                "epoch_pre_stimulus_seconds and epoch_post_stimulus_seconds must be positive"
                    .to_string(),
            ));
        }
        if self.pre_samples() == 0 || self.post_samples() == 0 {
            return Err(ErdError::Config(format!(
                "Epoch segments are shorter than one sample at {} Hz",
                fs
            )));
        }
        if !(self.bandpass_low > 0.0
            && self.bandpass_low < self.bandpass_high
            && self.bandpass_high < fs / 2.0)
        {
            return Err(ErdError::Config(format!(
                "Band {}-{} Hz must satisfy 0 < low < high < Nyquist ({} Hz)",
                self.bandpass_low,
                self.bandpass_high,
                fs / 2.0
            )));
        }
        if !(1..=10).contains(&self.filter_order) {
            return Err(ErdError::Config(format!(
                "filter_order must be between 1 and 10, got {}",
                self.filter_order
            )));
        }
        if !self.channel_names.is_empty() {
            self.check_focus_indices(self.channel_names.len())?;
        }
        if self.method == ErdMethod::MovingWindow {
            let w = self.moving_average_window_size;
            if w == 0 || w > self.post_samples() {
                return Err(ErdError::Config(format!(
                    "moving_average_window_size must be in 1..={} samples, got {}",
                    self.post_samples(),
                    w
                )));
            }
        }
        if !self.marker_labels.is_empty() {
            let missing: Vec<&str> = self
                .focus_markers
                .iter()
                .filter(|m| !self.marker_labels.contains_key(*m))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(ErdError::Config(format!(
                    "marker_labels has no entry for focus markers {:?}",
                    missing
                )));
            }
        }
        if let Some(seconds) = self.buffer_retention_seconds {
            if !(seconds.is_finite() && seconds > 0.0) {
                return Err(ErdError::Config(format!(
                    "buffer_retention_seconds must be positive, got {}",
                    seconds
                )));
            }
        }
        if self.buffer_safety_margin_seconds < 0.0 {
            return Err(ErdError::Config(
                "buffer_safety_margin_seconds must not be negative".to_string(),
            ));
        }
        if self.broadcast_queue_capacity == 0 || self.persistence.queue_capacity == 0 {
            return Err(ErdError::Config(
                "Queue capacities must be at least 1".to_string(),
            ));
        }
        if let SourceSettings::Emulated { speed, .. } = &self.source {
            if !(speed.is_finite() && *speed >= 0.0) {
                return Err(ErdError::Config(format!(
                    "Emulated speed must be >= 0, got {}",
                    speed
                )));
            }
        }
        Ok(())
    }

    fn check_focus_indices(&self, channel_count: usize) -> Result<()> {
        if let Some(bad) = self
            .focus_channels_indices
            .iter()
            .find(|&&i| i >= channel_count)
        {
            return Err(ErdError::Config(format!(
                "Focus channel index {} out of range for {} channels",
                bad, channel_count
            )));
        }
        Ok(())
    }

    /// Reconcile the configuration with what the source reports.
    ///
    /// Returns the effective channel names.
    pub fn bind_stream(&self, info: &StreamInfo) -> Result<Vec<String>> {
        if (info.sample_rate - self.sampling_freq).abs() > 1e-6 {
            return Err(ErdError::Config(format!(
                "Source samples at {} Hz but sampling_freq is {} Hz",
                info.sample_rate, self.sampling_freq
            )));
        }
        if info.channel_count() == 0 {
            return Err(ErdError::Config("Source reports no channels".to_string()));
        }
        if !self.channel_names.is_empty() && self.channel_names.len() != info.channel_count() {
            return Err(ErdError::Config(format!(
                "Configured {} channel names but source has {} channels",
                self.channel_names.len(),
                info.channel_count()
            )));
        }
        self.check_focus_indices(info.channel_count())?;

        if self.channel_names.is_empty() {
            Ok(info.channel_names.clone())
        } else {
            if self.channel_names != info.channel_names {
                tracing::warn!("Configured channel names differ from the source's; using configured names");
            }
            Ok(self.channel_names.clone())
        }
    }

    /// Baseline length in samples
    pub fn pre_samples(&self) -> usize {
        (self.epoch_pre_stimulus_seconds * self.sampling_freq).round() as usize
    }

    /// Post-stimulus length in samples
    pub fn post_samples(&self) -> usize {
        (self.epoch_post_stimulus_seconds * self.sampling_freq).round() as usize
    }

    pub fn epoch_samples(&self) -> usize {
        self.pre_samples() + self.post_samples()
    }

    pub fn safety_margin_samples(&self) -> usize {
        (self.buffer_safety_margin_seconds * self.sampling_freq).ceil() as usize
    }

    /// Smallest retention that can serve every marker: `pre + post + margin`.
    pub fn required_retention_samples(&self) -> usize {
        self.epoch_samples() + self.safety_margin_samples()
    }

    /// Ring buffer capacity in samples per channel.
    pub fn retention_samples(&self) -> usize {
        match self.buffer_retention_seconds {
            Some(seconds) => ((seconds * self.sampling_freq).ceil() as usize).max(1),
            None => {
                let base = (MIN_RETENTION_SECONDS * self.sampling_freq)
                    .max(RETENTION_EPOCH_FACTOR * self.epoch_samples() as f64);
                base.ceil() as usize + self.safety_margin_samples()
            }
        }
    }

    /// Focus channel indices for a stream with `channel_count` channels
    pub fn focus_indices(&self, channel_count: usize) -> Vec<usize> {
        if self.focus_channels_indices.is_empty() {
            (0..channel_count).collect()
        } else {
            self.focus_channels_indices.clone()
        }
    }

    /// Whether a marker description should open an epoch
    pub fn accepts_marker(&self, description: &str) -> bool {
        self.focus_markers.is_empty() || self.focus_markers.iter().any(|m| m == description)
    }

    /// Category a marker description is aggregated under
    pub fn category<'a>(&'a self, description: &'a str) -> &'a str {
        self.marker_labels
            .get(description)
            .map(String::as_str)
            .unwrap_or(description)
    }

    /// Directory session files are written to
    pub fn output_dir(&self) -> PathBuf {
        self.persistence.output_dir.clone().unwrap_or_else(|| {
            app_data_dir()
                .map(|p| p.join("sessions"))
                .unwrap_or_else(|| PathBuf::from("sessions"))
        })
    }
}
