//! Sub-sections of the session configuration
//!
//! These are nested tables in the TOML file (`[source]`, `[persistence]`,
//! `[logging]`); the flat analysis and broadcast keys live on
//! [`super::SessionConfig`] itself.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default RDA port of the amplifier's remote data access server
pub const DEFAULT_RDA_PORT: u16 = 51244;

/// Default socket read timeout for the live source
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 100;

/// Where samples come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSettings {
    /// RDA-style TCP feed
    Live {
        host: String,
        port: u16,
        /// Socket read timeout; bounds how long one loop iteration can block
        #[serde(default = "default_read_timeout_ms")]
        read_timeout_ms: u64,
        #[serde(default)]
        retry: RetrySettings,
    },
    /// Replay of a session persisted by this crate
    Emulated {
        /// Directory holding the session files
        dir: PathBuf,
        /// Session name (file prefix)
        session: String,
        /// Playback speed multiplier; 0 replays as fast as possible
        #[serde(default = "default_speed")]
        speed: f64,
    },
}

impl Default for SourceSettings {
    fn default() -> Self {
        SourceSettings::Live {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_RDA_PORT,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            retry: RetrySettings::default(),
        }
    }
}

impl std::fmt::Display for SourceSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceSettings::Live { host, port, .. } => write!(f, "live {}:{}", host, port),
            SourceSettings::Emulated {
                dir,
                session,
                speed,
            } => write!(f, "emulated {}/{} at {}x", dir.display(), session, speed),
        }
    }
}

fn default_read_timeout_ms() -> u64 {
    DEFAULT_READ_TIMEOUT_MS
}

fn default_speed() -> f64 {
    1.0
}

/// Reconnect policy for the live source (bounded exponential backoff).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Reconnect attempts before the session fails
    pub max_retries: u32,
    /// Delay before the first attempt
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay
    pub max_delay_ms: u64,
    /// Growth factor between attempts
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 250,
            max_delay_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl RetrySettings {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Raw stream and marker log persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    pub enabled: bool,
    /// Output directory; `None` uses the platform data directory
    pub output_dir: Option<PathBuf>,
    /// File prefix; `None` derives one from the start time
    pub session_name: Option<String>,
    /// Writer queue depth, in messages
    pub queue_capacity: usize,
    /// How long the computation loop may wait to enqueue a write
    pub enqueue_timeout_ms: u64,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: None,
            session_name: None,
            queue_capacity: 4096,
            enqueue_timeout_ms: 5,
        }
    }
}

/// Log output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Directory for daily-rolling log files; console only when unset
    pub log_dir: Option<PathBuf>,
    /// Filter directive used when `RUST_LOG` is not set
    pub filter: Option<String>,
}
