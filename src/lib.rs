//! # erd-stream: real-time event-related desynchronization
//!
//! Streams multichannel EEG from an amplifier (or a replayed recording),
//! cuts marker-locked epochs out of the stream and computes ERD/ERS per
//! marker. Results are broadcast to TCP consumers as JSON lines while the raw
//! stream is persisted for offline analysis.
//!
//! ## Architecture
//!
//! - **Source**: RDA-style TCP client or replay of a persisted session
//! - **Pipeline**: ring buffer, epoch extraction and the session state machine
//! - **Analysis**: zero-phase Butterworth band-pass, CAR and the ERD metrics
//! - **Broadcast**: per-consumer writer threads fed by bounded queues
//! - **Session**: `.npy` raw store, marker CSV and session metadata
//!
//! ## Configuration
//!
//! Sessions are configured from a TOML file (`erd-stream.toml` by default).
//! Persisted sessions go to the platform data directory under `erd-stream`
//! unless `persistence.output_dir` is set:
//!
//! - **Linux**: `~/.local/share/erd-stream/sessions/`
//! - **macOS**: `~/Library/Application Support/erd-stream/sessions/`
//! - **Windows**: `%APPDATA%\erd-stream\sessions\`
//!
//! ## Example
//!
//! ```ignore
//! use erd_stream::{config::SessionConfig, pipeline::Session};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = SessionConfig::load("erd-stream.toml")?;
//!     let handle = Session::from_config(config)?.spawn()?;
//!
//!     // ... later
//!     handle.stop();
//!     let summary = handle.join()?;
//!     println!("{} results", summary.results());
//!     Ok(())
//! }
//! ```

pub mod analysis;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod source;
pub mod types;

// Re-export commonly used types
pub use config::SessionConfig;
pub use error::{ErdError, Result, SourceError};
pub use pipeline::{Session, SessionHandle, SessionSummary};
pub use types::{ErdMethod, ErdResult, Marker, PipelineState, SampleBlock};
