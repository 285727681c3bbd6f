//! Signal sources
//!
//! A [`SignalSource`] yields sample blocks and markers tagged with a
//! monotonically increasing global sample index, so everything downstream is
//! agnostic to where samples come from. Two implementations exist:
//!
//! - [`LiveSource`]: RDA-style TCP feed from an amplifier (or the mock server)
//! - [`EmulatedSource`]: replay of a session persisted by this crate
//!
//! [`mock_server`] serves synthetic data over the same protocol as a live
//! amplifier.
//!
//! The concrete source is picked once per session by [`create_source`].

pub mod emulated;
pub mod live;
pub mod mock_server;
pub mod rda;
pub mod retry;

pub use emulated::EmulatedSource;
pub use live::LiveSource;
pub use retry::RetryPolicy;

use crate::config::{SessionConfig, SourceSettings};
use crate::error::SourceError;
use crate::types::{Marker, SampleBlock, StreamInfo};
use std::time::Duration;

/// One step of a source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// New samples, contiguous with the previous block
    Block(SampleBlock),
    /// A marker; always reported after the block containing its onset
    Marker(Marker),
    /// The source has no more data
    EndOfStream,
    /// Nothing arrived within the poll timeout
    Timeout,
}

/// Uniform interface over live and replayed streams.
#[cfg_attr(test, mockall::automock)]
pub trait SignalSource: Send {
    /// Open the source and report its layout.
    fn connect(&mut self) -> Result<StreamInfo, SourceError>;

    /// Wait at most `timeout` for the next event.
    fn next_event(&mut self, timeout: Duration) -> Result<SourceEvent, SourceError>;

    /// Re-open after a connection loss. Sample indices continue where they
    /// left off.
    fn reconnect(&mut self) -> Result<StreamInfo, SourceError>;

    /// Release the underlying connection or file.
    fn disconnect(&mut self);

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

/// Build the source selected by the configuration.
pub fn create_source(config: &SessionConfig) -> Box<dyn SignalSource> {
    match &config.source {
        SourceSettings::Live { host, port, .. } => Box::new(LiveSource::new(host.clone(), *port)),
        SourceSettings::Emulated {
            dir,
            session,
            speed,
        } => Box::new(EmulatedSource::new(dir.clone(), session.clone(), *speed)),
    }
}

/// Poll timeout used by the computation loop for the configured source.
pub fn poll_timeout(config: &SessionConfig) -> Duration {
    match &config.source {
        SourceSettings::Live {
            read_timeout_ms, ..
        } => Duration::from_millis((*read_timeout_ms).max(1)),
        SourceSettings::Emulated { .. } => Duration::from_millis(crate::config::DEFAULT_READ_TIMEOUT_MS),
    }
}
