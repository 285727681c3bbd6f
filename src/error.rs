//! Error handling for erd-stream
//!
//! This module defines the error types and a Result alias used throughout
//! the pipeline. Only a [`SourceError`] that survives the reconnect policy, or
//! an explicit stop, ends a session; every other error is contained locally.

use thiserror::Error;

/// Errors raised by a signal source (live feed or replay).
#[derive(Error, Debug)]
pub enum SourceError {
    /// The initial connection attempt failed
    #[error("Failed to connect to {address}: {message}")]
    Connect { address: String, message: String },

    /// An established connection went away
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A message on the wire or in the recording could not be decoded
    #[error("Malformed data: {0}")]
    Malformed(String),

    /// Reconnecting failed more often than the retry policy allows
    #[error("Gave up after {attempts} reconnect attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// IO errors from the underlying transport
    #[error("Source IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    /// Whether the retry policy should attempt a reconnect for this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SourceError::RetriesExhausted { .. })
    }
}

/// Main error type for erd-stream operations
#[derive(Error, Debug)]
pub enum ErdError {
    /// Errors from the signal source
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// A pending extraction outlived the retained history
    #[error(
        "Buffer overrun for marker '{description}' at sample {onset}: \
         window starts at {required_start} but oldest retained sample is {oldest_retained}"
    )]
    BufferOverrun {
        description: String,
        onset: u64,
        required_start: i64,
        oldest_retained: u64,
    },

    /// Invalid epoch shape or non-finite samples during preprocessing
    #[error("Computation error: {0}")]
    Computation(String),

    /// Consumer write failure or queue saturation
    #[error("Broadcast error: {0}")]
    Broadcast(String),

    /// Failure writing the raw store, marker log or metadata
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Errors related to configuration loading/validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<ErdError>,
    },
}

impl ErdError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        ErdError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether this error (ignoring context wrappers) is fatal for a session.
    pub fn is_fatal(&self) -> bool {
        match self {
            ErdError::Source(e) => !e.is_recoverable(),
            ErdError::WithContext { source, .. } => source.is_fatal(),
            _ => false,
        }
    }
}

/// Result type alias for erd-stream operations
pub type Result<T> = std::result::Result<T, ErdError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, SourceError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| ErdError::from(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| ErdError::from(e).with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| ErdError::from(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| ErdError::from(e).with_context(f()))
    }
}
