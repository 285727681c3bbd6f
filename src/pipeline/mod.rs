//! Streaming pipeline.
//!
//! Samples and markers flow from a source through the stream buffer into the
//! ERD calculator, and results flow out to the broadcaster and the session
//! store. The pipeline runs on a dedicated thread and reports to its caller
//! via crossbeam channels.
//!
//! # Architecture
//!
//! ```text
//! [SignalSource] ──► [StreamBuffer] ──► [ErdCalculator] ──► [BroadcastServer]
//!        │                                     └──────────► [SessionBridge]
//!        └──────────► [SessionWriter]
//! ```
//!
//! # Design
//!
//! - **Single owner**: the computation loop alone owns the buffer.
//! - **Never block on I/O**: broadcast, persistence and status all sit behind
//!   bounded channels.
//! - **Dedicated thread**: a session runs independently and is stopped with a
//!   cooperative flag.

pub mod bridge;
pub mod buffer;
pub mod executor;

pub use bridge::{SessionBridge, SessionMessage};
pub use buffer::{ExtractionRequest, StreamBuffer};
pub use executor::{Session, SessionHandle, SessionSummary};
