//! Session persistence
//!
//! Every session can be written to disk as three files sharing a prefix:
//!
//! - `<session>_raw.npy`: all samples as a `(channels, samples)` float64 array
//! - `<session>_markers.csv`: one row per marker received from the source
//! - `<session>_session.json`: channel layout, sampling rate and completion state
//!
//! Writing happens on a dedicated thread ([`SessionWriter`]); reading back is
//! done by [`RecordedSession`], which both the emulated source and offline
//! trial analysis use.

pub mod markers;
pub mod npy;
pub mod recording;
pub mod types;
pub mod writer;

pub use recording::RecordedSession;
pub use types::{PersistenceReport, SessionMetadata, SessionPaths};
pub use writer::SessionWriter;
