//! Thread boundary between a running session and whoever started it.
//!
//! The session thread publishes [`SessionMessage`]s with `try_send`, so a
//! caller that never drains the channel cannot stall acquisition; messages
//! that do not fit are counted in the session stats instead.

use crate::types::{ErdResult, PipelineState, SessionStats};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::time::Duration;

/// Messages sent from the session thread.
#[derive(Debug, Clone)]
pub enum SessionMessage {
    /// The session moved to a new lifecycle state.
    StateChanged(PipelineState),

    /// The source reported its layout.
    Connected {
        sample_rate: f64,
        channel_names: Vec<String>,
    },

    /// A marker produced a result (possibly wholly undefined).
    Result(ErdResult),

    /// A marker was abandoned because its baseline left the buffer.
    Overrun { description: String, onset: u64 },

    /// Periodic counters.
    Stats(SessionStats),

    /// The session is ending because of this error.
    Error(String),
}

/// Channel capacity for messages (session → caller).
/// 10,000 messages is far more than a session produces between drains.
const MSG_CHANNEL_CAPACITY: usize = 10_000;

/// Caller-side end of the status channel.
pub struct SessionBridge {
    pub msg_rx: Receiver<SessionMessage>,
}

impl SessionBridge {
    /// Create a new bridge pair: `(bridge_for_caller, msg_tx)`.
    ///
    /// The session thread owns `msg_tx`.
    pub fn new() -> (Self, Sender<SessionMessage>) {
        let (msg_tx, msg_rx) = bounded(MSG_CHANNEL_CAPACITY);
        (Self { msg_rx }, msg_tx)
    }

    /// Drain all pending messages.
    pub fn drain(&self) -> Vec<SessionMessage> {
        let mut msgs = Vec::new();
        while let Ok(msg) = self.msg_rx.try_recv() {
            msgs.push(msg);
        }
        msgs
    }

    /// Try to receive a single message without blocking.
    pub fn try_recv(&self) -> Option<SessionMessage> {
        self.msg_rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next message.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SessionMessage> {
        self.msg_rx.recv_timeout(timeout).ok()
    }
}
