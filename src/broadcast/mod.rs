//! Result broadcasting
//!
//! Downstream consumers (feedback displays, loggers) connect over TCP and
//! receive one JSON object per line for every marker, in marker order.
//! Consumers only see results produced after they connected.

pub mod server;

pub use server::BroadcastServer;
