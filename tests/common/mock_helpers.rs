//! Session, consumer and server helpers

use erd_stream::pipeline::{Session, SessionMessage, SessionSummary};
use erd_stream::source::mock_server::{MockRdaServer, MockServerConfig};
use erd_stream::types::{ErdResult, PipelineState};
use std::io::{BufRead, BufReader};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

/// Everything a finished session reported on its bridge
pub struct SessionRun {
    pub summary: SessionSummary,
    pub results: Vec<ErdResult>,
    pub overruns: Vec<(String, u64)>,
    pub states: Vec<PipelineState>,
}

/// Spawn `session` and collect its messages until it finishes.
///
/// The session is stopped if it is still running after `limit`.
pub fn run_to_completion(session: Session, limit: Duration) -> SessionRun {
    let handle = session.spawn().unwrap();
    let deadline = Instant::now() + limit;
    let mut results = Vec::new();
    let mut overruns = Vec::new();
    let mut states = Vec::new();

    let mut collect = |msg: SessionMessage| match msg {
        SessionMessage::Result(r) => results.push(r),
        SessionMessage::Overrun { description, onset } => overruns.push((description, onset)),
        SessionMessage::StateChanged(s) => states.push(s),
        _ => {}
    };

    while !handle.is_finished() {
        if Instant::now() >= deadline {
            handle.stop();
        }
        if let Some(msg) = handle.bridge().recv_timeout(Duration::from_millis(20)) {
            collect(msg);
        }
    }
    for msg in handle.bridge().drain() {
        collect(msg);
    }
    let summary = handle.join().unwrap();
    SessionRun {
        summary,
        results,
        overruns,
        states,
    }
}

/// Connect a broadcast consumer.
pub fn connect_consumer(addr: SocketAddr) -> BufReader<TcpStream> {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    BufReader::new(stream)
}

/// Read `n` JSON lines from a consumer connection.
pub fn read_records(reader: &mut BufReader<TcpStream>, n: usize) -> Vec<serde_json::Value> {
    (0..n)
        .map(|_| {
            let mut line = String::new();
            let read = reader.read_line(&mut line).unwrap();
            assert!(read > 0, "connection closed early");
            serde_json::from_str(line.trim_end()).unwrap()
        })
        .collect()
}

/// Read until the server closes the connection.
pub fn read_until_closed(reader: &mut BufReader<TcpStream>) -> Vec<serde_json::Value> {
    let mut records = Vec::new();
    let mut line = String::new();
    while let Ok(n) = reader.read_line(&mut line) {
        if n == 0 {
            break;
        }
        records.push(serde_json::from_str(line.trim_end()).unwrap());
        line.clear();
    }
    records
}

/// Start a mock RDA server on an ephemeral localhost port.
pub fn start_mock_server(config: MockServerConfig) -> MockRdaServer {
    MockRdaServer::start("127.0.0.1:0", config).unwrap()
}

/// A small noiseless mock stream: 4 channels at 250 Hz in 50 ms chunks.
pub fn small_mock_config() -> MockServerConfig {
    MockServerConfig {
        channel_names: ["C3", "C4", "Cz", "Pz"].iter().map(|s| s.to_string()).collect(),
        sample_rate: 250.0,
        chunk: 25,
        marker_interval: Duration::from_secs(2),
        noise: 0.0,
        ..Default::default()
    }
}
