//! Live RDA client over TCP

use super::rda::{self, RdaData, RdaStart};
use super::{SignalSource, SourceEvent};
use crate::error::SourceError;
use crate::types::{Marker, SampleBlock, StreamInfo};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

/// How long to wait for the TCP connection itself
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// How long to wait for the start message after connecting
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 64 * 1024;

/// Connects to an RDA server and turns its messages into source events.
///
/// The global sample index keeps counting across reconnects; samples the
/// server sent while disconnected are simply not part of the stream.
pub struct LiveSource {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    rx: Vec<u8>,
    layout: Option<RdaStart>,
    next_index: u64,
    last_block: Option<u32>,
    queued: VecDeque<SourceEvent>,
}

impl LiveSource {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
            rx: Vec::new(),
            layout: None,
            next_index: 0,
            last_block: None,
            queued: VecDeque::new(),
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn open(&mut self) -> Result<StreamInfo, SourceError> {
        let address = self.address();
        let connect_error = |message: String| SourceError::Connect {
            address: address.clone(),
            message,
        };

        let addr = address
            .to_socket_addrs()
            .map_err(|e| connect_error(e.to_string()))?
            .next()
            .ok_or_else(|| connect_error("address did not resolve".to_string()))?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| connect_error(e.to_string()))?;
        stream.set_nodelay(true)?;

        self.stream = Some(stream);
        self.rx.clear();
        self.last_block = None;

        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let start = loop {
            if let Some(frame) = rda::take_frame(&mut self.rx)? {
                if frame.msg_type == rda::MSG_START {
                    break RdaStart::decode(&frame.payload)?;
                }
                tracing::debug!("Ignoring message type {} before start", frame.msg_type);
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                self.stream = None;
                return Err(connect_error("no start message received".to_string()));
            }
            self.fill(deadline - now)?;
        };

        let info = StreamInfo {
            sample_rate: start.sample_rate(),
            channel_names: start.channel_names.clone(),
        };
        if let Some(previous) = &self.layout {
            if previous.channel_count() != start.channel_count()
                || (previous.sample_rate() - start.sample_rate()).abs() > 1e-9
            {
                self.stream = None;
                return Err(SourceError::Malformed(format!(
                    "Stream layout changed across reconnect: {} ch @ {} Hz -> {} ch @ {} Hz",
                    previous.channel_count(),
                    previous.sample_rate(),
                    start.channel_count(),
                    start.sample_rate()
                )));
            }
        }
        tracing::info!(
            "Connected to {}: {} channels at {} Hz",
            address,
            info.channel_count(),
            info.sample_rate
        );
        self.layout = Some(start);
        Ok(info)
    }

    /// Read whatever arrives within `timeout` into the receive buffer.
    ///
    /// Returns `Ok(false)` on timeout.
    fn fill(&mut self, timeout: Duration) -> Result<bool, SourceError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SourceError::ConnectionLost("not connected".to_string()))?;
        stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let mut chunk = [0u8; READ_CHUNK];
        match stream.read(&mut chunk) {
            Ok(0) => {
                self.stream = None;
                Err(SourceError::ConnectionLost("closed by peer".to_string()))
            }
            Ok(n) => {
                self.rx.extend_from_slice(&chunk[..n]);
                Ok(true)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(false),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(true),
            Err(e) => {
                self.stream = None;
                Err(SourceError::ConnectionLost(e.to_string()))
            }
        }
    }

    fn on_data(&mut self, data: RdaData) -> SourceEvent {
        let layout = match &self.layout {
            Some(l) => l,
            None => return SourceEvent::Timeout,
        };
        let channels = layout.channel_count();

        if let Some(last) = self.last_block {
            let expected = last.wrapping_add(1);
            if data.block != expected {
                tracing::warn!(
                    "RDA block counter jumped from {} to {}; samples were lost upstream",
                    last,
                    data.block
                );
            }
        }
        self.last_block = Some(data.block);

        let scaled: Vec<f64> = data
            .samples
            .iter()
            .enumerate()
            .map(|(i, &v)| v as f64 * layout.resolutions[i % channels])
            .collect();
        let block = SampleBlock::from_interleaved(self.next_index, layout.sample_rate(), channels, &scaled);
        let start = self.next_index;
        self.next_index += block.len() as u64;

        for m in data.markers {
            self.queued.push_back(SourceEvent::Marker(Marker::new(
                start + m.position as u64,
                m.kind,
                m.description,
            )));
        }
        SourceEvent::Block(block)
    }
}

impl SignalSource for LiveSource {
    fn connect(&mut self) -> Result<StreamInfo, SourceError> {
        self.next_index = 0;
        self.layout = None;
        self.queued.clear();
        self.open()
    }

    fn next_event(&mut self, timeout: Duration) -> Result<SourceEvent, SourceError> {
        if let Some(event) = self.queued.pop_front() {
            return Ok(event);
        }

        let deadline = Instant::now() + timeout;
        loop {
            while let Some(frame) = rda::take_frame(&mut self.rx)? {
                match frame.msg_type {
                    rda::MSG_DATA => {
                        let channels = self.layout.as_ref().map(RdaStart::channel_count).unwrap_or(0);
                        let data = RdaData::decode(&frame.payload, channels)?;
                        return Ok(self.on_data(data));
                    }
                    rda::MSG_STOP => {
                        tracing::info!("Server sent stop");
                        return Ok(SourceEvent::EndOfStream);
                    }
                    rda::MSG_START => {
                        tracing::debug!("Ignoring repeated start message");
                    }
                    other => tracing::trace!("Ignoring message type {}", other),
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(SourceEvent::Timeout);
            }
            if !self.fill(deadline - now)? {
                return Ok(SourceEvent::Timeout);
            }
        }
    }

    fn reconnect(&mut self) -> Result<StreamInfo, SourceError> {
        self.stream = None;
        self.queued.clear();
        self.open()
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.rx.clear();
    }

    fn describe(&self) -> String {
        format!("RDA {}", self.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::rda::RdaMarker;
    use std::io::Write;
    use std::net::TcpListener;

    fn layout() -> RdaStart {
        RdaStart {
            sampling_interval_us: 4000.0,
            resolutions: vec![0.5, 2.0],
            channel_names: vec!["C3".into(), "C4".into()],
        }
    }

    fn data(block: u32, markers: Vec<RdaMarker>) -> Vec<u8> {
        RdaData {
            block,
            points: 2,
            samples: vec![1.0, 1.0, 2.0, 2.0],
            markers,
        }
        .encode()
    }

    #[test]
    fn test_blocks_and_markers_from_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(&layout().encode()).unwrap();
            conn.write_all(&data(0, Vec::new())).unwrap();
            let marker = RdaMarker {
                position: 1,
                points: 1,
                channel: -1,
                kind: "Stimulus".into(),
                description: "S  1".into(),
            };
            conn.write_all(&data(1, vec![marker])).unwrap();
            conn.write_all(&rda::encode_stop()).unwrap();
        });

        let mut source = LiveSource::new("127.0.0.1", port);
        let info = source.connect().unwrap();
        assert_eq!(info.sample_rate, 250.0);
        assert_eq!(info.channel_names, vec!["C3", "C4"]);

        let mut events = Vec::new();
        loop {
            match source.next_event(Duration::from_secs(2)).unwrap() {
                SourceEvent::Timeout => continue,
                SourceEvent::EndOfStream => break,
                event => events.push(event),
            }
        }
        server.join().unwrap();

        assert_eq!(events.len(), 3);
        match &events[0] {
            SourceEvent::Block(b) => {
                assert_eq!(b.start_index, 0);
                assert_eq!(b.data[0], vec![0.5, 1.0]);
                assert_eq!(b.data[1], vec![2.0, 4.0]);
            }
            other => panic!("expected block, got {:?}", other),
        }
        match &events[1] {
            SourceEvent::Block(b) => assert_eq!(b.start_index, 2),
            other => panic!("expected block, got {:?}", other),
        }
        match &events[2] {
            SourceEvent::Marker(m) => {
                assert_eq!(m.onset, 3);
                assert_eq!(m.kind, "Stimulus");
                assert_eq!(m.description, "S  1");
            }
            other => panic!("expected marker, got {:?}", other),
        }
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut source = LiveSource::new("127.0.0.1", port);
        let err = source.connect().unwrap_err();
        assert!(matches!(err, SourceError::Connect { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_peer_close_is_connection_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(&layout().encode()).unwrap();
        });

        let mut source = LiveSource::new("127.0.0.1", port);
        source.connect().unwrap();
        server.join().unwrap();

        let result = loop {
            match source.next_event(Duration::from_millis(500)) {
                Ok(SourceEvent::Timeout) => continue,
                other => break other,
            }
        };
        assert!(matches!(result, Err(SourceError::ConnectionLost(_))));
    }
}
