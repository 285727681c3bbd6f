//! Mock RDA server for development without an amplifier
//!
//! Serves synthetic EEG to every connected client over the RDA protocol:
//! per channel `i`, a `3 + 0.5·i` Hz and a `10 + 0.7·i` Hz sinusoid plus
//! uniform noise, with a marker every few seconds.
//!
//! # Example
//!
//! ```ignore
//! use erd_stream::source::mock_server::{MockRdaServer, MockServerConfig};
//!
//! let server = MockRdaServer::start("127.0.0.1:51244", MockServerConfig::default())?;
//! // ... connect a LiveSource to server.local_addr()
//! server.stop();
//! ```

use super::rda::{encode_stop, RdaData, RdaMarker, RdaStart};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::io::{ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// What the mock server sends
#[derive(Debug, Clone, PartialEq)]
pub struct MockServerConfig {
    pub channel_names: Vec<String>,
    pub sample_rate: f64,
    /// Microvolts per raw unit
    pub resolution: f64,
    /// Samples per data message
    pub chunk: usize,
    pub marker_interval: Duration,
    pub marker_kind: String,
    /// Descriptions picked at random for each marker
    pub marker_descriptions: Vec<String>,
    /// Amplitude of the slow sinusoid on the first channel, in µV
    pub amplitude: f64,
    /// Peak uniform noise, in µV
    pub noise: f64,
    /// Send a stop message and exit after this long; run until stopped when unset
    pub duration: Option<Duration>,
    /// Pace messages in real time; when false, send as fast as possible
    pub realtime: bool,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            channel_names: ["Fp1", "Fp2", "C3", "C4", "Pz", "O1", "O2", "Cz"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            sample_rate: 500.0,
            resolution: 0.1,
            chunk: 50,
            marker_interval: Duration::from_secs(3),
            marker_kind: "Event".to_string(),
            marker_descriptions: vec!["Stimulus A".to_string(), "Stimulus B".to_string()],
            amplitude: 100.0,
            noise: 5.0,
            duration: None,
            realtime: true,
        }
    }
}

impl MockServerConfig {
    pub fn start_message(&self) -> RdaStart {
        RdaStart {
            sampling_interval_us: 1_000_000.0 / self.sample_rate,
            resolutions: vec![self.resolution; self.channel_names.len()],
            channel_names: self.channel_names.clone(),
        }
    }

    fn chunk_interval(&self) -> Duration {
        Duration::from_secs_f64(self.chunk as f64 / self.sample_rate)
    }
}

/// Produces consecutive data messages with continuous phase.
pub struct SignalGenerator {
    config: MockServerConfig,
    rng: StdRng,
    block: u32,
    sample: u64,
    next_marker: u64,
    marker_every: u64,
}

impl SignalGenerator {
    pub fn new(config: MockServerConfig) -> Self {
        let marker_every = (config.marker_interval.as_secs_f64() * config.sample_rate)
            .round()
            .max(1.0) as u64;
        Self {
            rng: StdRng::from_os_rng(),
            block: 0,
            sample: 0,
            next_marker: marker_every,
            marker_every,
            config,
        }
    }

    /// Index of the next sample to be generated
    pub fn position(&self) -> u64 {
        self.sample
    }

    fn value(&mut self, channel: usize, t: f64) -> f64 {
        let scale = self.config.amplitude / (channel as f64 + 1.0);
        let f1 = 3.0 + channel as f64 * 0.5;
        let f2 = 10.0 + channel as f64 * 0.7;
        let mut v = scale * (2.0 * PI * f1 * t).sin() + scale / 2.0 * (2.0 * PI * f2 * t + PI / 2.0).sin();
        if self.config.noise > 0.0 {
            v += self.rng.random_range(-self.config.noise..self.config.noise);
        }
        v
    }

    pub fn next_message(&mut self) -> RdaData {
        let channels = self.config.channel_names.len();
        let chunk = self.config.chunk.max(1);
        let mut samples = Vec::with_capacity(chunk * channels);
        for i in 0..chunk {
            let t = (self.sample + i as u64) as f64 / self.config.sample_rate;
            for ch in 0..channels {
                let uv = self.value(ch, t);
                samples.push((uv / self.config.resolution) as f32);
            }
        }

        let mut markers = Vec::new();
        let end = self.sample + chunk as u64;
        while self.next_marker < end && !self.config.marker_descriptions.is_empty() {
            let pick = self.rng.random_range(0..self.config.marker_descriptions.len());
            markers.push(RdaMarker {
                position: (self.next_marker - self.sample) as u32,
                points: 1,
                channel: -1,
                kind: self.config.marker_kind.clone(),
                description: self.config.marker_descriptions[pick].clone(),
            });
            self.next_marker += self.marker_every;
        }

        let message = RdaData {
            block: self.block,
            points: chunk as u32,
            samples,
            markers,
        };
        self.block = self.block.wrapping_add(1);
        self.sample = end;
        message
    }
}

type Clients = Arc<Mutex<Vec<TcpStream>>>;

fn lock(clients: &Clients) -> MutexGuard<'_, Vec<TcpStream>> {
    clients.lock().unwrap_or_else(|e| e.into_inner())
}

/// Serves one synthetic stream to all connected clients.
pub struct MockRdaServer {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    clients: Clients,
    handle: Option<JoinHandle<()>>,
}

impl MockRdaServer {
    pub fn start(addr: impl ToSocketAddrs, config: MockServerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let running = Arc::new(AtomicBool::new(true));
        let clients: Clients = Arc::new(Mutex::new(Vec::new()));

        let thread_running = running.clone();
        let thread_clients = clients.clone();
        let handle = std::thread::Builder::new()
            .name("mock-rda".into())
            .spawn(move || serve(listener, config, thread_clients, thread_running))?;

        tracing::info!("Mock RDA server listening on {}", local_addr);
        Ok(Self {
            local_addr,
            running,
            clients,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        lock(&self.clients).len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Drop every client connection without a stop message.
    pub fn disconnect_clients(&self) {
        for client in lock(&self.clients).drain(..) {
            let _ = client.shutdown(Shutdown::Both);
        }
    }

    /// Send a stop message to all clients and shut down.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MockRdaServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_pending(listener: &TcpListener, start: &[u8], clients: &Clients) {
    loop {
        match listener.accept() {
            Ok((mut stream, peer)) => {
                let _ = stream.set_nodelay(true);
                if stream.set_nonblocking(false).is_ok() && stream.write_all(start).is_ok() {
                    tracing::info!("Mock RDA client connected from {}", peer);
                    lock(clients).push(stream);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => {
                tracing::warn!("Mock RDA accept failed: {}", e);
                break;
            }
        }
    }
}

fn serve(listener: TcpListener, config: MockServerConfig, clients: Clients, running: Arc<AtomicBool>) {
    let start = config.start_message().encode();
    let interval = config.chunk_interval();
    let deadline = config.duration.map(|d| Instant::now() + d);
    let realtime = config.realtime;
    let mut generator = SignalGenerator::new(config);
    let mut next_send = Instant::now();

    while running.load(Ordering::Relaxed) {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        accept_pending(&listener, &start, &clients);

        if realtime {
            let now = Instant::now();
            if now < next_send {
                std::thread::sleep((next_send - now).min(Duration::from_millis(5)));
                continue;
            }
            next_send += interval;
        } else if lock(&clients).is_empty() {
            std::thread::sleep(Duration::from_millis(5));
            continue;
        }

        let message = generator.next_message().encode();
        lock(&clients).retain_mut(|client| match client.write_all(&message) {
            Ok(()) => true,
            Err(e) => {
                tracing::info!("Dropping mock RDA client: {}", e);
                false
            }
        });
    }

    let stop = encode_stop();
    for mut client in lock(&clients).drain(..) {
        let _ = client.write_all(&stop);
        let _ = client.shutdown(Shutdown::Both);
    }
    running.store(false, Ordering::Relaxed);
    tracing::info!("Mock RDA server stopped after {} samples", generator.position());
}
