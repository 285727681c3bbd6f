//! Session executor: the computation loop and its lifecycle.
//!
//! A session runs on a dedicated thread and walks
//! `Init → Connecting → Streaming → Closing → Closed`, with a detour through
//! `SourceLost` whenever the source drops and is reconnected. Each loop
//! iteration:
//! 1. Reads one event from the source (bounded by the poll timeout).
//! 2. Appends samples to the buffer or registers a marker.
//! 3. Resolves ready epochs and computes their ERD.
//! 4. Broadcasts and persists.
//!
//! The stop flag is checked once per iteration.

use crate::analysis::ErdCalculator;
use crate::broadcast::BroadcastServer;
use crate::config::{SessionConfig, SourceSettings};
use crate::error::{ErdError, Result, SourceError};
use crate::pipeline::bridge::{SessionBridge, SessionMessage};
use crate::pipeline::buffer::StreamBuffer;
use crate::session::{PersistenceReport, SessionWriter};
use crate::source::{self, RetryPolicy, SignalSource, SourceEvent};
use crate::types::{Epoch, ErdResult, Marker, PipelineState, SampleBlock, SessionStats, StreamInfo};
use crossbeam_channel::{Sender, TrySendError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const STATS_INTERVAL: Duration = Duration::from_millis(500);

/// How a session ended.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session: String,
    pub final_state: PipelineState,
    /// Set when the session ended because of an error rather than a stop or
    /// end of stream
    pub failure: Option<String>,
    pub stats: SessionStats,
    pub persistence: PersistenceReport,
}

impl SessionSummary {
    pub fn results(&self) -> u64 {
        self.stats.results
    }

    pub fn overruns(&self) -> u64 {
        self.stats.overruns
    }

    pub fn computation_failures(&self) -> u64 {
        self.stats.computation_failures
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Per-connection processing state, created once the source layout is known.
struct ActiveStream {
    buffer: StreamBuffer,
    calculator: ErdCalculator,
    writer: Option<SessionWriter>,
    /// Set when persistence was requested but the store could not be created
    persistence_failure: Option<PersistenceReport>,
}

/// A configured session, ready to run.
pub struct Session {
    config: Arc<SessionConfig>,
    name: String,
    source: Box<dyn SignalSource>,
    retry: RetryPolicy,
    poll_timeout: Duration,
    broadcast: Option<BroadcastServer>,
    running: Arc<AtomicBool>,
    msg_tx: Option<Sender<SessionMessage>>,
    state: PipelineState,
    stats: SessionStats,
    /// Recoveries since the last block was accepted
    recoveries_without_data: u32,
}

impl Session {
    /// Validate the configuration and bind the broadcast port.
    pub fn new(config: Arc<SessionConfig>, source: Box<dyn SignalSource>) -> Result<Self> {
        config.validate()?;

        let retry = match &config.source {
            SourceSettings::Live { retry, .. } => RetryPolicy::from(retry),
            SourceSettings::Emulated { .. } => RetryPolicy::default(),
        };
        let broadcast = if config.broadcast_enabled {
            Some(BroadcastServer::bind(
                &config.broadcast_host,
                config.broadcast_port,
                config.broadcast_queue_capacity,
            )?)
        } else {
            None
        };
        let name = config
            .persistence
            .session_name
            .clone()
            .unwrap_or_else(|| chrono::Local::now().format("session_%Y%m%d_%H%M%S").to_string());

        Ok(Self {
            poll_timeout: source::poll_timeout(&config),
            config,
            name,
            source,
            retry,
            broadcast,
            running: Arc::new(AtomicBool::new(true)),
            msg_tx: None,
            state: PipelineState::Init,
            stats: SessionStats::default(),
            recoveries_without_data: 0,
        })
    }

    /// Build the session with the source the configuration selects.
    pub fn from_config(config: SessionConfig) -> Result<Self> {
        let source = source::create_source(&config);
        Self::new(Arc::new(config), source)
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Where consumers should connect, if broadcasting
    pub fn broadcast_addr(&self) -> Option<SocketAddr> {
        self.broadcast.as_ref().map(BroadcastServer::local_addr)
    }

    pub fn consumer_count(&self) -> usize {
        self.broadcast
            .as_ref()
            .map(BroadcastServer::consumer_count)
            .unwrap_or(0)
    }

    /// Cooperative stop flag; clearing it ends the session at the next iteration.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Run on a dedicated thread, publishing status on a bridge.
    pub fn spawn(mut self) -> Result<SessionHandle> {
        let (bridge, msg_tx) = SessionBridge::new();
        self.msg_tx = Some(msg_tx);
        let running = self.running.clone();
        let broadcast_addr = self.broadcast_addr();
        let thread = std::thread::Builder::new()
            .name(format!("session-{}", self.name))
            .spawn(move || self.run())?;
        Ok(SessionHandle {
            bridge,
            running,
            broadcast_addr,
            thread: Some(thread),
        })
    }

    /// Run to completion on the current thread.
    pub fn run(mut self) -> SessionSummary {
        tracing::info!("Session '{}' starting ({})", self.name, self.source.describe());

        let mut failure = None;
        let mut writer = None;
        let mut persistence_failure = None;
        match self.connect() {
            Ok(Some(info)) => match self.prepare(&info) {
                Ok(mut active) => {
                    if let Err(e) = self.stream(&mut active) {
                        failure = Some(e);
                    }
                    let abandoned = active.buffer.abandon_pending();
                    if !abandoned.is_empty() {
                        tracing::info!(
                            "{} markers were still waiting for post-stimulus samples",
                            abandoned.len()
                        );
                    }
                    writer = active.writer.take();
                    persistence_failure = active.persistence_failure.take();
                }
                Err(e) => failure = Some(e),
            },
            Ok(None) => tracing::info!("Stopped before the source connected"),
            Err(e) => failure = Some(e),
        }

        if let Some(e) = &failure {
            tracing::error!("Session '{}' failed: {}", self.name, e);
            self.send(SessionMessage::Error(e.to_string()));
        }

        self.set_state(PipelineState::Closing);
        let persistence = match (writer, persistence_failure) {
            (Some(w), _) => w.finish(),
            (None, Some(report)) => report,
            (None, None) => PersistenceReport::disabled(),
        };
        if let Some(broadcast) = self.broadcast.as_mut() {
            broadcast.shutdown();
        }
        self.source.disconnect();
        self.set_state(PipelineState::Closed);
        self.send_stats();

        tracing::info!(
            "Session '{}' closed: {} results, {} overruns, {} computation failures",
            self.name,
            self.stats.results,
            self.stats.overruns,
            self.stats.computation_failures
        );
        SessionSummary {
            session: self.name,
            final_state: self.state,
            failure: failure.map(|e| e.to_string()),
            stats: self.stats,
            persistence,
        }
    }

    /// Initial connect, retried under the same policy as a lost source.
    fn connect(&mut self) -> Result<Option<StreamInfo>> {
        self.set_state(PipelineState::Connecting);
        match self.source.connect() {
            Ok(info) => Ok(Some(info)),
            Err(e) if e.is_recoverable() => {
                tracing::warn!("Connecting to {} failed: {}", self.source.describe(), e);
                let running = self.running.clone();
                Ok(self.retry.run(&running, |_| self.source.connect())?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn prepare(&mut self, info: &StreamInfo) -> Result<ActiveStream> {
        let channel_names = self.config.bind_stream(info)?;
        self.send(SessionMessage::Connected {
            sample_rate: info.sample_rate,
            channel_names: channel_names.clone(),
        });

        let buffer = StreamBuffer::from_config(&self.config, channel_names.len());
        let calculator = ErdCalculator::new(&self.config, channel_names.clone())?;

        let mut persistence_failure = None;
        let writer = if self.config.persistence.enabled {
            let dir = self.config.output_dir();
            let layout = StreamInfo {
                sample_rate: info.sample_rate,
                channel_names,
            };
            match SessionWriter::start(&self.config.persistence, &dir, &self.name, &layout) {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::error!("Session will not be persisted: {}", e);
                    persistence_failure = Some(PersistenceReport::start_failed(&self.name, dir));
                    None
                }
            }
        } else {
            None
        };

        tracing::info!(
            "Streaming {} channels at {} Hz, epochs of {}+{} samples, {} method",
            info.channel_count(),
            info.sample_rate,
            self.config.pre_samples(),
            self.config.post_samples(),
            calculator.method()
        );
        Ok(ActiveStream {
            buffer,
            calculator,
            writer,
            persistence_failure,
        })
    }

    fn stream(&mut self, active: &mut ActiveStream) -> Result<()> {
        self.set_state(PipelineState::Streaming);
        let mut last_stats = Instant::now();

        while self.running.load(Ordering::Relaxed) {
            match self.source.next_event(self.poll_timeout) {
                Ok(SourceEvent::Block(block)) => match self.on_block(active, block) {
                    Ok(()) => {}
                    Err(ErdError::Source(e)) if e.is_recoverable() => {
                        if !self.recover(active, e)? {
                            break;
                        }
                    }
                    Err(e) => return Err(e),
                },
                Ok(SourceEvent::Marker(marker)) => self.on_marker(active, marker),
                Ok(SourceEvent::EndOfStream) => {
                    tracing::info!("Source reached end of stream");
                    break;
                }
                Ok(SourceEvent::Timeout) => {}
                Err(e) if e.is_recoverable() => {
                    if !self.recover(active, e)? {
                        break;
                    }
                }
                Err(e) => return Err(e.into()),
            }

            if last_stats.elapsed() >= STATS_INTERVAL {
                self.send_stats();
                last_stats = Instant::now();
            }
        }
        Ok(())
    }

    fn on_block(&mut self, active: &mut ActiveStream, block: SampleBlock) -> Result<()> {
        active.buffer.append(&block)?;
        self.recoveries_without_data = 0;
        if let Some(writer) = &active.writer {
            writer.record_block(&block);
        }
        self.stats.blocks += 1;
        self.stats.samples += block.len() as u64;
        self.resolve(active);
        Ok(())
    }

    fn on_marker(&mut self, active: &mut ActiveStream, marker: Marker) {
        self.stats.markers += 1;
        if let Some(writer) = &active.writer {
            writer.record_marker(&marker);
        }
        if !self.config.accepts_marker(&marker.description) {
            tracing::trace!("Ignoring marker '{}'", marker.description);
            self.stats.markers_ignored += 1;
            return;
        }
        tracing::debug!("Marker '{}' at sample {}", marker.description, marker.onset);
        active.buffer.register(marker);
        self.resolve(active);
    }

    fn resolve(&mut self, active: &mut ActiveStream) {
        for resolved in active.buffer.resolve() {
            match resolved {
                Ok(epoch) => self.publish(active, &epoch),
                Err(ErdError::BufferOverrun {
                    description,
                    onset,
                    required_start,
                    oldest_retained,
                }) => {
                    self.stats.overruns += 1;
                    tracing::warn!(
                        "Dropping marker '{}' at {}: baseline starts at {} but buffer begins at {}",
                        description,
                        onset,
                        required_start,
                        oldest_retained
                    );
                    self.send(SessionMessage::Overrun { description, onset });
                }
                Err(e) => tracing::warn!("Epoch extraction failed: {}", e),
            }
        }
    }

    fn publish(&mut self, active: &mut ActiveStream, epoch: &Epoch) {
        let result = match active.calculator.compute(epoch) {
            Ok(result) => result,
            Err(e) => {
                self.stats.computation_failures += 1;
                tracing::warn!(
                    "ERD for marker '{}' at {} is undefined: {}",
                    epoch.marker.description,
                    epoch.marker.onset,
                    e
                );
                ErdResult::undefined(
                    &epoch.marker,
                    active.calculator.method(),
                    active.calculator.focus_names(),
                )
            }
        };
        self.stats.results += 1;
        tracing::debug!(
            "ERD '{}' at {}: mean {:?}, {} undefined channels",
            result.marker_description,
            result.marker_stream_pos,
            result.erd_mean,
            result.undefined_channels()
        );

        if let Some(broadcast) = self.broadcast.as_mut() {
            if let Err(e) = broadcast.broadcast(&result) {
                tracing::warn!("Broadcast failed: {}", e);
            }
        }
        self.send(SessionMessage::Result(result));
    }

    /// Reconnect after a recoverable source error: a lost connection or a
    /// malformed block.
    ///
    /// Returns `Ok(false)` when stopped while waiting. A source that keeps
    /// failing without delivering a usable block is given up on after
    /// `max_retries` recoveries.
    fn recover(&mut self, active: &mut ActiveStream, error: SourceError) -> Result<bool> {
        self.set_state(PipelineState::SourceLost);
        tracing::warn!("Lost {}: {}", self.source.describe(), error);
        self.source.disconnect();

        self.recoveries_without_data += 1;
        if self.recoveries_without_data > self.retry.max_retries {
            return Err(SourceError::RetriesExhausted {
                attempts: self.retry.max_retries,
                last_error: error.to_string(),
            }
            .into());
        }

        let running = self.running.clone();
        let Some(info) = self.retry.run(&running, |_| self.source.reconnect())? else {
            return Ok(false);
        };
        let names = self.config.bind_stream(&info)?;
        if names.len() != active.buffer.channel_count() {
            return Err(ErdError::Config(format!(
                "Source came back with {} channels instead of {}",
                names.len(),
                active.buffer.channel_count()
            )));
        }

        active.buffer.resync();
        self.stats.reconnects += 1;
        tracing::info!("Reconnected to {}", self.source.describe());
        self.set_state(PipelineState::Streaming);
        Ok(true)
    }

    fn set_state(&mut self, state: PipelineState) {
        if self.state != state {
            tracing::debug!("Session state {} -> {}", self.state, state);
            self.state = state;
            self.send(SessionMessage::StateChanged(state));
        }
    }

    fn send_stats(&mut self) {
        self.stats.consumers = self.consumer_count();
        let stats = self.stats.clone();
        self.send(SessionMessage::Stats(stats));
    }

    fn send(&mut self, msg: SessionMessage) {
        if let Some(tx) = &self.msg_tx {
            match tx.try_send(msg) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => self.stats.dropped_messages += 1,
            }
        }
    }
}

/// Caller-side handle of a spawned session.
pub struct SessionHandle {
    bridge: SessionBridge,
    running: Arc<AtomicBool>,
    broadcast_addr: Option<SocketAddr>,
    thread: Option<JoinHandle<SessionSummary>>,
}

impl SessionHandle {
    /// Ask the session to close at its next loop iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map(JoinHandle::is_finished).unwrap_or(true)
    }

    pub fn broadcast_addr(&self) -> Option<SocketAddr> {
        self.broadcast_addr
    }

    pub fn bridge(&self) -> &SessionBridge {
        &self.bridge
    }

    /// Wait for the session to close.
    pub fn join(mut self) -> Result<SessionSummary> {
        let thread = self
            .thread
            .take()
            .ok_or_else(|| ErdError::Channel("session already joined".to_string()))?;
        thread
            .join()
            .map_err(|_| ErdError::Channel("session thread panicked".to_string()))
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.stop();
            let _ = thread.join();
        }
    }
}
