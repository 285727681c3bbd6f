//! Replay of a persisted session as if it were a live stream

use super::{SignalSource, SourceEvent};
use crate::error::SourceError;
use crate::session::RecordedSession;
use crate::types::{Marker, SampleBlock, StreamInfo};
use chrono::Utc;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Blocks per second of signal time
const CHUNKS_PER_SECOND: f64 = 50.0;

/// Replays a [`RecordedSession`] in fixed-size chunks.
///
/// With `speed = 1.0` chunks are paced at the recording's sampling rate,
/// `2.0` plays twice as fast and `0.0` disables pacing entirely.
pub struct EmulatedSource {
    dir: PathBuf,
    session: String,
    speed: f64,
    recording: Option<RecordedSession>,
    chunk: usize,
    position: usize,
    next_marker: usize,
    next_due: Option<Instant>,
    queued: VecDeque<SourceEvent>,
}

impl EmulatedSource {
    pub fn new(dir: PathBuf, session: String, speed: f64) -> Self {
        Self {
            dir,
            session,
            speed: speed.max(0.0),
            recording: None,
            chunk: 1,
            position: 0,
            next_marker: 0,
            next_due: None,
            queued: VecDeque::new(),
        }
    }

    /// Replay an already loaded session.
    pub fn from_recording(recording: RecordedSession, speed: f64) -> Self {
        let mut source = Self::new(PathBuf::new(), recording.metadata.name.clone(), speed);
        source.recording = Some(recording);
        source
    }

    /// Samples per emitted block
    pub fn chunk_size(&self) -> usize {
        self.chunk
    }

    /// Global index of the next sample to be emitted
    pub fn position(&self) -> usize {
        self.position
    }

    fn interval(&self, sample_rate: f64) -> Option<Duration> {
        if self.speed <= 0.0 || sample_rate <= 0.0 {
            None
        } else {
            Some(Duration::from_secs_f64(self.chunk as f64 / sample_rate / self.speed))
        }
    }

    fn info(recording: &RecordedSession) -> StreamInfo {
        StreamInfo {
            sample_rate: recording.sample_rate(),
            channel_names: recording.channel_names().to_vec(),
        }
    }

    fn open(&mut self) -> Result<StreamInfo, SourceError> {
        if self.recording.is_none() {
            let loaded = RecordedSession::load(&self.dir, &self.session).map_err(|e| {
                SourceError::Connect {
                    address: self.describe(),
                    message: e.to_string(),
                }
            })?;
            self.recording = Some(loaded);
        }
        let recording = self
            .recording
            .as_ref()
            .ok_or_else(|| SourceError::ConnectionLost("recording unavailable".into()))?;

        let fs = recording.sample_rate();
        self.chunk = ((fs / CHUNKS_PER_SECOND).round() as usize).max(1);
        self.next_due = None;
        Ok(Self::info(recording))
    }
}

impl SignalSource for EmulatedSource {
    fn connect(&mut self) -> Result<StreamInfo, SourceError> {
        self.position = 0;
        self.next_marker = 0;
        self.queued.clear();
        let info = self.open()?;
        tracing::info!(
            "Replaying '{}': {} channels at {} Hz, {} samples per block",
            self.session,
            info.channel_count(),
            info.sample_rate,
            self.chunk
        );
        Ok(info)
    }

    fn next_event(&mut self, timeout: Duration) -> Result<SourceEvent, SourceError> {
        if let Some(event) = self.queued.pop_front() {
            return Ok(event);
        }
        let Some(recording) = self.recording.as_ref() else {
            return Err(SourceError::ConnectionLost("not connected".into()));
        };
        let total = recording.len();
        if self.position >= total {
            return Ok(SourceEvent::EndOfStream);
        }

        let fs = recording.sample_rate();
        if let Some(interval) = self.interval(fs) {
            let now = Instant::now();
            let due = *self.next_due.get_or_insert(now);
            if due > now {
                let wait = due - now;
                if wait > timeout {
                    std::thread::sleep(timeout);
                    return Ok(SourceEvent::Timeout);
                }
                std::thread::sleep(wait);
            }
            self.next_due = Some(due + interval);
        }

        let start = self.position;
        let end = (start + self.chunk).min(total);
        let data = recording
            .data
            .iter()
            .map(|channel| channel[start..end].to_vec())
            .collect();
        let block = SampleBlock::new(start as u64, fs, data);

        while let Some(marker) = recording.markers.get(self.next_marker) {
            let onset = marker.onset as usize;
            if onset >= end {
                break;
            }
            if onset >= start {
                let replayed = Marker::new(marker.onset, marker.kind.clone(), marker.description.clone())
                    .with_received_at(Utc::now());
                self.queued.push_back(SourceEvent::Marker(replayed));
            }
            self.next_marker += 1;
        }
        self.position = end;

        if self.position >= total {
            let remaining = recording.markers.len() - self.next_marker;
            if remaining > 0 {
                tracing::debug!("{} markers lie beyond the end of the recording", remaining);
            }
        }
        Ok(SourceEvent::Block(block))
    }

    fn reconnect(&mut self) -> Result<StreamInfo, SourceError> {
        let info = self.open()?;
        tracing::info!("Replay resumed at sample {}", self.position);
        Ok(info)
    }

    fn disconnect(&mut self) {
        self.queued.clear();
        self.next_due = None;
    }

    fn describe(&self) -> String {
        format!("replay {}/{}", self.dir.display(), self.session)
    }
}
