//! Test data builders for synthetic recordings and session configurations

use erd_stream::config::{PersistenceSettings, SessionConfig, SourceSettings};
use erd_stream::session::{RecordedSession, SessionWriter};
use erd_stream::types::{ErdMethod, Marker, SampleBlock, StreamInfo};
use std::f64::consts::PI;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Builder for deterministic multichannel recordings.
///
/// Every channel carries the same tone with a channel-specific amplitude and
/// phase, so common average referencing leaves a non-zero signal behind.
pub struct RecordingBuilder {
    sample_rate: f64,
    channels: usize,
    seconds: f64,
    tone_hz: f64,
    amplitude: f64,
    /// (start, end, gain) applied to the tone
    gains: Vec<(usize, usize, f64)>,
    markers: Vec<Marker>,
}

impl RecordingBuilder {
    pub fn new(sample_rate: f64, channels: usize) -> Self {
        Self {
            sample_rate,
            channels,
            seconds: 10.0,
            tone_hz: 10.0,
            amplitude: 20.0,
            gains: Vec::new(),
            markers: Vec::new(),
        }
    }

    pub fn seconds(mut self, seconds: f64) -> Self {
        self.seconds = seconds;
        self
    }

    pub fn tone(mut self, hz: f64, amplitude: f64) -> Self {
        self.tone_hz = hz;
        self.amplitude = amplitude;
        self
    }

    /// Scale the tone by `gain` over samples `[start, end)`.
    pub fn gain(mut self, start: usize, end: usize, gain: f64) -> Self {
        self.gains.push((start, end, gain));
        self
    }

    /// Zero every channel over samples `[start, end)`.
    pub fn silence(self, start: usize, end: usize) -> Self {
        self.gain(start, end, 0.0)
    }

    pub fn marker(mut self, onset: u64, description: &str) -> Self {
        self.markers.push(Marker::new(onset, "Stimulus", description));
        self
    }

    pub fn len(&self) -> usize {
        (self.seconds * self.sample_rate).round() as usize
    }

    pub fn channel_names(&self) -> Vec<String> {
        (1..=self.channels).map(|i| format!("Ch{}", i)).collect()
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    /// Channel-major samples
    pub fn data(&self) -> Vec<Vec<f64>> {
        let len = self.len();
        (0..self.channels)
            .map(|c| {
                let scale = self.amplitude * (1.0 + 0.5 * c as f64);
                let phase = 0.7 * c as f64;
                (0..len)
                    .map(|i| {
                        let t = i as f64 / self.sample_rate;
                        let gain = self
                            .gains
                            .iter()
                            .filter(|(s, e, _)| (*s..*e).contains(&i))
                            .fold(1.0, |g, (_, _, k)| g * k);
                        gain * scale * (2.0 * PI * self.tone_hz * t + phase).sin()
                    })
                    .collect()
            })
            .collect()
    }

    /// Persist the recording the way a live session would, then load it back.
    pub fn write(&self, dir: &Path, session: &str) -> RecordedSession {
        let info = StreamInfo {
            sample_rate: self.sample_rate,
            channel_names: self.channel_names(),
        };
        let settings = PersistenceSettings {
            queue_capacity: 100_000,
            enqueue_timeout_ms: 1_000,
            ..Default::default()
        };
        let writer = SessionWriter::start(&settings, dir, session, &info).unwrap();

        let data = self.data();
        let chunk = 100;
        let mut start = 0;
        while start < self.len() {
            let end = (start + chunk).min(self.len());
            let block = SampleBlock::new(
                start as u64,
                self.sample_rate,
                data.iter().map(|ch| ch[start..end].to_vec()).collect(),
            );
            writer.record_block(&block);
            for marker in self
                .markers
                .iter()
                .filter(|m| (start as u64..end as u64).contains(&m.onset))
            {
                writer.record_marker(marker);
            }
            start = end;
        }

        let report = writer.finish();
        assert!(report.complete, "synthetic recording incomplete: {:?}", report);
        RecordedSession::load(dir, session).unwrap()
    }
}

/// Builder for session configurations used in integration tests.
///
/// Defaults: 1 s baseline and post-stimulus, 8-13 Hz band, no broadcast and
/// no persistence.
pub struct ConfigBuilder {
    config: SessionConfig,
}

impl ConfigBuilder {
    pub fn new(sample_rate: f64) -> Self {
        let mut config = SessionConfig {
            sampling_freq: sample_rate,
            epoch_pre_stimulus_seconds: 1.0,
            epoch_post_stimulus_seconds: 1.0,
            filter_order: 4,
            buffer_safety_margin_seconds: 0.5,
            broadcast_enabled: false,
            broadcast_port: 0,
            ..Default::default()
        };
        config.persistence.enabled = false;
        Self { config }
    }

    pub fn epoch(mut self, pre: f64, post: f64) -> Self {
        self.config.epoch_pre_stimulus_seconds = pre;
        self.config.epoch_post_stimulus_seconds = post;
        self
    }

    pub fn method(mut self, method: ErdMethod) -> Self {
        self.config.method = method;
        self
    }

    pub fn focus_markers(mut self, markers: &[&str]) -> Self {
        self.config.focus_markers = markers.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn retention(mut self, seconds: f64) -> Self {
        self.config.buffer_retention_seconds = Some(seconds);
        self
    }

    /// Replay a persisted session as fast as possible.
    pub fn replay(mut self, dir: &Path, session: &str) -> Self {
        self.config.source = SourceSettings::Emulated {
            dir: dir.to_path_buf(),
            session: session.to_string(),
            speed: 0.0,
        };
        self
    }

    pub fn live(mut self, addr: SocketAddr) -> Self {
        let mut retry = erd_stream::config::RetrySettings::default();
        retry.initial_delay_ms = 50;
        retry.max_delay_ms = 200;
        self.config.source = SourceSettings::Live {
            host: addr.ip().to_string(),
            port: addr.port(),
            read_timeout_ms: 50,
            retry,
        };
        self
    }

    pub fn persist_to(mut self, dir: &Path, session: &str) -> Self {
        self.config.persistence.enabled = true;
        self.config.persistence.output_dir = Some(PathBuf::from(dir));
        self.config.persistence.session_name = Some(session.to_string());
        self
    }

    /// Broadcast on an ephemeral localhost port.
    pub fn broadcast(mut self) -> Self {
        self.config.broadcast_enabled = true;
        self.config.broadcast_host = "127.0.0.1".to_string();
        self.config.broadcast_port = 0;
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_builder_shape() {
        let builder = RecordingBuilder::new(100.0, 3)
            .seconds(2.0)
            .silence(50, 100)
            .marker(120, "S  1");
        let data = builder.data();
        assert_eq!(data.len(), 3);
        assert_eq!(data[0].len(), 200);
        assert!(data.iter().all(|ch| ch[50..100].iter().all(|&v| v == 0.0)));
        assert_eq!(builder.markers().len(), 1);
    }

    #[test]
    fn test_config_builder_validates() {
        let config = ConfigBuilder::new(250.0).epoch(0.5, 1.0).build();
        config.validate().unwrap();
        assert_eq!(config.pre_samples(), 125);
        assert!(!config.broadcast_enabled);
    }
}
