//! Core data types for erd-stream
//!
//! Sample blocks and markers flow from a source into the stream buffer; epochs
//! flow from the buffer into the ERD calculator; results flow out to the
//! broadcaster and the session log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A block of multichannel samples as delivered by a source.
///
/// `data[channel][sample]`. Every channel holds the same number of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    /// Global index of the first sample in this block
    pub start_index: u64,
    /// Sampling rate in Hz
    pub sample_rate: f64,
    /// Channel-major sample data
    pub data: Vec<Vec<f64>>,
}

impl SampleBlock {
    pub fn new(start_index: u64, sample_rate: f64, data: Vec<Vec<f64>>) -> Self {
        Self {
            start_index,
            sample_rate,
            data,
        }
    }

    /// Build a block from sample-major (interleaved) rows, as decoded from the wire.
    pub fn from_interleaved(
        start_index: u64,
        sample_rate: f64,
        channels: usize,
        interleaved: &[f64],
    ) -> Self {
        let points = if channels == 0 {
            0
        } else {
            interleaved.len() / channels
        };
        let mut data = vec![Vec::with_capacity(points); channels];
        for row in interleaved.chunks_exact(channels.max(1)).take(points) {
            for (ch, &v) in row.iter().enumerate() {
                data[ch].push(v);
            }
        }
        Self::new(start_index, sample_rate, data)
    }

    pub fn channel_count(&self) -> usize {
        self.data.len()
    }

    /// Number of samples per channel
    pub fn len(&self) -> usize {
        self.data.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One past the global index of the last sample
    pub fn end_index(&self) -> u64 {
        self.start_index + self.len() as u64
    }

    /// True when all channels carry the same number of samples.
    pub fn is_rectangular(&self) -> bool {
        let n = self.len();
        self.data.iter().all(|ch| ch.len() == n)
    }
}

/// A timing marker embedded in the sample stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    /// Global sample index of the event
    pub onset: u64,
    /// Marker type as reported by the source, e.g. `Stimulus`
    pub kind: String,
    /// Category code, e.g. `S  1`
    pub description: String,
    /// Wall-clock time the marker was received
    pub received_at: DateTime<Utc>,
}

impl Marker {
    pub fn new(onset: u64, kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            onset,
            kind: kind.into(),
            description: description.into(),
            received_at: Utc::now(),
        }
    }

    /// Set the arrival time (used when replaying a recorded marker log)
    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    /// Split a combined `type/description` annotation at the first `/`.
    ///
    /// Annotations without a separator are treated as a bare description with
    /// an empty type.
    pub fn from_annotation(onset: u64, annotation: &str) -> Self {
        match annotation.split_once('/') {
            Some((kind, description)) => Self::new(onset, kind, description),
            None => Self::new(onset, "", annotation),
        }
    }
}

/// What a source reports on connect.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    /// Sampling rate in Hz
    pub sample_rate: f64,
    /// Channel names, in stream order
    pub channel_names: Vec<String>,
}

impl StreamInfo {
    pub fn channel_count(&self) -> usize {
        self.channel_names.len()
    }
}

/// A marker-anchored window of `pre_samples + post_samples` samples per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Epoch {
    /// The marker this window is anchored to
    pub marker: Marker,
    /// Samples before the onset (baseline)
    pub pre_samples: usize,
    /// Samples from the onset on
    pub post_samples: usize,
    /// Channel-major samples
    pub data: Vec<Vec<f64>>,
}

impl Epoch {
    pub fn channel_count(&self) -> usize {
        self.data.len()
    }

    /// Samples per channel
    pub fn len(&self) -> usize {
        self.data.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Global index of the first sample in the window
    pub fn start_index(&self) -> i64 {
        self.marker.onset as i64 - self.pre_samples as i64
    }
}

/// ERD metric variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErdMethod {
    /// Mean squared amplitude ratio, in percent
    #[default]
    BandpassPower,
    /// Integrated Welch band power ratio, in percent
    Welch,
    /// `10·log10(post / pre)`
    DbCorrection,
    /// Sliding-window power relative to the baseline
    MovingWindow,
}

impl ErdMethod {
    pub fn display_name(&self) -> &'static str {
        match self {
            ErdMethod::BandpassPower => "Bandpass power",
            ErdMethod::Welch => "Welch",
            ErdMethod::DbCorrection => "dB correction",
            ErdMethod::MovingWindow => "Moving window",
        }
    }

    pub fn all() -> &'static [ErdMethod] {
        &[
            ErdMethod::BandpassPower,
            ErdMethod::Welch,
            ErdMethod::DbCorrection,
            ErdMethod::MovingWindow,
        ]
    }
}

impl std::fmt::Display for ErdMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Scale used by the moving-window method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowScale {
    #[default]
    Percent,
    Db,
}

/// One ERD value per focus channel for a single marker.
///
/// Serializes to the broadcast record. `None` entries are undefined values
/// and appear as JSON `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErdResult {
    /// When the result was computed
    pub timestamp: DateTime<Utc>,
    pub marker_description: String,
    /// Global sample index of the marker
    pub marker_stream_pos: u64,
    pub method: ErdMethod,
    /// Per focus channel, in `channel_names` order
    pub erd_percent: Vec<Option<f64>>,
    pub channel_names: Vec<String>,
    /// Mean of the defined entries of `erd_percent`
    pub erd_mean: Option<f64>,
}

impl ErdResult {
    /// Build a result from per-channel values, computing the aggregate.
    pub fn new(
        marker: &Marker,
        method: ErdMethod,
        erd_percent: Vec<Option<f64>>,
        channel_names: Vec<String>,
    ) -> Self {
        let (erd_mean, _) = mean_of_defined(&erd_percent);
        Self {
            timestamp: Utc::now(),
            marker_description: marker.description.clone(),
            marker_stream_pos: marker.onset,
            method,
            erd_percent,
            channel_names,
            erd_mean,
        }
    }

    /// A result where every channel is undefined (preprocessing failed).
    pub fn undefined(marker: &Marker, method: ErdMethod, channel_names: Vec<String>) -> Self {
        let values = vec![None; channel_names.len()];
        Self::new(marker, method, values, channel_names)
    }

    /// Number of focus channels without a defined value
    pub fn undefined_channels(&self) -> usize {
        self.erd_percent.iter().filter(|v| v.is_none()).count()
    }
}

/// Mean of the defined values and the number of undefined ones.
///
/// Returns `None` for the mean when nothing is defined.
pub fn mean_of_defined(values: &[Option<f64>]) -> (Option<f64>, usize) {
    let defined: Vec<f64> = values.iter().flatten().copied().collect();
    let undefined = values.len() - defined.len();
    if defined.is_empty() {
        (None, undefined)
    } else {
        (
            Some(defined.iter().sum::<f64>() / defined.len() as f64),
            undefined,
        )
    }
}

/// Lifecycle of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Init,
    Connecting,
    Streaming,
    /// Connection lost, reconnecting under the retry policy
    SourceLost,
    Closing,
    Closed,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Init => write!(f, "Init"),
            PipelineState::Connecting => write!(f, "Connecting..."),
            PipelineState::Streaming => write!(f, "Streaming"),
            PipelineState::SourceLost => write!(f, "Source lost"),
            PipelineState::Closing => write!(f, "Closing"),
            PipelineState::Closed => write!(f, "Closed"),
        }
    }
}

/// Running counters for a session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    /// Sample blocks appended to the buffer
    pub blocks: u64,
    /// Samples per channel appended to the buffer
    pub samples: u64,
    /// Markers reported by the source
    pub markers: u64,
    /// Markers skipped by the focus-marker filter
    pub markers_ignored: u64,
    /// Results computed (including wholly undefined ones)
    pub results: u64,
    /// Markers abandoned because the buffer no longer held their baseline
    pub overruns: u64,
    /// Markers whose preprocessing failed
    pub computation_failures: u64,
    /// Successful reconnects
    pub reconnects: u32,
    /// Consumers currently connected
    pub consumers: usize,
    /// Status messages dropped due to queue backpressure
    pub dropped_messages: u64,
}
