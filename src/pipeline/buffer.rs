//! Stream ring buffer and marker-anchored epoch extraction
//!
//! The buffer keeps the most recent `capacity` samples per channel. Each
//! accepted marker becomes a pending request for `[onset − pre, onset + post)`.
//! After every append the pending requests are walked in registration order:
//! a request whose start has already fallen out of the ring is abandoned with
//! a buffer overrun, and a request whose end has been written is sliced into
//! an [`Epoch`]. Extraction only reads the ring, so overlapping windows are
//! independent.

use crate::config::SessionConfig;
use crate::error::{ErdError, Result, SourceError};
use crate::types::{Epoch, Marker, SampleBlock};

/// A marker waiting for enough samples after its onset.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionRequest {
    pub marker: Marker,
    /// First sample of the window; negative when the baseline predates the stream
    pub start: i64,
    /// One past the last sample of the window
    pub end: u64,
}

/// Ring buffer of recent samples plus the pending extraction set.
pub struct StreamBuffer {
    ring: Vec<Vec<f64>>,
    capacity: usize,
    write_index: u64,
    pre_samples: usize,
    post_samples: usize,
    pending: Vec<ExtractionRequest>,
    /// Accept one forward jump on the next append
    resync: bool,
}

impl StreamBuffer {
    /// Create a buffer for `channels` channels holding `capacity` samples each.
    pub fn new(channels: usize, capacity: usize, pre_samples: usize, post_samples: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: vec![vec![0.0; capacity]; channels],
            capacity,
            write_index: 0,
            pre_samples,
            post_samples,
            pending: Vec::new(),
            resync: false,
        }
    }

    /// Size the buffer from the session configuration.
    pub fn from_config(config: &SessionConfig, channels: usize) -> Self {
        let capacity = config.retention_samples();
        let required = config.required_retention_samples();
        if capacity < required {
            tracing::warn!(
                "Buffer retention of {} samples is below the {} samples an epoch needs; \
                 markers will overrun",
                capacity,
                required
            );
        }
        tracing::debug!(
            "Stream buffer: {} channels x {} samples (epoch {}+{})",
            channels,
            capacity,
            config.pre_samples(),
            config.post_samples()
        );
        Self::new(channels, capacity, config.pre_samples(), config.post_samples())
    }

    pub fn channel_count(&self) -> usize {
        self.ring.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Global index of the next sample to be written
    pub fn write_index(&self) -> u64 {
        self.write_index
    }

    /// Global index of the oldest sample still held
    pub fn oldest_retained(&self) -> u64 {
        self.write_index.saturating_sub(self.capacity as u64)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> &[ExtractionRequest] {
        &self.pending
    }

    /// Append a block. Blocks must arrive contiguously and with the buffer's
    /// channel count.
    pub fn append(&mut self, block: &SampleBlock) -> Result<()> {
        if block.channel_count() != self.ring.len() || !block.is_rectangular() {
            return Err(SourceError::Malformed(format!(
                "Block at sample {} has {} channels (expected {}) or ragged channels",
                block.start_index,
                block.channel_count(),
                self.ring.len()
            ))
            .into());
        }
        if block.start_index > self.write_index && self.resync {
            self.fill_gap(block.start_index);
        }
        if block.start_index != self.write_index {
            return Err(SourceError::Malformed(format!(
                "Block starts at sample {} but buffer expects {}",
                block.start_index, self.write_index
            ))
            .into());
        }
        self.resync = false;

        let len = block.len();
        // Only the tail of an oversized block can survive
        let skip = len.saturating_sub(self.capacity);
        for (ring, samples) in self.ring.iter_mut().zip(&block.data) {
            for (offset, &v) in samples.iter().enumerate().skip(skip) {
                let global = self.write_index + offset as u64;
                ring[(global % self.capacity as u64) as usize] = v;
            }
        }
        self.write_index += len as u64;
        Ok(())
    }

    /// Allow the next block to start past the write index, as after a
    /// reconnect that skipped samples.
    pub fn resync(&mut self) {
        self.resync = true;
    }

    /// Advance to `next` with NaN for the missing samples. Epochs that
    /// overlap the gap come out undefined.
    fn fill_gap(&mut self, next: u64) {
        let missing = next - self.write_index;
        tracing::warn!(
            "Stream resumed at sample {}; {} samples are missing",
            next,
            missing
        );
        let first = next.saturating_sub(self.capacity as u64).max(self.write_index);
        for ring in &mut self.ring {
            for global in first..next {
                ring[(global % self.capacity as u64) as usize] = f64::NAN;
            }
        }
        self.write_index = next;
    }

    /// Register a pending extraction for a marker.
    pub fn register(&mut self, marker: Marker) {
        let start = marker.onset as i64 - self.pre_samples as i64;
        let end = marker.onset + self.post_samples as u64;
        self.pending.push(ExtractionRequest { marker, start, end });
    }

    /// Resolve every request that can be decided now, in registration order.
    ///
    /// Returns one entry per resolved request: the epoch, or a
    /// [`ErdError::BufferOverrun`] for a request whose baseline is gone.
    pub fn resolve(&mut self) -> Vec<Result<Epoch>> {
        let oldest = self.oldest_retained();
        let written = self.write_index;
        let mut resolved = Vec::new();
        let mut still_pending = Vec::with_capacity(self.pending.len());

        for request in std::mem::take(&mut self.pending) {
            if request.start < oldest as i64 {
                resolved.push(Err(ErdError::BufferOverrun {
                    description: request.marker.description.clone(),
                    onset: request.marker.onset,
                    required_start: request.start,
                    oldest_retained: oldest,
                }));
            } else if written >= request.end {
                let data = self.slice(request.start as u64, request.end);
                resolved.push(Ok(Epoch {
                    marker: request.marker,
                    pre_samples: self.pre_samples,
                    post_samples: self.post_samples,
                    data,
                }));
            } else {
                still_pending.push(request);
            }
        }

        self.pending = still_pending;
        resolved
    }

    /// Drop all pending requests (used on shutdown).
    pub fn abandon_pending(&mut self) -> Vec<ExtractionRequest> {
        std::mem::take(&mut self.pending)
    }

    /// Copy `[start, end)` out of the ring. Caller guarantees the range is retained.
    fn slice(&self, start: u64, end: u64) -> Vec<Vec<f64>> {
        let cap = self.capacity as u64;
        self.ring
            .iter()
            .map(|ring| {
                (start..end)
                    .map(|g| ring[(g % cap) as usize])
                    .collect()
            })
            .collect()
    }
}
