//! Spectral analysis module
//!
//! Welch power spectral density estimation:
//! - Overlapping segments with a configurable window function
//! - Per-segment constant detrend
//! - One-sided density scaling (units²/Hz)
//! - Band power integration

use rustfft::{num_complex::Complex, FftPlanner};
use std::f64::consts::PI;

/// Default segment length
pub const DEFAULT_NPERSEG: usize = 256;

/// Window function applied to each segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowFunction {
    /// Rectangular window (no windowing)
    Rectangular,
    /// Hann window (good general purpose)
    #[default]
    Hann,
    /// Hamming window (reduced side lobes)
    Hamming,
}

impl WindowFunction {
    /// Get display name
    pub fn display_name(&self) -> &'static str {
        match self {
            WindowFunction::Rectangular => "Rectangular",
            WindowFunction::Hann => "Hann",
            WindowFunction::Hamming => "Hamming",
        }
    }

    /// Get all window functions
    pub fn all() -> &'static [WindowFunction] {
        &[
            WindowFunction::Rectangular,
            WindowFunction::Hann,
            WindowFunction::Hamming,
        ]
    }

    /// Periodic window coefficient at position i out of n samples
    pub fn coefficient(&self, i: usize, n: usize) -> f64 {
        let n_f = n as f64;
        let i_f = i as f64;

        match self {
            WindowFunction::Rectangular => 1.0,
            WindowFunction::Hann => 0.5 * (1.0 - (2.0 * PI * i_f / n_f).cos()),
            WindowFunction::Hamming => 0.54 - 0.46 * (2.0 * PI * i_f / n_f).cos(),
        }
    }

    /// Generate window coefficients for n samples
    pub fn generate(&self, n: usize) -> Vec<f64> {
        (0..n).map(|i| self.coefficient(i, n)).collect()
    }
}

/// Welch estimator configuration
#[derive(Debug, Clone)]
pub struct WelchConfig {
    /// Window function to use
    pub window: WindowFunction,
    /// Segment length; clipped to the signal length
    pub nperseg: usize,
    /// Overlap ratio between consecutive segments (0.0 to 0.99)
    pub overlap: f64,
    /// Whether to subtract each segment's mean before windowing
    pub detrend: bool,
}

impl Default for WelchConfig {
    fn default() -> Self {
        Self {
            window: WindowFunction::Hann,
            nperseg: DEFAULT_NPERSEG,
            overlap: 0.5,
            detrend: true,
        }
    }
}

impl WelchConfig {
    /// Set window function
    pub fn window(mut self, window: WindowFunction) -> Self {
        self.window = window;
        self
    }

    /// Set segment length
    pub fn nperseg(mut self, nperseg: usize) -> Self {
        self.nperseg = nperseg;
        self
    }
}

/// One-sided power spectral density
#[derive(Debug, Clone, Default)]
pub struct Psd {
    /// Frequency bins (Hz)
    pub frequencies: Vec<f64>,
    /// Power density per bin (units²/Hz)
    pub density: Vec<f64>,
    /// Frequency resolution (Hz per bin)
    pub frequency_resolution: f64,
    /// Number of averaged segments
    pub segments: usize,
}

impl Psd {
    /// Integrate the density over the bins inside `[low, high]` Hz.
    ///
    /// Returns `None` when no bin falls inside the band.
    pub fn band_power(&self, low: f64, high: f64) -> Option<f64> {
        let mut bins = 0usize;
        let sum: f64 = self
            .frequencies
            .iter()
            .zip(&self.density)
            .filter(|(&f, _)| f >= low && f <= high)
            .map(|(_, &p)| {
                bins += 1;
                p
            })
            .sum();
        (bins > 0).then(|| sum * self.frequency_resolution)
    }

    /// Total power across all bins
    pub fn total_power(&self) -> f64 {
        self.density.iter().sum::<f64>() * self.frequency_resolution
    }
}

/// Welch PSD estimator.
///
/// Holds an FFT planner so repeated estimates over same-length segments reuse
/// their plans.
pub struct WelchEstimator {
    planner: FftPlanner<f64>,
    config: WelchConfig,
}

impl WelchEstimator {
    /// Create a new estimator with default config
    pub fn new() -> Self {
        Self::with_config(WelchConfig::default())
    }

    /// Create estimator with specific config
    pub fn with_config(config: WelchConfig) -> Self {
        Self {
            planner: FftPlanner::new(),
            config,
        }
    }

    /// Get current config
    pub fn config(&self) -> &WelchConfig {
        &self.config
    }

    /// Estimate the PSD of `samples`.
    pub fn psd(&mut self, samples: &[f64], sample_rate: f64) -> Psd {
        let n = samples.len();
        if n == 0 || sample_rate <= 0.0 {
            return Psd::default();
        }

        let nperseg = self.config.nperseg.clamp(1, n);
        let noverlap = ((self.config.overlap.clamp(0.0, 0.99) * nperseg as f64) as usize)
            .min(nperseg - 1);
        let step = nperseg - noverlap;
        let window = self.config.window.generate(nperseg);
        let window_power: f64 = window.iter().map(|w| w * w).sum();
        if window_power <= 0.0 {
            return Psd::default();
        }

        let num_bins = nperseg / 2 + 1;
        let fft = self.planner.plan_fft_forward(nperseg);
        let mut accumulated = vec![0.0; num_bins];
        let mut buffer = vec![Complex::new(0.0, 0.0); nperseg];
        let mut segments = 0usize;

        let mut start = 0;
        while start + nperseg <= n {
            let segment = &samples[start..start + nperseg];
            let mean = if self.config.detrend {
                segment.iter().sum::<f64>() / nperseg as f64
            } else {
                0.0
            };
            for ((slot, &s), &w) in buffer.iter_mut().zip(segment).zip(&window) {
                *slot = Complex::new((s - mean) * w, 0.0);
            }
            fft.process(&mut buffer);
            for (acc, c) in accumulated.iter_mut().zip(&buffer) {
                *acc += c.norm_sqr();
            }
            segments += 1;
            start += step;
        }

        let scale = 1.0 / (sample_rate * window_power * segments as f64);
        let nyquist_bin = (nperseg % 2 == 0).then_some(num_bins - 1);
        let density: Vec<f64> = accumulated
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                let one_sided = if i == 0 || Some(i) == nyquist_bin {
                    1.0
                } else {
                    2.0
                };
                p * scale * one_sided
            })
            .collect();

        let frequency_resolution = sample_rate / nperseg as f64;
        Psd {
            frequencies: (0..num_bins)
                .map(|i| i as f64 * frequency_resolution)
                .collect(),
            density,
            frequency_resolution,
            segments,
        }
    }
}

impl Default for WelchEstimator {
    fn default() -> Self {
        Self::new()
    }
}
