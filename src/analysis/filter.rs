//! Butterworth band-pass design and zero-phase filtering
//!
//! The filter is designed as cascaded second-order sections (SOS): analog
//! Butterworth prototype, low-pass to band-pass transform, then the bilinear
//! transform with frequency prewarping. Zero-phase filtering runs the cascade
//! forward and backward over an odd-extended signal, starting each pass from
//! the steady-state section states so edges do not ring.

use crate::error::{ErdError, Result};
use rustfft::num_complex::Complex;
use std::f64::consts::PI;

/// Poles closer than this to the real axis are treated as real.
const REAL_POLE_EPS: f64 = 1e-10;

/// Second-order section coefficients
/// Transfer function: H(z) = (b0 + b1*z^-1 + b2*z^-2) / (1 + a1*z^-1 + a2*z^-2)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoeffs {
    /// Section state after an infinitely long unit step, in Direct Form II
    /// Transposed.
    fn step_state(&self) -> [f64; 2] {
        let dc = self.dc_gain();
        let z2 = self.b2 - self.a2 * dc;
        let z1 = self.b1 + self.b2 - (self.a1 + self.a2) * dc;
        [z1, z2]
    }

    fn dc_gain(&self) -> f64 {
        (self.b0 + self.b1 + self.b2) / (1.0 + self.a1 + self.a2)
    }

    #[inline]
    fn process(&self, input: f64, state: &mut [f64; 2]) -> f64 {
        let output = self.b0 * input + state[0];
        state[0] = self.b1 * input - self.a1 * output + state[1];
        state[1] = self.b2 * input - self.a2 * output;
        output
    }
}

/// Cascaded second-order sections.
#[derive(Debug, Clone, PartialEq)]
pub struct SosFilter {
    sections: Vec<BiquadCoeffs>,
}

impl SosFilter {
    pub fn new(sections: Vec<BiquadCoeffs>) -> Self {
        Self { sections }
    }

    /// Design a Butterworth band-pass of the given prototype order.
    ///
    /// The resulting filter has `order` sections (overall order `2 * order`).
    pub fn butterworth_bandpass(order: usize, low: f64, high: f64, sample_rate: f64) -> Result<Self> {
        let nyquist = sample_rate / 2.0;
        if order == 0 {
            return Err(ErdError::Config("Filter order must be at least 1".to_string()));
        }
        if !(low > 0.0 && low < high && high < nyquist) {
            return Err(ErdError::Config(format!(
                "Invalid band {}-{} Hz for sample rate {} Hz",
                low, high, sample_rate
            )));
        }

        let fs2 = 2.0 * sample_rate;
        let w1 = prewarp(low, sample_rate);
        let w2 = prewarp(high, sample_rate);
        let bw = w2 - w1;
        let w0 = (w1 * w2).sqrt();

        // Low-pass to band-pass: every prototype pole splits into two.
        let mut poles = Vec::with_capacity(2 * order);
        for p in analog_prototype(order) {
            let p_lp = p * (bw / 2.0);
            let disc = (p_lp * p_lp - Complex::new(w0 * w0, 0.0)).sqrt();
            poles.push(p_lp + disc);
            poles.push(p_lp - disc);
        }

        // Bilinear transform. The band-pass has `order` zeros at s = 0 (which
        // land on z = 1) and `order` zeros at infinity (which land on z = -1).
        let fs2c = Complex::new(fs2, 0.0);
        let mut gain_den = Complex::new(1.0, 0.0);
        let digital: Vec<Complex<f64>> = poles
            .iter()
            .map(|&p| {
                gain_den *= fs2c - p;
                (fs2c + p) / (fs2c - p)
            })
            .collect();
        let gain_num = Complex::new(bw.powi(order as i32) * fs2.powi(order as i32), 0.0);
        let gain = (gain_num / gain_den).re;

        let sections = pair_poles(&digital, order)?
            .into_iter()
            .enumerate()
            .map(|(i, (a1, a2))| {
                let k = if i == 0 { gain } else { 1.0 };
                BiquadCoeffs {
                    b0: k,
                    b1: 0.0,
                    b2: -k,
                    a1,
                    a2,
                }
            })
            .collect();

        Ok(Self { sections })
    }

    pub fn sections(&self) -> &[BiquadCoeffs] {
        &self.sections
    }

    /// Edge padding used by [`SosFilter::filtfilt`]: three times the length of
    /// the equivalent transfer-function coefficient vectors.
    pub fn padlen(&self) -> usize {
        3 * (2 * self.sections.len() + 1)
    }

    /// Steady-state section states for a unit step input.
    pub fn steady_state(&self) -> Vec<[f64; 2]> {
        let mut scale = 1.0;
        self.sections
            .iter()
            .map(|s| {
                let [z1, z2] = s.step_state();
                let zi = [z1 * scale, z2 * scale];
                scale *= s.dc_gain();
                zi
            })
            .collect()
    }

    /// Single forward pass from the given section states.
    pub fn filter_with_state(&self, signal: &[f64], state: &mut [[f64; 2]]) -> Vec<f64> {
        signal
            .iter()
            .map(|&x| {
                self.sections
                    .iter()
                    .zip(state.iter_mut())
                    .fold(x, |acc, (section, st)| section.process(acc, st))
            })
            .collect()
    }

    /// Zero-phase forward-backward filtering.
    pub fn filtfilt(&self, signal: &[f64]) -> Vec<f64> {
        let n = signal.len();
        if n < 2 {
            return signal.to_vec();
        }
        let pad = self.padlen().min(n - 1);
        let extended = odd_extend(signal, pad);
        let zi = self.steady_state();

        let mut state = scaled_state(&zi, extended[0]);
        let mut forward = self.filter_with_state(&extended, &mut state);

        forward.reverse();
        let mut state = scaled_state(&zi, forward[0]);
        let mut backward = self.filter_with_state(&forward, &mut state);
        backward.reverse();

        backward[pad..pad + n].to_vec()
    }

    /// Magnitude response at `freq` Hz.
    pub fn magnitude_at(&self, freq: f64, sample_rate: f64) -> f64 {
        let w = 2.0 * PI * freq / sample_rate;
        let z1 = Complex::from_polar(1.0, -w);
        let z2 = z1 * z1;
        self.sections
            .iter()
            .map(|s| {
                let num = Complex::new(s.b0, 0.0) + z1 * s.b1 + z2 * s.b2;
                let den = Complex::new(1.0, 0.0) + z1 * s.a1 + z2 * s.a2;
                (num / den).norm()
            })
            .product()
    }
}

fn prewarp(freq: f64, sample_rate: f64) -> f64 {
    2.0 * sample_rate * (PI * freq / sample_rate).tan()
}

/// Poles of the normalized analog Butterworth low-pass.
fn analog_prototype(order: usize) -> Vec<Complex<f64>> {
    let n = order as f64;
    (0..order)
        .map(|k| {
            let m = -(n - 1.0) + 2.0 * k as f64;
            -Complex::from_polar(1.0, PI * m / (2.0 * n))
        })
        .collect()
}

/// Group digital poles into `(a1, a2)` denominators, one per section.
///
/// Complex poles pair with their conjugates; real poles pair with each other.
/// Sections are ordered by pole radius, smallest first.
fn pair_poles(poles: &[Complex<f64>], sections: usize) -> Result<Vec<(f64, f64)>> {
    let mut pairs: Vec<(f64, f64, f64)> = Vec::with_capacity(sections);

    for p in poles.iter().filter(|p| p.im > REAL_POLE_EPS) {
        pairs.push((-2.0 * p.re, p.norm_sqr(), p.norm()));
    }

    let mut real: Vec<f64> = poles
        .iter()
        .filter(|p| p.im.abs() <= REAL_POLE_EPS)
        .map(|p| p.re)
        .collect();
    if real.len() % 2 != 0 {
        return Err(ErdError::Computation(format!(
            "Cannot pair {} real poles into second-order sections",
            real.len()
        )));
    }
    real.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    for pair in real.chunks_exact(2) {
        pairs.push((-(pair[0] + pair[1]), pair[0] * pair[1], pair[0].abs().max(pair[1].abs())));
    }

    if pairs.len() != sections {
        return Err(ErdError::Computation(format!(
            "Expected {} sections, paired {}",
            sections,
            pairs.len()
        )));
    }

    pairs.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));
    Ok(pairs.into_iter().map(|(a1, a2, _)| (a1, a2)).collect())
}

/// Extend both ends by point reflection about the end samples.
fn odd_extend(signal: &[f64], pad: usize) -> Vec<f64> {
    let n = signal.len();
    let first = signal[0];
    let last = signal[n - 1];
    let mut out = Vec::with_capacity(n + 2 * pad);
    out.extend((1..=pad).rev().map(|i| 2.0 * first - signal[i]));
    out.extend_from_slice(signal);
    out.extend((1..=pad).map(|i| 2.0 * last - signal[n - 1 - i]));
    out
}

fn scaled_state(zi: &[[f64; 2]], x0: f64) -> Vec<[f64; 2]> {
    zi.iter().map(|[a, b]| [a * x0, b * x0]).collect()
}
