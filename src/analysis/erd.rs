//! Event-related desynchronization (ERD) metrics
//!
//! Every epoch is preprocessed once (zero-phase band-pass, then common average
//! reference) and split into a baseline (`pre_samples`) and a post-stimulus
//! segment. Per-channel values are `Option<f64>`: a non-positive or
//! non-finite baseline, or a non-positive logarithm argument, yields `None`
//! rather than a NaN.

use crate::analysis::filter::SosFilter;
use crate::analysis::spectral::WelchEstimator;
use crate::config::SessionConfig;
use crate::error::{ErdError, Result};
use crate::types::{Epoch, ErdMethod, ErdResult, WindowScale};

/// `(post − pre) / pre × 100`
pub fn erd_percent(pre_power: f64, post_power: f64) -> Option<f64> {
    if !(pre_power.is_finite() && post_power.is_finite()) || pre_power <= 0.0 {
        return None;
    }
    Some((post_power - pre_power) / pre_power * 100.0)
}

/// `10·log10(post / pre)`
pub fn erd_db(pre_power: f64, post_power: f64) -> Option<f64> {
    if !(pre_power.is_finite() && post_power.is_finite()) || pre_power <= 0.0 || post_power <= 0.0
    {
        return None;
    }
    Some(10.0 * (post_power / pre_power).log10())
}

/// Mean squared amplitude
pub fn mean_power(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|x| x * x).sum::<f64>() / samples.len() as f64
}

/// Moving-window ERD for every channel.
#[derive(Debug, Clone, PartialEq)]
pub struct MovingWindowErd {
    /// Window length in samples
    pub window: usize,
    /// `series[channel][position]`, one entry per window start over the
    /// whole epoch
    pub series: Vec<Vec<Option<f64>>>,
    /// Per channel mean over the windows lying inside the post segment
    pub mean: Vec<Option<f64>>,
}

/// Computes ERD metrics over epochs of one stream layout.
pub struct ErdCalculator {
    filter: SosFilter,
    welch: WelchEstimator,
    sample_rate: f64,
    pre_samples: usize,
    post_samples: usize,
    band: (f64, f64),
    channel_names: Vec<String>,
    focus: Vec<usize>,
    method: ErdMethod,
    window_size: usize,
    window_scale: WindowScale,
}

impl ErdCalculator {
    /// Build a calculator for a stream with the given channel names.
    pub fn new(config: &SessionConfig, channel_names: Vec<String>) -> Result<Self> {
        let filter = SosFilter::butterworth_bandpass(
            config.filter_order,
            config.bandpass_low,
            config.bandpass_high,
            config.sampling_freq,
        )?;
        let focus = config.focus_indices(channel_names.len());
        if let Some(bad) = focus.iter().find(|&&i| i >= channel_names.len()) {
            return Err(ErdError::Config(format!(
                "Focus channel index {} out of range for {} channels",
                bad,
                channel_names.len()
            )));
        }

        Ok(Self {
            filter,
            welch: WelchEstimator::new(),
            sample_rate: config.sampling_freq,
            pre_samples: config.pre_samples(),
            post_samples: config.post_samples(),
            band: (config.bandpass_low, config.bandpass_high),
            channel_names,
            focus,
            method: config.method,
            window_size: config.moving_average_window_size,
            window_scale: config.moving_window_scale,
        })
    }

    pub fn method(&self) -> ErdMethod {
        self.method
    }

    pub fn pre_samples(&self) -> usize {
        self.pre_samples
    }

    pub fn post_samples(&self) -> usize {
        self.post_samples
    }

    pub fn channel_names(&self) -> &[String] {
        &self.channel_names
    }

    /// Names of the focus channels, in result order
    pub fn focus_names(&self) -> Vec<String> {
        self.focus
            .iter()
            .map(|&i| self.channel_names[i].clone())
            .collect()
    }

    /// Validate, band-pass filter and re-reference an epoch.
    pub fn preprocess(&self, data: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        let expected = self.pre_samples + self.post_samples;
        if data.len() != self.channel_names.len() {
            return Err(ErdError::Computation(format!(
                "Epoch has {} channels, expected {}",
                data.len(),
                self.channel_names.len()
            )));
        }
        if let Some((ch, samples)) = data.iter().enumerate().find(|(_, s)| s.len() != expected) {
            return Err(ErdError::Computation(format!(
                "Channel {} has {} samples, expected {}",
                ch,
                samples.len(),
                expected
            )));
        }
        if let Some(ch) = data
            .iter()
            .position(|s| s.iter().any(|v| !v.is_finite()))
        {
            return Err(ErdError::Computation(format!(
                "Channel {} contains non-finite samples",
                ch
            )));
        }

        let mut filtered: Vec<Vec<f64>> = data.iter().map(|ch| self.filter.filtfilt(ch)).collect();
        common_average_reference(&mut filtered);
        Ok(filtered)
    }

    /// Compute the configured metric for an epoch.
    pub fn compute(&mut self, epoch: &Epoch) -> Result<ErdResult> {
        self.compute_with(epoch, self.method)
    }

    /// Compute a specific metric for an epoch.
    pub fn compute_with(&mut self, epoch: &Epoch, method: ErdMethod) -> Result<ErdResult> {
        let processed = self.preprocess(&epoch.data)?;
        let per_channel = self.channel_values(&processed, method);
        Ok(ErdResult::new(
            &epoch.marker,
            method,
            self.select_focus(&per_channel),
            self.focus_names(),
        ))
    }

    /// Per-channel values of `method` over an already preprocessed epoch.
    pub fn channel_values(&mut self, processed: &[Vec<f64>], method: ErdMethod) -> Vec<Option<f64>> {
        match method {
            ErdMethod::BandpassPower => self.bandpass_erd(processed),
            ErdMethod::Welch => self.welch_erd(processed),
            ErdMethod::DbCorrection => self.db_erd(processed),
            ErdMethod::MovingWindow => {
                self.moving_window_erd(processed, self.window_size, self.window_scale)
                    .mean
            }
        }
    }

    pub fn bandpass_erd(&self, processed: &[Vec<f64>]) -> Vec<Option<f64>> {
        self.segment_powers(processed)
            .map(|(pre, post)| erd_percent(pre, post))
            .collect()
    }

    pub fn db_erd(&self, processed: &[Vec<f64>]) -> Vec<Option<f64>> {
        self.segment_powers(processed)
            .map(|(pre, post)| erd_db(pre, post))
            .collect()
    }

    pub fn welch_erd(&mut self, processed: &[Vec<f64>]) -> Vec<Option<f64>> {
        let (low, high) = self.band;
        let split = self.pre_samples;
        processed
            .iter()
            .map(|ch| {
                let (pre, post) = ch.split_at(split.min(ch.len()));
                let pre_power = self.welch.psd(pre, self.sample_rate).band_power(low, high)?;
                let post_power = self.welch.psd(post, self.sample_rate).band_power(low, high)?;
                erd_percent(pre_power, post_power)
            })
            .collect()
    }

    /// Slide a `window`-sample window over the whole epoch with stride 1 and
    /// express each window's power relative to the full baseline power.
    pub fn moving_window_erd(
        &self,
        processed: &[Vec<f64>],
        window: usize,
        scale: WindowScale,
    ) -> MovingWindowErd {
        let pre = self.pre_samples;
        let mut series = Vec::with_capacity(processed.len());
        let mut mean = Vec::with_capacity(processed.len());

        for ch in processed {
            if window == 0 || window > ch.len() || pre > ch.len() {
                series.push(Vec::new());
                mean.push(None);
                continue;
            }
            let baseline = mean_power(&ch[..pre]);

            // Prefix sums of squares
            let mut prefix = Vec::with_capacity(ch.len() + 1);
            prefix.push(0.0);
            for x in ch {
                let last = prefix[prefix.len() - 1];
                prefix.push(last + x * x);
            }

            let values: Vec<Option<f64>> = (0..=ch.len() - window)
                .map(|i| {
                    let power = (prefix[i + window] - prefix[i]) / window as f64;
                    match scale {
                        WindowScale::Percent => erd_percent(baseline, power),
                        WindowScale::Db => erd_db(baseline, power),
                    }
                })
                .collect();

            let post_windows = values.get(pre..).unwrap_or(&[]);
            mean.push(crate::types::mean_of_defined(post_windows).0);
            series.push(values);
        }

        MovingWindowErd {
            window,
            series,
            mean,
        }
    }

    /// Pick the focus channels from per-channel values.
    pub fn select_focus<T: Clone>(&self, per_channel: &[T]) -> Vec<T> {
        self.focus.iter().map(|&i| per_channel[i].clone()).collect()
    }

    fn segment_powers<'a>(
        &self,
        processed: &'a [Vec<f64>],
    ) -> impl Iterator<Item = (f64, f64)> + 'a {
        let split = self.pre_samples;
        processed.iter().map(move |ch| {
            let (pre, post) = ch.split_at(split.min(ch.len()));
            (mean_power(pre), mean_power(post))
        })
    }
}

/// Subtract the cross-channel mean from every sample.
pub fn common_average_reference(data: &mut [Vec<f64>]) {
    let channels = data.len();
    let Some(len) = data.first().map(Vec::len) else {
        return;
    };
    for t in 0..len {
        let mean = data.iter().map(|ch| ch[t]).sum::<f64>() / channels as f64;
        for ch in data.iter_mut() {
            ch[t] -= mean;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Marker;
    use std::f64::consts::PI;

    const FS: f64 = 250.0;

    fn config() -> SessionConfig {
        SessionConfig {
            sampling_freq: FS,
            epoch_pre_stimulus_seconds: 1.0,
            epoch_post_stimulus_seconds: 1.0,
            bandpass_low: 8.0,
            bandpass_high: 13.0,
            ..Default::default()
        }
    }

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("Ch{}", i + 1)).collect()
    }

    fn epoch(data: Vec<Vec<f64>>) -> Epoch {
        Epoch {
            marker: Marker::new(1000, "Stimulus", "S  1"),
            pre_samples: 250,
            post_samples: 250,
            data,
        }
    }

    #[test]
    fn test_erd_formulas() {
        assert_eq!(erd_percent(2.0, 1.0), Some(-50.0));
        assert_eq!(erd_percent(0.0, 1.0), None);
        assert_eq!(erd_percent(-1.0, 1.0), None);
        assert_eq!(erd_percent(f64::NAN, 1.0), None);
        assert!((erd_db(1.0, 2.0).unwrap() - 3.0103).abs() < 1e-4);
        assert_eq!(erd_db(1.0, 0.0), None);
        assert_eq!(erd_db(0.0, 1.0), None);
    }

    #[test]
    fn test_common_average_reference() {
        let mut data = vec![vec![1.0, 2.0], vec![3.0, 6.0]];
        common_average_reference(&mut data);
        assert_eq!(data, vec![vec![-1.0, -2.0], vec![1.0, 2.0]]);
    }

    #[test]
    fn test_preprocess_rejects_bad_shape() {
        let calc = ErdCalculator::new(&config(), names(2)).unwrap();
        let err = calc.preprocess(&[vec![0.0; 500]]).unwrap_err();
        assert!(matches!(err, ErdError::Computation(_)));

        let err = calc.preprocess(&[vec![0.0; 500], vec![0.0; 499]]).unwrap_err();
        assert!(matches!(err, ErdError::Computation(_)));
    }

    #[test]
    fn test_preprocess_rejects_non_finite() {
        let calc = ErdCalculator::new(&config(), names(2)).unwrap();
        let mut bad = vec![vec![0.0; 500], vec![0.0; 500]];
        bad[1][17] = f64::NAN;
        assert!(calc.preprocess(&bad).is_err());
    }

    #[test]
    fn test_compute_failure_is_error_not_partial() {
        let mut calc = ErdCalculator::new(&config(), names(2)).unwrap();
        let result = calc.compute(&epoch(vec![vec![0.0; 10], vec![0.0; 10]]));
        assert!(result.is_err());
    }

    #[test]
    fn test_bandpass_doubling_power() {
        // Processed data: post segment amplitude √2 times baseline
        let calc = ErdCalculator::new(&config(), names(1)).unwrap();
        let data: Vec<f64> = (0..500)
            .map(|i| {
                let amp = if i < 250 { 1.0 } else { 2f64.sqrt() };
                amp * (2.0 * PI * 10.0 * i as f64 / FS).sin()
            })
            .collect();
        let erd = calc.bandpass_erd(&[data.clone()]);
        assert!((erd[0].unwrap() - 100.0).abs() < 1e-6);
        let db = calc.db_erd(&[data]);
        assert!((db[0].unwrap() - 10.0 * 2f64.log10()).abs() < 1e-9);
    }

    #[test]
    fn test_zero_baseline_is_undefined() {
        let calc = ErdCalculator::new(&config(), names(2)).unwrap();
        let mut ch = vec![0.0; 500];
        for v in ch.iter_mut().skip(250) {
            *v = 1.0;
        }
        let values = calc.bandpass_erd(&[ch.clone(), vec![1.0; 500]]);
        assert_eq!(values[0], None);
        assert_eq!(values[1], Some(0.0));
        assert_eq!(calc.db_erd(&[ch])[0], None);
    }

    #[test]
    fn test_moving_window_full_post_equals_bandpass() {
        let calc = ErdCalculator::new(&config(), names(1)).unwrap();
        let data: Vec<f64> = (0..500)
            .map(|i| {
                let amp = if i < 250 { 1.5 } else { 0.7 };
                amp * (2.0 * PI * 11.0 * i as f64 / FS).sin()
            })
            .collect();
        let mw = calc.moving_window_erd(&[data.clone()], 250, WindowScale::Percent);
        assert_eq!(mw.series[0].len(), 251);
        let bp = calc.bandpass_erd(&[data]);
        assert!((mw.mean[0].unwrap() - bp[0].unwrap()).abs() < 1e-9);
    }

    #[test]
    fn test_moving_window_db_scale() {
        let calc = ErdCalculator::new(&config(), names(1)).unwrap();
        let mut data = vec![1.0; 500];
        for v in data.iter_mut().skip(250) {
            *v = 2.0;
        }
        let mw = calc.moving_window_erd(&[data], 50, WindowScale::Db);
        // Post windows carry 4x power
        assert!((mw.mean[0].unwrap() - 10.0 * 4f64.log10()).abs() < 1e-9);
        // First window sits entirely in the baseline
        assert!(mw.series[0][0].unwrap().abs() < 1e-12);
    }

    #[test]
    fn test_welch_erd_sign() {
        let mut calc = ErdCalculator::new(&config(), names(1)).unwrap();
        let data: Vec<f64> = (0..500)
            .map(|i| {
                let amp = if i < 250 { 2.0 } else { 1.0 };
                amp * (2.0 * PI * 10.0 * i as f64 / FS).sin()
            })
            .collect();
        let erd = calc.welch_erd(&[data]);
        let value = erd[0].unwrap();
        assert!(value < -50.0, "expected strong desynchronization, got {}", value);
    }

    #[test]
    fn test_compute_selects_focus_channels() {
        let cfg = SessionConfig {
            focus_channels_indices: vec![2, 0],
            ..config()
        };
        let mut calc = ErdCalculator::new(&cfg, names(3)).unwrap();
        let data: Vec<Vec<f64>> = (0..3)
            .map(|c| {
                (0..500)
                    .map(|i| ((c + 1) as f64) * (2.0 * PI * 10.0 * i as f64 / FS + c as f64).sin())
                    .collect()
            })
            .collect();
        let result = calc.compute(&epoch(data)).unwrap();
        assert_eq!(result.channel_names, vec!["Ch3".to_string(), "Ch1".to_string()]);
        assert_eq!(result.erd_percent.len(), 2);
        assert_eq!(result.marker_stream_pos, 1000);
    }

    #[test]
    fn test_rejects_out_of_range_focus() {
        let cfg = SessionConfig {
            focus_channels_indices: vec![5],
            ..config()
        };
        assert!(ErdCalculator::new(&cfg, names(2)).is_err());
    }
}
