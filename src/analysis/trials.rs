//! Trial aggregation over a recorded session
//!
//! Groups markers by category, scores one epoch per marker and summarizes each
//! category two ways: the mean of the per-trial focus aggregates, and the ERD
//! of the trial-averaged instantaneous power.

use crate::analysis::erd::{erd_percent, ErdCalculator};
use crate::config::SessionConfig;
use crate::types::{mean_of_defined, Epoch, Marker};
use std::collections::BTreeMap;

/// Why a marker produced no defined value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialFailure {
    /// The window reaches outside the recording
    OutOfRange,
    /// Preprocessing rejected the epoch
    Computation,
    /// Every focus channel was undefined
    Undefined,
}

/// Summary for one marker category
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryErd {
    pub category: String,
    /// Markers of this category considered
    pub trials: usize,
    /// Mean of the defined per-trial focus aggregates
    pub mean_erd: Option<f64>,
    /// Trials that contributed to `mean_erd`
    pub defined: usize,
    /// Trials that produced no defined value
    pub failed: usize,
    pub failures: Vec<(u64, TrialFailure)>,
    /// ERD of the power averaged across trials, mean over focus channels
    pub power_averaged_erd: Option<f64>,
}

impl CategoryErd {
    fn new(category: &str) -> Self {
        Self {
            category: category.to_string(),
            trials: 0,
            mean_erd: None,
            defined: 0,
            failed: 0,
            failures: Vec::new(),
            power_averaged_erd: None,
        }
    }
}

/// Cut the `[onset − pre, onset + post)` window out of a channel-major recording.
///
/// Returns `None` when the window does not lie entirely inside the recording.
pub fn extract_epoch(data: &[Vec<f64>], marker: &Marker, pre: usize, post: usize) -> Option<Epoch> {
    let total = data.first().map(Vec::len)?;
    let start = marker.onset.checked_sub(pre as u64)? as usize;
    let end = start + pre + post;
    if end > total {
        return None;
    }
    Some(Epoch {
        marker: marker.clone(),
        pre_samples: pre,
        post_samples: post,
        data: data.iter().map(|ch| ch[start..end].to_vec()).collect(),
    })
}

/// Per-category ERD across all trials of a recording.
///
/// `data` is channel-major. Markers filtered out by the focus-marker list are
/// skipped; categories come from the marker label table when present.
pub fn calculate_erd_across_trials(
    calculator: &mut ErdCalculator,
    config: &SessionConfig,
    data: &[Vec<f64>],
    markers: &[Marker],
) -> Vec<CategoryErd> {
    let pre = calculator.pre_samples();
    let post = calculator.post_samples();
    let method = calculator.method();

    let mut summaries: BTreeMap<String, CategoryErd> = BTreeMap::new();
    let mut trial_means: BTreeMap<String, Vec<Option<f64>>> = BTreeMap::new();
    let mut power_sums: BTreeMap<String, (Vec<Vec<f64>>, usize)> = BTreeMap::new();

    for marker in markers {
        if !config.accepts_marker(&marker.description) {
            continue;
        }
        let category = config.category(&marker.description).to_string();
        let summary = summaries
            .entry(category.clone())
            .or_insert_with(|| CategoryErd::new(&category));
        summary.trials += 1;

        let Some(epoch) = extract_epoch(data, marker, pre, post) else {
            summary.failures.push((marker.onset, TrialFailure::OutOfRange));
            continue;
        };
        let processed = match calculator.preprocess(&epoch.data) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("Trial at sample {} rejected: {}", marker.onset, e);
                summary.failures.push((marker.onset, TrialFailure::Computation));
                continue;
            }
        };

        let (sum, count) = power_sums
            .entry(category.clone())
            .or_insert_with(|| (vec![vec![0.0; pre + post]; processed.len()], 0));
        for (acc, ch) in sum.iter_mut().zip(&processed) {
            for (a, x) in acc.iter_mut().zip(ch) {
                *a += x * x;
            }
        }
        *count += 1;

        let values = calculator.channel_values(&processed, method);
        let (trial_mean, _) = mean_of_defined(&calculator.select_focus(&values));
        if trial_mean.is_none() {
            summary.failures.push((marker.onset, TrialFailure::Undefined));
        }
        trial_means.entry(category).or_default().push(trial_mean);
    }

    for (category, summary) in summaries.iter_mut() {
        let means = trial_means.get(category).map(Vec::as_slice).unwrap_or(&[]);
        let (mean, _) = mean_of_defined(means);
        summary.mean_erd = mean;
        summary.defined = means.iter().flatten().count();
        summary.failed = summary.failures.len();

        if let Some((sum, count)) = power_sums.get(category) {
            let per_channel: Vec<Option<f64>> = sum
                .iter()
                .map(|ch| {
                    let n = *count as f64;
                    let baseline = ch[..pre].iter().sum::<f64>() / (pre as f64 * n);
                    let activation = ch[pre..].iter().sum::<f64>() / (post as f64 * n);
                    erd_percent(baseline, activation)
                })
                .collect();
            summary.power_averaged_erd = mean_of_defined(&calculator.select_focus(&per_channel)).0;
        }
    }

    summaries.into_values().collect()
}
