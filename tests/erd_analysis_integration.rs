//! Offline ERD analysis over synthetic recordings

mod common;

use common::builders::{ConfigBuilder, RecordingBuilder};
use erd_stream::analysis::{calculate_erd_across_trials, ErdCalculator, TrialFailure, WelchEstimator};
use erd_stream::config::SessionConfig;
use erd_stream::types::{ErdMethod, WindowScale};
use proptest::prelude::*;
use std::f64::consts::PI;
use tempfile::TempDir;

const FS: f64 = 250.0;

fn labelled(config: SessionConfig) -> SessionConfig {
    let mut config = config;
    config.marker_labels.insert("S  1".into(), "left".into());
    config.marker_labels.insert("S  2".into(), "right".into());
    config
}

#[test]
fn test_categories_exclude_undefined_and_out_of_range_trials() {
    let dir = TempDir::new().unwrap();
    let recording = RecordingBuilder::new(FS, 2)
        .seconds(12.0)
        .marker(500, "S  1")
        // Flat epoch: zero baseline power
        .silence(1250, 1750)
        .marker(1500, "S  1")
        .gain(2000, 2250, 0.5)
        .marker(2000, "S  2")
        .marker(2600, "S  1")
        .marker(2900, "S  2")
        .write(dir.path(), "trials");

    let config = labelled(ConfigBuilder::new(FS).build());
    let mut calc = ErdCalculator::new(&config, recording.channel_names().to_vec()).unwrap();
    let categories =
        calculate_erd_across_trials(&mut calc, &config, &recording.data, &recording.markers);

    assert_eq!(categories.len(), 2);
    let left = &categories[0];
    assert_eq!(left.category, "left");
    assert_eq!(left.trials, 3);
    assert_eq!(left.defined, 2);
    assert_eq!(left.failures, vec![(1500, TrialFailure::Undefined)]);
    // Stationary tone around the two defined markers
    assert!(left.mean_erd.unwrap().abs() < 25.0, "{:?}", left.mean_erd);

    let right = &categories[1];
    assert_eq!(right.category, "right");
    assert_eq!(right.trials, 2);
    assert_eq!(right.defined, 1);
    assert_eq!(right.failed, 1);
    assert_eq!(right.failures, vec![(2900, TrialFailure::OutOfRange)]);
    assert!(right.mean_erd.unwrap() < -50.0);
    assert!(right.power_averaged_erd.unwrap() < -50.0);
}

#[test]
fn test_doubled_power_reads_as_synchronization() {
    let dir = TempDir::new().unwrap();
    let mut builder = RecordingBuilder::new(FS, 3).seconds(12.0);
    for onset in [750u64, 1750, 2500] {
        builder = builder
            .gain(onset as usize, onset as usize + 250, 2f64.sqrt())
            .marker(onset, "S  1");
    }
    let recording = builder.write(dir.path(), "ers");

    let percent = ConfigBuilder::new(FS).build();
    let mut calc = ErdCalculator::new(&percent, recording.channel_names().to_vec()).unwrap();
    let categories =
        calculate_erd_across_trials(&mut calc, &percent, &recording.data, &recording.markers);
    let erd = categories[0].mean_erd.unwrap();
    assert!((erd - 100.0).abs() < 20.0, "expected about +100%, got {}", erd);

    let db = ConfigBuilder::new(FS).method(ErdMethod::DbCorrection).build();
    let mut calc = ErdCalculator::new(&db, recording.channel_names().to_vec()).unwrap();
    let categories =
        calculate_erd_across_trials(&mut calc, &db, &recording.data, &recording.markers);
    let value = categories[0].mean_erd.unwrap();
    assert!((value - 3.0103).abs() < 0.6, "expected about +3 dB, got {}", value);
}

#[test]
fn test_methods_agree_on_direction() {
    let dir = TempDir::new().unwrap();
    let recording = RecordingBuilder::new(FS, 3)
        .seconds(6.0)
        .gain(750, 1000, 0.4)
        .marker(750, "S  1")
        .write(dir.path(), "methods");

    for method in ErdMethod::all() {
        let config = ConfigBuilder::new(FS).method(*method).build();
        let mut calc = ErdCalculator::new(&config, recording.channel_names().to_vec()).unwrap();
        let categories =
            calculate_erd_across_trials(&mut calc, &config, &recording.data, &recording.markers);
        let value = categories[0].mean_erd.unwrap();
        assert!(value < 0.0, "{} reported {} for attenuated power", method, value);
    }
}

fn tone(amplitude_pre: f64, amplitude_post: f64, hz: f64) -> Vec<f64> {
    (0..500)
        .map(|i| {
            let amp = if i < 250 { amplitude_pre } else { amplitude_post };
            amp * (2.0 * PI * hz * i as f64 / FS).sin()
        })
        .collect()
}

proptest! {
    #[test]
    fn test_welch_density_is_non_negative(
        samples in prop::collection::vec(-1000.0f64..1000.0, 0..600),
    ) {
        let mut welch = WelchEstimator::new();
        let psd = welch.psd(&samples, FS);
        prop_assert!(psd.density.iter().all(|&p| p >= 0.0));
        if let Some(power) = psd.band_power(8.0, 13.0) {
            prop_assert!(power >= 0.0);
        }
    }

    #[test]
    fn test_percent_and_db_share_sign(
        pre in 0.1f64..10.0,
        post in 0.1f64..10.0,
        hz in 8.5f64..12.5,
    ) {
        let config = ConfigBuilder::new(FS).build();
        let calc = ErdCalculator::new(&config, vec!["C3".into()]).unwrap();
        let data = [tone(pre, post, hz)];
        let percent = calc.bandpass_erd(&data)[0].unwrap();
        let db = calc.db_erd(&data)[0].unwrap();
        prop_assert_eq!(percent > 0.0, db > 0.0);
        prop_assert!((db - 10.0 * (1.0 + percent / 100.0).log10()).abs() < 1e-9);
    }

    #[test]
    fn test_full_window_moving_average_matches_bandpass(
        pre in 0.1f64..10.0,
        post in 0.1f64..10.0,
    ) {
        let config = ConfigBuilder::new(FS).build();
        let calc = ErdCalculator::new(&config, vec!["C3".into()]).unwrap();
        let data = [tone(pre, post, 10.0)];
        let mw = calc.moving_window_erd(&data, 250, WindowScale::Percent);
        let bp = calc.bandpass_erd(&data);
        prop_assert!((mw.mean[0].unwrap() - bp[0].unwrap()).abs() < 1e-6);
    }
}
