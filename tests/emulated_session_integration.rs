//! Integration tests replaying persisted sessions through the full pipeline

mod common;

use common::builders::{ConfigBuilder, RecordingBuilder};
use common::mock_helpers::run_to_completion;
use erd_stream::analysis::{calculate_erd_across_trials, extract_epoch, ErdCalculator};
use erd_stream::pipeline::Session;
use erd_stream::session::RecordedSession;
use erd_stream::types::{mean_of_defined, PipelineState};
use std::time::Duration;
use tempfile::TempDir;

const FS: f64 = 250.0;

/// 12 s, three markers whose post-stimulus second is attenuated to half
/// amplitude.
fn attenuated_recording() -> RecordingBuilder {
    let mut builder = RecordingBuilder::new(FS, 4).seconds(12.0);
    for onset in [750u64, 1500, 2250] {
        builder = builder
            .gain(onset as usize, onset as usize + 250, 0.5)
            .marker(onset, "S  1");
    }
    builder
}

#[test]
fn test_replay_produces_one_result_per_marker() {
    let dir = TempDir::new().unwrap();
    attenuated_recording().write(dir.path(), "source");

    let config = ConfigBuilder::new(FS).replay(dir.path(), "source").build();
    let run = run_to_completion(Session::from_config(config).unwrap(), Duration::from_secs(30));

    assert!(run.summary.is_success(), "{:?}", run.summary.failure);
    assert_eq!(run.summary.final_state, PipelineState::Closed);
    assert_eq!(run.summary.stats.samples, 3000);
    assert_eq!(run.summary.results(), 3);
    assert_eq!(run.summary.overruns(), 0);

    let onsets: Vec<u64> = run.results.iter().map(|r| r.marker_stream_pos).collect();
    assert_eq!(onsets, vec![750, 1500, 2250]);
    for result in &run.results {
        assert_eq!(result.channel_names, vec!["Ch1", "Ch2", "Ch3", "Ch4"]);
        assert_eq!(result.undefined_channels(), 0);
        let mean = result.erd_mean.unwrap();
        // Half amplitude is a quarter of the power
        assert!(mean < -50.0 && mean > -90.0, "ERD {} not a desynchronization", mean);
    }
}

#[test]
fn test_persisted_replay_matches_source() {
    let source_dir = TempDir::new().unwrap();
    let out_dir = TempDir::new().unwrap();
    let recording = attenuated_recording().write(source_dir.path(), "source");

    let config = ConfigBuilder::new(FS)
        .replay(source_dir.path(), "source")
        .persist_to(out_dir.path(), "replayed")
        .build();
    let run = run_to_completion(Session::from_config(config).unwrap(), Duration::from_secs(30));
    assert!(run.summary.is_success());
    assert!(run.summary.persistence.complete);
    assert_eq!(run.summary.persistence.samples_written, 3000);
    assert_eq!(run.summary.persistence.markers_written, 3);

    let replayed = RecordedSession::load(out_dir.path(), "replayed").unwrap();
    assert!(replayed.metadata.complete);
    assert!(replayed.metadata.ended_at.is_some());
    assert_eq!(replayed.data, recording.data);
    let onsets: Vec<u64> = replayed.markers.iter().map(|m| m.onset).collect();
    assert_eq!(onsets, vec![750, 1500, 2250]);
}

#[test]
fn test_offline_epochs_reproduce_online_results() {
    let source_dir = TempDir::new().unwrap();
    let out_dir = TempDir::new().unwrap();
    attenuated_recording().write(source_dir.path(), "source");

    let config = ConfigBuilder::new(FS)
        .replay(source_dir.path(), "source")
        .persist_to(out_dir.path(), "replayed")
        .build();
    let run = run_to_completion(
        Session::from_config(config.clone()).unwrap(),
        Duration::from_secs(30),
    );
    assert_eq!(run.results.len(), 3);

    let stored = RecordedSession::load(out_dir.path(), "replayed").unwrap();
    let mut calculator = ErdCalculator::new(&config, stored.channel_names().to_vec()).unwrap();
    for (marker, online) in stored.markers.iter().zip(&run.results) {
        let epoch = extract_epoch(
            &stored.data,
            marker,
            config.pre_samples(),
            config.post_samples(),
        )
        .unwrap();
        let offline = calculator.compute(&epoch).unwrap();
        assert_eq!(offline.marker_stream_pos, online.marker_stream_pos);
        assert_eq!(offline.erd_percent, online.erd_percent);
    }

    let categories =
        calculate_erd_across_trials(&mut calculator, &config, &stored.data, &stored.markers);
    assert_eq!(categories.len(), 1);
    assert_eq!(categories[0].trials, 3);
    assert_eq!(categories[0].defined, 3);
    let online_means: Vec<Option<f64>> = run.results.iter().map(|r| r.erd_mean).collect();
    let (expected, _) = mean_of_defined(&online_means);
    common::assert_float_eq(categories[0].mean_erd.unwrap(), expected.unwrap(), 1e-9);
}

#[test]
fn test_only_unservable_markers_overrun() {
    let dir = TempDir::new().unwrap();
    // The buffer holds exactly one epoch. Replay blocks are 5 samples, so a
    // marker whose epoch ends on a block boundary is still fully retained
    // while one ending mid-block has lost its first samples.
    RecordingBuilder::new(FS, 4)
        .seconds(8.0)
        .marker(100, "early")
        .marker(750, "aligned")
        .marker(1502, "unaligned")
        .write(dir.path(), "source");

    let config = ConfigBuilder::new(FS)
        .replay(dir.path(), "source")
        .retention(2.0)
        .build();
    let run = run_to_completion(Session::from_config(config).unwrap(), Duration::from_secs(30));

    assert!(run.summary.is_success());
    assert_eq!(run.results.len(), 1);
    assert_eq!(run.results[0].marker_description, "aligned");
    assert_eq!(run.summary.overruns(), 2);

    let mut overrun: Vec<&str> = run.overruns.iter().map(|(d, _)| d.as_str()).collect();
    overrun.sort_unstable();
    assert_eq!(overrun, vec!["early", "unaligned"]);
}

#[test]
fn test_focus_markers_filter_replay() {
    let dir = TempDir::new().unwrap();
    RecordingBuilder::new(FS, 2)
        .seconds(6.0)
        .marker(500, "S  1")
        .marker(1000, "S  2")
        .write(dir.path(), "source");

    let config = ConfigBuilder::new(FS)
        .replay(dir.path(), "source")
        .focus_markers(&["S  2"])
        .build();
    let run = run_to_completion(Session::from_config(config).unwrap(), Duration::from_secs(30));

    assert_eq!(run.summary.stats.markers, 2);
    assert_eq!(run.summary.stats.markers_ignored, 1);
    assert_eq!(run.results.len(), 1);
    assert_eq!(run.results[0].marker_stream_pos, 1000);
}

#[test]
fn test_missing_recording_fails_session() {
    let dir = TempDir::new().unwrap();
    let config = ConfigBuilder::new(FS).replay(dir.path(), "absent").build();
    let session = Session::from_config(config)
        .unwrap()
        .with_retry_policy(erd_stream::source::RetryPolicy::none());
    let run = run_to_completion(session, Duration::from_secs(10));

    assert!(!run.summary.is_success());
    assert_eq!(run.summary.final_state, PipelineState::Closed);
    assert!(run.results.is_empty());
    assert!(run.states.contains(&PipelineState::Connecting));
}
