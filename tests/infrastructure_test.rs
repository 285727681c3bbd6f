//! Test to verify test infrastructure works correctly

mod common;

use common::builders::{ConfigBuilder, RecordingBuilder};
use tempfile::TempDir;

#[test]
fn test_infrastructure_setup() {
    // Test that builders work
    let dir = TempDir::new().unwrap();
    let recording = RecordingBuilder::new(100.0, 2)
        .seconds(3.0)
        .marker(150, "S  1")
        .write(dir.path(), "infra");

    assert_eq!(recording.channel_count(), 2);
    assert_eq!(recording.len(), 300);
    assert_eq!(recording.markers.len(), 1);
    assert!(recording.metadata.complete);

    let config = ConfigBuilder::new(100.0).replay(dir.path(), "infra").build();
    config.validate().unwrap();
}

#[test]
fn test_float_comparison() {
    common::assert_float_eq(1.0, 1.0000001, 0.001);
}

#[test]
#[should_panic]
fn test_float_comparison_fails() {
    common::assert_float_eq(1.0, 2.0, 0.001);
}

#[test]
fn test_wait_until() {
    assert!(common::wait_until(common::test_timeout(), || true));
    assert!(!common::wait_until(common::test_timeout(), || false));
}
