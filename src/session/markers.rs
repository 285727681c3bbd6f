//! Marker log (CSV)

use crate::error::{ErdError, Result};
use crate::types::Marker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize)]
struct MarkerRow {
    onset_sample: u64,
    description: String,
    timestamp: String,
    #[serde(rename = "type", default)]
    kind: String,
}

fn csv_error(e: csv::Error) -> ErdError {
    ErdError::Persistence(format!("marker log: {}", e))
}

/// Writes one row per marker.
pub struct MarkerLogWriter {
    writer: csv::Writer<File>,
    rows: u64,
}

impl MarkerLogWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let writer = csv::Writer::from_path(path.as_ref()).map_err(csv_error)?;
        Ok(Self { writer, rows: 0 })
    }

    pub fn write(&mut self, marker: &Marker) -> Result<()> {
        self.writer
            .serialize(MarkerRow {
                onset_sample: marker.onset,
                description: marker.description.clone(),
                timestamp: marker.received_at.to_rfc3339(),
                kind: marker.kind.clone(),
            })
            .map_err(csv_error)?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Read a marker log back in onset order.
///
/// Logs without a `type` column carry `type/description` in the description
/// field; those are split at the first `/`. In four-column logs the
/// description is taken verbatim, even when the type is empty.
pub fn read_markers(path: impl AsRef<Path>) -> Result<Vec<Marker>> {
    let mut reader = csv::Reader::from_path(path.as_ref()).map_err(csv_error)?;
    let legacy = !reader.headers().map_err(csv_error)?.iter().any(|h| h == "type");
    let mut markers = Vec::new();
    for row in reader.deserialize::<MarkerRow>() {
        let row = row.map_err(csv_error)?;
        let mut marker = if legacy {
            Marker::from_annotation(row.onset_sample, &row.description)
        } else {
            Marker::new(row.onset_sample, row.kind, row.description)
        };
        if let Ok(ts) = DateTime::parse_from_rfc3339(&row.timestamp) {
            marker = marker.with_received_at(ts.with_timezone(&Utc));
        }
        markers.push(marker);
    }
    markers.sort_by_key(|m| m.onset);
    Ok(markers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.csv");

        let mut log = MarkerLogWriter::create(&path).unwrap();
        log.write(&Marker::new(1000, "Stimulus", "S  1")).unwrap();
        log.write(&Marker::new(2500, "Comment", "left, then right \"cue\""))
            .unwrap();
        assert_eq!(log.rows(), 2);
        log.flush().unwrap();
        drop(log);

        let header = std::fs::read_to_string(&path).unwrap();
        assert!(header.starts_with("onset_sample,description,timestamp,type"));

        let markers = read_markers(&path).unwrap();
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].onset, 1000);
        assert_eq!(markers[0].description, "S  1");
        assert_eq!(markers[1].description, "left, then right \"cue\"");
        assert_eq!(markers[1].kind, "Comment");
    }

    #[test]
    fn test_empty_kind_keeps_description() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.csv");

        let mut log = MarkerLogWriter::create(&path).unwrap();
        log.write(&Marker::new(10, "", "left/right")).unwrap();
        log.write(&Marker::new(20, "Stimulus", "S  1/a")).unwrap();
        log.flush().unwrap();
        drop(log);

        let markers = read_markers(&path).unwrap();
        assert_eq!(markers[0].kind, "");
        assert_eq!(markers[0].description, "left/right");
        assert_eq!(markers[1].kind, "Stimulus");
        assert_eq!(markers[1].description, "S  1/a");
    }

    #[test]
    fn test_three_column_log_splits_annotation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old.csv");
        std::fs::write(
            &path,
            "onset_sample,description,timestamp\n\
             750,Stimulus/S  2,2024-03-01T10:00:00Z\n\
             250,Stimulus/S  1,2024-03-01T09:59:59Z\n",
        )
        .unwrap();

        let markers = read_markers(&path).unwrap();
        assert_eq!(markers[0].onset, 250);
        assert_eq!(markers[0].kind, "Stimulus");
        assert_eq!(markers[0].description, "S  1");
        assert_eq!(markers[1].description, "S  2");
    }
}
