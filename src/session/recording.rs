//! Loading a persisted session for replay or offline analysis

use super::markers::read_markers;
use super::npy::read_npy;
use super::types::{SessionMetadata, SessionPaths};
use crate::error::{ErdError, Result, ResultExt};
use crate::types::Marker;
use std::path::Path;

/// A session read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSession {
    pub metadata: SessionMetadata,
    /// `data[channel][sample]`
    pub data: Vec<Vec<f64>>,
    /// Markers in onset order
    pub markers: Vec<Marker>,
}

impl RecordedSession {
    /// Load `<dir>/<session>_{raw.npy,markers.csv,session.json}`.
    pub fn load(dir: impl AsRef<Path>, session: &str) -> Result<Self> {
        let paths = SessionPaths::new(dir, session);

        let json = std::fs::read_to_string(&paths.metadata)
            .with_context(|| format!("Failed to read {}", paths.metadata.display()))?;
        let metadata: SessionMetadata = serde_json::from_str(&json)
            .map_err(|e| ErdError::Serialization(format!("{}: {}", paths.metadata.display(), e)))?;

        let data = read_npy(&paths.raw)
            .with_context(|| format!("Failed to read {}", paths.raw.display()))?;
        if data.len() != metadata.channel_count() {
            return Err(ErdError::Persistence(format!(
                "{} has {} channels but metadata lists {}",
                paths.raw.display(),
                data.len(),
                metadata.channel_count()
            )));
        }

        let markers = if paths.markers.exists() {
            read_markers(&paths.markers)?
        } else {
            tracing::warn!("No marker log at {}", paths.markers.display());
            Vec::new()
        };

        if !metadata.complete {
            tracing::warn!("Session '{}' was not persisted completely", metadata.name);
        }

        Ok(Self {
            metadata,
            data,
            markers,
        })
    }

    pub fn sample_rate(&self) -> f64 {
        self.metadata.sample_rate
    }

    pub fn channel_names(&self) -> &[String] {
        &self.metadata.channel_names
    }

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
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_session() {
        let dir = tempdir().unwrap();
        let err = RecordedSession::load(dir.path(), "nope").unwrap_err();
        assert!(err.to_string().contains("nope_session.json"));
    }
}
