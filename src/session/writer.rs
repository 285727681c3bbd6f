//! Background session writer
//!
//! The computation loop hands samples and markers to [`SessionWriter`], which
//! forwards them over a bounded channel to a dedicated thread owning the
//! files. Enqueueing waits at most a short timeout; anything that cannot be
//! enqueued or written is logged, counted and marks the session incomplete.
//! Acquisition never stops because of persistence.

use super::markers::MarkerLogWriter;
use super::npy::NpyWriter;
use super::types::{PersistenceReport, SessionMetadata, SessionPaths};
use crate::config::PersistenceSettings;
use crate::error::{ErdError, Result, ResultExt};
use crate::types::{Marker, SampleBlock, StreamInfo};
use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

enum WriteItem {
    Samples(Vec<Vec<f64>>),
    Marker(Marker),
}

/// Handle used by the computation loop.
pub struct SessionWriter {
    tx: Option<Sender<WriteItem>>,
    handle: Option<JoinHandle<PersistenceReport>>,
    enqueue_timeout: Duration,
    dropped: Arc<AtomicU64>,
    session: String,
    directory: PathBuf,
}

impl SessionWriter {
    /// Create the session files and start the writer thread.
    pub fn start(
        settings: &PersistenceSettings,
        directory: impl AsRef<Path>,
        session: &str,
        info: &StreamInfo,
    ) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory)
            .with_context(|| format!("Failed to create {}", directory.display()))?;

        let paths = SessionPaths::new(&directory, session);
        let raw = NpyWriter::create(&paths.raw, info.channel_count())
            .with_context(|| format!("Failed to create {}", paths.raw.display()))?;
        let markers = MarkerLogWriter::create(&paths.markers)
            .with_context(|| format!("Failed to create {}", paths.markers.display()))?;
        let mut metadata =
            SessionMetadata::new(session, info.channel_names.clone(), info.sample_rate);
        metadata.complete = false;
        write_metadata(&paths.metadata, &metadata)?;

        let (tx, rx) = bounded(settings.queue_capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let worker = WriterThread {
            rx,
            raw: Some(raw),
            markers,
            metadata,
            paths,
            dropped: dropped.clone(),
            write_errors: 0,
        };
        let handle = std::thread::Builder::new()
            .name("session-writer".into())
            .spawn(move || worker.run())?;

        tracing::info!("Persisting session '{}' to {}", session, directory.display());
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            enqueue_timeout: Duration::from_millis(settings.enqueue_timeout_ms),
            dropped,
            session: session.to_string(),
            directory,
        })
    }

    pub fn record_block(&self, block: &SampleBlock) {
        self.enqueue(WriteItem::Samples(block.data.clone()), "sample block");
    }

    pub fn record_marker(&self, marker: &Marker) {
        self.enqueue(WriteItem::Marker(marker.clone()), "marker");
    }

    fn enqueue(&self, item: WriteItem, what: &str) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.send_timeout(item, self.enqueue_timeout) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::error!("Persistence queue full, dropped {} ({} dropped so far)", what, n);
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Persistence writer has stopped, dropped {}", what);
            }
        }
    }

    /// Number of items that could not be enqueued
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drain the queue, finalize the files and report.
    pub fn finish(mut self) -> PersistenceReport {
        self.tx.take();
        let report = match self.handle.take().map(JoinHandle::join) {
            Some(Ok(report)) => report,
            _ => {
                tracing::error!("Session writer thread panicked");
                PersistenceReport {
                    session: self.session.clone(),
                    directory: self.directory.clone(),
                    dropped: self.dropped(),
                    complete: false,
                    ..Default::default()
                }
            }
        };
        tracing::info!(
            "Session '{}' persisted: {} samples, {} markers, complete: {}",
            report.session,
            report.samples_written,
            report.markers_written,
            report.complete
        );
        report
    }
}

impl Drop for SessionWriter {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct WriterThread {
    rx: Receiver<WriteItem>,
    raw: Option<NpyWriter>,
    markers: MarkerLogWriter,
    metadata: SessionMetadata,
    paths: SessionPaths,
    dropped: Arc<AtomicU64>,
    write_errors: u64,
}

impl WriterThread {
    fn run(mut self) -> PersistenceReport {
        while let Ok(item) = self.rx.recv() {
            let result = match item {
                WriteItem::Samples(data) => match self.raw.as_mut() {
                    Some(raw) => raw.append(&data),
                    None => Err(ErdError::Persistence("raw store already failed".into())),
                },
                WriteItem::Marker(marker) => self.markers.write(&marker),
            };
            if let Err(e) = result {
                self.fail(e);
            }
        }

        let samples = match self.raw.take().map(NpyWriter::finalize) {
            Some(Ok(n)) => n,
            Some(Err(e)) => {
                self.fail(e);
                0
            }
            None => 0,
        };
        if let Err(e) = self.markers.flush() {
            self.fail(e);
        }

        let dropped = self.dropped.load(Ordering::Relaxed);
        self.metadata.ended_at = Some(Utc::now());
        self.metadata.total_samples = samples;
        self.metadata.marker_count = self.markers.rows();
        self.metadata.complete = self.write_errors == 0 && dropped == 0;
        if let Err(e) = write_metadata(&self.paths.metadata, &self.metadata) {
            self.fail(e);
            self.metadata.complete = false;
        }

        PersistenceReport {
            session: self.metadata.name.clone(),
            directory: self
                .paths
                .raw
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
            samples_written: samples,
            markers_written: self.markers.rows(),
            write_errors: self.write_errors,
            dropped,
            complete: self.metadata.complete,
        }
    }

    fn fail(&mut self, error: ErdError) {
        self.write_errors += 1;
        tracing::error!("Session persistence failed: {}", error);
    }
}

fn write_metadata(path: &Path, metadata: &SessionMetadata) -> Result<()> {
    let json = serde_json::to_string_pretty(metadata)
        .map_err(|e| ErdError::Serialization(e.to_string()))?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::recording::RecordedSession;
    use tempfile::tempdir;

    fn info() -> StreamInfo {
        StreamInfo {
            sample_rate: 100.0,
            channel_names: vec!["C3".into(), "C4".into()],
        }
    }

    #[test]
    fn test_persists_blocks_and_markers() {
        let dir = tempdir().unwrap();
        let writer =
            SessionWriter::start(&PersistenceSettings::default(), dir.path(), "t1", &info()).unwrap();

        writer.record_block(&SampleBlock::new(0, 100.0, vec![vec![1.0, 2.0], vec![3.0, 4.0]]));
        writer.record_marker(&Marker::new(1, "Stimulus", "S  1"));
        writer.record_block(&SampleBlock::new(2, 100.0, vec![vec![5.0], vec![6.0]]));

        let report = writer.finish();
        assert!(report.complete);
        assert_eq!(report.samples_written, 3);
        assert_eq!(report.markers_written, 1);
        assert_eq!(report.dropped, 0);

        let session = RecordedSession::load(dir.path(), "t1").unwrap();
        assert_eq!(session.data, vec![vec![1.0, 2.0, 5.0], vec![3.0, 4.0, 6.0]]);
        assert_eq!(session.markers.len(), 1);
        assert_eq!(session.markers[0].onset, 1);
        assert!(session.metadata.complete);
        assert_eq!(session.metadata.total_samples, 3);
    }

    #[test]
    fn test_write_failure_marks_incomplete() {
        let dir = tempdir().unwrap();
        let writer =
            SessionWriter::start(&PersistenceSettings::default(), dir.path(), "t2", &info()).unwrap();

        writer.record_block(&SampleBlock::new(0, 100.0, vec![vec![1.0]]));
        let report = writer.finish();
        assert!(!report.complete);
        assert_eq!(report.write_errors, 1);
        assert_eq!(report.samples_written, 0);
    }

    #[test]
    fn test_unwritable_directory() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        let result = SessionWriter::start(&PersistenceSettings::default(), &file, "t3", &info());
        assert!(result.is_err());
    }
}
