// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory record buffers backed by the segment store.
//!
//! Each record kind has its own byte buffer. A buffer is flushed to the
//! active segment as soon as its length reaches the kind's share of
//! `max_buffer_size`. Buffers, flushes, rotation and batch checkout all go
//! through one mutex so concurrent producers never interleave partial writes.
//! No network I/O happens under the lock.

use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;
use tracing::{debug, error, warn};

use crate::batch::{Batch, BatchFile};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::record::{Record, RecordKind};
use crate::segment::{SegmentPolicy, SegmentState, SegmentStore};

#[derive(Debug)]
struct BufferState {
    buffers: [Vec<u8>; 4],
    store: SegmentStore,
    max_buffer_size: usize,
    flushes: u64,
}

impl BufferState {
    fn flush_kind(&mut self, kind: RecordKind) -> Result<(), RelayError> {
        let index = kind.index();
        if self.buffers[index].is_empty() {
            return Ok(());
        }
        // On failure the bytes stay buffered for the next attempt.
        self.store.append(&self.buffers[index])?;
        debug!(
            "Flushed {} bytes of {:?} records",
            self.buffers[index].len(),
            kind
        );
        self.buffers[index].clear();
        self.flushes += 1;
        Ok(())
    }

    fn flush_all(&mut self) -> Result<(), RelayError> {
        let mut result = Ok(());
        for kind in RecordKind::ALL {
            if let Err(e) = self.flush_kind(kind) {
                error!("RELAY | Failed to flush {kind:?} buffer: {e}");
                result = Err(e);
            }
        }
        result
    }
}

#[derive(Debug)]
pub struct RecordBuffer {
    state: Mutex<BufferState>,
}

impl RecordBuffer {
    #[must_use]
    pub fn new(store: SegmentStore, max_buffer_size: usize) -> Self {
        Self {
            state: Mutex::new(BufferState {
                buffers: Default::default(),
                store,
                max_buffer_size,
                flushes: 0,
            }),
        }
    }

    /// Opens the segment store under `config.data_dir` with default rotation windows.
    pub fn open(config: &RelayConfig) -> Result<Self, RelayError> {
        let policy = SegmentPolicy {
            max_file_size: config.max_file_size,
            ..Default::default()
        };
        let store = SegmentStore::open(&config.data_dir, policy)?;
        Ok(Self::new(store, config.max_buffer_size))
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned")
    }

    /// Buffers a record. Returns whether this append triggered a flush.
    pub fn add(&self, record: &Record) -> Result<bool, RelayError> {
        let line = record.to_line()?;
        Ok(self.add_bytes(record.kind(), &line))
    }

    /// Buffers pre-serialized bytes under `kind`. The buffer is flushed when its length first
    /// reaches the kind's threshold. Returns whether a flush happened; a failed flush keeps
    /// the bytes buffered and returns `false`.
    pub fn add_bytes(&self, kind: RecordKind, bytes: &[u8]) -> bool {
        let mut state = self.lock();
        let threshold = kind.flush_threshold(state.max_buffer_size);
        let buffer = &mut state.buffers[kind.index()];
        buffer.extend_from_slice(bytes);
        if buffer.len() < threshold {
            return false;
        }
        match state.flush_kind(kind) {
            Ok(()) => true,
            Err(e) => {
                warn!("RELAY | Keeping {kind:?} records in memory, flush failed: {e}");
                false
            }
        }
    }

    pub fn flush_all(&self) -> Result<(), RelayError> {
        self.lock().flush_all()
    }

    /// Closes the active segment.
    pub fn rotate(&self) -> Result<(), RelayError> {
        self.lock().store.rotate().map(|_| ())
    }

    /// Closes the active segment if it has been open for the rotation interval.
    pub fn maybe_rotate(&self) -> Result<(), RelayError> {
        self.lock().store.maybe_rotate().map(|_| ())
    }

    /// True when a segment is ready for delivery or any buffer holds records.
    #[must_use]
    pub fn has_data(&self) -> bool {
        let state = self.lock();
        if state.buffers.iter().any(|b| !b.is_empty()) {
            return true;
        }
        match state.store.has_ready() {
            Ok(ready) => ready,
            Err(e) => {
                warn!("Failed to scan segments: {e}");
                false
            }
        }
    }

    #[must_use]
    pub fn buffered_len(&self, kind: RecordKind) -> usize {
        self.lock().buffers[kind.index()].len()
    }

    /// Number of buffer-to-segment flushes so far.
    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.lock().flushes
    }

    /// Drops every buffered record without writing it.
    pub fn clear(&self) {
        for buffer in self.lock().buffers.iter_mut() {
            buffer.clear();
        }
    }

    /// Flushes buffers, then moves every ready segment in flight and frames them into one
    /// batch. Returns `None` when nothing is ready. The segments stay in flight until
    /// [`confirm`](Self::confirm) or [`release`](Self::release).
    pub fn checkout_batch(&self, client_id: &str) -> Result<Option<Batch>, RelayError> {
        let mut state = self.lock();
        if let Err(e) = state.flush_all() {
            warn!("RELAY | Building batch without unflushed records: {e}");
        }

        let ready = state.store.ready_segments()?;
        if ready.is_empty() {
            return Ok(None);
        }

        let mut files = Vec::with_capacity(ready.len());
        let mut segments = Vec::with_capacity(ready.len());
        let mut window: Option<(SystemTime, SystemTime)> = None;
        for segment in ready {
            let in_flight = state.store.mark_in_flight(&segment.path)?;
            let data = match fs::read(&in_flight) {
                Ok(data) => data,
                Err(e) => {
                    error!("Failed to read {}: {e}", in_flight.display());
                    state.store.release(&in_flight)?;
                    continue;
                }
            };
            window = Some(match window {
                Some((start, end)) => (start.min(segment.modified), end.max(segment.modified)),
                None => (segment.modified, segment.modified),
            });
            files.push(BatchFile {
                name: segment.name,
                data,
            });
            segments.push(in_flight);
        }

        let Some(window) = window else {
            return Ok(None);
        };
        let batch = Batch::assemble(client_id, &files, window, segments);
        debug!(
            "Checked out batch {} with {} segments ({} bytes)",
            batch.header.batch_id, batch.header.file_count, batch.header.total_size
        );
        Ok(Some(batch))
    }

    /// Marks a delivered batch's segments transmitted.
    pub fn confirm(&self, batch: &Batch) -> Result<(), RelayError> {
        let state = self.lock();
        for segment in &batch.segments {
            state.store.mark_transmitted(segment)?;
        }
        Ok(())
    }

    /// Returns an undelivered batch's segments to the ready pool.
    pub fn release(&self, batch: &Batch) -> Result<(), RelayError> {
        let state = self.lock();
        let mut result = Ok(());
        for segment in &batch.segments {
            if let Err(e) = state.store.release(segment) {
                error!("Failed to release {}: {e}", segment.display());
                result = Err(e);
            }
        }
        result
    }

    /// Deletes transmitted segments past their retention window.
    pub fn purge_expired(&self) -> Result<usize, RelayError> {
        self.lock().store.purge_expired()
    }

    pub fn segment_count(&self, state: SegmentState) -> Result<usize, RelayError> {
        self.lock().store.count(state)
    }

    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.lock().store.dir().to_path_buf()
    }

    #[cfg(test)]
    pub(crate) fn active_segment_exists(&self) -> bool {
        self.lock().store.active_path().is_some_and(std::path::Path::exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::DecodedBatch;
    use crate::segment::tests::backdate_closed;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn buffer(dir: &TempDir, max_buffer_size: usize) -> RecordBuffer {
        RecordBuffer::new(
            SegmentStore::open(dir.path(), SegmentPolicy::default()).unwrap(),
            max_buffer_size,
        )
    }

    #[test]
    fn test_flush_exactly_at_threshold() {
        let dir = TempDir::new().unwrap();
        let buffer = buffer(&dir, 1024);

        // Metric threshold is 1024 / 4 = 256 bytes.
        assert!(!buffer.add_bytes(RecordKind::Metric, &[b'a'; 100]));
        assert!(!buffer.add_bytes(RecordKind::Metric, &[b'a'; 155]));
        assert_eq!(buffer.flush_count(), 0);
        assert_eq!(buffer.buffered_len(RecordKind::Metric), 255);

        assert!(buffer.add_bytes(RecordKind::Metric, &[b'a'; 1]));
        assert_eq!(buffer.flush_count(), 1);
        assert_eq!(buffer.buffered_len(RecordKind::Metric), 0);
        assert!(buffer.active_segment_exists());
    }

    #[test]
    fn test_large_append_flushes_once() {
        let dir = TempDir::new().unwrap();
        let buffer = buffer(&dir, 1024);

        assert!(buffer.add_bytes(RecordKind::Metric, &[b'k'; 300]));
        assert_eq!(buffer.flush_count(), 1);
        assert!(buffer.add_bytes(RecordKind::Metric, &[b'k'; 300]));
        assert_eq!(buffer.flush_count(), 2);
    }

    #[test]
    fn test_thresholds_per_kind() {
        let dir = TempDir::new().unwrap();
        let buffer = buffer(&dir, 1024);

        assert!(!buffer.add_bytes(RecordKind::Log, &[b'l'; 127]));
        assert!(buffer.add_bytes(RecordKind::Log, &[b'l'; 1]));
        assert!(!buffer.add_bytes(RecordKind::Host, &[b'h'; 127]));
        assert!(buffer.add_bytes(RecordKind::Host, &[b'h'; 1]));
        assert!(!buffer.add_bytes(RecordKind::Lifecycle, &[b'e'; 63]));
        assert!(buffer.add_bytes(RecordKind::Lifecycle, &[b'e'; 1]));
        assert_eq!(buffer.flush_count(), 3);
    }

    #[test]
    fn test_has_data_tracks_buffers_and_ready_segments() {
        let dir = TempDir::new().unwrap();
        let buffer = buffer(&dir, 1 << 20);
        assert!(!buffer.has_data());

        buffer.add(&Record::log("info", "app", "hello")).unwrap();
        assert!(buffer.has_data());

        buffer.flush_all().unwrap();
        assert!(!buffer.has_data());

        buffer.rotate().unwrap();
        assert!(!buffer.has_data());
        backdate_closed(dir.path(), Duration::from_secs(120));
        assert!(buffer.has_data());
    }

    #[test]
    fn test_clear_drops_buffered_records() {
        let dir = TempDir::new().unwrap();
        let buffer = buffer(&dir, 1 << 20);
        buffer.add(&Record::metric("cpu", 0.5, vec![])).unwrap();
        buffer.clear();
        assert!(!buffer.has_data());
        assert_eq!(buffer.flush_count(), 0);
    }

    #[test]
    fn test_checkout_confirm_and_release() {
        let dir = TempDir::new().unwrap();
        let buffer = buffer(&dir, 1 << 20);
        assert!(buffer.checkout_batch("client").unwrap().is_none());

        let record = Record::metric("requests", 3.0, vec!["env:test".to_string()]);
        buffer.add(&record).unwrap();
        buffer.flush_all().unwrap();
        buffer.rotate().unwrap();
        backdate_closed(dir.path(), Duration::from_secs(120));

        let batch = buffer.checkout_batch("client").unwrap().expect("ready batch");
        assert_eq!(batch.header.file_count, 1);
        assert_eq!(buffer.segment_count(SegmentState::InFlight).unwrap(), 1);
        assert!(buffer.checkout_batch("client").unwrap().is_none());

        let decoded = DecodedBatch::parse(&batch.payload).unwrap();
        assert_eq!(Record::from_line(&decoded.files[0].data).unwrap(), record);

        buffer.release(&batch).unwrap();
        assert_eq!(buffer.segment_count(SegmentState::Closed).unwrap(), 1);
        assert!(buffer.has_data());

        let batch = buffer.checkout_batch("client").unwrap().expect("released batch is ready");
        buffer.confirm(&batch).unwrap();
        assert_eq!(buffer.segment_count(SegmentState::Sent).unwrap(), 1);
        assert!(!buffer.has_data());
    }

    #[test]
    fn test_storage_failure_keeps_records_buffered() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("segments");
        let buffer = RecordBuffer::new(
            SegmentStore::open(&data_dir, SegmentPolicy::default()).unwrap(),
            64,
        );
        fs::remove_dir_all(&data_dir).unwrap();

        assert!(!buffer.add_bytes(RecordKind::Metric, &[b'x'; 32]));
        assert_eq!(buffer.buffered_len(RecordKind::Metric), 32);
        assert!(buffer.flush_all().is_err());
        assert!(buffer.has_data());

        fs::create_dir_all(&data_dir).unwrap();
        buffer.flush_all().unwrap();
        assert_eq!(buffer.buffered_len(RecordKind::Metric), 0);
    }

    #[test]
    fn test_concurrent_producers_do_not_interleave_records() {
        let dir = TempDir::new().unwrap();
        let buffer = Arc::new(buffer(&dir, 512));

        let handles: Vec<_> = (0..4)
            .map(|producer| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let record = Record::log("info", format!("p{producer}"), format!("m{i}"));
                        buffer.add(&record).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        buffer.flush_all().unwrap();
        buffer.rotate().unwrap();
        backdate_closed(dir.path(), Duration::from_secs(120));

        let batch = buffer.checkout_batch("client").unwrap().unwrap();
        let decoded = DecodedBatch::parse(&batch.payload).unwrap();
        let lines: Vec<_> = decoded
            .files
            .iter()
            .flat_map(|f| f.data.split(|b| *b == b'\n').filter(|l| !l.is_empty()).map(<[u8]>::to_vec))
            .collect();
        assert_eq!(lines.len(), 200);
        assert!(lines.iter().all(|line| Record::from_line(line).is_ok()));
    }
}
