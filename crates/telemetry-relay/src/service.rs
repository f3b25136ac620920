// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::buffer::RecordBuffer;
use crate::record::Record;

#[derive(Debug)]
pub enum BufferCommand {
    Insert(Record),
    InsertBatch(Vec<Record>),
    Flush(oneshot::Sender<FlushResponse>),
    Shutdown,
}

#[derive(Debug)]
pub struct FlushResponse {
    pub flushed: bool,
    pub flush_count: u64,
}

/// Cloneable producer side of the record buffer.
#[derive(Clone)]
pub struct RecordBufferHandle {
    tx: mpsc::UnboundedSender<BufferCommand>,
}

impl RecordBufferHandle {
    pub fn insert(&self, record: Record) -> Result<(), mpsc::error::SendError<BufferCommand>> {
        self.tx.send(BufferCommand::Insert(record))
    }

    pub fn insert_batch(
        &self,
        records: Vec<Record>,
    ) -> Result<(), mpsc::error::SendError<BufferCommand>> {
        self.tx.send(BufferCommand::InsertBatch(records))
    }

    /// Flushes every buffer to the active segment once all earlier inserts are applied.
    pub async fn flush(&self) -> Result<FlushResponse, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(BufferCommand::Flush(response_tx))
            .map_err(|e| format!("Failed to send flush command: {e}"))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive flush response: {e}"))
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<BufferCommand>> {
        self.tx.send(BufferCommand::Shutdown)
    }
}

pub struct RecordBufferService {
    buffer: Arc<RecordBuffer>,
    rx: mpsc::UnboundedReceiver<BufferCommand>,
}

impl RecordBufferService {
    #[must_use]
    pub fn new(buffer: Arc<RecordBuffer>) -> (Self, RecordBufferHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { buffer, rx }, RecordBufferHandle { tx })
    }

    fn insert(&self, record: &Record) -> bool {
        match self.buffer.add(record) {
            Ok(_) => true,
            Err(e) => {
                debug!("Dropping record: {e}");
                false
            }
        }
    }

    /// Applies commands until `Shutdown` or every handle is dropped. Buffers are flushed
    /// on the way out.
    pub async fn run(mut self) {
        debug!("Record buffer service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                BufferCommand::Insert(record) => {
                    self.insert(&record);
                }
                BufferCommand::InsertBatch(records) => {
                    let failed = records.iter().filter(|r| !self.insert(r)).count();
                    if failed > 0 {
                        warn!("Total of {failed} records failed to buffer");
                    }
                }
                BufferCommand::Flush(response_tx) => {
                    let flushed = match self.buffer.flush_all() {
                        Ok(()) => true,
                        Err(e) => {
                            error!("RELAY | Flush failed: {e}");
                            false
                        }
                    };
                    let response = FlushResponse {
                        flushed,
                        flush_count: self.buffer.flush_count(),
                    };
                    if response_tx.send(response).is_err() {
                        error!("Failed to send flush response - receiver dropped");
                    }
                }
                BufferCommand::Shutdown => {
                    debug!("Record buffer service shutting down");
                    break;
                }
            }
        }

        if let Err(e) = self.buffer.flush_all() {
            error!("RELAY | Final flush failed: {e}");
        }
        debug!("Record buffer service stopped");
    }
}
