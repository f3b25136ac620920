// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! UDP intake for locally produced records.
//!
//! Each datagram carries one or more newline-separated JSON records in the
//! same shape they are stored in segments. Valid records are forwarded to the
//! record buffer service; malformed lines are logged and dropped.

use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::RelayError;
use crate::record::Record;
use crate::service::RecordBufferHandle;

// Largest datagram accepted in one read.
const BUFFER_SIZE: usize = 65_507;

pub struct IngestConfig {
    /// Host to bind the UDP socket to (e.g., "127.0.0.1")
    pub host: String,
    /// Port to bind to, 0 for an ephemeral port
    pub port: u16,
}

pub struct IngestListener {
    socket: UdpSocket,
    buffer_handle: RecordBufferHandle,
    cancel_token: CancellationToken,
}

fn parse_records(datagram: &[u8]) -> Vec<Record> {
    datagram
        .split(|b| *b == b'\n')
        .filter(|line| !line.trim_ascii().is_empty())
        .filter_map(|line| match Record::from_line(line) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(
                    "Failed to parse record {}: {e}",
                    String::from_utf8_lossy(line)
                );
                None
            }
        })
        .collect()
}

impl IngestListener {
    pub async fn bind(
        config: &IngestConfig,
        buffer_handle: RecordBufferHandle,
        cancel_token: CancellationToken,
    ) -> Result<Self, RelayError> {
        let socket = UdpSocket::bind(format!("{}:{}", config.host, config.port)).await?;
        Ok(Self {
            socket,
            buffer_handle,
            cancel_token,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.socket.local_addr()?)
    }

    /// Receives datagrams until the token is cancelled.
    pub async fn spin(self) {
        let mut buf = vec![0; BUFFER_SIZE];
        debug!("RELAY | Intake listening");
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((amt, src)) => self.consume(&buf[..amt], src),
                    Err(e) => error!("RELAY | Failed to receive datagram: {e}"),
                },
            }
        }
        debug!("RELAY | Intake stopped");
    }

    fn consume(&self, datagram: &[u8], src: SocketAddr) {
        trace!("Received {} bytes from {src}", datagram.len());
        let records = parse_records(datagram);
        if records.is_empty() {
            return;
        }
        debug!("Inserting {} records from {src}", records.len());
        if let Err(e) = self.buffer_handle.insert_batch(records) {
            error!("Failed to send records to buffer: {e}");
        }
    }
}
