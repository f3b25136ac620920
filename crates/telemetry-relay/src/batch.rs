// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batch wire format.
//!
//! ```text
//! METADATA_START
//! batch_id:<id>
//! client_id:<id>
//! timestamp:<created>
//! start_time:<oldest segment>
//! end_time:<newest segment>
//! total_size:<sum of segment sizes>
//! file_count:<n>
//! checksum:<sha256 hex of everything after METADATA_END>
//! METADATA_END
//! FILE_DELIMITER:<name>:SIZE:<n>
//! <n raw bytes>
//! ...
//! ```

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::SystemTime;

use crate::error::RelayError;
use crate::record::format_timestamp;

const METADATA_START: &str = "METADATA_START\n";
const METADATA_END: &str = "METADATA_END\n";
const FILE_DELIMITER: &str = "FILE_DELIMITER:";
const SIZE_MARKER: &str = ":SIZE:";
const FINGERPRINT_LEN: usize = 8;

/// One segment's contents inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFile {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchHeader {
    pub batch_id: String,
    pub client_id: String,
    pub timestamp: String,
    pub start_time: String,
    pub end_time: String,
    pub total_size: usize,
    pub file_count: usize,
    pub checksum: String,
}

/// A framed batch ready for delivery, plus the in-flight segments it was built from.
#[derive(Debug, Clone)]
pub struct Batch {
    pub header: BatchHeader,
    pub payload: Vec<u8>,
    pub segments: Vec<PathBuf>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn frame_files(files: &[BatchFile]) -> Vec<u8> {
    let mut body = Vec::with_capacity(files.iter().map(|f| f.data.len() + 64).sum());
    for file in files {
        body.extend_from_slice(
            format!("{FILE_DELIMITER}{}{SIZE_MARKER}{}\n", file.name, file.data.len()).as_bytes(),
        );
        body.extend_from_slice(&file.data);
    }
    body
}

impl Batch {
    /// Frames `files` under a metadata header. `window` is the modification time range of the
    /// constituent segments.
    #[must_use]
    pub fn assemble(
        client_id: &str,
        files: &[BatchFile],
        window: (SystemTime, SystemTime),
        segments: Vec<PathBuf>,
    ) -> Self {
        let body = frame_files(files);
        let checksum = sha256_hex(&body);
        let now = Utc::now();
        let header = BatchHeader {
            batch_id: format!(
                "{}-{}",
                now.format("%Y%m%dT%H%M%S%3f"),
                &checksum[..FINGERPRINT_LEN]
            ),
            client_id: client_id.to_string(),
            timestamp: format_timestamp(now),
            start_time: format_timestamp(DateTime::<Utc>::from(window.0)),
            end_time: format_timestamp(DateTime::<Utc>::from(window.1)),
            total_size: files.iter().map(|f| f.data.len()).sum(),
            file_count: files.len(),
            checksum,
        };

        let mut payload = header.render().into_bytes();
        payload.extend_from_slice(&body);
        Self {
            header,
            payload,
            segments,
        }
    }

    /// Re-parses the payload and checks it against its own checksum and counts.
    pub fn verify(&self) -> Result<(), RelayError> {
        let decoded = DecodedBatch::parse(&self.payload)?;
        if decoded.header != self.header {
            return Err(RelayError::MalformedBatch(
                "header does not match payload".to_string(),
            ));
        }
        Ok(())
    }
}

impl BatchHeader {
    fn render(&self) -> String {
        format!(
            "{METADATA_START}batch_id:{}\nclient_id:{}\ntimestamp:{}\nstart_time:{}\nend_time:{}\ntotal_size:{}\nfile_count:{}\nchecksum:{}\n{METADATA_END}",
            self.batch_id,
            self.client_id,
            self.timestamp,
            self.start_time,
            self.end_time,
            self.total_size,
            self.file_count,
            self.checksum,
        )
    }
}

/// A batch read back from its wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBatch {
    pub header: BatchHeader,
    pub files: Vec<BatchFile>,
}

fn malformed(reason: impl Into<String>) -> RelayError {
    RelayError::MalformedBatch(reason.into())
}

fn take_line(input: &[u8]) -> Result<(&str, &[u8]), RelayError> {
    let end = input
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| malformed("unterminated line"))?;
    let line = std::str::from_utf8(&input[..end]).map_err(|_| malformed("non-utf8 header"))?;
    Ok((line, &input[end + 1..]))
}

impl DecodedBatch {
    /// Parses a framed batch and verifies its checksum, size and file count.
    pub fn parse(payload: &[u8]) -> Result<Self, RelayError> {
        let mut rest = payload
            .strip_prefix(METADATA_START.as_bytes())
            .ok_or_else(|| malformed("missing METADATA_START"))?;

        let mut fields = std::collections::HashMap::new();
        loop {
            let (line, remaining) = take_line(rest)?;
            rest = remaining;
            if line == METADATA_END.trim_end() {
                break;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| malformed(format!("bad header line '{line}'")))?;
            fields.insert(key.to_string(), value.to_string());
        }

        let field = |key: &str| -> Result<String, RelayError> {
            fields
                .get(key)
                .cloned()
                .ok_or_else(|| malformed(format!("missing {key}")))
        };
        let number = |key: &str| -> Result<usize, RelayError> {
            field(key)?
                .parse()
                .map_err(|_| malformed(format!("{key} is not a number")))
        };

        let header = BatchHeader {
            batch_id: field("batch_id")?,
            client_id: field("client_id")?,
            timestamp: field("timestamp")?,
            start_time: field("start_time")?,
            end_time: field("end_time")?,
            total_size: number("total_size")?,
            file_count: number("file_count")?,
            checksum: field("checksum")?,
        };

        let actual = sha256_hex(rest);
        if actual != header.checksum {
            return Err(RelayError::ChecksumMismatch {
                expected: header.checksum,
                actual,
            });
        }

        let mut files = Vec::new();
        while !rest.is_empty() {
            let (line, remaining) = take_line(rest)?;
            let (name, size) = line
                .strip_prefix(FILE_DELIMITER)
                .and_then(|frame| frame.rsplit_once(SIZE_MARKER))
                .ok_or_else(|| malformed(format!("bad file delimiter '{line}'")))?;
            let size: usize = size
                .parse()
                .map_err(|_| malformed(format!("bad size in '{line}'")))?;
            if remaining.len() < size {
                return Err(malformed(format!("file {name} truncated")));
            }
            files.push(BatchFile {
                name: name.to_string(),
                data: remaining[..size].to_vec(),
            });
            rest = &remaining[size..];
        }

        if files.len() != header.file_count {
            return Err(malformed(format!(
                "file_count {} but {} files framed",
                header.file_count,
                files.len()
            )));
        }
        let total: usize = files.iter().map(|f| f.data.len()).sum();
        if total != header.total_size {
            return Err(malformed(format!(
                "total_size {} but {total} bytes framed",
                header.total_size
            )));
        }

        Ok(Self { header, files })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now_window() -> (SystemTime, SystemTime) {
        let now = SystemTime::now();
        (now, now)
    }

    fn files() -> Vec<BatchFile> {
        vec![
            BatchFile {
                name: "segment_20240501T120000000_000001".to_string(),
                data: b"{\"type\":\"log\"}\n".to_vec(),
            },
            BatchFile {
                name: "segment_20240501T120500000_000002".to_string(),
                data: vec![0, 1, 2, b'\n', b':', 255],
            },
        ]
    }

    #[test]
    fn test_wire_layout() {
        let batch = Batch::assemble("client-1", &files(), now_window(), vec![]);
        let text = String::from_utf8_lossy(&batch.payload);
        assert!(text.starts_with("METADATA_START\nbatch_id:"));
        assert!(text.contains("\nclient_id:client-1\n"));
        assert!(text.contains("\ntotal_size:21\n"));
        assert!(text.contains("\nfile_count:2\n"));
        assert!(text.contains(
            "METADATA_END\nFILE_DELIMITER:segment_20240501T120000000_000001:SIZE:15\n"
        ));
        assert!(batch.header.batch_id.ends_with(&batch.header.checksum[..8]));
    }

    #[test]
    fn test_parse_recovers_files() {
        let batch = Batch::assemble("client-1", &files(), now_window(), vec![]);
        batch.verify().expect("fresh batch verifies");
        let decoded = DecodedBatch::parse(&batch.payload).unwrap();
        assert_eq!(decoded.files, files());
        assert_eq!(decoded.header, batch.header);
    }

    #[test]
    fn test_empty_batch() {
        let batch = Batch::assemble("client-1", &[], now_window(), vec![]);
        let decoded = DecodedBatch::parse(&batch.payload).unwrap();
        assert!(decoded.files.is_empty());
        assert_eq!(decoded.header.total_size, 0);
    }

    #[test]
    fn test_corrupted_body_is_checksum_mismatch() {
        let mut batch = Batch::assemble("client-1", &files(), now_window(), vec![]);
        let last = batch.payload.len() - 1;
        batch.payload[last] ^= 0x01;
        assert!(matches!(
            batch.verify(),
            Err(RelayError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_malformed_frames() {
        assert!(DecodedBatch::parse(b"garbage").is_err());
        assert!(DecodedBatch::parse(b"METADATA_START\nbatch_id:x\n").is_err());

        let body = b"FILE_DELIMITER:a:SIZE:10\nshort";
        let header = BatchHeader {
            batch_id: "b".to_string(),
            client_id: "c".to_string(),
            timestamp: "t".to_string(),
            start_time: "t".to_string(),
            end_time: "t".to_string(),
            total_size: 10,
            file_count: 1,
            checksum: sha256_hex(body),
        };
        let mut payload = header.render().into_bytes();
        payload.extend_from_slice(body);
        assert!(matches!(
            DecodedBatch::parse(&payload),
            Err(RelayError::MalformedBatch(_))
        ));
    }
}
