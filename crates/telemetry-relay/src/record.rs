// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed telemetry records handed to the relay by local producers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Timestamp layout used for records, batches and segment names.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Formats a timestamp with millisecond precision.
#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Current time formatted with millisecond precision.
#[must_use]
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Buffer a record is accumulated in. Each kind flushes at its own fraction
/// of the configured buffer size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Metric,
    Log,
    Host,
    Lifecycle,
}

impl RecordKind {
    pub const ALL: [RecordKind; 4] = [
        RecordKind::Metric,
        RecordKind::Log,
        RecordKind::Host,
        RecordKind::Lifecycle,
    ];

    #[must_use]
    pub fn flush_divisor(self) -> usize {
        match self {
            RecordKind::Metric => 4,
            RecordKind::Log | RecordKind::Host => 8,
            RecordKind::Lifecycle => 16,
        }
    }

    /// Buffered length at which this kind is flushed to disk. Never zero.
    #[must_use]
    pub fn flush_threshold(self, max_buffer_size: usize) -> usize {
        (max_buffer_size / self.flush_divisor()).max(1)
    }

    pub(crate) fn index(self) -> usize {
        match self {
            RecordKind::Metric => 0,
            RecordKind::Log => 1,
            RecordKind::Host => 2,
            RecordKind::Lifecycle => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    Metric {
        timestamp: String,
        name: String,
        value: f64,
        #[serde(default)]
        tags: Vec<String>,
    },
    Log {
        timestamp: String,
        level: String,
        source: String,
        message: String,
    },
    HostSnapshot {
        timestamp: String,
        hostname: String,
        os: String,
        memory_total_bytes: u64,
        memory_available_bytes: u64,
        process_count: u32,
    },
    Lifecycle {
        timestamp: String,
        component: String,
        event: String,
        #[serde(default)]
        detail: String,
    },
}

impl Record {
    pub fn metric(name: impl Into<String>, value: f64, tags: Vec<String>) -> Self {
        Record::Metric {
            timestamp: now_timestamp(),
            name: name.into(),
            value,
            tags,
        }
    }

    pub fn log(
        level: impl Into<String>,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Record::Log {
            timestamp: now_timestamp(),
            level: level.into(),
            source: source.into(),
            message: message.into(),
        }
    }

    pub fn lifecycle(
        component: impl Into<String>,
        event: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Record::Lifecycle {
            timestamp: now_timestamp(),
            component: component.into(),
            event: event.into(),
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Metric { .. } => RecordKind::Metric,
            Record::Log { .. } => RecordKind::Log,
            Record::HostSnapshot { .. } => RecordKind::Host,
            Record::Lifecycle { .. } => RecordKind::Lifecycle,
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> &str {
        match self {
            Record::Metric { timestamp, .. }
            | Record::Log { timestamp, .. }
            | Record::HostSnapshot { timestamp, .. }
            | Record::Lifecycle { timestamp, .. } => timestamp,
        }
    }

    /// Serializes the record as a single JSON line, newline included.
    pub fn to_line(&self) -> Result<Vec<u8>, RelayError> {
        let mut line =
            serde_json::to_vec(self).map_err(|e| RelayError::Encoding(e.to_string()))?;
        line.push(b'\n');
        Ok(line)
    }

    /// Parses one JSON record, ignoring surrounding whitespace.
    pub fn from_line(line: &[u8]) -> Result<Self, RelayError> {
        serde_json::from_slice(line.trim_ascii()).map_err(|e| RelayError::Encoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_thresholds() {
        assert_eq!(RecordKind::Metric.flush_threshold(1024), 256);
        assert_eq!(RecordKind::Log.flush_threshold(1024), 128);
        assert_eq!(RecordKind::Host.flush_threshold(1024), 128);
        assert_eq!(RecordKind::Lifecycle.flush_threshold(1024), 64);
        assert_eq!(RecordKind::Lifecycle.flush_threshold(8), 1);
    }

    #[test]
    fn test_timestamp_has_millisecond_precision() {
        let at = DateTime::parse_from_rfc3339("2024-05-01T12:30:45.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_timestamp(at), "2024-05-01T12:30:45.123Z");
    }

    #[test]
    fn test_line_is_tagged_json() {
        let record = Record::Lifecycle {
            timestamp: "2024-05-01T12:30:45.123Z".to_string(),
            component: "ingest".to_string(),
            event: "started".to_string(),
            detail: String::new(),
        };
        let line = record.to_line().expect("serialize");
        assert_eq!(line.last(), Some(&b'\n'));
        let text = String::from_utf8(line.clone()).unwrap();
        assert!(text.starts_with(r#"{"type":"lifecycle""#));
        assert_eq!(Record::from_line(&line).unwrap(), record);
    }

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(Record::metric("cpu", 1.0, vec![]).kind(), RecordKind::Metric);
        assert_eq!(Record::log("info", "app", "hi").kind(), RecordKind::Log);
        assert_eq!(
            Record::lifecycle("app", "stopped", "").kind(),
            RecordKind::Lifecycle
        );
    }

    #[test]
    fn test_from_line_rejects_garbage() {
        assert!(matches!(
            Record::from_line(b"{\"type\":\"unknown\"}"),
            Err(RelayError::Encoding(_))
        ));
    }
}
