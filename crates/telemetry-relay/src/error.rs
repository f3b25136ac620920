// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised by the relay pipeline and its delivery channels
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Transport {name} failed to initialize: {reason}")]
    TransportInit { name: String, reason: String },

    #[error("Transport {name} failed to send: {reason}")]
    TransportSend { name: String, reason: String },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Batch checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Malformed batch: {0}")]
    MalformedBatch(String),

    #[error("Malformed fragment: {0}")]
    MalformedFragment(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No transport available")]
    NoTransportAvailable,
}

impl RelayError {
    pub(crate) fn init(name: &str, reason: impl ToString) -> Self {
        Self::TransportInit {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn send(name: &str, reason: impl ToString) -> Self {
        Self::TransportSend {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the failure is confined to a single channel and another
    /// channel may still succeed.
    #[must_use]
    pub fn is_channel_failure(&self) -> bool {
        matches!(self, Self::TransportInit { .. } | Self::TransportSend { .. })
    }
}
