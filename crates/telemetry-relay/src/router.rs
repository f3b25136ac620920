// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reliability-scored delivery across several channels.
//!
//! Every attempt adjusts the channel's score; the best-scoring channel is
//! tried first and a fixed preference order follows. Payloads above the
//! fragment threshold can be split into self-describing fragments
//! (`FRAG:<index>:<total>:` followed by the chunk) that a collector
//! reassembles with [`reassemble`].

use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::codec::PayloadCodec;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::transport::{channels_from_config, Transport};

pub const MIN_SCORE: f64 = 0.1;
pub const MAX_SCORE: f64 = 1.0;
pub const INITIAL_SCORE: f64 = 0.5;
const SUCCESS_REWARD: f64 = 0.05;
const FAILURE_PENALTY: f64 = 0.10;

pub const MIN_FRAGMENT_SIZE: usize = 256;
pub const MAX_FRAGMENT_SIZE: usize = 64 * 1024;
const FRAGMENT_PREFIX: &[u8] = b"FRAG:";

/// Channels tried after the best-scoring one, in this order.
pub const PREFERENCE_ORDER: [&str; 3] = ["http", "https", "ftp"];

/// Per-channel reliability scores, bounded to `[MIN_SCORE, MAX_SCORE]`.
#[derive(Debug, Clone, Default)]
pub struct ReliabilityTable {
    scores: HashMap<String, f64>,
}

impl ReliabilityTable {
    #[must_use]
    pub fn score(&self, channel: &str) -> f64 {
        self.scores.get(channel).copied().unwrap_or(INITIAL_SCORE)
    }

    pub fn record(&mut self, channel: &str, success: bool) -> f64 {
        let current = self.score(channel);
        let updated = if success {
            (current + SUCCESS_REWARD).min(MAX_SCORE)
        } else {
            (current - FAILURE_PENALTY).max(MIN_SCORE)
        };
        self.scores.insert(channel.to_string(), updated);
        updated
    }
}

/// Splits `payload` into `FRAG:<index>:<total>:` prefixed fragments of at most
/// `chunk_size` payload bytes. An empty payload yields a single empty fragment.
#[must_use]
pub fn fragment(payload: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    let chunk_size = chunk_size.max(1);
    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![payload]
    } else {
        payload.chunks(chunk_size).collect()
    };
    let total = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            let mut fragment = format!("FRAG:{index}:{total}:").into_bytes();
            fragment.extend_from_slice(chunk);
            fragment
        })
        .collect()
}

/// Parses a fragment into `(index, total, chunk)`.
pub fn parse_fragment(fragment: &[u8]) -> Result<(usize, usize, &[u8]), RelayError> {
    let rest = fragment
        .strip_prefix(FRAGMENT_PREFIX)
        .ok_or_else(|| RelayError::MalformedFragment("missing FRAG prefix".to_string()))?;

    let mut fields = rest.splitn(3, |b| *b == b':');
    let mut number = |what: &str| -> Result<usize, RelayError> {
        fields
            .next()
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .and_then(|raw| raw.parse::<usize>().ok())
            .ok_or_else(|| RelayError::MalformedFragment(format!("bad {what}")))
    };
    let index = number("index")?;
    let total = number("total")?;
    let chunk = fields
        .next()
        .ok_or_else(|| RelayError::MalformedFragment("missing payload separator".to_string()))?;

    if total == 0 || index >= total {
        return Err(RelayError::MalformedFragment(format!(
            "index {index} out of range for total {total}"
        )));
    }
    Ok((index, total, chunk))
}

/// Rebuilds a payload from its fragments, in any arrival order.
pub fn reassemble<T: AsRef<[u8]>>(fragments: &[T]) -> Result<Vec<u8>, RelayError> {
    let mut parsed = fragments
        .iter()
        .map(|f| parse_fragment(f.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;

    let total = parsed
        .first()
        .map(|(_, total, _)| *total)
        .ok_or_else(|| RelayError::MalformedFragment("no fragments".to_string()))?;
    if parsed.iter().any(|(_, t, _)| *t != total) {
        return Err(RelayError::MalformedFragment(
            "fragments disagree on total".to_string(),
        ));
    }

    parsed.sort_by_key(|(index, _, _)| *index);
    parsed.dedup_by_key(|(index, _, _)| *index);
    if parsed.len() != total {
        return Err(RelayError::MalformedFragment(format!(
            "have {} of {total} fragments",
            parsed.len()
        )));
    }

    Ok(parsed
        .into_iter()
        .flat_map(|(_, _, chunk)| chunk.iter().copied())
        .collect())
}

pub struct ReliabilityRouter {
    channels: Vec<Box<dyn Transport>>,
    table: ReliabilityTable,
    codec: PayloadCodec,
    fragment_size: usize,
    fragment_interval: Duration,
}

impl std::fmt::Debug for ReliabilityRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliabilityRouter")
            .field(
                "channels",
                &self.channels.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .field("table", &self.table)
            .field("fragment_size", &self.fragment_size)
            .finish()
    }
}

impl ReliabilityRouter {
    #[must_use]
    pub fn new(
        channels: Vec<Box<dyn Transport>>,
        codec: PayloadCodec,
        fragment_size: usize,
        fragment_interval: Duration,
    ) -> Self {
        Self {
            channels,
            table: ReliabilityTable::default(),
            codec,
            fragment_size: fragment_size.clamp(MIN_FRAGMENT_SIZE, MAX_FRAGMENT_SIZE),
            fragment_interval,
        }
    }

    #[must_use]
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(
            channels_from_config(config),
            PayloadCodec::new(config.compression_level, config.encryption_key.as_deref()),
            config.fragment_size,
            config.fragment_interval,
        )
    }

    #[must_use]
    pub fn table(&self) -> &ReliabilityTable {
        &self.table
    }

    #[must_use]
    pub fn codec(&self) -> &PayloadCodec {
        &self.codec
    }

    #[must_use]
    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    /// Initializes channels that are not ready yet and returns the indices that are.
    async fn available(&mut self) -> Vec<usize> {
        let mut ready = Vec::new();
        for (index, channel) in self.channels.iter_mut().enumerate() {
            if channel.is_initialized() {
                ready.push(index);
                continue;
            }
            match channel.initialize().await {
                Ok(()) => ready.push(index),
                Err(e) => debug!("Channel unavailable: {e}"),
            }
        }
        ready
    }

    /// Best available channel first, then the preference order, then the rest of the
    /// available channels in registration order. No channel appears twice.
    async fn candidates(&mut self) -> Vec<usize> {
        let available = self.available().await;
        let mut order = Vec::with_capacity(available.len());

        let best = available.iter().copied().fold(None, |best: Option<usize>, index| {
            match best {
                Some(current)
                    if self.table.score(self.channels[current].name())
                        >= self.table.score(self.channels[index].name()) =>
                {
                    Some(current)
                }
                _ => Some(index),
            }
        });
        order.extend(best);

        for name in PREFERENCE_ORDER {
            if let Some(index) = available
                .iter()
                .copied()
                .find(|i| self.channels[*i].name() == name)
            {
                if !order.contains(&index) {
                    order.push(index);
                }
            }
        }
        for index in available {
            if !order.contains(&index) {
                order.push(index);
            }
        }
        order
    }

    async fn deliver(&mut self, payload: &[u8]) -> Result<String, RelayError> {
        for index in self.candidates().await {
            let channel = &mut self.channels[index];
            let result = channel.send(payload).await;
            let name = channel.name().to_string();
            let score = self.table.record(&name, result.is_ok());
            match result {
                Ok(()) => {
                    debug!("Delivered {} bytes over {name} (score {score:.2})", payload.len());
                    return Ok(name);
                }
                Err(e) => warn!("RELAY | {e} (score now {score:.2})"),
            }
        }
        Err(RelayError::NoTransportAvailable)
    }

    /// Encodes and delivers `payload` over the best channel that accepts it.
    pub async fn send(&mut self, payload: &[u8]) -> Result<String, RelayError> {
        let encoded = self.codec.encode(payload)?;
        self.deliver(&encoded).await
    }

    /// Encodes `payload` once, then delivers it as fragments, pausing the configured
    /// interval between them. Returns the number of fragments sent.
    pub async fn send_fragmented(&mut self, payload: &[u8]) -> Result<usize, RelayError> {
        let encoded = self.codec.encode(payload)?;
        let fragments = fragment(&encoded, self.fragment_size);
        let total = fragments.len();

        for (index, fragment) in fragments.iter().enumerate() {
            if index > 0 && !self.fragment_interval.is_zero() {
                tokio::time::sleep(self.fragment_interval).await;
            }
            if let Err(e) = self.deliver(fragment).await {
                warn!("RELAY | Fragment {index} of {total} undeliverable");
                return Err(e);
            }
        }
        debug!("Delivered {} encoded bytes in {total} fragments", encoded.len());
        Ok(total)
    }

    pub async fn cleanup(&mut self) {
        for channel in &mut self.channels {
            channel.cleanup().await;
        }
    }
}
