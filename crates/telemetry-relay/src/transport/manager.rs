// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Channel registry with configured selection, fallback and rotation.
//!
//! Channels are kept in registration order; that order drives both
//! `fallback` and `rotate`, so every channel is reachable from any other in
//! at most N rotations.

use tracing::{debug, info, warn};

use crate::codec::PayloadCodec;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::transport::{channels_from_config, Transport};

pub struct TransportManager {
    channels: Vec<Box<dyn Transport>>,
    active: Option<usize>,
    preferred: String,
    endpoint: String,
    codec: PayloadCodec,
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportManager")
            .field("channels", &self.channel_names())
            .field("active", &self.active_name())
            .field("preferred", &self.preferred)
            .finish()
    }
}

impl TransportManager {
    /// An empty registry. `preferred` names the channel `initialize` tries first.
    #[must_use]
    pub fn new(preferred: &str, endpoint: &str, codec: PayloadCodec) -> Self {
        Self {
            channels: Vec::new(),
            active: None,
            preferred: preferred.to_string(),
            endpoint: endpoint.to_string(),
            codec,
        }
    }

    #[must_use]
    pub fn from_config(config: &RelayConfig) -> Self {
        let mut manager = Self::new(
            config.transport.as_str(),
            config.effective_server_url(),
            PayloadCodec::new(config.compression_level, config.encryption_key.as_deref()),
        );
        for channel in channels_from_config(config) {
            manager.register(channel);
        }
        manager
    }

    /// Adds a channel. A channel registered under an existing name replaces it in place.
    pub fn register(&mut self, channel: Box<dyn Transport>) {
        match self.position(channel.name()) {
            Some(index) => {
                if self.active == Some(index) {
                    self.active = None;
                }
                self.channels[index] = channel;
            }
            None => self.channels.push(channel),
        }
    }

    #[must_use]
    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    #[must_use]
    pub fn active_name(&self) -> Option<&str> {
        self.active.map(|index| self.channels[index].name())
    }

    #[must_use]
    pub fn codec(&self) -> &PayloadCodec {
        &self.codec
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|c| c.name() == name)
    }

    async fn initialize_at(&mut self, index: usize) -> Result<(), RelayError> {
        let endpoint = self.endpoint.clone();
        let channel = &mut self.channels[index];
        channel.set_endpoint(&endpoint);
        channel.initialize().await
    }

    /// Initializes the configured channel, falling back to the others when it fails.
    /// Returns the name of the channel that became active.
    pub async fn initialize(&mut self) -> Result<String, RelayError> {
        let preferred = self.preferred.clone();
        let Some(index) = self.position(&preferred) else {
            warn!("Configured channel {preferred} is not registered");
            return self.fallback(&preferred).await;
        };

        match self.initialize_at(index).await {
            Ok(()) => {
                self.active = Some(index);
                info!("RELAY | Using {preferred} channel");
                Ok(preferred)
            }
            Err(e) => {
                warn!("RELAY | {e}; falling back");
                self.fallback(&preferred).await
            }
        }
    }

    /// Tries every channel other than `failed`, in registration order, and activates the
    /// first one that initializes.
    pub async fn fallback(&mut self, failed: &str) -> Result<String, RelayError> {
        for index in 0..self.channels.len() {
            if self.channels[index].name() == failed {
                continue;
            }
            match self.initialize_at(index).await {
                Ok(()) => {
                    self.active = Some(index);
                    let name = self.channels[index].name().to_string();
                    info!("RELAY | Fell back from {failed} to {name}");
                    return Ok(name);
                }
                Err(e) => debug!("Fallback candidate rejected: {e}"),
            }
        }
        self.active = None;
        Err(RelayError::NoTransportAvailable)
    }

    /// Advances the active cursor to the next registered channel, wrapping to the first.
    /// Returns the new active channel's name.
    pub fn rotate(&mut self) -> Option<&str> {
        if self.channels.is_empty() {
            return None;
        }
        let next = match self.active {
            Some(index) => (index + 1) % self.channels.len(),
            None => 0,
        };
        self.active = Some(next);
        Some(self.channels[next].name())
    }

    async fn send_active(&mut self, payload: &[u8]) -> Result<(), RelayError> {
        let Some(index) = self.active else {
            return Err(RelayError::NoTransportAvailable);
        };
        if !self.channels[index].is_initialized() {
            self.initialize_at(index).await?;
        }
        self.channels[index].send(payload).await
    }

    /// Encodes `payload` and sends it over the active channel. A failed send rotates to the
    /// next channel and is retried once there; a second failure is returned to the caller.
    pub async fn transmit(&mut self, payload: &[u8]) -> Result<String, RelayError> {
        if self.active.is_none() {
            self.initialize().await?;
        }
        let encoded = self.codec.encode(payload)?;

        match self.send_active(&encoded).await {
            Ok(()) => Ok(self.active_name().unwrap_or_default().to_string()),
            Err(first) => {
                warn!("RELAY | {first}; rotating channel");
                let Some(next) = self.rotate().map(str::to_string) else {
                    return Err(first);
                };
                match self.send_active(&encoded).await {
                    Ok(()) => Ok(next),
                    Err(second) => {
                        warn!("RELAY | Retry over {next} failed: {second}");
                        Err(second)
                    }
                }
            }
        }
    }

    pub async fn test_active(&mut self) -> bool {
        match self.active {
            Some(index) => self.channels[index].test_connection().await,
            None => false,
        }
    }

    pub async fn receive(&mut self) -> Vec<u8> {
        match self.active {
            Some(index) => self.channels[index].receive().await,
            None => Vec::new(),
        }
    }

    pub async fn cleanup(&mut self) {
        for channel in &mut self.channels {
            channel.cleanup().await;
        }
        self.active = None;
    }
}
