// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery channels.
//!
//! A channel moves an opaque byte payload to the collector. Channels are
//! owned by a [`manager::TransportManager`] or a
//! [`crate::router::ReliabilityRouter`] and are never driven concurrently.

use async_trait::async_trait;

use crate::config::{RelayConfig, TransportKind};
use crate::error::RelayError;

pub mod ftp;
pub mod http;
pub mod manager;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable registry name, e.g. `https`.
    fn name(&self) -> &str;

    /// Replaces the destination. Takes effect on the next `initialize`.
    fn set_endpoint(&mut self, endpoint: &str);

    fn is_initialized(&self) -> bool;

    /// Prepares connection state. Calling it on an initialized channel re-initializes it.
    async fn initialize(&mut self) -> Result<(), RelayError>;

    /// Delivers one payload. Success means the collector acknowledged it.
    async fn send(&mut self, payload: &[u8]) -> Result<(), RelayError>;

    async fn test_connection(&mut self) -> bool;

    /// Best-effort read of anything the collector has for us. Empty when there is nothing.
    async fn receive(&mut self) -> Vec<u8>;

    async fn cleanup(&mut self);
}

/// Builds every channel the configuration allows, in registration order:
/// `http`, `https`, then `ftp` when an FTP URL is configured.
#[must_use]
pub fn channels_from_config(config: &RelayConfig) -> Vec<Box<dyn Transport>> {
    let mut channels: Vec<Box<dyn Transport>> = vec![
        Box::new(http::HttpTransport::new(TransportKind::Http, config)),
        Box::new(http::HttpTransport::new(TransportKind::Https, config)),
    ];
    if let Some(ftp_url) = &config.ftp_url {
        channels.push(Box::new(ftp::FtpTransport::new(ftp_url, config.timeout)));
    }
    channels
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted channel used by manager and router tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    pub struct Calls {
        pub initialize: usize,
        pub send: usize,
        pub payloads: Vec<Vec<u8>>,
        pub cleanup: usize,
    }

    pub struct ScriptedTransport {
        name: String,
        init_ok: bool,
        /// Outcomes for successive sends; once drained, `default_send` applies.
        send_script: VecDeque<bool>,
        default_send: bool,
        initialized: bool,
        endpoint: String,
        pub calls: Arc<Mutex<Calls>>,
    }

    impl ScriptedTransport {
        pub fn new(name: &str, init_ok: bool, send_ok: bool) -> Self {
            Self {
                name: name.to_string(),
                init_ok,
                send_script: VecDeque::new(),
                default_send: send_ok,
                initialized: false,
                endpoint: String::new(),
                calls: Arc::new(Mutex::new(Calls::default())),
            }
        }

        pub fn with_script(mut self, script: &[bool]) -> Self {
            self.send_script = script.iter().copied().collect();
            self
        }

        pub fn calls(&self) -> Arc<Mutex<Calls>> {
            Arc::clone(&self.calls)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn name(&self) -> &str {
            &self.name
        }

        fn set_endpoint(&mut self, endpoint: &str) {
            self.endpoint = endpoint.to_string();
        }

        fn is_initialized(&self) -> bool {
            self.initialized
        }

        async fn initialize(&mut self) -> Result<(), RelayError> {
            self.calls.lock().unwrap().initialize += 1;
            self.initialized = self.init_ok;
            if self.init_ok {
                Ok(())
            } else {
                Err(RelayError::init(&self.name, "scripted failure"))
            }
        }

        async fn send(&mut self, payload: &[u8]) -> Result<(), RelayError> {
            let mut calls = self.calls.lock().unwrap();
            calls.send += 1;
            calls.payloads.push(payload.to_vec());
            let ok = self.send_script.pop_front().unwrap_or(self.default_send);
            if ok {
                Ok(())
            } else {
                Err(RelayError::send(&self.name, "scripted failure"))
            }
        }

        async fn test_connection(&mut self) -> bool {
            self.initialized
        }

        async fn receive(&mut self) -> Vec<u8> {
            Vec::new()
        }

        async fn cleanup(&mut self) {
            self.calls.lock().unwrap().cleanup += 1;
            self.initialized = false;
        }
    }
}
