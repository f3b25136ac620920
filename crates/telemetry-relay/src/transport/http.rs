// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP and HTTPS channels.
//!
//! Both POST the payload to the collector endpoint. The HTTPS channel only
//! accepts `https://` endpoints and builds an HTTPS-only client; certificate
//! and hostname validation stay enabled.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::Url;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{RelayConfig, TransportKind};
use crate::error::RelayError;
use crate::transport::Transport;

pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

#[derive(Debug)]
pub struct HttpTransport {
    kind: TransportKind,
    endpoint: String,
    timeout: Duration,
    user_agent: String,
    proxy: Option<String>,
    client: Option<reqwest::Client>,
}

impl HttpTransport {
    /// `kind` must be `Http` or `Https`.
    #[must_use]
    pub fn new(kind: TransportKind, config: &RelayConfig) -> Self {
        debug_assert!(kind != TransportKind::Ftp);
        Self {
            kind,
            endpoint: config.effective_server_url().to_string(),
            timeout: config.timeout,
            user_agent: config.user_agent.clone(),
            proxy: config.proxy.clone(),
            client: None,
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_client(&self) -> Result<reqwest::Client, RelayError> {
        let url = Url::parse(&self.endpoint)
            .map_err(|e| RelayError::init(self.name(), format!("invalid endpoint: {e}")))?;

        match (self.kind, url.scheme()) {
            (TransportKind::Https, "https") | (TransportKind::Http, "http" | "https") => {}
            (_, scheme) => {
                return Err(RelayError::init(
                    self.name(),
                    format!("unsupported endpoint scheme '{scheme}'"),
                ))
            }
        }

        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.as_str())
            .https_only(self.kind == TransportKind::Https);

        if let Some(proxy) = &self.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| RelayError::init(self.name(), format!("invalid proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }

        builder
            .build()
            .map_err(|e| RelayError::init(self.name(), e))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    fn set_endpoint(&mut self, endpoint: &str) {
        if self.endpoint != endpoint {
            self.endpoint = endpoint.to_string();
            self.client = None;
        }
    }

    fn is_initialized(&self) -> bool {
        self.client.is_some()
    }

    async fn initialize(&mut self) -> Result<(), RelayError> {
        self.client = None;
        let client = self.build_client()?;
        debug!("{} channel ready for {}", self.name(), self.endpoint);
        self.client = Some(client);
        Ok(())
    }

    async fn send(&mut self, payload: &[u8]) -> Result<(), RelayError> {
        let Some(client) = &self.client else {
            return Err(RelayError::send(self.name(), "channel not initialized"));
        };

        let request_id = uuid::Uuid::new_v4().to_string();
        let response = client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"))
            .header(REQUEST_ID_HEADER, request_id.as_str())
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|e| RelayError::send(self.name(), e))?;

        let status = response.status();
        if status.is_success() {
            debug!(
                "{} channel delivered {} bytes, request id {request_id}",
                self.name(),
                payload.len()
            );
            Ok(())
        } else {
            Err(RelayError::send(
                self.name(),
                format!("collector answered {status}"),
            ))
        }
    }

    async fn test_connection(&mut self) -> bool {
        let Some(client) = &self.client else {
            return false;
        };
        match client.head(&self.endpoint).send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(e) => {
                warn!("{} connection test failed: {e}", self.name());
                false
            }
        }
    }

    async fn receive(&mut self) -> Vec<u8> {
        let Some(client) = &self.client else {
            return Vec::new();
        };
        match client.get(&self.endpoint).send().await {
            Ok(response) if response.status().is_success() => response
                .bytes()
                .await
                .map(|body| body.to_vec())
                .unwrap_or_default(),
            Ok(_) => Vec::new(),
            Err(e) => {
                debug!("{} receive failed: {e}", self.name());
                Vec::new()
            }
        }
    }

    async fn cleanup(&mut self) {
        self.client = None;
    }
}
