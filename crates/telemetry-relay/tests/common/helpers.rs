// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use telemetry_relay::config::{RelayConfig, Routing, TransportKind};

pub const SECRET: &str = "integration-secret";

/// Relay configuration pointed at a mock collector, storing segments under `data_dir`.
pub fn relay_config(server_url: &str, data_dir: &Path) -> RelayConfig {
    RelayConfig {
        server_url: format!("{server_url}/intake"),
        transport: TransportKind::Http,
        routing: Routing::Failover,
        encryption_key: Some(SECRET.to_string()),
        timeout: Duration::from_secs(2),
        data_dir: data_dir.to_path_buf(),
        client_id: "integration-client".to_string(),
        ..Default::default()
    }
}

/// Ages every closed segment past the quiescence window.
pub fn age_closed_segments(dir: &Path) {
    for entry in fs::read_dir(dir).expect("read data dir") {
        let path = entry.expect("dir entry").path();
        if path.extension().is_some_and(|ext| ext == "log") {
            OpenOptions::new()
                .write(true)
                .open(&path)
                .expect("open segment")
                .set_modified(SystemTime::now() - Duration::from_secs(120))
                .expect("set mtime");
        }
    }
}

pub fn count_with_extension(dir: &Path, extension: &str) -> usize {
    fs::read_dir(dir)
        .expect("read data dir")
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == extension))
        .count()
}

/// Request bodies captured by a mock collector.
pub type Captured = Arc<Mutex<Vec<Vec<u8>>>>;

pub fn captured() -> Captured {
    Arc::new(Mutex::new(Vec::new()))
}
