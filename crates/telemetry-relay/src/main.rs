// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use telemetry_relay::{
    buffer::RecordBuffer,
    config::RelayConfig,
    ingest::{IngestConfig, IngestListener},
    record::Record,
    service::RecordBufferService,
    shipper::Shipper,
};

const INGEST_HOST: &str = "127.0.0.1";

#[tokio::main]
pub async fn main() {
    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid relay configuration: {e}");
            return;
        }
    };

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", config.log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let buffer = match RecordBuffer::open(&config) {
        Ok(buffer) => Arc::new(buffer),
        Err(e) => {
            error!("RELAY | Unable to open data directory {}: {e}", config.data_dir.display());
            return;
        }
    };

    let (service, handle) = RecordBufferService::new(Arc::clone(&buffer));
    let service_task = tokio::spawn(service.run());

    let cancel_token = CancellationToken::new();

    match IngestListener::bind(
        &IngestConfig {
            host: INGEST_HOST.to_string(),
            port: config.ingest_port,
        },
        handle.clone(),
        cancel_token.clone(),
    )
    .await
    {
        Ok(listener) => {
            info!("RELAY | Intake listening on {INGEST_HOST}:{}", config.ingest_port);
            tokio::spawn(listener.spin());
        }
        Err(e) => error!("RELAY | Intake disabled, bind failed: {e}"),
    }

    let shipper = Shipper::from_config(Arc::clone(&buffer), &config);
    let shipper_task = tokio::spawn(shipper.run(cancel_token.clone()));

    if let Err(e) = handle.insert(Record::lifecycle("relay", "started", &config.client_id)) {
        error!("Failed to record startup: {e}");
    }
    info!(
        "RELAY | Shipping to {} every {:?} ({:?} routing)",
        config.effective_server_url(),
        config.flush_interval,
        config.routing
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {e}");
    }
    info!("RELAY | Shutting down");

    if let Err(e) = handle.insert(Record::lifecycle("relay", "stopped", &config.client_id)) {
        error!("Failed to record shutdown: {e}");
    }
    if let Err(e) = handle.shutdown() {
        error!("Failed to stop record buffer service: {e}");
    }
    if let Err(e) = service_task.await {
        error!("Record buffer service panicked: {e}");
    }
    cancel_token.cancel();
    if let Err(e) = shipper_task.await {
        error!("Shipper panicked: {e}");
    }
}
