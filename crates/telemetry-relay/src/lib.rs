// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Telemetry Relay
//!
//! Collects metrics, logs, host snapshots and lifecycle events from local
//! producers, persists them in rotating on-disk segments and ships them in
//! checksummed batches to a collector.
//!
//! ## Architecture
//!
//! - [`service`]: producer handle and the task that owns buffer inserts
//! - [`buffer`] and [`segment`]: threshold flushing, rotation, retention
//! - [`batch`]: batch framing and verification
//! - [`codec`]: compression and optional authenticated sealing
//! - [`transport`] and [`router`]: HTTP, HTTPS and FTP channels with failover
//!   or reliability-scored routing
//! - [`shipper`]: the periodic delivery loop
//! - [`ingest`]: UDP intake for JSON-line records

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batch;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod ingest;
pub mod record;
pub mod router;
pub mod segment;
pub mod service;
pub mod shipper;
pub mod transport;
