// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic batch delivery.
//!
//! Each cycle rotates an aged segment, purges expired deliveries, checks out
//! every ready segment as one batch and sends it. Segments are marked
//! transmitted only after the channel acknowledged the batch; any failure
//! returns them to the ready pool for the next cycle.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::Batch;
use crate::buffer::RecordBuffer;
use crate::config::{RelayConfig, Routing};
use crate::error::RelayError;
use crate::router::ReliabilityRouter;
use crate::transport::manager::TransportManager;

const JITTER_RATIO: f64 = 0.2;

/// How batches leave the host.
#[derive(Debug)]
pub enum Delivery {
    /// Configured channel with fallback and one rotate-and-retry per batch.
    Failover(TransportManager),
    /// Reliability-scored channel choice; batches above the threshold are fragmented.
    Adaptive {
        router: ReliabilityRouter,
        fragment_threshold: usize,
    },
}

/// Where a delivered batch went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Channel that acknowledged the batch. `None` when fragments went out over
    /// several channels.
    pub channel: Option<String>,
    pub fragments: usize,
}

impl Delivery {
    #[must_use]
    pub fn from_config(config: &RelayConfig) -> Self {
        match config.routing {
            Routing::Failover => Delivery::Failover(TransportManager::from_config(config)),
            Routing::Adaptive => Delivery::Adaptive {
                router: ReliabilityRouter::from_config(config),
                fragment_threshold: config.fragment_threshold,
            },
        }
    }

    pub async fn deliver(&mut self, payload: &[u8]) -> Result<Receipt, RelayError> {
        match self {
            Delivery::Failover(manager) => Ok(Receipt {
                channel: Some(manager.transmit(payload).await?),
                fragments: 1,
            }),
            Delivery::Adaptive {
                router,
                fragment_threshold,
            } => {
                if payload.len() > *fragment_threshold {
                    let fragments = router.send_fragmented(payload).await?;
                    Ok(Receipt {
                        channel: None,
                        fragments,
                    })
                } else {
                    Ok(Receipt {
                        channel: Some(router.send(payload).await?),
                        fragments: 1,
                    })
                }
            }
        }
    }

    pub async fn cleanup(&mut self) {
        match self {
            Delivery::Failover(manager) => manager.cleanup().await,
            Delivery::Adaptive { router, .. } => router.cleanup().await,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShipOutcome {
    /// Nothing was ready.
    Idle,
    Delivered {
        batch_id: String,
        file_count: usize,
        bytes: usize,
        receipt: Receipt,
    },
}

pub struct Shipper {
    buffer: Arc<RecordBuffer>,
    delivery: Delivery,
    client_id: String,
    interval: Duration,
}

impl Shipper {
    #[must_use]
    pub fn new(
        buffer: Arc<RecordBuffer>,
        delivery: Delivery,
        client_id: &str,
        interval: Duration,
    ) -> Self {
        Self {
            buffer,
            delivery,
            client_id: client_id.to_string(),
            interval,
        }
    }

    #[must_use]
    pub fn from_config(buffer: Arc<RecordBuffer>, config: &RelayConfig) -> Self {
        Self::new(
            buffer,
            Delivery::from_config(config),
            &config.client_id,
            config.flush_interval,
        )
    }

    #[must_use]
    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Runs one collection cycle.
    pub async fn ship_once(&mut self) -> Result<ShipOutcome, RelayError> {
        if let Err(e) = self.buffer.maybe_rotate() {
            warn!("RELAY | Failed to rotate segment: {e}");
        }
        match self.buffer.purge_expired() {
            Ok(0) => {}
            Ok(purged) => debug!("Purged {purged} expired segments"),
            Err(e) => warn!("RELAY | Failed to purge segments: {e}"),
        }

        let Some(batch) = self.buffer.checkout_batch(&self.client_id)? else {
            return Ok(ShipOutcome::Idle);
        };
        self.ship_batch(batch).await
    }

    /// Verifies and delivers a checked-out batch, then confirms or releases its segments.
    pub(crate) async fn ship_batch(&mut self, batch: Batch) -> Result<ShipOutcome, RelayError> {
        if let Err(e) = batch.verify() {
            error!(
                "RELAY | Batch {} failed verification, releasing: {e}",
                batch.header.batch_id
            );
            self.buffer.release(&batch)?;
            return Err(e);
        }

        match self.delivery.deliver(&batch.payload).await {
            Ok(receipt) => {
                self.buffer.confirm(&batch)?;
                info!(
                    "RELAY | Delivered batch {} ({} segments, {} bytes)",
                    batch.header.batch_id, batch.header.file_count, batch.header.total_size
                );
                Ok(ShipOutcome::Delivered {
                    batch_id: batch.header.batch_id,
                    file_count: batch.header.file_count,
                    bytes: batch.payload.len(),
                    receipt,
                })
            }
            Err(e) => {
                warn!(
                    "RELAY | Batch {} not delivered, will retry: {e}",
                    batch.header.batch_id
                );
                self.buffer.release(&batch)?;
                Err(e)
            }
        }
    }

    fn next_delay(&self) -> Duration {
        jittered(self.interval, fastrand::f64())
    }

    /// Ships on a jittered interval until cancelled, then flushes buffers and closes channels.
    pub async fn run(mut self, cancel: CancellationToken) {
        debug!("RELAY | Shipper started");
        loop {
            let delay = self.next_delay();
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
            match self.ship_once().await {
                Ok(ShipOutcome::Idle) => debug!("Nothing to ship"),
                Ok(ShipOutcome::Delivered { .. }) => {}
                Err(e) => debug!("Ship cycle failed: {e}"),
            }
        }

        if let Err(e) = self.buffer.flush_all() {
            error!("RELAY | Failed to flush on shutdown: {e}");
        }
        self.delivery.cleanup().await;
        debug!("RELAY | Shipper stopped");
    }
}

/// `base` scaled by a factor in `[1 - JITTER_RATIO, 1 + JITTER_RATIO]`, `unit` in `[0, 1)`.
fn jittered(base: Duration, unit: f64) -> Duration {
    base.mul_f64(1.0 - JITTER_RATIO + unit * 2.0 * JITTER_RATIO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PayloadCodec;
    use crate::record::Record;
    use crate::router::MIN_FRAGMENT_SIZE;
    use crate::segment::tests::backdate_closed;
    use crate::segment::{SegmentPolicy, SegmentState, SegmentStore};
    use crate::transport::testing::ScriptedTransport;
    use crate::transport::Transport;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn ready_buffer(dir: &TempDir, records: usize) -> Arc<RecordBuffer> {
        let store = SegmentStore::open(dir.path(), SegmentPolicy::default()).unwrap();
        let buffer = Arc::new(RecordBuffer::new(store, 1 << 20));
        // Random tags keep the batch from compressing to a single fragment.
        let mut rng = fastrand::Rng::with_seed(11);
        for i in 0..records {
            let id: String = (0..32).map(|_| rng.alphanumeric()).collect();
            buffer
                .add(&Record::metric("queue.depth", i as f64, vec![format!("id:{id}")]))
                .unwrap();
        }
        buffer.flush_all().unwrap();
        buffer.rotate().unwrap();
        backdate_closed(dir.path(), Duration::from_secs(120));
        buffer
    }

    fn failover(channels: Vec<ScriptedTransport>) -> Delivery {
        let mut manager = TransportManager::new("a", "http://collector/intake", PayloadCodec::new(1, None));
        for channel in channels {
            manager.register(Box::new(channel));
        }
        Delivery::Failover(manager)
    }

    #[tokio::test]
    async fn test_idle_when_nothing_ready() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::open(dir.path(), SegmentPolicy::default()).unwrap();
        let buffer = Arc::new(RecordBuffer::new(store, 1 << 20));
        let a = ScriptedTransport::new("a", true, true);
        let calls = a.calls();
        let mut shipper = Shipper::new(buffer, failover(vec![a]), "client", Duration::from_secs(1));

        assert_eq!(shipper.ship_once().await.unwrap(), ShipOutcome::Idle);
        assert_eq!(calls.lock().unwrap().send, 0);
    }

    #[tokio::test]
    async fn test_delivery_marks_segments_transmitted() {
        let dir = TempDir::new().unwrap();
        let buffer = ready_buffer(&dir, 10);
        let a = ScriptedTransport::new("a", true, true);
        let calls = a.calls();
        let mut shipper = Shipper::new(
            Arc::clone(&buffer),
            failover(vec![a]),
            "client",
            Duration::from_secs(1),
        );

        let outcome = shipper.ship_once().await.unwrap();
        let ShipOutcome::Delivered {
            file_count, receipt, ..
        } = outcome
        else {
            panic!("expected delivery");
        };
        assert_eq!(file_count, 1);
        assert_eq!(receipt.channel.as_deref(), Some("a"));
        assert_eq!(calls.lock().unwrap().send, 1);
        assert_eq!(buffer.segment_count(SegmentState::Sent).unwrap(), 1);
        assert_eq!(buffer.segment_count(SegmentState::Closed).unwrap(), 0);
        assert_eq!(shipper.ship_once().await.unwrap(), ShipOutcome::Idle);
    }

    #[tokio::test]
    async fn test_failed_delivery_releases_segments() {
        let dir = TempDir::new().unwrap();
        let buffer = ready_buffer(&dir, 3);
        let a = ScriptedTransport::new("a", true, true).with_script(&[false, true]);
        let b = ScriptedTransport::new("b", true, false);
        let mut shipper = Shipper::new(
            Arc::clone(&buffer),
            failover(vec![a, b]),
            "client",
            Duration::from_secs(1),
        );

        assert!(shipper.ship_once().await.is_err());
        assert_eq!(buffer.segment_count(SegmentState::Closed).unwrap(), 1);
        assert_eq!(buffer.segment_count(SegmentState::InFlight).unwrap(), 0);
        assert_eq!(buffer.segment_count(SegmentState::Sent).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupted_batch_is_released_not_sent() {
        let dir = TempDir::new().unwrap();
        let buffer = ready_buffer(&dir, 3);
        let a = ScriptedTransport::new("a", true, true);
        let calls = a.calls();
        let mut shipper = Shipper::new(
            Arc::clone(&buffer),
            failover(vec![a]),
            "client",
            Duration::from_secs(1),
        );

        let mut batch = buffer.checkout_batch("client").unwrap().unwrap();
        let last = batch.payload.len() - 1;
        batch.payload[last] ^= 0xff;

        assert!(matches!(
            shipper.ship_batch(batch).await,
            Err(RelayError::ChecksumMismatch { .. })
        ));
        assert_eq!(calls.lock().unwrap().send, 0);
        assert_eq!(buffer.segment_count(SegmentState::Closed).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_adaptive_fragments_large_batches() {
        let dir = TempDir::new().unwrap();
        let buffer = ready_buffer(&dir, 200);
        let channel = ScriptedTransport::new("http", true, true);
        let calls = channel.calls();
        let router = ReliabilityRouter::new(
            vec![Box::new(channel) as Box<dyn Transport>],
            PayloadCodec::new(1, None),
            MIN_FRAGMENT_SIZE,
            Duration::ZERO,
        );
        let delivery = Delivery::Adaptive {
            router,
            fragment_threshold: 512,
        };
        let mut shipper = Shipper::new(Arc::clone(&buffer), delivery, "client", Duration::from_secs(1));

        let ShipOutcome::Delivered { receipt, .. } = shipper.ship_once().await.unwrap() else {
            panic!("expected delivery");
        };
        assert!(receipt.fragments > 1);
        assert_eq!(receipt.channel, None);
        assert_eq!(calls.lock().unwrap().send, receipt.fragments);
        assert_eq!(buffer.segment_count(SegmentState::Sent).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let buffer = ready_buffer(&dir, 1);
        let a = ScriptedTransport::new("a", true, true);
        let calls = a.calls();
        let shipper = Shipper::new(buffer, failover(vec![a]), "client", Duration::from_secs(3600));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(shipper.run(cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("shipper stops on cancel")
            .unwrap();
        assert_eq!(calls.lock().unwrap().cleanup, 1);
    }

    proptest! {
        #[test]
        fn prop_jitter_stays_within_twenty_percent(secs in 1u64..3600, unit in 0.0f64..1.0) {
            let base = Duration::from_secs(secs);
            let delay = jittered(base, unit);
            prop_assert!(delay >= base.mul_f64(0.8));
            prop_assert!(delay <= base.mul_f64(1.2));
        }
    }
}
