// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use clarion::{
    cfg::{config::SyncConfig, enums::TransportKind},
    edge::sync::{
        SyncBatch, SyncClient, SyncEnvelope, SyncError, SyncTransport,
        decode_binary_batch, encode_binary_batch, gunzip_payload, gzip_payload,
    },
    sketches::SketchError,
};
use tokio_util::sync::CancellationToken;

use crate::unit_tests::outbound_sketch;

fn test_sync_cfg() -> SyncConfig {
    SyncConfig {
        max_retries: 3,
        retry_delay: Duration::from_millis(10),
        batch_size: 4,
        compress: false,
        transport: TransportKind::Binary,
        ..SyncConfig::default()
    }
}

/// Transport that fails the first `failures` calls, then succeeds, and
/// remembers every delivered batch.
#[derive(Clone, Default)]
struct FlakyTransport {
    failures: Arc<AtomicU64>,
    delivered: Arc<std::sync::Mutex<Vec<SyncBatch>>>,
}

impl FlakyTransport {
    fn failing(n: u64) -> Self {
        let t = Self::default();
        t.failures.store(n, Ordering::SeqCst);
        t
    }

    fn delivered_sequences(&self) -> Vec<u64> {
        self.delivered
            .lock()
            .expect("mutex")
            .iter()
            .map(|b| b.sequence)
            .collect()
    }
}

impl SyncTransport for FlakyTransport {
    async fn send(&mut self, batch: &SyncBatch) -> Result<(), SyncError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SyncError::TransportUnavailable("induced failure".into()));
        }
        self.delivered.lock().expect("mutex").push(batch.clone());
        Ok(())
    }
}

#[test]
fn binary_framing_round_trips() -> Result<()> {
    let sketches = vec![
        outbound_sketch("aa:00:00:00:00:01", 30, 5, 443),
        outbound_sketch("aa:00:00:00:00:02", 10, 3, 80),
    ];

    let frame = encode_binary_batch(&sketches);
    // 4-byte LE count leads the frame.
    assert_eq!(frame[..4], 2u32.to_le_bytes()[..]);

    let decoded = decode_binary_batch(&frame)?;
    assert_eq!(decoded.len(), 2);
    assert_eq!(decoded[0].endpoint_id, "aa:00:00:00:00:01");
    assert_eq!(decoded[0].flow_count, 30);
    assert_eq!(decoded[1].bytes_out, 10_000);
    Ok(())
}

#[test]
fn binary_decoding_rejects_garbage() {
    assert!(matches!(
        decode_binary_batch(&[1, 2]),
        Err(SketchError::InvalidFormat(_))
    ));

    // Valid frame with trailing junk.
    let mut frame = encode_binary_batch(&[outbound_sketch("aa:00:00:00:00:03", 5, 2, 443)])
        .to_vec();
    frame.push(0xff);
    assert!(matches!(
        decode_binary_batch(&frame),
        Err(SketchError::InvalidFormat(_))
    ));
}

#[test]
fn gzip_round_trips() -> Result<()> {
    let sketches = vec![outbound_sketch("aa:00:00:00:00:04", 100, 20, 443)];
    let frame = encode_binary_batch(&sketches);

    let squeezed = gzip_payload(&frame).expect("gzip");
    let restored = gunzip_payload(&squeezed)?;
    assert_eq!(&restored[..], &frame[..]);
    Ok(())
}

#[test]
fn structured_envelope_survives_json() -> Result<()> {
    let sketch = outbound_sketch("aa:00:00:00:00:05", 50, 10, 443);
    let envelope = SyncEnvelope {
        switch_id: "edge-001".to_string(),
        timestamp: 1_700_000_000,
        sequence: 7,
        sketch_count: 1,
        sketches: vec![sketch.summary()],
    };

    let json = serde_json::to_string(&envelope)?;
    let back: SyncEnvelope = serde_json::from_str(&json)?;

    assert_eq!(back.switch_id, "edge-001");
    assert_eq!(back.sequence, 7);
    assert_eq!(back.sketch_count, 1);
    let summary = &back.sketches[0];
    assert_eq!(summary.endpoint_id, "aa:00:00:00:00:05");
    assert_eq!(summary.flow_count, 50);
    assert_eq!(summary.unique_peers_count, sketch.peer_diversity());
    assert_eq!(summary.active_hours, sketch.active_hours);
    Ok(())
}

#[tokio::test]
async fn batches_split_and_sequences_increase() {
    let transport = FlakyTransport::default();
    let mut client = SyncClient::new(test_sync_cfg(), "edge-001", transport.clone());

    let sketches: Vec<_> = (0..10)
        .map(|i| outbound_sketch(&format!("aa:00:00:00:01:{i:02x}"), 5, 2, 443))
        .collect();

    let report = client
        .sync(sketches, 1_700_000_000, &CancellationToken::new())
        .await;

    assert!(report.all_sent());
    // 10 sketches at batch size 4: three batches.
    assert_eq!(report.batches_sent, 3);
    assert_eq!(report.sketches_sent, 10);
    assert_eq!(transport.delivered_sequences(), vec![1, 2, 3]);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    // Two failures, then success: within the 3-attempt budget.
    let transport = FlakyTransport::failing(2);
    let mut client = SyncClient::new(test_sync_cfg(), "edge-001", transport.clone());

    let report = client
        .sync(
            vec![outbound_sketch("aa:00:00:00:02:01", 5, 2, 443)],
            1_700_000_000,
            &CancellationToken::new(),
        )
        .await;

    assert!(report.all_sent());
    assert_eq!(report.batches_sent, 1);
    assert_eq!(client.retained_batches(), 0);
}

#[tokio::test]
async fn exhausted_retries_retain_the_batch() {
    // More failures than attempts: batch must be retained, not dropped.
    let transport = FlakyTransport::failing(10);
    let mut client = SyncClient::new(test_sync_cfg(), "edge-001", transport.clone());

    let report = client
        .sync(
            vec![outbound_sketch("aa:00:00:00:03:01", 5, 2, 443)],
            1_700_000_000,
            &CancellationToken::new(),
        )
        .await;

    assert!(!report.all_sent());
    assert_eq!(report.errors, 1);
    assert_eq!(report.batches_retained, 1);
    assert_eq!(client.retained_batches(), 1);

    // Next cycle redelivers the retained batch once the backend is back.
    transport.failures.store(0, Ordering::SeqCst);
    let report = client
        .sync(Vec::new(), 1_700_000_100, &CancellationToken::new())
        .await;
    assert!(report.all_sent());
    assert_eq!(report.batches_sent, 1);
    assert_eq!(client.retained_batches(), 0);
}

#[tokio::test]
async fn cancellation_stops_between_batches() {
    let transport = FlakyTransport::default();
    let mut client = SyncClient::new(test_sync_cfg(), "edge-001", transport.clone());

    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = client
        .sync(
            vec![outbound_sketch("aa:00:00:00:04:01", 5, 2, 443)],
            1_700_000_000,
            &cancel,
        )
        .await;

    assert!(report.cancelled);
    assert_eq!(report.batches_sent, 0);
    // The unsent batch is kept for the next cycle.
    assert_eq!(client.retained_batches(), 1);
    assert!(transport.delivered_sequences().is_empty());
}
