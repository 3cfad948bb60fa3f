// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Edge agent runtime: ingestion, periodic sync, shutdown.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use chrono::Utc;
use clarion::{
    cfg::{
        config::{Config, EdgeConfig, SyncConfig},
        enums::TransportKind,
    },
    edge::{
        agent::EdgeAgent,
        sync::{SyncBatch, SyncError, SyncTransport},
    },
    flow::{FlowRecord, Protocol},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct CollectingTransport {
    batches: Arc<Mutex<Vec<SyncBatch>>>,
}

impl SyncTransport for CollectingTransport {
    async fn send(&mut self, batch: &SyncBatch) -> Result<(), SyncError> {
        self.batches.lock().expect("mutex").push(batch.clone());
        Ok(())
    }
}

fn agent_config() -> Config {
    let mut cfg = Config::default();
    cfg.edge = EdgeConfig {
        switch_id: "it-switch".to_string(),
        max_endpoints: 32,
        enable_clustering: true,
        n_clusters: 2,
        cluster_interval: Duration::from_millis(150),
        metrics_interval: Duration::from_millis(150),
    };
    cfg.sync = SyncConfig {
        transport: TransportKind::Binary,
        sync_interval: Duration::from_millis(100),
        max_retries: 1,
        retry_delay: Duration::from_millis(10),
        batch_size: 16,
        compress: false,
        ..SyncConfig::default()
    };
    cfg
}

fn flow(mac: &str, dst_ip: &str, port: u16) -> FlowRecord {
    FlowRecord {
        src_mac: mac.to_string(),
        src_ip: "10.0.0.5".to_string(),
        dst_ip: dst_ip.to_string(),
        src_port: 44000,
        dst_port: port,
        proto: Protocol::Tcp,
        bytes: 1200,
        packets: 3,
        timestamp: Utc::now(),
        switch_id: "it-switch".to_string(),
        service_name: None,
    }
}

#[tokio::test]
async fn agent_ingests_syncs_and_quiesces() -> Result<()> {
    let transport = CollectingTransport::default();
    let agent = EdgeAgent::new(agent_config(), transport.clone());

    let (tx, rx) = mpsc::channel(256);
    let cancel = CancellationToken::new();
    let runner = tokio::spawn(agent.run(rx, cancel.clone()));

    // 8 endpoints, a handful of flows each, plus one invalid record.
    for e in 0..8 {
        for i in 0..5 {
            tx.send(flow(
                &format!("aa:bb:cc:00:00:{e:02x}"),
                &format!("10.0.1.{i}"),
                if e % 2 == 0 { 443 } else { 22 },
            ))
            .await?;
        }
    }
    tx.send(flow("", "10.0.1.1", 443)).await?;

    // Let ingest and at least one sync cycle happen, then shut down.
    tokio::time::sleep(Duration::from_millis(400)).await;
    cancel.cancel();
    let snapshot = runner.await??;

    assert_eq!(snapshot.flows_processed, 40);
    assert_eq!(snapshot.invalid_records, 1);
    assert_eq!(snapshot.endpoints_tracked, 8);
    assert_eq!(snapshot.sync_errors, 0);
    assert!(snapshot.sketches_synced >= 8, "no sync cycle ran");

    // Delivered batches carry the switch id and increasing sequences.
    let batches = transport.batches.lock().expect("mutex");
    assert!(!batches.is_empty());
    assert!(batches.iter().all(|b| b.switch_id == "it-switch"));
    let sequences: Vec<u64> = batches.iter().map(|b| b.sequence).collect();
    let mut sorted = sequences.clone();
    sorted.sort_unstable();
    assert_eq!(sequences, sorted);
    Ok(())
}

#[tokio::test]
async fn agent_stops_when_flow_channel_closes_and_is_cancelled() -> Result<()> {
    let transport = CollectingTransport::default();
    let agent = EdgeAgent::new(agent_config(), transport);

    let (tx, rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let runner = tokio::spawn(agent.run(rx, cancel.clone()));

    tx.send(flow("aa:bb:cc:00:01:01", "10.0.2.1", 443)).await?;
    drop(tx);

    tokio::time::sleep(Duration::from_millis(150)).await;
    cancel.cancel();

    let snapshot = runner.await??;
    assert_eq!(snapshot.flows_processed, 1);
    assert_eq!(snapshot.endpoints_tracked, 1);
    Ok(())
}

#[test]
#[serial_test::serial]
fn logger_initializes_from_yaml() -> Result<()> {
    // Sets the global subscriber, so this must not race other tests that
    // might do the same.
    let _guard = clarion::cfg::logger::init_logger("tests/config_logger.yaml")?;
    tracing::info!("logger smoke test");
    Ok(())
}

#[test]
fn config_files_load_and_validate() -> Result<()> {
    let cfg = Config::load_from_file("tests/config.yaml")?;
    assert_eq!(cfg.edge.switch_id, "test-switch");
    assert_eq!(cfg.sync.batch_size, 10);
    assert_eq!(cfg.clustering.min_cluster_size, 4);
    assert_eq!(cfg.policy.high_flow_threshold, 50);

    let mut broken = cfg;
    broken.edge.max_endpoints = 0;
    assert!(broken.validate_and_normalize().is_err());
    Ok(())
}
