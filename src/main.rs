// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Edge agent binary.
//!
//! Reads decoded flow records as JSON lines on stdin (one `FlowRecord`
//! per line, as produced by the external NetFlow collector), feeds them
//! to the agent, and syncs sketches to the backend until EOF or Ctrl-C.

use anyhow::{Context, Result};
use clarion::{
    cfg::{config::Config, logger::init_logger},
    edge::{agent::EdgeAgent, sync::TcpTransport},
    flow::FlowRecord,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _init_logger = init_logger("config/logger.yaml")?;

    let cfg = Config::load_from_file("config/clarion.yaml")
        .context("failed to resolve or load config")?;

    let transport = TcpTransport::new(
        cfg.sync.backend_addr.clone(),
        cfg.sync.request_timeout,
    );
    let agent = EdgeAgent::new(cfg, transport);

    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel::<FlowRecord>(1024);

    // Flow reader: NDJSON on stdin from the external collector. EOF means
    // the collector is gone; the agent flushes and shuts down.
    let reader_cancel = cancel.clone();
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                () = reader_cancel.cancelled() => break,
                l = lines.next_line() => l,
            };
            match line {
                Ok(Some(line)) if line.trim().is_empty() => {},
                Ok(Some(line)) => match serde_json::from_str::<FlowRecord>(&line) {
                    Ok(record) => {
                        if tx.send(record).await.is_err() {
                            break;
                        }
                    },
                    Err(e) => warn!("undecodable flow line skipped: {e}"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("stdin read failed: {e}");
                    break;
                },
            }
        }
        reader_cancel.cancel();
    });

    // Ctrl-C propagates as cancellation; the agent flushes and quiesces.
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    let snapshot = agent.run(rx, cancel.clone()).await?;
    cancel.cancel();
    let _ = reader.await;

    info!(
        flows = snapshot.flows_processed,
        invalid = snapshot.invalid_records,
        endpoints = snapshot.endpoints_tracked,
        synced = snapshot.sketches_synced,
        "edge agent finished"
    );

    Ok(())
}
