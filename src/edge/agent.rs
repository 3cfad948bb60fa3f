// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The edge agent: one process on the switch.
//!
//! Four cooperative tasks share the sketch store behind a reader-writer
//! lock with a single writer:
//!
//! 1. the updater applies decoded flow records in arrival order,
//! 2. a periodic task runs the local k-means pass,
//! 3. a periodic task drives the sync client,
//! 4. a periodic task logs metrics.
//!
//! Shutdown is a broadcast [`CancellationToken`]; every task quiesces
//! within the grace period or is abandoned.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use anyhow::Result;
use chrono::Utc;
use rand::{SeedableRng, rngs::{StdRng, SysRng}};
use tokio::{
    sync::{RwLock, mpsc},
    time::{Duration, interval, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::Config,
    edge::{
        kmeans::LightweightKMeans,
        sync::{SyncClient, SyncTransport},
    },
    flow::FlowRecord,
    sketches::{endpoint::EndpointSketch, store::SketchStore},
};

/// How long tasks get to quiesce after cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Counters shared by the agent tasks. All relaxed; these feed logs and
/// the metrics snapshot, not control flow.
#[derive(Debug, Default)]
pub struct EdgeMetrics {
    pub flows_processed: AtomicU64,
    pub invalid_records: AtomicU64,
    pub clustering_runs: AtomicU64,
    pub sync_cycles: AtomicU64,
    pub sketches_synced: AtomicU64,
    pub sync_errors: AtomicU64,
    pub batches_retained: AtomicU64,
}

/// Point-in-time copy of the counters plus store gauges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub flows_processed: u64,
    pub invalid_records: u64,
    pub clustering_runs: u64,
    pub sync_cycles: u64,
    pub sketches_synced: u64,
    pub sync_errors: u64,
    pub batches_retained: u64,
    pub endpoints_tracked: usize,
    pub memory_bytes: usize,
    pub evictions: u64,
}

impl EdgeMetrics {
    fn snapshot(&self, store: &SketchStore) -> MetricsSnapshot {
        MetricsSnapshot {
            flows_processed: self.flows_processed.load(Ordering::Relaxed),
            invalid_records: self.invalid_records.load(Ordering::Relaxed),
            clustering_runs: self.clustering_runs.load(Ordering::Relaxed),
            sync_cycles: self.sync_cycles.load(Ordering::Relaxed),
            sketches_synced: self.sketches_synced.load(Ordering::Relaxed),
            sync_errors: self.sync_errors.load(Ordering::Relaxed),
            batches_retained: self.batches_retained.load(Ordering::Relaxed),
            endpoints_tracked: store.len(),
            memory_bytes: store.memory_bytes(),
            evictions: store.evictions(),
        }
    }
}

/// Six local features per endpoint, cheap enough for the switch. The
/// backend's full 18-feature projection needs identity context the edge
/// does not have.
pub fn local_feature_vector(sketch: &EndpointSketch) -> Vec<f64> {
    let total_bytes = sketch.bytes_in + sketch.bytes_out;
    vec![
        (sketch.peer_diversity() as f64).ln_1p(),
        (sketch.port_diversity() as f64).ln_1p(),
        sketch.in_out_ratio(),
        (total_bytes as f64).ln_1p(),
        (sketch.flow_count as f64).ln_1p(),
        f64::from(sketch.active_hour_count()) / 24.0,
    ]
}

pub struct EdgeAgent<T: SyncTransport> {
    cfg: Config,
    store: Arc<RwLock<SketchStore>>,
    metrics: Arc<EdgeMetrics>,
    sync_client: SyncClient<T>,
}

impl<T: SyncTransport + 'static> EdgeAgent<T> {
    pub fn new(cfg: Config, transport: T) -> Self {
        let store = SketchStore::new(&cfg.edge.switch_id, cfg.edge.max_endpoints);
        let sync_client =
            SyncClient::new(cfg.sync.clone(), cfg.edge.switch_id.clone(), transport);
        Self {
            cfg,
            store: Arc::new(RwLock::new(store)),
            metrics: Arc::new(EdgeMetrics::default()),
            sync_client,
        }
    }

    pub fn metrics(&self) -> Arc<EdgeMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn store(&self) -> Arc<RwLock<SketchStore>> {
        Arc::clone(&self.store)
    }

    /// Runs the agent until the flow channel closes or `cancel` fires.
    /// Returns the final metrics snapshot.
    pub async fn run(
        mut self,
        flows: mpsc::Receiver<FlowRecord>,
        cancel: CancellationToken,
    ) -> Result<MetricsSnapshot> {
        info!(
            switch_id = %self.cfg.edge.switch_id,
            max_endpoints = self.cfg.edge.max_endpoints,
            "edge agent starting"
        );

        let updater = tokio::spawn(updater_task(
            Arc::clone(&self.store),
            Arc::clone(&self.metrics),
            flows,
            cancel.clone(),
        ));

        let cluster_task = if self.cfg.edge.enable_clustering {
            Some(tokio::spawn(clustering_task(
                Arc::clone(&self.store),
                Arc::clone(&self.metrics),
                self.cfg.edge.n_clusters,
                self.cfg.edge.cluster_interval,
                cancel.clone(),
            )))
        } else {
            None
        };

        let metrics_task = tokio::spawn(metrics_task(
            Arc::clone(&self.store),
            Arc::clone(&self.metrics),
            self.cfg.edge.metrics_interval,
            cancel.clone(),
        ));

        // The sync loop runs on the agent itself: the client owns the
        // retained-batch state and the sequence counter.
        let mut sync_tick = interval(self.cfg.sync.sync_interval);
        sync_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sync_tick.tick().await; // immediate first tick

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = sync_tick.tick() => {
                    self.run_sync_cycle(&cancel).await;
                },
            }
        }

        // Flush what the store still holds before quiescing. The flush
        // gets a fresh token so it can run to completion; transport
        // deadlines and the retry budget bound it.
        self.run_sync_cycle(&CancellationToken::new()).await;

        let grace = timeout(SHUTDOWN_GRACE, async {
            let _ = updater.await;
            if let Some(t) = cluster_task {
                let _ = t.await;
            }
            let _ = metrics_task.await;
        })
        .await;
        if grace.is_err() {
            warn!("edge tasks did not quiesce within the grace period");
        }

        let store = self.store.read().await;
        let snapshot = self.metrics.snapshot(&store);
        info!(
            flows = snapshot.flows_processed,
            endpoints = snapshot.endpoints_tracked,
            "edge agent stopped"
        );
        Ok(snapshot)
    }

    async fn run_sync_cycle(&mut self, cancel: &CancellationToken) {
        let sketches = {
            let store = self.store.read().await;
            store.snapshot()
        };
        if sketches.is_empty() && self.sync_client.retained_batches() == 0 {
            return;
        }

        let report = self
            .sync_client
            .sync(sketches, Utc::now().timestamp(), cancel)
            .await;

        self.metrics.sync_cycles.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .sketches_synced
            .fetch_add(report.sketches_sent, Ordering::Relaxed);
        self.metrics
            .sync_errors
            .fetch_add(report.errors, Ordering::Relaxed);
        self.metrics
            .batches_retained
            .fetch_add(report.batches_retained, Ordering::Relaxed);

        if !report.all_sent() {
            warn!(
                retained = report.batches_retained,
                errors = report.errors,
                "sync cycle incomplete; batches retained for next cycle"
            );
        }
    }
}

/// Applies flow records to the store. Single writer; per-endpoint updates
/// happen in arrival order.
async fn updater_task(
    store: Arc<RwLock<SketchStore>>,
    metrics: Arc<EdgeMetrics>,
    mut flows: mpsc::Receiver<FlowRecord>,
    cancel: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            () = cancel.cancelled() => break,
            r = flows.recv() => match r {
                Some(r) => r,
                None => break,
            },
        };

        let record = match record.validate() {
            Ok(r) => r,
            Err(e) => {
                metrics.invalid_records.fetch_add(1, Ordering::Relaxed);
                debug!("dropped flow record: {e}");
                continue;
            },
        };

        {
            let mut store = store.write().await;
            let sketch = store.get_or_create(&record.src_mac);
            sketch.record_outbound(
                &record.dst_ip,
                record.dst_port,
                record.proto,
                record.bytes,
                record.packets,
                record.timestamp,
                record.service_name.as_deref(),
            );
        }
        metrics.flows_processed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Periodic local clustering: snapshot features under the read lock, fit
/// outside it, write labels back under the write lock.
async fn clustering_task(
    store: Arc<RwLock<SketchStore>>,
    metrics: Arc<EdgeMetrics>,
    n_clusters: usize,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = tick.tick() => {},
        }

        let (features, ids) = {
            let store = store.read().await;
            if store.len() < n_clusters {
                debug!(endpoints = store.len(), "not enough endpoints to cluster");
                continue;
            }
            let mut features = Vec::with_capacity(store.len());
            let mut ids = Vec::with_capacity(store.len());
            for sketch in store.iter() {
                features.push(local_feature_vector(sketch));
                ids.push(sketch.endpoint_id.clone());
            }
            (features, ids)
        };

        let mut kmeans = LightweightKMeans::new(n_clusters, 10);
        let mut rng = StdRng::try_from_rng(&mut SysRng).expect("failed to seed RNG from OS");
        let Some(labels) = kmeans.fit_cancellable(&features, &mut rng, &cancel).await
        else {
            break;
        };

        {
            let mut store = store.write().await;
            for (id, label) in ids.iter().zip(&labels) {
                if let Some(sketch) = store.get_mut(id) {
                    sketch.local_cluster_id = *label as i64;
                }
            }
        }

        metrics.clustering_runs.fetch_add(1, Ordering::Relaxed);
        info!(endpoints = ids.len(), k = n_clusters, "local clustering complete");
    }
}

async fn metrics_task(
    store: Arc<RwLock<SketchStore>>,
    metrics: Arc<EdgeMetrics>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = tick.tick() => {},
        }

        let snapshot = {
            let store = store.read().await;
            metrics.snapshot(&store)
        };
        info!(
            flows = snapshot.flows_processed,
            invalid = snapshot.invalid_records,
            endpoints = snapshot.endpoints_tracked,
            memory_kb = snapshot.memory_bytes / 1024,
            sync_errors = snapshot.sync_errors,
            "edge metrics"
        );
    }
}
