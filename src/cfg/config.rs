// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::{Metric, TransportKind};

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    /// Edge runtime parameters: store capacity and periodic task cadence.
    #[serde(default)]
    pub edge: EdgeConfig,
    /// Sketch sync channel to the backend.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Backend clustering parameters shared by the batch and incremental
    /// paths.
    #[serde(default)]
    pub clustering: ClusteringConfig,
    /// SGACL generation and impact-analysis thresholds.
    #[serde(default)]
    pub policy: PolicyConfig,
}

/// Parameters of the on-switch agent.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EdgeConfig {
    #[serde(rename = "SwitchID")]
    /// Identifier this switch reports in every sync envelope.
    pub switch_id: String,

    #[serde(rename = "MaxEndpoints")]
    /// Sketch store capacity; the stalest endpoint is evicted beyond it.
    pub max_endpoints: usize,

    #[serde(rename = "EnableClustering")]
    /// Whether the local k-means pass runs at all.
    pub enable_clustering: bool,

    #[serde(rename = "LocalClusters")]
    /// Target k for the local clusterer.
    pub n_clusters: usize,

    #[serde(rename = "ClusterInterval", with = "serde_secs")]
    /// Cadence of the local clustering task.
    pub cluster_interval: Duration,

    #[serde(rename = "MetricsInterval", with = "serde_secs")]
    /// Cadence of the metrics log line.
    pub metrics_interval: Duration,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            switch_id: "edge-001".to_string(),
            max_endpoints: 500,
            enable_clustering: true,
            n_clusters: 8,
            cluster_interval: Duration::from_secs(300),
            metrics_interval: Duration::from_secs(30),
        }
    }
}

/// Sketch sync channel parameters.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SyncConfig {
    #[serde(rename = "BackendAddr")]
    /// Backend address the transport connects to.
    pub backend_addr: String,

    #[serde(rename = "Transport")]
    /// Envelope flavor: structured summaries or full binary sketches.
    pub transport: TransportKind,

    #[serde(rename = "SyncInterval", with = "serde_secs")]
    /// Cadence of the periodic sync task.
    pub sync_interval: Duration,

    #[serde(rename = "MaxRetries")]
    /// Attempts per batch before it is retained for the next cycle.
    pub max_retries: u32,

    #[serde(rename = "RetryDelay", with = "serde_secs")]
    /// Fixed delay between attempts. No exponential backoff.
    pub retry_delay: Duration,

    #[serde(rename = "BatchSize")]
    /// Sketches per batch; larger payloads are split.
    pub batch_size: usize,

    #[serde(rename = "Compress")]
    /// Whole-payload gzip for the binary flavor.
    pub compress: bool,

    #[serde(rename = "RequestTimeout", with = "serde_secs")]
    /// Deadline applied to every transport call.
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backend_addr: "127.0.0.1:9477".to_string(),
            transport: TransportKind::Binary,
            sync_interval: Duration::from_secs(60),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            batch_size: 100,
            compress: true,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Backend clustering parameters.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ClusteringConfig {
    #[serde(rename = "MinClusterSize")]
    /// Minimum members for a density cluster; smaller groups become noise.
    pub min_cluster_size: usize,

    #[serde(rename = "MinSamples")]
    /// Neighborhood size for core points.
    pub min_samples: usize,

    #[serde(rename = "Metric")]
    /// Distance metric over normalized feature vectors.
    pub metric: Metric,

    #[serde(rename = "MaxDistanceThreshold")]
    /// Incremental path: beyond this distance a new endpoint is noise.
    pub max_distance_threshold: f64,

    #[serde(rename = "MinSgtClusterSize")]
    /// Minimum cluster size to earn an SGT recommendation.
    pub min_sgt_cluster_size: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            min_cluster_size: 50,
            min_samples: 10,
            metric: Metric::Euclidean,
            max_distance_threshold: 2.0,
            min_sgt_cluster_size: 10,
        }
    }
}

/// SGACL generation and impact thresholds.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PolicyConfig {
    #[serde(rename = "MinFlowCount")]
    /// Minimum flows on a port before it earns a permit rule.
    pub min_flow_count: u64,

    #[serde(rename = "MinFlowRatio")]
    /// Minimum share of the cell's flows for a permit rule.
    pub min_flow_ratio: f64,

    #[serde(rename = "AddLogging")]
    /// Whether the terminal deny carries the `log` keyword.
    pub add_logging: bool,

    #[serde(rename = "CriticalFlowThreshold")]
    /// Blocked flow count at which any port becomes high risk.
    pub critical_flow_threshold: u64,

    #[serde(rename = "HighFlowThreshold")]
    /// Blocked flow count at which any port becomes medium risk.
    pub high_flow_threshold: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_flow_count: 10,
            min_flow_ratio: 0.01,
            add_logging: true,
            critical_flow_threshold: 100,
            high_flow_threshold: 50,
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value. Relative paths resolve against the working
    /// directory, so the agent can be launched from the deployment root
    /// with the stock `config/clarion.yaml`.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = resolve_config_path(path.as_ref())?;
        let s = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {path:?}"))?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            !self.edge.switch_id.is_empty(),
            "SwitchID must not be empty"
        );
        ensure!(self.edge.max_endpoints >= 1, "MaxEndpoints must be >= 1");
        ensure!(self.edge.n_clusters >= 1, "LocalClusters must be >= 1");

        ensure!(self.sync.max_retries >= 1, "MaxRetries must be >= 1");
        ensure!(self.sync.batch_size >= 1, "BatchSize must be >= 1");
        ensure!(
            !self.sync.request_timeout.is_zero(),
            "RequestTimeout must be non-zero"
        );

        ensure!(
            self.clustering.min_cluster_size >= 2,
            "MinClusterSize must be >= 2"
        );
        ensure!(self.clustering.min_samples >= 1, "MinSamples must be >= 1");
        ensure!(
            self.clustering.max_distance_threshold > 0.0,
            "MaxDistanceThreshold must be positive"
        );

        ensure!(
            (0.0..=1.0).contains(&self.policy.min_flow_ratio),
            "MinFlowRatio must lie in [0, 1]"
        );

        Ok(())
    }
}

fn resolve_config_path(rel: &Path) -> Result<std::path::PathBuf> {
    let abs = if rel.is_absolute() {
        rel.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(rel)
    };
    abs.canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
