// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Density-based batch clustering over normalized feature vectors.
//!
//! Groups endpoints by behavioral density without a fixed k, tolerating
//! clusters of different densities. The mechanics follow the HDBSCAN
//! family: each point gets a core distance (distance to its
//! `min_samples`-th neighbor), pairwise distances are smoothed into
//! mutual reachability, a minimum spanning tree is built over that
//! space, and the tree is cut where edge weights jump by an order that
//! separates dense regions. Components smaller than `min_cluster_size`
//! are folded into noise (label −1).
//!
//! Soft membership is reported as normalized proximity to the cluster
//! centroid; silhouette is computed over non-noise points when at least
//! two clusters exist.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::cfg::{config::ClusteringConfig, enums::Metric};

/// Label used for points no cluster claims.
pub const NOISE: i64 = -1;

/// Minimum multiplicative jump between spanning-tree edge weights that
/// separates clusters.
const GAP_FACTOR: f64 = 3.0;

/// Result of one clustering run. `endpoint_ids` and `labels` are equal
/// length and index-aligned.
#[derive(Debug, Clone, Default)]
pub struct ClusterResult {
    pub endpoint_ids: Vec<String>,
    pub labels: Vec<i64>,
    pub n_clusters: usize,
    pub n_noise: usize,
    pub silhouette: Option<f64>,
    pub cluster_sizes: BTreeMap<i64, usize>,
    pub probabilities: Option<Vec<f64>>,
}

impl ClusterResult {
    pub fn get_cluster_members(&self, cluster_id: i64) -> Vec<&str> {
        self.endpoint_ids
            .iter()
            .zip(&self.labels)
            .filter(|&(_, &l)| l == cluster_id)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn get_endpoint_cluster(&self, endpoint_id: &str) -> i64 {
        self.endpoint_ids
            .iter()
            .position(|id| id == endpoint_id)
            .map_or(NOISE, |i| self.labels[i])
    }

    /// Non-noise cluster ids, ascending.
    pub fn cluster_ids(&self) -> Vec<i64> {
        self.cluster_sizes
            .keys()
            .copied()
            .filter(|&c| c != NOISE)
            .collect()
    }

    pub fn noise_ratio(&self) -> f64 {
        if self.endpoint_ids.is_empty() {
            0.0
        } else {
            self.n_noise as f64 / self.endpoint_ids.len() as f64
        }
    }
}

pub struct DensityClusterer {
    min_cluster_size: usize,
    min_samples: usize,
    metric: Metric,
}

impl DensityClusterer {
    pub fn new(cfg: &ClusteringConfig) -> Self {
        Self {
            min_cluster_size: cfg.min_cluster_size,
            min_samples: cfg.min_samples,
            metric: cfg.metric,
        }
    }

    /// Clusters the matrix. Empty input yields an empty result; fewer
    /// points than `min_cluster_size` yield all noise. Neither is an
    /// error.
    pub fn cluster(&self, x: &[Vec<f64>], endpoint_ids: &[String]) -> ClusterResult {
        assert_eq!(x.len(), endpoint_ids.len(), "matrix/id length mismatch");

        let n = x.len();
        if n == 0 {
            return ClusterResult::default();
        }
        if n < self.min_cluster_size {
            debug!(n, min = self.min_cluster_size, "too few points; all noise");
            return self.all_noise(endpoint_ids);
        }

        let dist = self.distance_matrix(x);
        let reach = self.mutual_reachability(&dist, n);
        let mst = minimum_spanning_tree(&reach, n);
        let mut labels = cut_components(&mst, n);
        self.fold_small_clusters(&mut labels);
        renumber(&mut labels);

        let mut cluster_sizes: BTreeMap<i64, usize> = BTreeMap::new();
        for &l in &labels {
            *cluster_sizes.entry(l).or_insert(0) += 1;
        }
        let n_clusters = cluster_sizes.keys().filter(|&&c| c != NOISE).count();
        let n_noise = cluster_sizes.get(&NOISE).copied().unwrap_or(0);

        let probabilities = Some(membership_probabilities(x, &labels));
        let silhouette = if n_clusters >= 2 {
            silhouette_score(&dist, &labels)
        } else {
            None
        };

        info!(
            n,
            n_clusters,
            n_noise,
            silhouette = silhouette.unwrap_or(f64::NAN),
            "batch clustering complete"
        );

        ClusterResult {
            endpoint_ids: endpoint_ids.to_vec(),
            labels,
            n_clusters,
            n_noise,
            silhouette,
            cluster_sizes,
            probabilities,
        }
    }

    fn all_noise(&self, endpoint_ids: &[String]) -> ClusterResult {
        let n = endpoint_ids.len();
        let mut cluster_sizes = BTreeMap::new();
        cluster_sizes.insert(NOISE, n);
        ClusterResult {
            endpoint_ids: endpoint_ids.to_vec(),
            labels: vec![NOISE; n],
            n_clusters: 0,
            n_noise: n,
            silhouette: None,
            cluster_sizes,
            probabilities: Some(vec![0.0; n]),
        }
    }

    fn distance(&self, a: &[f64], b: &[f64]) -> f64 {
        match self.metric {
            Metric::Euclidean => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f64>()
                .sqrt(),
            Metric::Manhattan => a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum(),
        }
    }

    fn distance_matrix(&self, x: &[Vec<f64>]) -> Vec<f64> {
        let n = x.len();
        let mut dist = vec![0.0; n * n];
        for i in 0..n {
            for j in (i + 1)..n {
                let d = self.distance(&x[i], &x[j]);
                dist[i * n + j] = d;
                dist[j * n + i] = d;
            }
        }
        dist
    }

    /// Mutual reachability: distances smoothed so sparse regions cannot
    /// chain into dense ones. `mr(a,b) = max(core(a), core(b), d(a,b))`
    /// with `core(p)` the distance to p's `min_samples`-th neighbor.
    fn mutual_reachability(&self, dist: &[f64], n: usize) -> Vec<f64> {
        let k = self.min_samples.min(n - 1).max(1);
        let core: Vec<f64> = (0..n)
            .map(|i| {
                let mut row: Vec<f64> = (0..n)
                    .filter(|&j| j != i)
                    .map(|j| dist[i * n + j])
                    .collect();
                row.sort_by(|a, b| a.total_cmp(b));
                row[k - 1]
            })
            .collect();

        let mut reach = vec![0.0; n * n];
        for i in 0..n {
            for j in (i + 1)..n {
                let mr = dist[i * n + j].max(core[i]).max(core[j]);
                reach[i * n + j] = mr;
                reach[j * n + i] = mr;
            }
        }
        reach
    }

    fn fold_small_clusters(&self, labels: &mut [i64]) {
        let mut sizes: BTreeMap<i64, usize> = BTreeMap::new();
        for &l in labels.iter() {
            if l != NOISE {
                *sizes.entry(l).or_insert(0) += 1;
            }
        }
        for l in labels.iter_mut() {
            if *l != NOISE && sizes[l] < self.min_cluster_size {
                *l = NOISE;
            }
        }
    }
}

/// Prim's algorithm over the dense reachability matrix; returns the tree
/// as `(weight, a, b)` edges.
fn minimum_spanning_tree(reach: &[f64], n: usize) -> Vec<(f64, usize, usize)> {
    let mut in_tree = vec![false; n];
    let mut best_dist = vec![f64::INFINITY; n];
    let mut best_from = vec![0usize; n];
    let mut edges = Vec::with_capacity(n.saturating_sub(1));

    in_tree[0] = true;
    for j in 1..n {
        best_dist[j] = reach[j];
        best_from[j] = 0;
    }

    for _ in 1..n {
        let mut next = usize::MAX;
        let mut next_dist = f64::INFINITY;
        for j in 0..n {
            if !in_tree[j] && best_dist[j] < next_dist {
                next = j;
                next_dist = best_dist[j];
            }
        }
        if next == usize::MAX {
            break;
        }

        in_tree[next] = true;
        edges.push((next_dist, best_from[next], next));

        for j in 0..n {
            if !in_tree[j] && reach[next * n + j] < best_dist[j] {
                best_dist[j] = reach[next * n + j];
                best_from[j] = next;
            }
        }
    }

    edges
}

/// Cuts the spanning tree at the dominant weight gap and labels the
/// resulting components.
///
/// Inter-cluster edges sit at the top of the sorted weight list and are
/// separated from intra-cluster edges by a large multiplicative jump;
/// without such a jump the data is one density region and stays a single
/// component. Gaps are only sought in the upper half so duplicate points
/// (zero-weight edges) cannot fabricate one.
fn cut_components(mst: &[(f64, usize, usize)], n: usize) -> Vec<i64> {
    let mut weights: Vec<f64> = mst.iter().map(|e| e.0).collect();
    weights.sort_by(|a, b| a.total_cmp(b));

    let mut threshold = f64::INFINITY;
    let mut best_ratio = 0.0;
    for i in (weights.len() / 2)..weights.len().saturating_sub(1) {
        let lo = weights[i].max(1e-12);
        let ratio = weights[i + 1] / lo;
        if ratio > best_ratio {
            best_ratio = ratio;
            threshold = weights[i + 1];
        }
    }
    if best_ratio < GAP_FACTOR {
        threshold = f64::INFINITY;
    }

    // Union-find over the edges kept below the cut.
    let mut parent: Vec<usize> = (0..n).collect();
    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }
    for &(w, a, b) in mst {
        if w < threshold {
            let ra = find(&mut parent, a);
            let rb = find(&mut parent, b);
            if ra != rb {
                parent[ra] = rb;
            }
        }
    }

    let mut next_label = 0i64;
    let mut root_to_label: BTreeMap<usize, i64> = BTreeMap::new();
    (0..n)
        .map(|i| {
            let root = find(&mut parent, i);
            *root_to_label.entry(root).or_insert_with(|| {
                let l = next_label;
                next_label += 1;
                l
            })
        })
        .collect()
}

/// Compacts cluster ids to `0..k` preserving first-appearance order.
fn renumber(labels: &mut [i64]) {
    let mut mapping: BTreeMap<i64, i64> = BTreeMap::new();
    let mut next = 0i64;
    for l in labels.iter_mut() {
        if *l == NOISE {
            continue;
        }
        let new = *mapping.entry(*l).or_insert_with(|| {
            let v = next;
            next += 1;
            v
        });
        *l = new;
    }
}

/// Soft membership per point: 1 at the cluster centroid decaying linearly
/// to 0 at the cluster's farthest member. Noise points get 0.
fn membership_probabilities(x: &[Vec<f64>], labels: &[i64]) -> Vec<f64> {
    let mut centroids: BTreeMap<i64, (Vec<f64>, usize)> = BTreeMap::new();
    let dim = x.first().map_or(0, Vec::len);

    for (row, &l) in x.iter().zip(labels) {
        if l == NOISE {
            continue;
        }
        let entry = centroids.entry(l).or_insert_with(|| (vec![0.0; dim], 0));
        for (c, v) in entry.0.iter_mut().zip(row) {
            *c += v;
        }
        entry.1 += 1;
    }
    for (centroid, count) in centroids.values_mut() {
        for c in centroid.iter_mut() {
            *c /= *count as f64;
        }
    }

    let dists: Vec<f64> = x
        .iter()
        .zip(labels)
        .map(|(row, &l)| {
            centroids
                .get(&l)
                .map_or(0.0, |(c, _)| euclidean(row, c))
        })
        .collect();

    let mut max_dist: BTreeMap<i64, f64> = BTreeMap::new();
    for (&l, &d) in labels.iter().zip(&dists) {
        if l != NOISE {
            let m = max_dist.entry(l).or_insert(0.0);
            if d > *m {
                *m = d;
            }
        }
    }

    labels
        .iter()
        .zip(&dists)
        .map(|(&l, &d)| {
            if l == NOISE {
                return 0.0;
            }
            let m = max_dist.get(&l).copied().unwrap_or(0.0);
            if m == 0.0 { 1.0 } else { (1.0 - d / m).clamp(0.0, 1.0) }
        })
        .collect()
}

/// Mean silhouette over non-noise points, using the precomputed distance
/// matrix. `None` when fewer than two points survive.
fn silhouette_score(dist: &[f64], labels: &[i64]) -> Option<f64> {
    let n = labels.len();
    let points: Vec<usize> = (0..n).filter(|&i| labels[i] != NOISE).collect();
    if points.len() < 2 {
        return None;
    }

    let mut sum = 0.0;
    let mut counted = 0usize;

    for &i in &points {
        let own = labels[i];

        let own_members: Vec<usize> = points
            .iter()
            .copied()
            .filter(|&j| j != i && labels[j] == own)
            .collect();
        if own_members.is_empty() {
            continue;
        }
        let a = own_members.iter().map(|&j| dist[i * n + j]).sum::<f64>()
            / own_members.len() as f64;

        let mut b = f64::INFINITY;
        let others: Vec<i64> = {
            let mut o: Vec<i64> =
                points.iter().map(|&j| labels[j]).filter(|&l| l != own).collect();
            o.sort_unstable();
            o.dedup();
            o
        };
        for other in others {
            let members: Vec<usize> = points
                .iter()
                .copied()
                .filter(|&j| labels[j] == other)
                .collect();
            let mean = members.iter().map(|&j| dist[i * n + j]).sum::<f64>()
                / members.len() as f64;
            if mean < b {
                b = mean;
            }
        }
        if !b.is_finite() {
            continue;
        }

        sum += (b - a) / a.max(b);
        counted += 1;
    }

    if counted == 0 {
        None
    } else {
        Some(sum / counted as f64)
    }
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}
