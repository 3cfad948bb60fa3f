// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Memory-frugal k-means for the switch.
//!
//! Plain Lloyd iterations over `Vec<f64>` rows with k-means++ seeding; no
//! math library, no allocation beyond the centroid set. Meant for a few
//! hundred endpoints with a handful of features, where a full density
//! clusterer would not fit the edge budget.

use rand::{Rng, RngExt};
use tokio_util::sync::CancellationToken;

/// k-means with k-means++ initialization.
#[derive(Debug, Clone)]
pub struct LightweightKMeans {
    n_clusters: usize,
    max_iter: usize,
    centroids: Vec<Vec<f64>>,
}

impl LightweightKMeans {
    pub fn new(n_clusters: usize, max_iter: usize) -> Self {
        assert!(n_clusters > 0, "k must be non-zero");
        Self {
            n_clusters,
            max_iter: max_iter.max(1),
            centroids: Vec::new(),
        }
    }

    pub fn centroids(&self) -> &[Vec<f64>] {
        &self.centroids
    }

    /// Fits the model and returns one label in `0..k` per row.
    ///
    /// With fewer points than clusters every point becomes its own
    /// cluster. Iteration stops when assignments are stable or `max_iter`
    /// is reached.
    pub fn fit<R: Rng>(&mut self, x: &[Vec<f64>], rng: &mut R) -> Vec<usize> {
        if x.is_empty() {
            self.centroids.clear();
            return Vec::new();
        }
        if x.len() < self.n_clusters {
            self.centroids = x.to_vec();
            return (0..x.len()).collect();
        }

        self.centroids = init_plus_plus(x, self.n_clusters, rng);

        let mut labels = vec![0usize; x.len()];
        for _ in 0..self.max_iter {
            let new_labels: Vec<usize> =
                x.iter().map(|p| self.nearest_centroid(p)).collect();
            if new_labels == labels {
                break;
            }
            labels = new_labels;
            self.update_centroids(x, &labels);
        }

        labels
    }

    /// Cancellable variant: yields between Lloyd iterations so the agent's
    /// shutdown signal is honored mid-fit.
    pub async fn fit_cancellable<R: Rng>(
        &mut self,
        x: &[Vec<f64>],
        rng: &mut R,
        cancel: &CancellationToken,
    ) -> Option<Vec<usize>> {
        if x.is_empty() {
            self.centroids.clear();
            return Some(Vec::new());
        }
        if x.len() < self.n_clusters {
            self.centroids = x.to_vec();
            return Some((0..x.len()).collect());
        }

        self.centroids = init_plus_plus(x, self.n_clusters, rng);

        let mut labels = vec![0usize; x.len()];
        for _ in 0..self.max_iter {
            if cancel.is_cancelled() {
                return None;
            }
            let new_labels: Vec<usize> =
                x.iter().map(|p| self.nearest_centroid(p)).collect();
            if new_labels == labels {
                break;
            }
            labels = new_labels;
            self.update_centroids(x, &labels);
            tokio::task::yield_now().await;
        }

        Some(labels)
    }

    /// Labels for new rows against the fitted centroids.
    pub fn predict(&self, x: &[Vec<f64>]) -> Vec<usize> {
        x.iter().map(|p| self.nearest_centroid(p)).collect()
    }

    fn nearest_centroid(&self, p: &[f64]) -> usize {
        let mut nearest = 0;
        let mut min_dist = f64::INFINITY;
        for (i, c) in self.centroids.iter().enumerate() {
            let d = euclidean(p, c);
            if d < min_dist {
                min_dist = d;
                nearest = i;
            }
        }
        nearest
    }

    fn update_centroids(&mut self, x: &[Vec<f64>], labels: &[usize]) {
        let n_features = x[0].len();
        for k in 0..self.n_clusters {
            let members: Vec<&Vec<f64>> = labels
                .iter()
                .zip(x)
                .filter(|&(&l, _)| l == k)
                .map(|(_, p)| p)
                .collect();
            if members.is_empty() {
                continue;
            }
            let mut mean = vec![0.0; n_features];
            for p in &members {
                for (m, v) in mean.iter_mut().zip(p.iter()) {
                    *m += v;
                }
            }
            for m in &mut mean {
                *m /= members.len() as f64;
            }
            self.centroids[k] = mean;
        }
    }
}

/// k-means++ seeding: first centroid uniform, the rest sampled with
/// probability proportional to squared distance to the nearest chosen one.
fn init_plus_plus<R: Rng>(x: &[Vec<f64>], k: usize, rng: &mut R) -> Vec<Vec<f64>> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(x[rng.random_range(0..x.len())].clone());

    while centroids.len() < k {
        let weights: Vec<f64> = x
            .iter()
            .map(|p| {
                let d = centroids
                    .iter()
                    .map(|c| euclidean(p, c))
                    .fold(f64::INFINITY, f64::min);
                d * d
            })
            .collect();

        let total: f64 = weights.iter().sum();
        let idx = if total == 0.0 {
            // Every point already sits on a centroid.
            rng.random_range(0..x.len())
        } else {
            let threshold = rng.random::<f64>() * total;
            let mut cumulative = 0.0;
            let mut chosen = x.len() - 1;
            for (i, w) in weights.iter().enumerate() {
                cumulative += w;
                if cumulative >= threshold {
                    chosen = i;
                    break;
                }
            }
            chosen
        };
        centroids.push(x[idx].clone());
    }

    centroids
}

pub(crate) fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}
