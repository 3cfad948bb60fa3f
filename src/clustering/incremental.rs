// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Incremental assignment of new endpoints to existing clusters.
//!
//! The fast path between batch runs: project the sketch with the frozen
//! scaler, take the nearest stored centroid by Euclidean distance, and
//! assign: or declare noise beyond `max_distance_threshold`. Assignment
//! is deterministic for fixed centroids and input. Centroid updates are
//! running means and are serialized by the caller; reads take a snapshot
//! of the cache and are safe under concurrency.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    clustering::{
        batch::{ClusterResult, NOISE},
        confidence,
        features::{FeatureExtractor, FeatureVector},
    },
    sketches::endpoint::EndpointSketch,
};

/// Stored center of one non-noise cluster.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ClusterCentroid {
    pub cluster_id: i64,
    /// Mean of member feature vectors, in the frozen scaler's space.
    pub values: Vec<f64>,
    pub member_count: usize,
    pub sgt_value: Option<u16>,
    pub updated_at: DateTime<Utc>,
}

/// One incremental assignment decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub endpoint_id: String,
    pub cluster_id: i64,
    pub confidence: f64,
    pub distance: f64,
    pub sgt_value: Option<u16>,
}

pub struct IncrementalClusterer {
    extractor: FeatureExtractor,
    centroids: DashMap<i64, ClusterCentroid>,
    max_distance_threshold: f64,
}

impl IncrementalClusterer {
    pub fn new(extractor: FeatureExtractor, max_distance_threshold: f64) -> Self {
        Self {
            extractor,
            centroids: DashMap::new(),
            max_distance_threshold,
        }
    }

    /// Restores the incremental model artifact persisted by a batch run:
    /// the frozen scaler and the stored centroids.
    pub fn load_from_storage<S: crate::storage::Storage>(
        storage: &S,
        max_distance_threshold: f64,
    ) -> Self {
        let extractor = match storage.get_scaler() {
            Some(scaler) => FeatureExtractor::with_scaler(scaler),
            None => FeatureExtractor::new(),
        };
        let clusterer = Self::new(extractor, max_distance_threshold);
        clusterer.load_centroids(storage.list_centroids());
        clusterer
    }

    /// Writes the current centroid cache back through the storage
    /// boundary. Callers serialize updates; reads stay lock-free.
    pub fn persist<S: crate::storage::Storage>(&self, storage: &S) {
        for centroid in self.centroids() {
            storage.store_centroid(centroid);
        }
    }

    /// Replaces the centroid cache.
    pub fn load_centroids(&self, centroids: Vec<ClusterCentroid>) {
        self.centroids.clear();
        for c in centroids {
            self.centroids.insert(c.cluster_id, c);
        }
        info!(count = self.centroids.len(), "cluster centroids loaded");
    }

    pub fn has_centroids(&self) -> bool {
        !self.centroids.is_empty()
    }

    pub fn centroids(&self) -> Vec<ClusterCentroid> {
        self.centroids.iter().map(|e| e.value().clone()).collect()
    }

    /// Assigns one endpoint to its nearest centroid, read-only.
    pub fn assign(&self, sketch: &EndpointSketch) -> Assignment {
        let feature = self.extractor.extract(sketch);
        self.assign_vector(&sketch.endpoint_id, &feature)
    }

    fn assign_vector(&self, endpoint_id: &str, feature: &FeatureVector) -> Assignment {
        if self.centroids.is_empty() {
            warn!("no centroids loaded; incremental assignment yields noise");
            return Assignment {
                endpoint_id: endpoint_id.to_string(),
                cluster_id: NOISE,
                confidence: 0.0,
                distance: f64::INFINITY,
                sgt_value: None,
            };
        }
        if !feature.is_finite() {
            debug!(endpoint = endpoint_id, "non-finite feature vector; noise");
            return Assignment {
                endpoint_id: endpoint_id.to_string(),
                cluster_id: NOISE,
                confidence: 0.0,
                distance: f64::INFINITY,
                sgt_value: None,
            };
        }

        let row = self.extractor.transform_one(feature);

        let mut nearest: Option<(i64, f64, usize, Option<u16>)> = None;
        for entry in self.centroids.iter() {
            let c = entry.value();
            let d = euclidean(&row, &c.values);
            let closer = match nearest {
                // Equidistant centroids resolve to the smaller id so the
                // decision stays deterministic across runs.
                Some((best_id, best_d, _, _)) => {
                    d < best_d || (d == best_d && c.cluster_id < best_id)
                },
                None => true,
            };
            if closer {
                nearest = Some((c.cluster_id, d, c.member_count, c.sgt_value));
            }
        }

        let (cluster_id, distance, member_count, sgt_value) =
            nearest.expect("non-empty centroid cache checked above");

        if distance > self.max_distance_threshold {
            return Assignment {
                endpoint_id: endpoint_id.to_string(),
                cluster_id: NOISE,
                confidence: 0.0,
                distance,
                sgt_value: None,
            };
        }

        let confidence = confidence::for_cluster_assignment(
            cluster_id,
            Some(distance),
            None,
            Some(member_count),
            None,
        );

        Assignment {
            endpoint_id: endpoint_id.to_string(),
            cluster_id,
            confidence,
            distance,
            sgt_value,
        }
    }

    /// Assigns and folds the endpoint into its cluster's running mean.
    pub fn assign_and_update(&self, sketch: &EndpointSketch) -> Assignment {
        let feature = self.extractor.extract(sketch);
        let assignment = self.assign_vector(&sketch.endpoint_id, &feature);

        if assignment.cluster_id != NOISE {
            let row = self.extractor.transform_one(&feature);
            self.fold_sum_into_centroid(assignment.cluster_id, &row, 1);
        }

        assignment
    }

    /// Bulk path: every sketch assigned against the same snapshot, then
    /// one centroid update per affected cluster.
    pub fn assign_bulk(&self, sketches: &[EndpointSketch]) -> Vec<Assignment> {
        let mut assignments = Vec::with_capacity(sketches.len());
        let mut pending: std::collections::BTreeMap<i64, (Vec<f64>, usize)> =
            std::collections::BTreeMap::new();

        for sketch in sketches {
            let feature = self.extractor.extract(sketch);
            let assignment = self.assign_vector(&sketch.endpoint_id, &feature);

            if assignment.cluster_id != NOISE {
                let row = self.extractor.transform_one(&feature);
                let entry = pending
                    .entry(assignment.cluster_id)
                    .or_insert_with(|| (vec![0.0; row.len()], 0));
                for (s, v) in entry.0.iter_mut().zip(&row) {
                    *s += v;
                }
                entry.1 += 1;
            }

            assignments.push(assignment);
        }

        for (cluster_id, (sum, count)) in pending {
            self.fold_sum_into_centroid(cluster_id, &sum, count);
        }

        info!(assigned = assignments.len(), "bulk incremental assignment done");
        assignments
    }

    fn fold_sum_into_centroid(&self, cluster_id: i64, sum: &[f64], count: usize) {
        if let Some(mut entry) = self.centroids.get_mut(&cluster_id) {
            let old_n = entry.member_count as f64;
            let new_n = old_n + count as f64;
            for (c, s) in entry.values.iter_mut().zip(sum) {
                *c = (*c * old_n + s) / new_n;
            }
            entry.member_count += count;
            entry.updated_at = Utc::now();
        }
    }
}

/// Per-cluster mean vectors from a batch result, the seed for the
/// incremental cache.
pub fn centroids_from_result(
    result: &ClusterResult,
    matrix: &[Vec<f64>],
    now: DateTime<Utc>,
) -> Vec<ClusterCentroid> {
    let mut out = Vec::new();

    for cluster_id in result.cluster_ids() {
        let members: Vec<&Vec<f64>> = result
            .labels
            .iter()
            .zip(matrix)
            .filter(|&(&l, _)| l == cluster_id)
            .map(|(_, row)| row)
            .collect();
        if members.is_empty() {
            continue;
        }

        let dim = members[0].len();
        let mut mean = vec![0.0; dim];
        for row in &members {
            for (m, v) in mean.iter_mut().zip(row.iter()) {
                *m += v;
            }
        }
        for m in &mut mean {
            *m /= members.len() as f64;
        }

        out.push(ClusterCentroid {
            cluster_id,
            values: mean,
            member_count: members.len(),
            sgt_value: None,
            updated_at: now,
        });
    }

    out
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}
