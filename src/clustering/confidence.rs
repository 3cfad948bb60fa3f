// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Confidence scoring for cluster and SGT assignments.
//!
//! A pure function library; every score lands in `[0, 1]`. Sub-scores are
//! combined by weighted average with defaults probability 0.4, distance
//! 0.3, size 0.2, silhouette 0.1; absent sub-scores re-normalize the
//! remaining weights. The noise cluster always scores 0.2.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::clustering::batch::NOISE;

/// Distance at which distance-based confidence decays to zero.
pub const DISTANCE_THRESHOLD: f64 = 2.0;
/// Cluster size for full size-based confidence.
pub const MIN_RELIABLE_CLUSTER: usize = 10;
/// Cluster size beyond which heterogeneity starts costing confidence.
pub const MAX_RELIABLE_CLUSTER: usize = 1000;

const WEIGHT_PROBABILITY: f64 = 0.4;
const WEIGHT_DISTANCE: f64 = 0.3;
const WEIGHT_SIZE: f64 = 0.2;
const WEIGHT_SILHOUETTE: f64 = 0.1;

/// Confidence bands used in reports and the deployment package.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceClass {
    VeryHigh,
    High,
    Medium,
    Low,
    VeryLow,
}

impl fmt::Display for ConfidenceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConfidenceClass::VeryHigh => "very_high",
            ConfidenceClass::High => "high",
            ConfidenceClass::Medium => "medium",
            ConfidenceClass::Low => "low",
            ConfidenceClass::VeryLow => "very_low",
        })
    }
}

/// Linear decay from 1 at distance 0 to 0 at the threshold.
pub fn from_distance(distance: f64, threshold: f64) -> f64 {
    if threshold <= 0.0 || distance > threshold {
        return 0.0;
    }
    (1.0 - distance / threshold).max(0.0)
}

/// Density-membership probability maps through unchanged.
pub fn from_probability(probability: f64) -> f64 {
    probability.clamp(0.0, 1.0)
}

/// Piecewise size score: tiny clusters are unreliable, very large ones
/// too heterogeneous, the middle band scores full.
pub fn from_cluster_size(cluster_size: usize) -> f64 {
    if cluster_size < MIN_RELIABLE_CLUSTER {
        (cluster_size as f64 / MIN_RELIABLE_CLUSTER as f64).min(0.7)
    } else if cluster_size >= MAX_RELIABLE_CLUSTER {
        0.9
    } else {
        1.0
    }
}

/// Silhouette (−1..1) mapped to (0..1).
pub fn from_silhouette(silhouette: f64) -> f64 {
    ((silhouette + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// Weighted average of whichever sub-scores are present; 0.5 when none.
pub fn combined(
    distance: Option<f64>,
    probability: Option<f64>,
    size: Option<f64>,
    silhouette: Option<f64>,
) -> f64 {
    let mut weighted = 0.0;
    let mut total_weight = 0.0;

    for (score, weight) in [
        (probability, WEIGHT_PROBABILITY),
        (distance, WEIGHT_DISTANCE),
        (size, WEIGHT_SIZE),
        (silhouette, WEIGHT_SILHOUETTE),
    ] {
        if let Some(s) = score {
            weighted += s * weight;
            total_weight += weight;
        }
    }

    if total_weight == 0.0 {
        0.5
    } else {
        (weighted / total_weight).clamp(0.0, 1.0)
    }
}

/// Confidence of one cluster assignment from whatever evidence exists.
/// Noise assignments are always 0.2.
pub fn for_cluster_assignment(
    cluster_id: i64,
    distance: Option<f64>,
    probability: Option<f64>,
    cluster_size: Option<usize>,
    silhouette: Option<f64>,
) -> f64 {
    if cluster_id == NOISE {
        return 0.2;
    }

    let scores = [
        distance.map(|d| from_distance(d, DISTANCE_THRESHOLD)),
        probability.map(from_probability),
        cluster_size.map(from_cluster_size),
        silhouette.map(from_silhouette),
    ];
    let present = scores.iter().flatten().count();

    match present {
        0 => 0.5,
        1 => scores
            .iter()
            .flatten()
            .next()
            .copied()
            .unwrap_or(0.5),
        _ => combined(scores[0], scores[1], scores[2], scores[3]),
    }
}

/// SGT assignment confidence: base cluster confidence plus a stability
/// bonus of 0.01 per historical assignment, capped at 0.1. Manual
/// assignments bypass this and score 1.0 in the lifecycle layer.
pub fn for_sgt_assignment(
    cluster_confidence: f64,
    sgt_confidence: Option<f64>,
    history_count: usize,
) -> f64 {
    let stability_bonus = (history_count as f64 * 0.01).min(0.1);

    let base = match sgt_confidence {
        Some(s) => (cluster_confidence + s) / 2.0,
        None => cluster_confidence,
    };

    (base + stability_bonus).clamp(0.0, 1.0)
}

/// Bands a score for display.
pub fn classify(confidence: f64) -> ConfidenceClass {
    if confidence >= 0.9 {
        ConfidenceClass::VeryHigh
    } else if confidence >= 0.8 {
        ConfidenceClass::High
    } else if confidence >= 0.6 {
        ConfidenceClass::Medium
    } else if confidence >= 0.4 {
        ConfidenceClass::Low
    } else {
        ConfidenceClass::VeryLow
    }
}
