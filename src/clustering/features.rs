// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Sketch → feature vector projection.
//!
//! The projection is deterministic, feature ordering is part of the
//! contract (centroids persist across runs), and skewed features are
//! log1p-scaled. Standardization is fit on the first batch presented and
//! frozen afterwards; the stored parameters travel with the centroids so
//! the batch and incremental paths scale identically.

use serde::{Deserialize, Serialize};

use crate::{identity::PRIVILEGED_GROUPS, sketches::endpoint::EndpointSketch};

/// Number of features in the vector. Ordering is fixed by
/// [`FeatureVector::to_array`] and [`FEATURE_NAMES`].
pub const FEATURE_DIM: usize = 18;

pub const FEATURE_NAMES: [&str; FEATURE_DIM] = [
    "peer_diversity",
    "service_diversity",
    "port_diversity",
    "in_out_ratio",
    "total_bytes",
    "total_flows",
    "active_hours",
    "business_hours_ratio",
    "bytes_per_flow",
    "is_likely_server",
    "has_user",
    "group_count",
    "is_privileged",
    "is_laptop",
    "is_server",
    "is_printer",
    "is_iot",
    "is_phone",
];

/// Feature vector for one endpoint, raw (pre-standardization) values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureVector {
    pub endpoint_id: String,

    pub peer_diversity: f64,
    pub service_diversity: f64,
    pub port_diversity: f64,
    pub in_out_ratio: f64,
    pub total_bytes: f64,
    pub total_flows: f64,
    pub active_hours: f64,
    pub business_hours_ratio: f64,

    pub bytes_per_flow: f64,
    pub is_likely_server: f64,

    pub has_user: f64,
    pub group_count: f64,
    pub is_privileged: f64,

    // Device-type one-hots
    pub is_laptop: f64,
    pub is_server: f64,
    pub is_printer: f64,
    pub is_iot: f64,
    pub is_phone: f64,
}

impl FeatureVector {
    pub fn to_array(&self) -> [f64; FEATURE_DIM] {
        [
            self.peer_diversity,
            self.service_diversity,
            self.port_diversity,
            self.in_out_ratio,
            self.total_bytes,
            self.total_flows,
            self.active_hours,
            self.business_hours_ratio,
            self.bytes_per_flow,
            self.is_likely_server,
            self.has_user,
            self.group_count,
            self.is_privileged,
            self.is_laptop,
            self.is_server,
            self.is_printer,
            self.is_iot,
            self.is_phone,
        ]
    }

    /// Rejects vectors with NaN/infinite components; those records are
    /// dropped by callers, not clustered.
    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }
}

/// Zero-mean unit-variance standardization, fit once and then frozen.
/// Serialized alongside centroids as part of the model artifact.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct StandardScaler {
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(matrix: &[[f64; FEATURE_DIM]]) -> Self {
        let n = matrix.len().max(1) as f64;
        let mut means = vec![0.0; FEATURE_DIM];
        for row in matrix {
            for (m, v) in means.iter_mut().zip(row) {
                *m += v;
            }
        }
        for m in &mut means {
            *m /= n;
        }

        let mut stds = vec![0.0; FEATURE_DIM];
        for row in matrix {
            for ((s, v), m) in stds.iter_mut().zip(row).zip(&means) {
                *s += (v - m) * (v - m);
            }
        }
        for s in &mut stds {
            *s = (*s / n).sqrt();
            // Constant features standardize to zero instead of dividing
            // by zero.
            if *s == 0.0 {
                *s = 1.0;
            }
        }

        Self { means, stds }
    }

    pub fn transform(&self, row: &[f64; FEATURE_DIM]) -> Vec<f64> {
        row.iter()
            .zip(&self.means)
            .zip(&self.stds)
            .map(|((v, m), s)| (v - m) / s)
            .collect()
    }
}

/// Extracts and standardizes feature vectors.
#[derive(Debug, Default)]
pub struct FeatureExtractor {
    scaler: Option<StandardScaler>,
}

impl FeatureExtractor {
    pub fn new() -> Self {
        Self { scaler: None }
    }

    /// Restores an extractor around previously persisted scaler
    /// parameters, for the incremental path.
    pub fn with_scaler(scaler: StandardScaler) -> Self {
        Self {
            scaler: Some(scaler),
        }
    }

    pub fn scaler(&self) -> Option<&StandardScaler> {
        self.scaler.as_ref()
    }

    /// Drops the frozen parameters; the next `to_matrix` call refits.
    pub fn reset_scaler(&mut self) {
        self.scaler = None;
    }

    /// Raw feature projection for one sketch.
    pub fn extract(&self, sketch: &EndpointSketch) -> FeatureVector {
        let total_bytes = sketch.bytes_in + sketch.bytes_out;

        let business_hours_ratio = if sketch.active_hour_count() == 0 {
            0.5
        } else {
            sketch.business_hours_ratio()
        };

        let bytes_per_flow = if sketch.flow_count > 0 {
            (total_bytes as f64 / sketch.flow_count as f64).ln_1p()
        } else {
            0.0
        };

        let is_privileged = sketch
            .ad_groups
            .iter()
            .any(|g| PRIVILEGED_GROUPS.iter().any(|p| p.eq_ignore_ascii_case(g)));

        let device_type = sketch
            .device_type
            .as_deref()
            .unwrap_or("")
            .to_ascii_lowercase();

        FeatureVector {
            endpoint_id: sketch.endpoint_id.clone(),
            peer_diversity: (sketch.peer_diversity() as f64).ln_1p(),
            service_diversity: (sketch.service_diversity() as f64).ln_1p(),
            port_diversity: (sketch.port_diversity() as f64).ln_1p(),
            in_out_ratio: sketch.in_out_ratio(),
            total_bytes: (total_bytes as f64).ln_1p(),
            total_flows: (sketch.flow_count as f64).ln_1p(),
            active_hours: f64::from(sketch.active_hour_count()) / 24.0,
            business_hours_ratio,
            bytes_per_flow,
            is_likely_server: f64::from(u8::from(sketch.is_likely_server())),
            has_user: f64::from(u8::from(sketch.username.is_some())),
            group_count: (sketch.ad_groups.len() as f64).ln_1p(),
            is_privileged: f64::from(u8::from(is_privileged)),
            is_laptop: one_hot(&device_type, &["laptop", "workstation"]),
            is_server: one_hot(&device_type, &["server"]),
            is_printer: one_hot(&device_type, &["printer"]),
            is_iot: one_hot(&device_type, &["iot", "camera", "sensor"]),
            is_phone: one_hot(&device_type, &["phone", "mobile"]),
        }
    }

    pub fn extract_all(&self, sketches: &[EndpointSketch]) -> Vec<FeatureVector> {
        sketches.iter().map(|s| self.extract(s)).collect()
    }

    /// Standardized matrix plus endpoint ids, in input order. Fits the
    /// scaler on the first non-empty batch; later calls reuse the frozen
    /// parameters.
    pub fn to_matrix(
        &mut self,
        features: &[FeatureVector],
    ) -> (Vec<Vec<f64>>, Vec<String>) {
        if features.is_empty() {
            return (Vec::new(), Vec::new());
        }

        let raw: Vec<[f64; FEATURE_DIM]> =
            features.iter().map(FeatureVector::to_array).collect();
        let ids: Vec<String> =
            features.iter().map(|f| f.endpoint_id.clone()).collect();

        if self.scaler.is_none() {
            self.scaler = Some(StandardScaler::fit(&raw));
        }
        let scaler = self
            .scaler
            .as_ref()
            .expect("scaler fitted above cannot be missing");

        let matrix = raw.iter().map(|row| scaler.transform(row)).collect();
        (matrix, ids)
    }

    /// Standardizes a single vector with the frozen parameters; raw values
    /// pass through until a scaler exists.
    pub fn transform_one(&self, feature: &FeatureVector) -> Vec<f64> {
        let row = feature.to_array();
        match &self.scaler {
            Some(scaler) => scaler.transform(&row),
            None => row.to_vec(),
        }
    }
}

fn one_hot(device_type: &str, matches: &[&str]) -> f64 {
    f64::from(u8::from(matches.contains(&device_type)))
}
