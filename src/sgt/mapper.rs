// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Cluster → SGT allocation.
//!
//! Each sufficiently large, labeled cluster is proposed one SGT: a value
//! drawn from its category's range (overflowing into the special range)
//! and a globally unique name. Known label names map through a fixed
//! template table; unknown labels are categorized by behavior.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    clustering::{
        batch::{ClusterResult, NOISE},
        labeling::ClusterLabel,
    },
    sgt::SgtCategory,
};

/// Label name → (SGT base name, category) for labels the mapper knows.
const SGT_TEMPLATES: &[(&str, &str, SgtCategory)] = &[
    ("Corporate Laptops", "Corp-Users", SgtCategory::Users),
    ("Corporate Workstations", "Corp-Users", SgtCategory::Users),
    ("Engineering Users", "Engineering", SgtCategory::Users),
    ("IT Staff", "IT-Staff", SgtCategory::Users),
    ("Privileged Admins", "Privileged-IT", SgtCategory::Users),
    ("HR Users", "HR-Users", SgtCategory::Users),
    ("Sales Team", "Sales", SgtCategory::Users),
    ("Marketing Team", "Marketing", SgtCategory::Users),
    ("Finance Users", "Finance", SgtCategory::Users),
    ("Operations Staff", "Operations", SgtCategory::Users),
    ("Servers", "Servers", SgtCategory::Servers),
    ("Server-Like Endpoints", "Servers", SgtCategory::Servers),
    ("Printers", "Printers", SgtCategory::Devices),
    ("IoT Devices", "IoT", SgtCategory::Devices),
    ("Mobile Devices", "Mobile", SgtCategory::Users),
    ("Security Cameras", "Cameras", SgtCategory::Devices),
];

/// One proposed SGT for a cluster.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SgtRecommendation {
    pub cluster_id: i64,
    pub sgt_value: u16,
    pub sgt_name: String,
    pub category: SgtCategory,

    pub cluster_label: String,
    pub cluster_size: usize,

    pub confidence: f64,
    pub justification: String,

    pub endpoint_count: usize,
    pub sample_endpoints: Vec<String>,
}

/// The complete proposed taxonomy plus coverage statistics.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct SgtTaxonomy {
    pub recommendations: Vec<SgtRecommendation>,

    pub total_endpoints: usize,
    pub covered_endpoints: usize,
    pub uncovered_endpoints: usize,

    pub n_sgts: usize,
    pub avg_confidence: f64,
}

impl SgtTaxonomy {
    pub fn coverage_ratio(&self) -> f64 {
        if self.total_endpoints == 0 {
            0.0
        } else {
            self.covered_endpoints as f64 / self.total_endpoints as f64
        }
    }

    /// cluster id → SGT value lookup for the matrix builder.
    pub fn cluster_to_sgt(&self) -> BTreeMap<i64, u16> {
        self.recommendations
            .iter()
            .map(|r| (r.cluster_id, r.sgt_value))
            .collect()
    }

    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("SGT taxonomy: {} Security Group Tags", self.n_sgts),
            format!(
                "Coverage: {}/{} ({:.1}%)",
                self.covered_endpoints,
                self.total_endpoints,
                self.coverage_ratio() * 100.0
            ),
        ];
        let mut recs: Vec<&SgtRecommendation> = self.recommendations.iter().collect();
        recs.sort_by_key(|r| r.sgt_value);
        for rec in recs {
            lines.push(format!(
                "  SGT {:3} | {:<25} | {:5} endpoints | conf={:.2}",
                rec.sgt_value, rec.sgt_name, rec.endpoint_count, rec.confidence
            ));
        }
        lines.join("\n")
    }
}

pub struct SgtMapper {
    min_cluster_size: usize,
    next_value: BTreeMap<SgtCategory, u16>,
}

impl SgtMapper {
    pub fn new(min_cluster_size: usize) -> Self {
        Self {
            min_cluster_size,
            next_value: fresh_counters(),
        }
    }

    /// Builds the taxonomy from cluster labels. The noise cluster and
    /// clusters below `min_cluster_size` are skipped; their endpoints
    /// count as uncovered.
    pub fn generate_taxonomy(
        &mut self,
        result: &ClusterResult,
        labels: &BTreeMap<i64, ClusterLabel>,
    ) -> SgtTaxonomy {
        self.next_value = fresh_counters();
        let mut used_names: HashSet<String> = HashSet::new();

        let mut recommendations = Vec::new();
        let mut covered = 0usize;

        for (&cluster_id, label) in labels {
            if cluster_id == NOISE || label.member_count < self.min_cluster_size {
                continue;
            }

            let (base_name, category) = self.determine_name(label);
            let sgt_name = unique_name(&base_name, &used_names);
            let sgt_value = self.allocate_value(category);

            let mut sample: Vec<String> = result
                .get_cluster_members(cluster_id)
                .into_iter()
                .take(10)
                .map(str::to_string)
                .collect();
            sample.sort();

            used_names.insert(sgt_name.clone());
            covered += label.member_count;

            recommendations.push(SgtRecommendation {
                cluster_id,
                sgt_value,
                sgt_name,
                category,
                cluster_label: label.name.clone(),
                cluster_size: label.member_count,
                confidence: label.confidence,
                justification: justification(label),
                endpoint_count: label.member_count,
                sample_endpoints: sample,
            });
        }

        let total = result.endpoint_ids.len();
        let avg_confidence = if recommendations.is_empty() {
            0.0
        } else {
            recommendations.iter().map(|r| r.confidence).sum::<f64>()
                / recommendations.len() as f64
        };

        let taxonomy = SgtTaxonomy {
            n_sgts: recommendations.len(),
            total_endpoints: total,
            covered_endpoints: covered,
            uncovered_endpoints: total.saturating_sub(covered),
            avg_confidence,
            recommendations,
        };

        info!(
            sgts = taxonomy.n_sgts,
            coverage = format!("{:.1}%", taxonomy.coverage_ratio() * 100.0),
            "SGT taxonomy generated"
        );

        taxonomy
    }

    fn determine_name(&self, label: &ClusterLabel) -> (String, SgtCategory) {
        for (template, base, category) in SGT_TEMPLATES {
            if *template == label.name {
                return ((*base).to_string(), *category);
            }
        }

        // Unknown label: categorize by behavior.
        if label.is_server_cluster {
            ("Servers".to_string(), SgtCategory::Servers)
        } else if label.avg_in_out_ratio > 0.6 {
            ("Receivers".to_string(), SgtCategory::Servers)
        } else {
            ("Users".to_string(), SgtCategory::Users)
        }
    }

    /// Next free value in the category range; the special range absorbs
    /// overflow. When the special range itself is exhausted, allocation
    /// continues sequentially above its nominal top, so values stay
    /// unique at the cost of leaving the documented ranges. Real
    /// taxonomies stay far below the 40 combined slots.
    fn allocate_value(&mut self, category: SgtCategory) -> u16 {
        let (_, hi) = category.range();
        let next = self
            .next_value
            .get(&category)
            .copied()
            .unwrap_or(category.range().0);

        if next > hi && category != SgtCategory::Special {
            return self.allocate_value(SgtCategory::Special);
        }

        self.next_value.insert(category, next + 1);
        next
    }
}

fn fresh_counters() -> BTreeMap<SgtCategory, u16> {
    [
        SgtCategory::Users,
        SgtCategory::Servers,
        SgtCategory::Devices,
        SgtCategory::Special,
    ]
    .into_iter()
    .map(|c| (c, c.range().0))
    .collect()
}

/// Suffixes `-2`, `-3`, … until the name is free.
fn unique_name(base: &str, used: &HashSet<String>) -> String {
    if !used.contains(base) {
        return base.to_string();
    }
    let mut counter = 2;
    loop {
        let candidate = format!("{base}-{counter}");
        if !used.contains(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

fn justification(label: &ClusterLabel) -> String {
    let mut parts = vec![label.primary_reason.clone()];

    if let Some((dtype, ratio)) = label.top_device_types.first()
        && *ratio > 0.5
    {
        parts.push(format!("Device type: {dtype} ({:.0}%)", ratio * 100.0));
    }
    if label.is_server_cluster {
        parts.push(format!(
            "Server behavior (avg in/out ratio: {:.2})",
            label.avg_in_out_ratio
        ));
    }

    parts.join("; ")
}
