// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Semantic cluster labels.
//!
//! A cluster is named after the strongest identity signal that dominates
//! its membership, checked in the order device type > ISE profile > AD
//! group; behavioral shape is the fallback. The noise cluster gets a
//! dedicated label describing why its members did not group, because
//! operators see it next to every real cluster in the taxonomy review.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::{
    clustering::batch::{ClusterResult, NOISE},
    sketches::endpoint::EndpointSketch,
};

/// Membership share a signal needs to name the cluster.
pub const DOMINANCE_THRESHOLD: f64 = 0.5;

/// Label of one cluster.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ClusterLabel {
    pub cluster_id: i64,
    pub name: String,
    pub primary_reason: String,
    /// Clamped to `[0.2, 1.0]`; the ratio of the signal that won.
    pub confidence: f64,

    /// Top signals with membership ratios, strongest first.
    pub top_ad_groups: Vec<(String, f64)>,
    pub top_ise_profiles: Vec<(String, f64)>,
    pub top_device_types: Vec<(String, f64)>,

    /// Behavioral summary of the membership.
    pub avg_peer_diversity: f64,
    pub avg_in_out_ratio: f64,
    pub is_server_cluster: bool,

    pub member_count: usize,
}

pub struct SemanticLabeler {
    top_k: usize,
}

impl Default for SemanticLabeler {
    fn default() -> Self {
        Self { top_k: 5 }
    }
}

impl SemanticLabeler {
    pub fn new(top_k: usize) -> Self {
        Self { top_k: top_k.max(1) }
    }

    /// Labels every cluster in the result, the noise cluster included.
    pub fn label_clusters(
        &self,
        sketches: &HashMap<String, EndpointSketch>,
        result: &ClusterResult,
    ) -> BTreeMap<i64, ClusterLabel> {
        let mut labels = BTreeMap::new();

        let mut cluster_ids = result.cluster_ids();
        if result.cluster_sizes.contains_key(&NOISE) {
            cluster_ids.push(NOISE);
        }

        for cluster_id in cluster_ids {
            let members: Vec<&EndpointSketch> = result
                .get_cluster_members(cluster_id)
                .into_iter()
                .filter_map(|id| sketches.get(id))
                .collect();
            if members.is_empty() {
                continue;
            }
            labels.insert(cluster_id, self.label_one(cluster_id, &members));
        }

        labels
    }

    fn label_one(&self, cluster_id: i64, members: &[&EndpointSketch]) -> ClusterLabel {
        let n = members.len() as f64;

        let top_device_types = self.ranked(members, |s| {
            s.device_type.as_deref().map(|d| vec![d.to_string()]).unwrap_or_default()
        });
        let top_ise_profiles = self.ranked(members, |s| {
            s.ise_profile.as_deref().map(|p| vec![p.to_string()]).unwrap_or_default()
        });
        let top_ad_groups = self.ranked(members, |s| s.ad_groups.clone());

        let avg_peer_diversity =
            members.iter().map(|s| s.peer_diversity() as f64).sum::<f64>() / n;
        let avg_in_out_ratio =
            members.iter().map(|s| s.in_out_ratio()).sum::<f64>() / n;
        let server_members =
            members.iter().filter(|s| s.is_likely_server()).count() as f64;
        let is_server_cluster = avg_in_out_ratio > 0.6 || server_members / n > 0.5;

        if cluster_id == NOISE {
            return self.label_noise(
                members,
                top_device_types,
                top_ise_profiles,
                top_ad_groups,
                avg_peer_diversity,
                avg_in_out_ratio,
            );
        }

        // Strongest dominant signal wins, device type first.
        let (name, primary_reason, ratio) = if let Some((dtype, ratio)) =
            dominant(&top_device_types)
        {
            (
                device_type_display_name(&dtype),
                format!("Device type: {dtype} ({:.0}% of members)", ratio * 100.0),
                ratio,
            )
        } else if let Some((profile, ratio)) = dominant(&top_ise_profiles) {
            (
                profile.clone(),
                format!("ISE profile: {profile} ({:.0}% of members)", ratio * 100.0),
                ratio,
            )
        } else if let Some((group, ratio)) = dominant(&top_ad_groups) {
            (
                group.clone(),
                format!("AD group: {group} ({:.0}% of members)", ratio * 100.0),
                ratio,
            )
        } else if avg_in_out_ratio > 0.6 {
            (
                "Server-Like Endpoints".to_string(),
                "Server-like behavior".to_string(),
                avg_in_out_ratio,
            )
        } else {
            (
                "Mixed Endpoints".to_string(),
                "Mixed behavior".to_string(),
                0.4,
            )
        };

        ClusterLabel {
            cluster_id,
            name,
            primary_reason,
            confidence: ratio.clamp(0.2, 1.0),
            top_ad_groups,
            top_ise_profiles,
            top_device_types,
            avg_peer_diversity,
            avg_in_out_ratio,
            is_server_cluster,
            member_count: members.len(),
        }
    }

    /// The noise cluster is labeled by why its members did not group.
    #[allow(clippy::too_many_arguments)]
    fn label_noise(
        &self,
        members: &[&EndpointSketch],
        top_device_types: Vec<(String, f64)>,
        top_ise_profiles: Vec<(String, f64)>,
        top_ad_groups: Vec<(String, f64)>,
        avg_peer_diversity: f64,
        avg_in_out_ratio: f64,
    ) -> ClusterLabel {
        let n = members.len() as f64;

        let without_identity = members
            .iter()
            .filter(|s| s.username.is_none() && s.device_type.is_none())
            .count() as f64;
        let avg_flows =
            members.iter().map(|s| s.flow_count as f64).sum::<f64>() / n;

        let primary_reason = if without_identity / n > 0.5 {
            "Members lack identity context; no directory or session data to group on"
        } else if avg_flows < 10.0 {
            "Members have too little activity to establish a behavioral pattern"
        } else if top_device_types.len() > 3 {
            "Members span too many device types to form a coherent group"
        } else {
            "Members are behaviorally too diverse for any dense grouping"
        }
        .to_string();

        ClusterLabel {
            cluster_id: NOISE,
            name: "Unclustered".to_string(),
            primary_reason,
            confidence: 0.2,
            top_ad_groups,
            top_ise_profiles,
            top_device_types,
            avg_peer_diversity,
            avg_in_out_ratio,
            is_server_cluster: false,
            member_count: members.len(),
        }
    }

    fn ranked<F>(&self, members: &[&EndpointSketch], extract: F) -> Vec<(String, f64)>
    where
        F: Fn(&EndpointSketch) -> Vec<String>,
    {
        let n = members.len() as f64;
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for &member in members {
            for value in extract(member) {
                if !value.is_empty() {
                    *counts.entry(value).or_insert(0) += 1;
                }
            }
        }

        let mut ranked: Vec<(String, f64)> = counts
            .into_iter()
            .map(|(value, count)| (value, count as f64 / n))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(self.top_k);
        ranked
    }
}

fn dominant(ranked: &[(String, f64)]) -> Option<(String, f64)> {
    ranked
        .first()
        .filter(|(_, ratio)| *ratio >= DOMINANCE_THRESHOLD)
        .cloned()
}

fn device_type_display_name(device_type: &str) -> String {
    match device_type.to_ascii_lowercase().as_str() {
        "laptop" | "workstation" => "Corporate Laptops".to_string(),
        "server" => "Servers".to_string(),
        "printer" => "Printers".to_string(),
        "iot" | "camera" | "sensor" => "IoT Devices".to_string(),
        "phone" | "mobile" => "Mobile Devices".to_string(),
        other => {
            let mut name = other.to_string();
            if let Some(first) = name.get_mut(0..1) {
                first.make_ascii_uppercase();
            }
            format!("{name} Devices")
        },
    }
}

/// Multi-line operator-facing explanation of a cluster label.
pub fn generate_explanation(label: &ClusterLabel) -> String {
    let mut lines = Vec::new();

    if label.cluster_id == NOISE {
        lines.push(format!(
            "{} endpoints could not be grouped.",
            label.member_count
        ));
        lines.push(label.primary_reason.clone());
        lines.push(
            "These endpoints keep their current classification until more \
             evidence accumulates."
                .to_string(),
        );
        return lines.join("\n");
    }

    lines.push(format!("Primary reason: {}", label.primary_reason));
    lines.push(String::new());
    lines.push(
        "These endpoints are grouped because they share the characteristics \
         below and will receive the same SGACL policies."
            .to_string(),
    );

    if !label.top_ad_groups.is_empty() {
        lines.push(String::new());
        lines.push("AD group membership:".to_string());
        for (group, ratio) in label.top_ad_groups.iter().take(3) {
            lines.push(format!("  - {group}: {:.0}% of members", ratio * 100.0));
        }
    }
    if !label.top_ise_profiles.is_empty() {
        lines.push(String::new());
        lines.push("ISE profiles:".to_string());
        for (profile, ratio) in label.top_ise_profiles.iter().take(3) {
            lines.push(format!("  - {profile}: {:.0}% of members", ratio * 100.0));
        }
    }
    if !label.top_device_types.is_empty() {
        lines.push(String::new());
        lines.push("Device types:".to_string());
        for (dtype, ratio) in label.top_device_types.iter().take(3) {
            lines.push(format!("  - {dtype}: {:.0}% of members", ratio * 100.0));
        }
    }

    lines.push(String::new());
    lines.push("Behavior:".to_string());
    if label.is_server_cluster {
        lines.push(format!(
            "  - server-like; average in/out ratio {:.2}",
            label.avg_in_out_ratio
        ));
    } else {
        lines.push(format!(
            "  - average in/out ratio {:.2}",
            label.avg_in_out_ratio
        ));
    }
    lines.push(format!(
        "  - average peer diversity {:.1}",
        label.avg_peer_diversity
    ));

    lines.push(String::new());
    lines.push(format!(
        "Members: {}; confidence {:.0}%",
        label.member_count,
        label.confidence * 100.0
    ));

    lines.join("\n")
}
