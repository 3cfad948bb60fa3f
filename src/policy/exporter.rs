// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Deployment package assembly.
//!
//! The enforcement-ready artifact the deploy-to-ISE tool consumes: SGT
//! definitions, SGACL definitions with their ordered rules, the SGT×SGT
//! binding list, the impact report, and a deployment guide that calls out
//! critical blocks. The wire format downstream is the tool's business;
//! the object shapes here are the contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    policy::{
        impact::ImpactReport,
        sgacl::{SgaclPolicy, SgaclRule},
    },
    sgt::lifecycle::SgtEntry,
};

/// One SGT definition as the deployment tool expects it.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SgtDefinition {
    pub sgt_value: u16,
    pub sgt_name: String,
    pub description: Option<String>,
}

/// One named SGACL with its ordered rules, rendered and structured.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SgaclDefinition {
    pub name: String,
    pub rules: Vec<SgaclRule>,
    pub cisco_syntax: String,
    pub coverage_ratio: f64,
}

/// Binding of one SGT pair to its SGACL.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SgtBinding {
    pub src_sgt: u16,
    pub dst_sgt: u16,
    pub sgacl_name: String,
}

/// The complete enforcement-ready artifact.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DeploymentPackage {
    pub generated_at: DateTime<Utc>,
    pub sgts: Vec<SgtDefinition>,
    pub sgacls: Vec<SgaclDefinition>,
    pub bindings: Vec<SgtBinding>,
    pub impact: ImpactReport,
    pub deployment_guide: Vec<String>,
}

impl DeploymentPackage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Assembles the package from the run's artifacts.
pub fn build_package(
    sgts: &[SgtEntry],
    policies: &[SgaclPolicy],
    impact: ImpactReport,
) -> DeploymentPackage {
    let sgt_defs: Vec<SgtDefinition> = sgts
        .iter()
        .map(|e| SgtDefinition {
            sgt_value: e.sgt_value,
            sgt_name: e.sgt_name.clone(),
            description: e.description.clone(),
        })
        .collect();

    let sgacls: Vec<SgaclDefinition> = policies
        .iter()
        .map(|p| SgaclDefinition {
            name: p.name.clone(),
            rules: p.rules.clone(),
            cisco_syntax: p.to_cisco_syntax(),
            coverage_ratio: p.coverage_ratio(),
        })
        .collect();

    let bindings: Vec<SgtBinding> = policies
        .iter()
        .map(|p| SgtBinding {
            src_sgt: p.src_sgt,
            dst_sgt: p.dst_sgt,
            sgacl_name: p.name.clone(),
        })
        .collect();

    let deployment_guide = deployment_guide(&impact, policies);

    let package = DeploymentPackage {
        generated_at: Utc::now(),
        sgts: sgt_defs,
        sgacls,
        bindings,
        impact,
        deployment_guide,
    };

    info!(
        sgts = package.sgts.len(),
        sgacls = package.sgacls.len(),
        critical_blocks = package.impact.critical_blocks,
        "deployment package assembled"
    );
    package
}

fn deployment_guide(impact: &ImpactReport, policies: &[SgaclPolicy]) -> Vec<String> {
    let mut notes = Vec::new();

    if impact.has_critical_issues() {
        notes.push(format!(
            "DO NOT DEPLOY: {} critical block(s) found. Core service traffic \
             (DNS/Kerberos/NTP/LDAP/HTTPS) would be cut. Resolve every \
             critical entry in the impact report first.",
            impact.critical_blocks
        ));
        for b in impact
            .blocked_traffic
            .iter()
            .filter(|b| b.risk_level == crate::policy::impact::RiskLevel::Critical)
        {
            notes.push(format!(
                "  critical: {} -> {} on {} ({} flows): {}",
                b.src_sgt_name, b.dst_sgt_name, b.port, b.flow_count, b.recommendation
            ));
        }
    } else {
        notes.push(format!(
            "Safe to stage: no critical blocks. {:.1}% of observed traffic \
             is permitted by the proposed policies.",
            impact.permit_ratio() * 100.0
        ));
    }

    let low_coverage = policies
        .iter()
        .filter(|p| p.total_observed_flows > 0 && p.coverage_ratio() < 0.9)
        .count();
    if low_coverage > 0 {
        notes.push(format!(
            "{low_coverage} polic(ies) cover less than 90% of their observed \
             flows; review their deny impact before enforcement."
        ));
    }

    notes.push(
        "Recommended rollout: monitor mode first, then enforce per SGT pair."
            .to_string(),
    );
    notes
}
