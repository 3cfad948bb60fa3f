// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Enforcement impact analysis.
//!
//! Before any policy is pushed, every matrix cell is replayed against the
//! proposed SGACLs: flows on ports outside the permit set would be
//! blocked, and each blocked (port, volume) pair is classified by the
//! operational risk of losing it. A report with any critical block gates
//! deployment.

use core::fmt;
use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    cfg::config::PolicyConfig,
    policy::{
        matrix::{MatrixCell, PolicyMatrix},
        sgacl::SgaclPolicy,
    },
};

/// Ports whose loss breaks core infrastructure, whatever the volume.
/// DNS, Kerberos, NTP, LDAP, HTTPS, LDAPS.
pub const CRITICAL_PORTS: &[u16] = &[53, 88, 123, 389, 443, 636];

/// Well-known operational ports: SSH, HTTP, SMB, kpasswd, RDP.
pub const OPERATIONAL_PORTS: &[u16] = &[22, 80, 445, 464, 3389];

#[derive(
    Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Critical,
    High,
    Medium,
    Low,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RiskLevel::Critical => "critical",
            RiskLevel::High => "high",
            RiskLevel::Medium => "medium",
            RiskLevel::Low => "low",
        })
    }
}

/// One would-be-blocked traffic pattern.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct BlockedTraffic {
    pub src_sgt: u16,
    pub src_sgt_name: String,
    pub dst_sgt: u16,
    pub dst_sgt_name: String,

    /// `"proto/port"`.
    pub port: String,
    pub flow_count: u64,
    pub bytes_count: u64,

    pub reason: String,
    pub risk_level: RiskLevel,
    pub recommendation: String,
}

/// Complete impact analysis over one matrix + policy set.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ImpactReport {
    pub total_flows_analyzed: u64,
    pub flows_permitted: u64,
    pub flows_blocked: u64,

    pub blocked_traffic: Vec<BlockedTraffic>,

    pub critical_blocks: u64,
    pub high_risk_blocks: u64,
    pub medium_risk_blocks: u64,
    pub low_risk_blocks: u64,

    pub affected_src_sgts: BTreeSet<u16>,
    pub affected_dst_sgts: BTreeSet<u16>,
}

impl ImpactReport {
    pub fn permit_ratio(&self) -> f64 {
        if self.total_flows_analyzed == 0 {
            1.0
        } else {
            self.flows_permitted as f64 / self.total_flows_analyzed as f64
        }
    }

    pub fn block_ratio(&self) -> f64 {
        1.0 - self.permit_ratio()
    }

    /// Deployment gate: true when any critical block exists.
    pub fn has_critical_issues(&self) -> bool {
        self.critical_blocks > 0
    }

    pub fn summary(&self) -> String {
        let mut lines = vec![
            "Policy impact analysis".to_string(),
            format!("Total flows analyzed: {}", self.total_flows_analyzed),
            format!(
                "Flows permitted:      {} ({:.1}%)",
                self.flows_permitted,
                self.permit_ratio() * 100.0
            ),
            format!(
                "Flows blocked:        {} ({:.1}%)",
                self.flows_blocked,
                self.block_ratio() * 100.0
            ),
            String::new(),
            format!(
                "Risk breakdown: critical={} high={} medium={} low={}",
                self.critical_blocks,
                self.high_risk_blocks,
                self.medium_risk_blocks,
                self.low_risk_blocks
            ),
        ];

        if !self.blocked_traffic.is_empty() {
            lines.push(String::new());
            lines.push("Top blocked traffic:".to_string());
            let mut top: Vec<&BlockedTraffic> = self.blocked_traffic.iter().collect();
            top.sort_by(|a, b| b.flow_count.cmp(&a.flow_count));
            for b in top.into_iter().take(10) {
                lines.push(format!(
                    "  {} -> {} {}: {} flows [{}]",
                    b.src_sgt_name, b.dst_sgt_name, b.port, b.flow_count, b.risk_level
                ));
            }
        }

        lines.join("\n")
    }
}

pub struct ImpactAnalyzer {
    critical_flow_threshold: u64,
    high_flow_threshold: u64,
}

impl ImpactAnalyzer {
    pub fn new(cfg: &PolicyConfig) -> Self {
        Self {
            critical_flow_threshold: cfg.critical_flow_threshold,
            high_flow_threshold: cfg.high_flow_threshold,
        }
    }

    /// Replays every matrix cell against its policy. A cell without a
    /// policy is fully blocked: the baseline is default-deny.
    pub fn analyze(
        &self,
        matrix: &PolicyMatrix,
        policies: &[SgaclPolicy],
    ) -> ImpactReport {
        let policy_lookup: HashMap<(u16, u16), &SgaclPolicy> = policies
            .iter()
            .map(|p| ((p.src_sgt, p.dst_sgt), p))
            .collect();

        let mut report = ImpactReport::default();

        for (&key, cell) in &matrix.cells {
            match policy_lookup.get(&key) {
                None => self.analyze_all_blocked(cell, &mut report),
                Some(policy) => self.analyze_with_policy(cell, policy, &mut report),
            }
        }

        info!(
            permitted = report.flows_permitted,
            blocked = report.flows_blocked,
            critical = report.critical_blocks,
            "impact analysis complete"
        );
        report
    }

    fn analyze_all_blocked(&self, cell: &MatrixCell, report: &mut ImpactReport) {
        report.total_flows_analyzed += cell.total_flows;
        report.flows_blocked += cell.total_flows;
        report.affected_src_sgts.insert(cell.src_sgt);
        report.affected_dst_sgts.insert(cell.dst_sgt);

        let avg_bytes =
            cell.total_bytes / (cell.observed_ports.len().max(1) as u64);
        for (port_key, count) in cell.top_ports(5) {
            let blocked = self.blocked_entry(
                cell,
                port_key,
                count,
                avg_bytes,
                "No SGACL policy defined for this SGT pair".to_string(),
            );
            bump_risk(report, blocked.risk_level);
            report.blocked_traffic.push(blocked);
        }
    }

    fn analyze_with_policy(
        &self,
        cell: &MatrixCell,
        policy: &SgaclPolicy,
        report: &mut ImpactReport,
    ) {
        report.total_flows_analyzed += cell.total_flows;

        let permitted: BTreeSet<String> = policy.permitted_ports().collect();

        for (port_key, &count) in &cell.observed_ports {
            if permitted.contains(port_key) {
                report.flows_permitted += count;
                continue;
            }

            report.flows_blocked += count;
            report.affected_src_sgts.insert(cell.src_sgt);
            report.affected_dst_sgts.insert(cell.dst_sgt);

            let bytes = if cell.total_flows == 0 {
                0
            } else {
                cell.total_bytes * count / cell.total_flows
            };
            let blocked = self.blocked_entry(
                cell,
                port_key,
                count,
                bytes,
                format!("Port {port_key} not in SGACL permit list"),
            );
            bump_risk(report, blocked.risk_level);
            report.blocked_traffic.push(blocked);
        }
    }

    fn blocked_entry(
        &self,
        cell: &MatrixCell,
        port_key: &str,
        flow_count: u64,
        bytes_count: u64,
        reason: String,
    ) -> BlockedTraffic {
        let risk_level = self.assess_risk(port_key, flow_count);
        BlockedTraffic {
            src_sgt: cell.src_sgt,
            src_sgt_name: cell.src_sgt_name.clone(),
            dst_sgt: cell.dst_sgt,
            dst_sgt_name: cell.dst_sgt_name.clone(),
            port: port_key.to_string(),
            flow_count,
            bytes_count,
            reason,
            risk_level,
            recommendation: recommendation(port_key, risk_level),
        }
    }

    fn assess_risk(&self, port_key: &str, flow_count: u64) -> RiskLevel {
        let Some(port) = port_key
            .split_once('/')
            .and_then(|(_, p)| p.parse::<u16>().ok())
        else {
            return RiskLevel::Low;
        };

        if CRITICAL_PORTS.contains(&port) {
            return RiskLevel::Critical;
        }

        if OPERATIONAL_PORTS.contains(&port) {
            return if flow_count >= self.high_flow_threshold {
                RiskLevel::High
            } else {
                RiskLevel::Medium
            };
        }

        if flow_count >= self.critical_flow_threshold {
            RiskLevel::High
        } else if flow_count >= self.high_flow_threshold {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

fn recommendation(port_key: &str, risk_level: RiskLevel) -> String {
    match risk_level {
        RiskLevel::Critical => format!(
            "CRITICAL: Add permit rule for {port_key} - likely required for core services"
        ),
        RiskLevel::High => {
            format!("Review and add permit rule for {port_key} if business-justified")
        },
        RiskLevel::Medium => format!("Consider adding permit rule for {port_key}"),
        RiskLevel::Low => format!("Low-risk block - verify {port_key} is not needed"),
    }
}

fn bump_risk(report: &mut ImpactReport, risk: RiskLevel) {
    match risk {
        RiskLevel::Critical => report.critical_blocks += 1,
        RiskLevel::High => report.high_risk_blocks += 1,
        RiskLevel::Medium => report.medium_risk_blocks += 1,
        RiskLevel::Low => report.low_risk_blocks += 1,
    }
}
