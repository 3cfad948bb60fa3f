// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! SGACL rule generation.
//!
//! For each matrix cell: permit rules for the significant observed ports
//! (ordered by descending flow count), then a terminal `deny ip [log]`.
//! A port is significant when it carries both `min_flow_count` flows and
//! `min_flow_ratio` of the cell's total. Coverage is the share of
//! observed flows the permit rules account for.

use core::fmt;
use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    cfg::config::PolicyConfig,
    policy::matrix::{MatrixCell, PolicyMatrix},
};

/// Well-known port aliases, used for rendering only; rule identity is the
/// numeric port.
pub static PORT_NAMES: Lazy<HashMap<u16, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (22, "ssh"),
        (25, "smtp"),
        (53, "dns"),
        (80, "http"),
        (88, "kerberos"),
        (110, "pop3"),
        (123, "ntp"),
        (135, "msrpc"),
        (143, "imap"),
        (161, "snmp"),
        (389, "ldap"),
        (443, "https"),
        (445, "smb"),
        (464, "kpasswd"),
        (465, "smtps"),
        (587, "submission"),
        (636, "ldaps"),
        (993, "imaps"),
        (995, "pop3s"),
        (1433, "mssql"),
        (1521, "oracle"),
        (3306, "mysql"),
        (3389, "rdp"),
        (5432, "postgresql"),
        (8080, "http-alt"),
        (8443, "https-alt"),
    ])
});

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Permit,
    Deny,
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuleAction::Permit => "permit",
            RuleAction::Deny => "deny",
        })
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleProtocol {
    Tcp,
    Udp,
    Ip,
    Icmp,
}

impl fmt::Display for RuleProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuleProtocol::Tcp => "tcp",
            RuleProtocol::Udp => "udp",
            RuleProtocol::Ip => "ip",
            RuleProtocol::Icmp => "icmp",
        })
    }
}

/// One access control entry.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct SgaclRule {
    pub action: RuleAction,
    pub protocol: RuleProtocol,
    /// Destination port; `None` matches all.
    pub port: Option<u16>,
    pub source_port: Option<u16>,
    pub log: bool,

    /// Flows observed matching this pattern.
    pub flow_count: u64,
    /// Share of the cell's flows this rule accounts for.
    pub confidence: f64,
}

impl SgaclRule {
    pub fn to_cisco_syntax(&self) -> String {
        let mut parts = vec![self.action.to_string(), self.protocol.to_string()];
        if let Some(port) = self.port {
            parts.push(format!("dst eq {port}"));
        }
        if self.log {
            parts.push("log".to_string());
        }
        parts.join(" ")
    }

    /// Rendering alias for the destination port, if it is well-known.
    pub fn port_alias(&self) -> Option<&'static str> {
        self.port.and_then(|p| PORT_NAMES.get(&p).copied())
    }
}

/// Ordered rule list for one SGT pair; first match wins, default deny.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SgaclPolicy {
    pub name: String,
    pub src_sgt: u16,
    pub src_sgt_name: String,
    pub dst_sgt: u16,
    pub dst_sgt_name: String,

    pub rules: Vec<SgaclRule>,

    pub total_observed_flows: u64,
    pub covered_flows: u64,
    pub default_action: RuleAction,
}

impl SgaclPolicy {
    pub fn coverage_ratio(&self) -> f64 {
        if self.total_observed_flows == 0 {
            0.0
        } else {
            self.covered_flows as f64 / self.total_observed_flows as f64
        }
    }

    /// The `"proto/port"` keys this policy permits.
    pub fn permitted_ports(&self) -> impl Iterator<Item = String> + '_ {
        self.rules.iter().filter_map(|r| {
            if r.action == RuleAction::Permit
                && let Some(port) = r.port
            {
                Some(format!("{}/{port}", r.protocol))
            } else {
                None
            }
        })
    }

    pub fn to_cisco_syntax(&self) -> String {
        let mut lines = vec![
            format!("! SGACL: {}", self.name),
            format!("! Source: SGT {} ({})", self.src_sgt, self.src_sgt_name),
            format!("! Destination: SGT {} ({})", self.dst_sgt, self.dst_sgt_name),
            format!(
                "cts role-based permissions from {} to {}",
                self.src_sgt, self.dst_sgt
            ),
            format!("ip access-list role-based {}", self.name),
        ];
        for rule in &self.rules {
            lines.push(format!("  {}", rule.to_cisco_syntax()));
        }
        lines.join("\n")
    }
}

pub struct SgaclGenerator {
    min_flow_count: u64,
    min_flow_ratio: f64,
    add_logging: bool,
}

impl SgaclGenerator {
    pub fn new(cfg: &PolicyConfig) -> Self {
        Self {
            min_flow_count: cfg.min_flow_count,
            min_flow_ratio: cfg.min_flow_ratio,
            add_logging: cfg.add_logging,
        }
    }

    /// One policy per matrix cell. Pure over the built matrix.
    pub fn generate(&self, matrix: &PolicyMatrix) -> Vec<SgaclPolicy> {
        let policies: Vec<SgaclPolicy> =
            matrix.cells.values().map(|c| self.generate_policy(c)).collect();
        info!(policies = policies.len(), "SGACL generation complete");
        policies
    }

    pub fn generate_policy(&self, cell: &MatrixCell) -> SgaclPolicy {
        let mut policy = SgaclPolicy {
            name: policy_name(&cell.src_sgt_name, &cell.dst_sgt_name),
            src_sgt: cell.src_sgt,
            src_sgt_name: cell.src_sgt_name.clone(),
            dst_sgt: cell.dst_sgt,
            dst_sgt_name: cell.dst_sgt_name.clone(),
            rules: Vec::new(),
            total_observed_flows: cell.total_flows,
            covered_flows: 0,
            default_action: RuleAction::Deny,
        };

        for rule in self.permit_rules(cell) {
            policy.covered_flows += rule.flow_count;
            policy.rules.push(rule);
        }

        policy.rules.push(SgaclRule {
            action: RuleAction::Deny,
            protocol: RuleProtocol::Ip,
            port: None,
            source_port: None,
            log: self.add_logging,
            flow_count: 0,
            confidence: 1.0,
        });

        policy
    }

    fn permit_rules(&self, cell: &MatrixCell) -> Vec<SgaclRule> {
        let mut significant: Vec<(RuleProtocol, u16, u64)> = cell
            .observed_ports
            .iter()
            .filter_map(|(port_key, &count)| {
                let (proto, port) = parse_port_key(port_key)?;
                self.is_significant(count, cell.total_flows)
                    .then_some((proto, port, count))
            })
            .collect();

        // Descending by flow count; protocol then port keep ties stable.
        significant.sort_by(|a, b| {
            b.2.cmp(&a.2)
                .then_with(|| a.0.to_string().cmp(&b.0.to_string()))
                .then_with(|| a.1.cmp(&b.1))
        });

        significant
            .into_iter()
            .map(|(protocol, port, count)| SgaclRule {
                action: RuleAction::Permit,
                protocol,
                port: Some(port),
                source_port: None,
                log: false,
                flow_count: count,
                confidence: if cell.total_flows == 0 {
                    0.0
                } else {
                    count as f64 / cell.total_flows as f64
                },
            })
            .collect()
    }

    fn is_significant(&self, count: u64, total: u64) -> bool {
        if count < self.min_flow_count {
            return false;
        }
        if total > 0 && (count as f64 / total as f64) < self.min_flow_ratio {
            return false;
        }
        true
    }
}

/// `"tcp/443"` → `(Tcp, 443)`. Synthetic keys (`listen:…`) and malformed
/// entries yield `None` and never become rules.
fn parse_port_key(port_key: &str) -> Option<(RuleProtocol, u16)> {
    let (proto, port) = port_key.split_once('/')?;
    let protocol = match proto {
        "tcp" => RuleProtocol::Tcp,
        "udp" => RuleProtocol::Udp,
        _ => return None,
    };
    Some((protocol, port.parse().ok()?))
}

/// `SGACL_<src>_to_<dst>` with names reduced to ASCII alphanumerics and
/// underscores.
pub fn policy_name(src_name: &str, dst_name: &str) -> String {
    format!(
        "SGACL_{}_to_{}",
        sanitize_name(src_name),
        sanitize_name(dst_name)
    )
}

fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_underscore = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    out.trim_matches('_').to_string()
}
