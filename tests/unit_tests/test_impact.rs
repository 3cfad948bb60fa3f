// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::BTreeMap;

use clarion::{
    cfg::config::PolicyConfig,
    policy::{
        impact::{ImpactAnalyzer, RiskLevel},
        matrix::{MatrixCell, PolicyMatrix},
        sgacl::SgaclGenerator,
    },
};

fn cell(src: u16, dst: u16, ports: &[(&str, u64)]) -> MatrixCell {
    let mut cell = MatrixCell {
        src_sgt: src,
        src_sgt_name: format!("SGT-{src}"),
        dst_sgt: dst,
        dst_sgt_name: format!("SGT-{dst}"),
        total_bytes: 10_000,
        ..MatrixCell::default()
    };
    for &(port, count) in ports {
        cell.observed_ports.insert(port.to_string(), count);
        cell.total_flows += count;
    }
    cell
}

fn matrix_of(cells: Vec<MatrixCell>) -> PolicyMatrix {
    let mut cells_map = BTreeMap::new();
    let mut total_flows = 0;
    let mut total_bytes = 0;
    for c in cells {
        total_flows += c.total_flows;
        total_bytes += c.total_bytes;
        cells_map.insert((c.src_sgt, c.dst_sgt), c);
    }
    PolicyMatrix {
        cells: cells_map,
        sgt_names: BTreeMap::new(),
        total_flows,
        total_bytes,
    }
}

fn analyzer() -> ImpactAnalyzer {
    ImpactAnalyzer::new(&PolicyConfig::default())
}

#[test]
fn blocked_ssh_at_volume_is_high_risk() {
    // Cell 2→10: 555 flows; policy permits only 443 and 8080.
    let cell = cell(2, 10, &[("tcp/443", 500), ("tcp/22", 50), ("tcp/8080", 5)]);
    let matrix = matrix_of(vec![cell]);

    // The policy under test permits only 443 and 8080.
    let generator = SgaclGenerator::new(&PolicyConfig {
        min_flow_count: 5,
        min_flow_ratio: 0.001,
        ..PolicyConfig::default()
    });
    let mut policy = generator.generate_policy(&matrix.cells[&(2, 10)]);
    policy.rules.retain(|r| r.port != Some(22));
    policy.covered_flows = 505;

    let report = analyzer().analyze(&matrix, &[policy]);

    assert_eq!(report.total_flows_analyzed, 555);
    assert_eq!(report.flows_permitted, 505);
    assert_eq!(report.flows_blocked, 50);
    assert_eq!(
        report.flows_permitted + report.flows_blocked,
        report.total_flows_analyzed
    );

    assert_eq!(report.blocked_traffic.len(), 1);
    let blocked = &report.blocked_traffic[0];
    assert_eq!(blocked.port, "tcp/22");
    assert_eq!(blocked.flow_count, 50);
    // Well-known operational port at the high-volume threshold.
    assert_eq!(blocked.risk_level, RiskLevel::High);
    assert!(!report.has_critical_issues());
}

#[test]
fn missing_policy_blocks_the_whole_cell() {
    let matrix = matrix_of(vec![cell(2, 10, &[("tcp/8080", 30), ("tcp/9000", 10)])]);
    let report = analyzer().analyze(&matrix, &[]);

    assert_eq!(report.total_flows_analyzed, 40);
    assert_eq!(report.flows_blocked, 40);
    assert_eq!(report.flows_permitted, 0);
    assert!(report.affected_src_sgts.contains(&2));
    assert!(report.affected_dst_sgts.contains(&10));
    assert!(
        report
            .blocked_traffic
            .iter()
            .all(|b| b.reason.contains("No SGACL policy"))
    );
}

#[test]
fn critical_ports_gate_deployment() {
    // DNS blocked: critical regardless of volume.
    let matrix = matrix_of(vec![cell(2, 0, &[("udp/53", 3)])]);
    let report = analyzer().analyze(&matrix, &[]);

    assert_eq!(report.critical_blocks, 1);
    assert!(report.has_critical_issues());
    assert!(report.blocked_traffic[0].recommendation.contains("CRITICAL"));
}

#[test]
fn risk_classification_by_volume() {
    let a = analyzer();
    let matrix = matrix_of(vec![cell(
        2,
        10,
        &[
            ("tcp/9999", 150), // >= critical threshold: high
            ("tcp/8888", 60),  // >= high threshold: medium
            ("tcp/7777", 5),   // low
            ("tcp/3389", 10),  // well-known below threshold: medium
            ("tcp/389", 1),    // LDAP: critical
        ],
    )]);
    let report = a.analyze(&matrix, &[]);

    let risk_of = |port: &str| {
        report
            .blocked_traffic
            .iter()
            .find(|b| b.port == port)
            .map(|b| b.risk_level)
    };
    assert_eq!(risk_of("tcp/9999"), Some(RiskLevel::High));
    assert_eq!(risk_of("tcp/8888"), Some(RiskLevel::Medium));
    assert_eq!(risk_of("tcp/7777"), Some(RiskLevel::Low));
    assert_eq!(risk_of("tcp/3389"), Some(RiskLevel::Medium));
    assert_eq!(risk_of("tcp/389"), Some(RiskLevel::Critical));

    assert_eq!(report.critical_blocks, 1);
    assert_eq!(report.high_risk_blocks, 1);
    assert_eq!(report.medium_risk_blocks, 2);
    assert_eq!(report.low_risk_blocks, 1);
}

#[test]
fn permitted_and_blocked_always_sum() {
    // Several cells, one with a policy, one without, one fully permitted.
    let c1 = cell(2, 10, &[("tcp/443", 100), ("tcp/22", 20)]);
    let c2 = cell(2, 0, &[("tcp/8080", 30)]);
    let c3 = cell(10, 2, &[("tcp/443", 55)]);

    let generator = SgaclGenerator::new(&PolicyConfig {
        min_flow_count: 1,
        min_flow_ratio: 0.0,
        ..PolicyConfig::default()
    });
    let p1 = {
        let mut p = generator.generate_policy(&c1);
        // Keep only the 443 permit.
        p.rules.retain(|r| r.port != Some(22));
        p
    };
    let p3 = generator.generate_policy(&c3);

    let matrix = matrix_of(vec![c1, c2, c3]);
    let report = analyzer().analyze(&matrix, &[p1, p3]);

    assert_eq!(report.total_flows_analyzed, 205);
    assert_eq!(
        report.flows_permitted + report.flows_blocked,
        report.total_flows_analyzed
    );
    assert_eq!(report.flows_permitted, 155);
    assert_eq!(report.flows_blocked, 50);
}

#[test]
fn empty_matrix_permits_everything() {
    let report = analyzer().analyze(&matrix_of(Vec::new()), &[]);
    assert_eq!(report.total_flows_analyzed, 0);
    assert_eq!(report.permit_ratio(), 1.0);
    assert!(!report.has_critical_issues());
}

#[test]
fn summary_renders() {
    let matrix = matrix_of(vec![cell(2, 0, &[("udp/53", 3)])]);
    let report = analyzer().analyze(&matrix, &[]);
    let text = report.summary();
    assert!(text.contains("Flows blocked"));
    assert!(text.contains("udp/53"));
}
