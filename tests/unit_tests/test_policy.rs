// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::{BTreeMap, HashMap};

use chrono::{Duration, Utc};
use clarion::{
    cfg::config::PolicyConfig,
    flow::{FlowRecord, Protocol},
    policy::{
        matrix::{MatrixCell, PolicyMatrixBuilder, SERVICE_SGT, UNKNOWN_SGT},
        sgacl::{RuleAction, RuleProtocol, SgaclGenerator, policy_name},
    },
};

fn flow(src_mac: &str, dst_ip: &str, dst_port: u16, bytes: u64) -> FlowRecord {
    FlowRecord {
        src_mac: src_mac.to_string(),
        src_ip: "10.0.0.2".to_string(),
        dst_ip: dst_ip.to_string(),
        src_port: 44000,
        dst_port,
        proto: Protocol::Tcp,
        bytes,
        packets: bytes / 500 + 1,
        timestamp: Utc::now(),
        switch_id: "switch-1".to_string(),
        service_name: None,
    }
}

struct World {
    endpoint_to_cluster: HashMap<String, i64>,
    cluster_to_sgt: BTreeMap<i64, u16>,
    sgt_names: BTreeMap<u16, String>,
    ip_to_endpoint: HashMap<String, String>,
    ip_to_service: HashMap<String, String>,
}

fn world() -> World {
    World {
        endpoint_to_cluster: HashMap::from([
            ("aa:00:00:00:00:01".to_string(), 0i64),
            ("aa:00:00:00:00:02".to_string(), 0i64),
            ("bb:00:00:00:00:01".to_string(), 1i64),
        ]),
        cluster_to_sgt: BTreeMap::from([(0i64, 2u16), (1i64, 10u16)]),
        sgt_names: BTreeMap::from([
            (2u16, "Corp-Users".to_string()),
            (10u16, "Servers".to_string()),
        ]),
        ip_to_endpoint: HashMap::from([(
            "10.1.0.1".to_string(),
            "bb:00:00:00:00:01".to_string(),
        )]),
        ip_to_service: HashMap::from([(
            "10.2.0.1".to_string(),
            "intranet-web".to_string(),
        )]),
    }
}

#[test]
fn destinations_resolve_endpoint_then_service_then_unknown() {
    let w = world();
    let builder = PolicyMatrixBuilder::new(
        &w.endpoint_to_cluster,
        &w.cluster_to_sgt,
        &w.sgt_names,
        &w.ip_to_endpoint,
        &w.ip_to_service,
    );

    let flows = vec![
        // Known endpoint destination: its cluster's SGT (10).
        flow("aa:00:00:00:00:01", "10.1.0.1", 443, 1000),
        // Known service destination: the service SGT.
        flow("aa:00:00:00:00:01", "10.2.0.1", 8080, 500),
        // Unknown destination: SGT 0.
        flow("aa:00:00:00:00:01", "203.0.113.9", 80, 300),
    ];

    let matrix = builder.build(&flows);
    assert_eq!(matrix.n_cells(), 3);
    assert!(matrix.get_cell(2, 10).is_some());
    assert!(matrix.get_cell(2, SERVICE_SGT).is_some());
    assert!(matrix.get_cell(2, UNKNOWN_SGT).is_some());
    assert_eq!(matrix.sgt_names.get(&UNKNOWN_SGT).map(String::as_str), Some("Unknown"));
    assert_eq!(matrix.total_flows, 3);
    assert_eq!(matrix.total_bytes, 1800);

    // The service cell picked up the resolved service name.
    let service_cell = matrix.get_cell(2, SERVICE_SGT).expect("cell");
    assert!(service_cell.services.contains("intranet-web"));
}

#[test]
fn unattributable_sources_are_skipped() {
    let w = world();
    let builder = PolicyMatrixBuilder::new(
        &w.endpoint_to_cluster,
        &w.cluster_to_sgt,
        &w.sgt_names,
        &w.ip_to_endpoint,
        &w.ip_to_service,
    );

    // Source MAC with no cluster: the flow contributes nothing.
    let matrix = builder.build(&[flow("ff:ff:ff:00:00:01", "10.1.0.1", 443, 1000)]);
    assert_eq!(matrix.n_cells(), 0);
    assert_eq!(matrix.total_flows, 0);
}

#[test]
fn cells_aggregate_ports_bytes_and_endpoints() {
    let w = world();
    let builder = PolicyMatrixBuilder::new(
        &w.endpoint_to_cluster,
        &w.cluster_to_sgt,
        &w.sgt_names,
        &w.ip_to_endpoint,
        &w.ip_to_service,
    );

    let mut flows = Vec::new();
    for _ in 0..5 {
        flows.push(flow("aa:00:00:00:00:01", "10.1.0.1", 443, 1000));
    }
    for _ in 0..3 {
        flows.push(flow("aa:00:00:00:00:02", "10.1.0.1", 22, 200));
    }
    let mut early = flow("aa:00:00:00:00:01", "10.1.0.1", 443, 100);
    early.timestamp = Utc::now() - Duration::hours(5);
    flows.push(early);

    let matrix = builder.build(&flows);
    let cell = matrix.get_cell(2, 10).expect("cell");

    assert_eq!(cell.total_flows, 9);
    assert_eq!(cell.observed_ports.get("tcp/443"), Some(&6));
    assert_eq!(cell.observed_ports.get("tcp/22"), Some(&3));
    assert_eq!(cell.unique_src_endpoints, 2);
    assert_eq!(cell.unique_dst_endpoints, 1);
    assert!(cell.first_seen.expect("first") < cell.last_seen.expect("last"));
    assert_eq!(cell.top_ports(1)[0].0, "tcp/443");
}

// ─────────────────────────────────────────────────────────────────────────
// SGACL generation

fn cell_with_ports(ports: &[(&str, u64)], total_bytes: u64) -> MatrixCell {
    let mut cell = MatrixCell {
        src_sgt: 2,
        src_sgt_name: "Corp-Users".to_string(),
        dst_sgt: 10,
        dst_sgt_name: "Servers".to_string(),
        total_bytes,
        ..MatrixCell::default()
    };
    for &(port, count) in ports {
        cell.observed_ports.insert(port.to_string(), count);
        cell.total_flows += count;
    }
    cell
}

fn generator(min_flow_count: u64, min_flow_ratio: f64) -> SgaclGenerator {
    SgaclGenerator::new(&PolicyConfig {
        min_flow_count,
        min_flow_ratio,
        add_logging: true,
        ..PolicyConfig::default()
    })
}

#[test]
fn significant_ports_become_ordered_permits() {
    // 1000 flows: 443 and 80 pass both thresholds, 22 fails the count.
    let cell = cell_with_ports(&[("tcp/443", 900), ("tcp/80", 80), ("tcp/22", 20)], 1_000_000);
    let policy = generator(50, 0.05).generate_policy(&cell);

    let permits: Vec<_> = policy
        .rules
        .iter()
        .filter(|r| r.action == RuleAction::Permit)
        .collect();
    assert_eq!(permits.len(), 2);
    assert_eq!(permits[0].port, Some(443));
    assert_eq!(permits[1].port, Some(80));
    assert!((permits[0].confidence - 0.9).abs() < 1e-9);

    // Terminal deny ip log.
    let last = policy.rules.last().expect("terminal rule");
    assert_eq!(last.action, RuleAction::Deny);
    assert_eq!(last.protocol, RuleProtocol::Ip);
    assert!(last.log);

    assert_eq!(policy.covered_flows, 980);
    assert!((policy.coverage_ratio() - 0.98).abs() < 1e-9);
}

#[test]
fn coverage_never_exceeds_observed() {
    let cell = cell_with_ports(
        &[("tcp/443", 500), ("udp/53", 300), ("tcp/22", 120), ("tcp/8080", 3)],
        0,
    );
    let policy = generator(10, 0.01).generate_policy(&cell);

    assert!(policy.covered_flows <= policy.total_observed_flows);
    let permit_sum: u64 = policy
        .rules
        .iter()
        .filter(|r| r.action == RuleAction::Permit)
        .map(|r| r.flow_count)
        .sum();
    assert_eq!(permit_sum, policy.covered_flows);
}

#[test]
fn listen_markers_never_become_rules() {
    let mut cell = cell_with_ports(&[("tcp/443", 100)], 0);
    cell.observed_ports.insert("listen:tcp/8443".to_string(), 500);
    cell.total_flows += 500;

    let policy = generator(10, 0.01).generate_policy(&cell);
    let permits: Vec<_> = policy
        .rules
        .iter()
        .filter(|r| r.action == RuleAction::Permit)
        .collect();
    assert_eq!(permits.len(), 1);
    assert_eq!(permits[0].port, Some(443));
}

#[test]
fn udp_and_tcp_are_interleaved_by_count() {
    let cell =
        cell_with_ports(&[("udp/53", 400), ("tcp/443", 300), ("udp/123", 200)], 0);
    let policy = generator(10, 0.01).generate_policy(&cell);

    let permits: Vec<(RuleProtocol, Option<u16>)> = policy
        .rules
        .iter()
        .filter(|r| r.action == RuleAction::Permit)
        .map(|r| (r.protocol, r.port))
        .collect();
    assert_eq!(
        permits,
        vec![
            (RuleProtocol::Udp, Some(53)),
            (RuleProtocol::Tcp, Some(443)),
            (RuleProtocol::Udp, Some(123)),
        ]
    );
}

#[test]
fn cisco_rendering_and_names() {
    let cell = cell_with_ports(&[("tcp/443", 100)], 0);
    let policy = generator(10, 0.01).generate_policy(&cell);

    assert_eq!(policy.name, "SGACL_Corp_Users_to_Servers");
    let rendered = policy.to_cisco_syntax();
    assert!(rendered.contains("cts role-based permissions from 2 to 10"));
    assert!(rendered.contains("ip access-list role-based SGACL_Corp_Users_to_Servers"));
    assert!(rendered.contains("  permit tcp dst eq 443"));
    assert!(rendered.contains("  deny ip log"));

    // Name sanitization collapses repeated separators.
    assert_eq!(
        policy_name("Corp  Users!!", "Data--Center"),
        "SGACL_Corp_Users_to_Data_Center"
    );
}

#[test]
fn well_known_ports_carry_aliases() {
    let cell = cell_with_ports(&[("tcp/443", 100), ("tcp/49152", 100)], 0);
    let policy = generator(10, 0.01).generate_policy(&cell);

    let by_port: HashMap<Option<u16>, &clarion::policy::sgacl::SgaclRule> = policy
        .rules
        .iter()
        .filter(|r| r.action == RuleAction::Permit)
        .map(|r| (r.port, r))
        .collect();
    assert_eq!(by_port[&Some(443)].port_alias(), Some("https"));
    assert_eq!(by_port[&Some(49152)].port_alias(), None);
}

#[test]
fn empty_cell_is_deny_only() {
    let cell = cell_with_ports(&[], 0);
    let policy = generator(10, 0.01).generate_policy(&cell);

    assert_eq!(policy.rules.len(), 1);
    assert_eq!(policy.rules[0].action, RuleAction::Deny);
    assert_eq!(policy.covered_flows, 0);
    assert_eq!(policy.coverage_ratio(), 0.0);
}
