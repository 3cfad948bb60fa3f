// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use clarion::{
    flow::Protocol,
    sketches::{SketchError, endpoint::EndpointSketch},
};

use crate::unit_tests::{outbound_sketch, ts_at_hour};

#[test]
fn behavioral_scenario_hundred_flows() {
    // 100 outbound flows, 10 peers, ports alternating 443/80, hour 10.
    let mut sketch =
        EndpointSketch::new("aa:bb:cc:dd:ee:ff", Some("switch-1".to_string()));
    for i in 0..100 {
        sketch.record_outbound(
            &format!("10.0.1.{}", i % 10),
            if i % 2 == 0 { 443 } else { 80 },
            Protocol::Tcp,
            1000,
            2,
            ts_at_hour(10),
            None,
        );
    }

    assert_eq!(sketch.flow_count, 100);
    assert_eq!(sketch.bytes_out, 100_000);
    let peers = sketch.peer_diversity();
    assert!((8..=12).contains(&peers), "peer diversity {peers}");
    assert!(sketch.port_diversity() >= 2);
    assert_ne!(sketch.active_hours & (1 << 10), 0, "hour 10 bit unset");
    assert_eq!(sketch.in_out_ratio(), 0.5, "no inbound traffic yet");
    assert_eq!(sketch.version, 100);
}

#[test]
fn inbound_flows_leave_a_listen_marker() {
    let mut sketch = EndpointSketch::new("aa:bb:cc:dd:ee:01", None);
    for _ in 0..20 {
        sketch.record_inbound(
            "10.0.2.7",
            51000,
            8443,
            Protocol::Tcp,
            4000,
            4,
            ts_at_hour(3),
        );
    }

    assert_eq!(sketch.bytes_in, 80_000);
    assert_eq!(sketch.flow_count, 20);
    assert_eq!(sketch.port_frequency.count(b"listen:tcp/8443"), 20);
    assert_ne!(sketch.active_hours & (1 << 3), 0);
}

#[test]
fn server_shape_is_detected() {
    let mut sketch = EndpointSketch::new("aa:bb:cc:dd:ee:02", None);
    // Few peers, receives far more than it sends.
    for i in 0..30 {
        sketch.record_outbound(
            &format!("10.0.3.{}", i % 5),
            443,
            Protocol::Tcp,
            100,
            1,
            ts_at_hour(14),
            None,
        );
        sketch.record_inbound(
            &format!("10.0.3.{}", i % 5),
            50000,
            443,
            Protocol::Tcp,
            10_000,
            10,
            ts_at_hour(14),
        );
    }

    assert!(sketch.in_out_ratio() > 0.6);
    assert!(sketch.is_likely_server());
}

#[test]
fn business_hours_ratio_counts_working_hours() {
    let mut sketch = EndpointSketch::new("aa:bb:cc:dd:ee:03", None);
    for hour in [9, 10, 11, 15, 22] {
        sketch.record_outbound(
            "10.0.0.9",
            443,
            Protocol::Tcp,
            10,
            1,
            ts_at_hour(hour),
            None,
        );
    }

    assert_eq!(sketch.active_hour_count(), 5);
    // 4 of 5 active hours fall in 8..=17.
    assert!((sketch.business_hours_ratio() - 0.8).abs() < 1e-9);
}

#[test]
fn merge_requires_same_endpoint() {
    let mut a = outbound_sketch("aa:bb:cc:dd:ee:04", 10, 5, 443);
    let b = outbound_sketch("aa:bb:cc:dd:ee:05", 10, 5, 443);

    assert!(matches!(
        a.merge(&b),
        Err(SketchError::EndpointMismatch { .. })
    ));
}

#[test]
fn merge_combines_counters_and_enrichment() -> Result<()> {
    let mut a = outbound_sketch("aa:bb:cc:dd:ee:06", 40, 10, 443);
    let mut b = EndpointSketch::new("aa:bb:cc:dd:ee:06", Some("switch-2".to_string()));
    for i in 0..60 {
        b.record_outbound(
            &format!("172.16.0.{}", i % 20),
            22,
            Protocol::Tcp,
            500,
            1,
            ts_at_hour(2),
            Some("ssh-bastion"),
        );
    }
    b.username = Some("jdoe".to_string());
    b.ad_groups = vec!["Engineering".to_string()];

    let peers_a = a.peer_diversity();
    let peers_b = b.peer_diversity();
    a.merge(&b)?;

    assert_eq!(a.flow_count, 100);
    assert_eq!(a.bytes_out, 40 * 1000 + 60 * 500);
    // Disjoint peer sets: the union is close to the sum.
    let merged_peers = a.peer_diversity();
    assert!(merged_peers >= peers_a.max(peers_b));
    // Hour bitmap is a union.
    assert_ne!(a.active_hours & (1 << 10), 0);
    assert_ne!(a.active_hours & (1 << 2), 0);
    // Enrichment adopted because the local side was empty.
    assert_eq!(a.username.as_deref(), Some("jdoe"));
    assert_eq!(a.ad_groups, vec!["Engineering".to_string()]);
    Ok(())
}

#[test]
fn merge_keeps_local_enrichment() -> Result<()> {
    let mut a = outbound_sketch("aa:bb:cc:dd:ee:07", 5, 2, 443);
    a.username = Some("alice".to_string());
    a.user_id = Some("u-1".to_string());

    let mut b = outbound_sketch("aa:bb:cc:dd:ee:07", 5, 2, 443);
    b.username = Some("bob".to_string());
    b.user_id = Some("u-2".to_string());

    a.merge(&b)?;
    assert_eq!(a.username.as_deref(), Some("alice"));
    Ok(())
}

#[test]
fn serialized_round_trip_is_faithful() -> Result<()> {
    let mut sketch = outbound_sketch("aa:bb:cc:dd:ee:08", 200, 25, 443);
    for i in 0..50 {
        sketch.record_outbound(
            &format!("10.9.0.{i}"),
            80,
            Protocol::Tcp,
            2048,
            3,
            ts_at_hour(16),
            Some("intranet-web"),
        );
    }
    sketch.record_inbound("10.9.0.1", 43000, 8080, Protocol::Tcp, 999, 1, ts_at_hour(16));
    sketch.local_cluster_id = 3;
    sketch.username = Some("svc-web".to_string());
    sketch.ad_groups = vec!["Ops".to_string(), "DevOps".to_string()];
    sketch.ise_profile = Some("Workstation".to_string());
    sketch.device_type = Some("server".to_string());

    let restored = EndpointSketch::deserialize(&sketch.serialize())?;

    // Identity, counters, temporal, cluster state.
    assert_eq!(restored.endpoint_id, sketch.endpoint_id);
    assert_eq!(restored.switch_id, sketch.switch_id);
    assert_eq!(restored.bytes_in, sketch.bytes_in);
    assert_eq!(restored.bytes_out, sketch.bytes_out);
    assert_eq!(restored.packets_in, sketch.packets_in);
    assert_eq!(restored.packets_out, sketch.packets_out);
    assert_eq!(restored.flow_count, sketch.flow_count);
    assert_eq!(restored.first_seen, sketch.first_seen);
    assert_eq!(restored.last_seen, sketch.last_seen);
    assert_eq!(restored.active_hours, sketch.active_hours);
    assert_eq!(restored.local_cluster_id, sketch.local_cluster_id);
    assert_eq!(restored.version, sketch.version);

    // Register state, bit-exact.
    assert_eq!(restored.unique_peers, sketch.unique_peers);
    assert_eq!(restored.unique_services, sketch.unique_services);
    assert_eq!(restored.unique_ports, sketch.unique_ports);
    assert_eq!(restored.port_frequency, sketch.port_frequency);
    assert_eq!(restored.service_frequency, sketch.service_frequency);

    // Derived queries agree.
    assert_eq!(restored.peer_diversity(), sketch.peer_diversity());
    assert_eq!(restored.port_diversity(), sketch.port_diversity());
    assert_eq!(restored.service_diversity(), sketch.service_diversity());
    assert_eq!(restored.in_out_ratio(), sketch.in_out_ratio());

    // Enrichment.
    assert_eq!(restored.username, sketch.username);
    assert_eq!(restored.ad_groups, sketch.ad_groups);
    assert_eq!(restored.ise_profile, sketch.ise_profile);
    assert_eq!(restored.device_type, sketch.device_type);
    Ok(())
}

#[test]
fn deserialize_rejects_truncation() {
    let sketch = outbound_sketch("aa:bb:cc:dd:ee:09", 10, 5, 443);
    let bytes = sketch.serialize();
    assert!(matches!(
        EndpointSketch::deserialize(&bytes[..bytes.len() / 2]),
        Err(SketchError::InvalidFormat(_))
    ));
}

#[test]
fn memory_footprint_stays_in_budget() {
    let sketch = outbound_sketch("aa:bb:cc:dd:ee:0a", 1000, 50, 443);
    assert!(
        sketch.memory_bytes() <= 30 * 1024,
        "sketch uses {} bytes",
        sketch.memory_bytes()
    );
}

#[test]
fn top_ports_ranks_candidates() {
    let mut sketch = EndpointSketch::new("aa:bb:cc:dd:ee:0b", None);
    for _ in 0..90 {
        sketch.record_outbound("10.1.1.1", 443, Protocol::Tcp, 10, 1, ts_at_hour(9), None);
    }
    for _ in 0..9 {
        sketch.record_outbound("10.1.1.1", 22, Protocol::Tcp, 10, 1, ts_at_hour(9), None);
    }

    let top = sketch.top_ports(2);
    assert_eq!(top.first().map(|t| t.0), Some("tcp/443"));
}
