// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use clarion::{
    clustering::{
        batch::{ClusterResult, NOISE},
        labeling::ClusterLabel,
    },
    sgt::{
        AssignmentSource, SgtCategory,
        lifecycle::{SgtError, SgtLifecycle},
        mapper::SgtMapper,
    },
    storage::{InMemoryStorage, Storage},
};

fn label(cluster_id: i64, name: &str, members: usize, server: bool) -> ClusterLabel {
    ClusterLabel {
        cluster_id,
        name: name.to_string(),
        primary_reason: "Device type: test".to_string(),
        confidence: 0.75,
        top_ad_groups: Vec::new(),
        top_ise_profiles: Vec::new(),
        top_device_types: Vec::new(),
        avg_peer_diversity: 10.0,
        avg_in_out_ratio: if server { 0.8 } else { 0.3 },
        is_server_cluster: server,
        member_count: members,
    }
}

fn result_with_clusters(specs: &[(i64, usize)]) -> ClusterResult {
    let mut endpoint_ids = Vec::new();
    let mut labels = Vec::new();
    for &(cluster, count) in specs {
        for i in 0..count {
            endpoint_ids.push(format!("{cluster:02}:00:00:00:00:{i:02x}"));
            labels.push(cluster);
        }
    }
    let mut cluster_sizes = BTreeMap::new();
    for &l in &labels {
        *cluster_sizes.entry(l).or_insert(0) += 1;
    }
    ClusterResult {
        n_clusters: cluster_sizes.keys().filter(|&&c| c != NOISE).count(),
        n_noise: cluster_sizes.get(&NOISE).copied().unwrap_or(0),
        endpoint_ids,
        labels,
        silhouette: None,
        cluster_sizes,
        probabilities: None,
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Mapper

#[test]
fn taxonomy_values_and_names_are_unique_and_in_range() {
    let result = result_with_clusters(&[
        (0, 20),
        (1, 15),
        (2, 12),
        (3, 30),
        (4, 9),
        (NOISE, 5),
    ]);
    let mut labels = BTreeMap::new();
    labels.insert(0, label(0, "Corporate Laptops", 20, false));
    labels.insert(1, label(1, "Servers", 15, true));
    labels.insert(2, label(2, "Printers", 12, false));
    // Same display label twice: names must uniquify.
    labels.insert(3, label(3, "Corporate Laptops", 30, false));
    labels.insert(4, label(4, "IoT Devices", 9, false));
    labels.insert(NOISE, label(NOISE, "Unclustered", 5, false));

    let taxonomy = SgtMapper::new(3).generate_taxonomy(&result, &labels);

    assert_eq!(taxonomy.n_sgts, 5);

    let values: HashSet<u16> =
        taxonomy.recommendations.iter().map(|r| r.sgt_value).collect();
    assert_eq!(values.len(), 5, "duplicate SGT values");
    let names: HashSet<&str> = taxonomy
        .recommendations
        .iter()
        .map(|r| r.sgt_name.as_str())
        .collect();
    assert_eq!(names.len(), 5, "duplicate SGT names");

    for rec in &taxonomy.recommendations {
        let in_own = rec.category.contains(rec.sgt_value);
        let in_special = SgtCategory::Special.contains(rec.sgt_value);
        assert!(
            in_own || in_special,
            "SGT {} outside {} and special ranges",
            rec.sgt_value,
            rec.category
        );
    }

    // The two user clusters took 2 and 3; servers took 10; devices 20, 21.
    assert!(values.contains(&2));
    assert!(values.contains(&10));
    assert!(values.contains(&20));
}

#[test]
fn noise_and_small_clusters_are_skipped() {
    let result = result_with_clusters(&[(0, 20), (1, 2), (NOISE, 10)]);
    let mut labels = BTreeMap::new();
    labels.insert(0, label(0, "Corporate Laptops", 20, false));
    labels.insert(1, label(1, "Printers", 2, false));
    labels.insert(NOISE, label(NOISE, "Unclustered", 10, false));

    let taxonomy = SgtMapper::new(10).generate_taxonomy(&result, &labels);

    assert_eq!(taxonomy.n_sgts, 1);
    assert_eq!(taxonomy.total_endpoints, 32);
    assert_eq!(taxonomy.covered_endpoints, 20);
    assert_eq!(taxonomy.uncovered_endpoints, 12);
    assert!((taxonomy.coverage_ratio() - 20.0 / 32.0).abs() < 1e-9);
}

#[test]
fn unknown_labels_categorize_by_behavior() {
    let result = result_with_clusters(&[(0, 10), (1, 10)]);
    let mut labels = BTreeMap::new();
    labels.insert(0, label(0, "Some Oddball Group", 10, true));
    labels.insert(1, label(1, "Another Oddball", 10, false));

    let taxonomy = SgtMapper::new(3).generate_taxonomy(&result, &labels);

    let by_cluster: BTreeMap<i64, &str> = taxonomy
        .recommendations
        .iter()
        .map(|r| (r.cluster_id, r.sgt_name.as_str()))
        .collect();
    assert_eq!(by_cluster[&0], "Servers");
    assert_eq!(by_cluster[&1], "Users");
}

#[test]
fn category_overflow_lands_in_special_range() {
    // Eleven server-ish clusters overflow the 10..=19 range.
    let specs: Vec<(i64, usize)> = (0..11).map(|c| (c, 10)).collect();
    let result = result_with_clusters(&specs);
    let mut labels = BTreeMap::new();
    for c in 0..11i64 {
        labels.insert(c, label(c, "Servers", 10, true));
    }

    let taxonomy = SgtMapper::new(3).generate_taxonomy(&result, &labels);
    assert_eq!(taxonomy.n_sgts, 11);

    let mut values: Vec<u16> =
        taxonomy.recommendations.iter().map(|r| r.sgt_value).collect();
    values.sort_unstable();
    assert_eq!(&values[..10], &[10, 11, 12, 13, 14, 15, 16, 17, 18, 19]);
    assert!(SgtCategory::Special.contains(values[10]));
}

#[test]
fn exhausted_special_range_keeps_values_unique_and_sequential() {
    // 21 server clusters exhaust both the servers range (10 slots) and
    // the special overflow range (10 slots); the 21st allocation runs
    // past the special top instead of colliding.
    let specs: Vec<(i64, usize)> = (0..21).map(|c| (c, 10)).collect();
    let result = result_with_clusters(&specs);
    let mut labels = BTreeMap::new();
    for c in 0..21i64 {
        labels.insert(c, label(c, "Servers", 10, true));
    }

    let taxonomy = SgtMapper::new(3).generate_taxonomy(&result, &labels);
    assert_eq!(taxonomy.n_sgts, 21);

    let mut values: Vec<u16> =
        taxonomy.recommendations.iter().map(|r| r.sgt_value).collect();
    values.sort_unstable();
    let unique: HashSet<u16> = values.iter().copied().collect();
    assert_eq!(unique.len(), 21, "duplicate SGT values after double overflow");

    assert_eq!(&values[..10], &[10, 11, 12, 13, 14, 15, 16, 17, 18, 19]);
    assert_eq!(&values[10..20], &[30, 31, 32, 33, 34, 35, 36, 37, 38, 39]);
    assert_eq!(values[20], 40);
}

// ─────────────────────────────────────────────────────────────────────────
// Lifecycle

#[test]
fn duplicate_active_sgt_is_rejected() -> Result<()> {
    let storage = InMemoryStorage::new();
    let lifecycle = SgtLifecycle::new(&storage);

    lifecycle.create_sgt(100, "Users", Some(SgtCategory::Users), None)?;
    assert!(matches!(
        lifecycle.create_sgt(100, "Users-Again", None, None),
        Err(SgtError::DuplicateSgt(100))
    ));

    // An inactive entry may be replaced.
    lifecycle.deactivate_sgt(100)?;
    lifecycle.create_sgt(100, "Users-Again", None, None)?;
    Ok(())
}

#[test]
fn assignment_requires_known_active_sgt() -> Result<()> {
    let storage = InMemoryStorage::new();
    let lifecycle = SgtLifecycle::new(&storage);

    assert!(matches!(
        lifecycle.assign_endpoint("e1", 42, AssignmentSource::Manual, None, None),
        Err(SgtError::UnknownSgt(42))
    ));

    lifecycle.create_sgt(42, "Quarantine", Some(SgtCategory::Special), None)?;
    lifecycle.deactivate_sgt(42)?;
    assert!(matches!(
        lifecycle.assign_endpoint("e1", 42, AssignmentSource::Manual, None, None),
        Err(SgtError::InactiveSgt(42))
    ));
    Ok(())
}

#[test]
fn reassignment_closes_previous_row() -> Result<()> {
    // Scenario: clustering assigns E1 to 100, then a manual move to 200.
    let storage = InMemoryStorage::new();
    let lifecycle = SgtLifecycle::new(&storage);

    lifecycle.create_sgt(100, "Users", Some(SgtCategory::Users), None)?;
    lifecycle.create_sgt(200, "Servers", Some(SgtCategory::Servers), None)?;

    lifecycle.assign_endpoint(
        "e1",
        100,
        AssignmentSource::Clustering,
        Some(0.8),
        Some(7),
    )?;
    lifecycle.assign_endpoint("e1", 200, AssignmentSource::Manual, None, None)?;

    let membership = lifecycle.get_endpoint_sgt("e1").expect("active membership");
    assert_eq!(membership.sgt_value, 200);
    assert_eq!(membership.assigned_by, AssignmentSource::Manual);
    assert_eq!(membership.confidence, 1.0);

    let history = lifecycle.history_of("e1");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].sgt_value, 100);
    assert!(history[0].unassigned_at.is_some(), "first row not closed");
    assert_eq!(history[1].sgt_value, 200);
    assert!(history[1].unassigned_at.is_none());
    assert_eq!(history[0].unassigned_at, Some(history[1].assigned_at));
    Ok(())
}

#[test]
fn history_replay_reproduces_membership() -> Result<()> {
    let storage = InMemoryStorage::new();
    let lifecycle = SgtLifecycle::new(&storage);
    for sgt in [10u16, 11, 12] {
        lifecycle.create_sgt(sgt, format!("SGT-{sgt}"), None, None)?;
    }

    // An arbitrary assignment/unassignment churn across three endpoints.
    lifecycle.assign_endpoint("e1", 10, AssignmentSource::Clustering, Some(0.9), None)?;
    lifecycle.assign_endpoint("e2", 10, AssignmentSource::Clustering, Some(0.7), None)?;
    lifecycle.assign_endpoint("e1", 11, AssignmentSource::Incremental, Some(0.6), None)?;
    lifecycle.assign_endpoint("e3", 12, AssignmentSource::Manual, None, None)?;
    lifecycle.unassign_endpoint("e2");
    lifecycle.assign_endpoint("e1", 12, AssignmentSource::Manual, None, None)?;

    // Replay: for each endpoint, the single open history row must match
    // the active membership; closed rows must not.
    for endpoint in ["e1", "e2", "e3"] {
        let open: Vec<_> = lifecycle
            .history_of(endpoint)
            .into_iter()
            .filter(|r| r.unassigned_at.is_none())
            .collect();
        match lifecycle.get_endpoint_sgt(endpoint) {
            Some(membership) => {
                assert_eq!(open.len(), 1, "{endpoint} open rows");
                assert_eq!(open[0].sgt_value, membership.sgt_value);
                assert_eq!(open[0].assigned_at, membership.assigned_at);
            },
            None => assert!(open.is_empty(), "{endpoint} has orphan open row"),
        }
    }
    Ok(())
}

#[test]
fn automated_confidence_uses_stability_bonus() -> Result<()> {
    let storage = InMemoryStorage::new();
    let lifecycle = SgtLifecycle::new(&storage);
    lifecycle.create_sgt(10, "Users", None, None)?;

    // No explicit confidence: base 0.7 plus 0.01 per prior history row.
    let first =
        lifecycle.assign_endpoint("e1", 10, AssignmentSource::Incremental, None, None)?;
    assert!((first.confidence - 0.7).abs() < 1e-9);

    let second =
        lifecycle.assign_endpoint("e1", 10, AssignmentSource::Incremental, None, None)?;
    assert!((second.confidence - 0.71).abs() < 1e-9);
    Ok(())
}

#[test]
fn summary_aggregates_members() -> Result<()> {
    let storage = InMemoryStorage::new();
    let lifecycle = SgtLifecycle::new(&storage);
    lifecycle.create_sgt(10, "Users", Some(SgtCategory::Users), None)?;

    lifecycle.assign_endpoint("e1", 10, AssignmentSource::Clustering, Some(0.8), None)?;
    lifecycle.assign_endpoint("e2", 10, AssignmentSource::Manual, None, None)?;

    let summary = lifecycle.summary_of(10).expect("summary");
    assert_eq!(summary.member_count, 2);
    assert!((summary.average_confidence.expect("avg") - 0.9).abs() < 1e-9);
    assert_eq!(summary.by_source.len(), 2);

    // Deactivation retains membership rows.
    lifecycle.deactivate_sgt(10)?;
    assert_eq!(lifecycle.members_of(10).len(), 2);
    assert!(storage.get_sgt(10).is_some_and(|e| !e.is_active));
    Ok(())
}
