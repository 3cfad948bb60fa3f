// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use clarion::clustering::confidence::{
    ConfidenceClass, classify, combined, for_cluster_assignment, for_sgt_assignment,
    from_cluster_size, from_distance, from_probability, from_silhouette,
};

#[test]
fn distance_decays_linearly() {
    assert_eq!(from_distance(0.0, 2.0), 1.0);
    assert!((from_distance(1.0, 2.0) - 0.5).abs() < 1e-9);
    assert_eq!(from_distance(2.5, 2.0), 0.0);
    assert_eq!(from_distance(1.0, 0.0), 0.0);
}

#[test]
fn probability_is_identity_clamped() {
    assert_eq!(from_probability(0.7), 0.7);
    assert_eq!(from_probability(1.5), 1.0);
    assert_eq!(from_probability(-0.2), 0.0);
}

#[test]
fn cluster_size_is_piecewise() {
    // Tiny clusters: proportional, capped at 0.7.
    assert!((from_cluster_size(5) - 0.5).abs() < 1e-9);
    assert_eq!(from_cluster_size(9), 0.7);
    // The reliable band scores full.
    assert_eq!(from_cluster_size(10), 1.0);
    assert_eq!(from_cluster_size(500), 1.0);
    // Very large clusters lose a little.
    assert_eq!(from_cluster_size(1000), 0.9);
    assert_eq!(from_cluster_size(50_000), 0.9);
}

#[test]
fn silhouette_maps_to_unit_interval() {
    assert_eq!(from_silhouette(-1.0), 0.0);
    assert_eq!(from_silhouette(0.0), 0.5);
    assert_eq!(from_silhouette(1.0), 1.0);
}

#[test]
fn combined_uses_default_weights() {
    // All four present: 0.4p + 0.3d + 0.2s + 0.1sil.
    let score = combined(Some(1.0), Some(0.5), Some(1.0), Some(0.0));
    let expected = (0.5 * 0.4 + 1.0 * 0.3 + 1.0 * 0.2 + 0.0 * 0.1) / 1.0;
    assert!((score - expected).abs() < 1e-9);
}

#[test]
fn combined_renormalizes_missing_scores() {
    // Only probability and size: weights 0.4 and 0.2 renormalize.
    let score = combined(None, Some(0.9), Some(0.6), None);
    let expected = (0.9 * 0.4 + 0.6 * 0.2) / 0.6;
    assert!((score - expected).abs() < 1e-9);
}

#[test]
fn combined_with_nothing_is_neutral() {
    assert_eq!(combined(None, None, None, None), 0.5);
}

#[test]
fn noise_cluster_scores_low_always() {
    assert_eq!(
        for_cluster_assignment(-1, Some(0.0), Some(1.0), Some(100), Some(1.0)),
        0.2
    );
}

#[test]
fn single_metric_passes_through() {
    let score = for_cluster_assignment(3, Some(1.0), None, None, None);
    assert!((score - 0.5).abs() < 1e-9); // distance 1.0 of threshold 2.0
}

#[test]
fn no_metric_is_neutral() {
    assert_eq!(for_cluster_assignment(3, None, None, None, None), 0.5);
}

#[test]
fn sgt_confidence_gets_stability_bonus() {
    // Bonus grows at 0.01 per historical assignment, capped at 0.1.
    assert!((for_sgt_assignment(0.7, None, 0) - 0.7).abs() < 1e-9);
    assert!((for_sgt_assignment(0.7, None, 5) - 0.75).abs() < 1e-9);
    assert!((for_sgt_assignment(0.7, None, 50) - 0.8).abs() < 1e-9);
    // Clamped at 1.0.
    assert_eq!(for_sgt_assignment(0.98, None, 50), 1.0);
}

#[test]
fn sgt_confidence_averages_mapper_confidence() {
    let score = for_sgt_assignment(0.8, Some(0.6), 0);
    assert!((score - 0.7).abs() < 1e-9);
}

#[test]
fn classification_bands() {
    assert_eq!(classify(0.95), ConfidenceClass::VeryHigh);
    assert_eq!(classify(0.9), ConfidenceClass::VeryHigh);
    assert_eq!(classify(0.85), ConfidenceClass::High);
    assert_eq!(classify(0.7), ConfidenceClass::Medium);
    assert_eq!(classify(0.5), ConfidenceClass::Low);
    assert_eq!(classify(0.1), ConfidenceClass::VeryLow);
}
