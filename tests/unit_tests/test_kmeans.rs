// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use clarion::edge::kmeans::LightweightKMeans;
use rand::{SeedableRng, rngs::StdRng};

fn blob(center: &[f64], n: usize, spread: f64) -> Vec<Vec<f64>> {
    // Deterministic jitter; no RNG needed for the data itself.
    (0..n)
        .map(|i| {
            center
                .iter()
                .enumerate()
                .map(|(d, c)| c + spread * ((i * 7 + d * 3) % 5) as f64 / 5.0)
                .collect()
        })
        .collect()
}

#[test]
fn fewer_points_than_clusters_is_one_cluster_per_point() {
    let mut kmeans = LightweightKMeans::new(8, 10);
    let mut rng = StdRng::seed_from_u64(7);

    let x = blob(&[0.0, 0.0], 3, 0.1);
    let labels = kmeans.fit(&x, &mut rng);

    assert_eq!(labels, vec![0, 1, 2]);
    assert_eq!(kmeans.centroids().len(), 3);
}

#[test]
fn empty_input_yields_no_labels() {
    let mut kmeans = LightweightKMeans::new(4, 10);
    let mut rng = StdRng::seed_from_u64(7);
    assert!(kmeans.fit(&[], &mut rng).is_empty());
}

#[test]
fn separates_two_well_spaced_groups() {
    let mut x = blob(&[0.0, 0.0, 0.0], 20, 0.2);
    x.extend(blob(&[10.0, 10.0, 10.0], 20, 0.2));

    let mut kmeans = LightweightKMeans::new(2, 10);
    let mut rng = StdRng::seed_from_u64(42);
    let labels = kmeans.fit(&x, &mut rng);

    assert_eq!(labels.len(), 40);
    let first = labels[0];
    assert!(labels[..20].iter().all(|&l| l == first));
    let second = labels[20];
    assert!(labels[20..].iter().all(|&l| l == second));
    assert_ne!(first, second);
}

#[test]
fn predict_matches_fit_assignment() {
    let mut x = blob(&[0.0, 0.0], 15, 0.3);
    x.extend(blob(&[5.0, 5.0], 15, 0.3));

    let mut kmeans = LightweightKMeans::new(2, 10);
    let mut rng = StdRng::seed_from_u64(3);
    let labels = kmeans.fit(&x, &mut rng);

    let predicted = kmeans.predict(&x);
    assert_eq!(labels, predicted);
}

#[test]
fn labels_stay_in_range() {
    let x = blob(&[1.0, 2.0, 3.0], 50, 2.0);
    let mut kmeans = LightweightKMeans::new(5, 10);
    let mut rng = StdRng::seed_from_u64(11);

    let labels = kmeans.fit(&x, &mut rng);
    assert!(labels.iter().all(|&l| l < 5));
}

#[tokio::test]
async fn cancellable_fit_stops_on_cancel() {
    let x = blob(&[0.0; 6], 30, 1.0);
    let mut kmeans = LightweightKMeans::new(3, 10);
    let mut rng = StdRng::seed_from_u64(5);

    let cancel = tokio_util::sync::CancellationToken::new();
    cancel.cancel();

    let labels = kmeans.fit_cancellable(&x, &mut rng, &cancel).await;
    assert!(labels.is_none());
}
